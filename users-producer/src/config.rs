use std::time::Duration;

use common_kafka::config::KafkaConfig;
use envconfig::Envconfig;
use tracing::Level;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "0.0.0.0")]
    pub bind_host: String,

    #[envconfig(from = "APP_PORT", default = "8080")]
    pub app_port: u16,

    #[envconfig(default = "5000")]
    pub publish_timeout_ms: u64,

    #[envconfig(default = "false")]
    pub print_sink: bool,

    #[envconfig(default = "false")]
    pub export_prometheus: bool,

    #[envconfig(default = "info")]
    pub log_level: Level,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

impl Config {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind_host, self.app_port)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}
