use common_kafka::config::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;
use tracing::Level;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "info")]
    pub log_level: Level,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,
}
