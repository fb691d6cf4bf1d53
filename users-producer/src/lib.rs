pub mod api;
pub mod config;
pub mod prometheus;
pub mod router;
pub mod server;
pub mod sinks;
pub mod time;
pub mod users;
