//! Environment-driven configuration, read once at startup the way the
//! reference service reads `DATABASE_URL`/`BIND_ADDR` in its `main.rs` --
//! no config-file crate, since config loading itself is out of scope and
//! the reference access tier only ever needed env vars.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub ack_retry_timeout: Duration,
    pub ack_retry_cap: u32,
    pub heartbeat_timeout: Duration,
    pub disconnect_rpc_timeout: Duration,
    pub user_service_addr: String,
    pub message_service_addr: String,
    pub write_channel_capacity: usize,
    pub retry_channel_capacity: usize,
    pub event_channel_capacity: usize,
    pub msg_box_bucket_count: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8080"),
            ack_retry_timeout: Duration::from_millis(env_u64_or("ACK_RETRY_TIMEOUT_MS", 100)),
            ack_retry_cap: env_u64_or("ACK_RETRY_CAP", 3) as u32,
            heartbeat_timeout: Duration::from_secs(env_u64_or("HEARTBEAT_TIMEOUT_SECS", 60)),
            disconnect_rpc_timeout: Duration::from_millis(env_u64_or(
                "DISCONNECT_RPC_TIMEOUT_MS",
                2000,
            )),
            user_service_addr: env_or("USER_SERVICE_ADDR", "http://127.0.0.1:9001"),
            message_service_addr: env_or("MESSAGE_SERVICE_ADDR", "http://127.0.0.1:9002"),
            write_channel_capacity: env_u64_or("WRITE_CHANNEL_CAPACITY", 1000) as usize,
            retry_channel_capacity: env_u64_or("RETRY_CHANNEL_CAPACITY", 512) as usize,
            event_channel_capacity: env_u64_or("EVENT_CHANNEL_CAPACITY", 1000) as usize,
            msg_box_bucket_count: env_u64_or("MSG_BOX_BUCKET_COUNT", 1000) as usize,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_u64_or(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
