// src/core/client/config.rs

//! Node-agent RPC client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    #[default]
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClientConfig {
    /// Agent port on every node.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub scheme: Scheme,
    /// Process-wide fallback token; a cluster record's token takes precedence.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// End-to-end time to complete a request including retries.
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
    /// Time to complete a single attempt including opening a connection.
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Time window over which the host pool's latency averages decay.
    #[serde(with = "humantime_serde", default = "default_pool_decay_duration")]
    pub pool_decay_duration: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            scheme: Scheme::default(),
            auth_token: None,
            timeout: default_timeout(),
            request_timeout: default_request_timeout(),
            pool_decay_duration: default_pool_decay_duration(),
        }
    }
}

fn default_port() -> u16 {
    10001
}
fn default_timeout() -> Duration {
    Duration::from_secs(90)
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(15)
}
fn default_pool_decay_duration() -> Duration {
    Duration::from_secs(30 * 60)
}
