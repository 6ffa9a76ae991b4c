use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::hub::HubConfig;
use crate::pump::PumpConfig;

/// Real-time group chat server.
#[derive(Debug, Clone, Parser)]
#[command(name = "chatterbox", version, about)]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "CHAT_ADDR", default_value = "0.0.0.0:8080")]
    pub addr: SocketAddr,

    /// Messages buffered per participant before it is treated as too slow
    #[arg(long, env = "CHAT_OUTBOX_CAPACITY", default_value = "256")]
    pub outbox_capacity: NonZeroUsize,

    /// Intents buffered in front of the hub
    #[arg(long, env = "CHAT_HUB_QUEUE", default_value = "1024")]
    pub hub_queue: NonZeroUsize,

    /// Do not echo a message back to its sender
    #[arg(long, env = "CHAT_EXCLUDE_SENDER")]
    pub exclude_sender: bool,

    /// Disconnect peers that send nothing for this many seconds
    #[arg(long, env = "CHAT_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: Option<u64>,

    /// Seconds a departing peer's writer may spend flushing queued messages
    #[arg(long, env = "CHAT_DRAIN_TIMEOUT_SECS", default_value_t = 5)]
    pub drain_timeout_secs: u64,

    /// Longest accepted message body, in bytes
    #[arg(long, env = "CHAT_MAX_BODY_LEN", default_value_t = 4096)]
    pub max_body_len: usize,

    /// Directory served at the site root
    #[arg(long, env = "CHAT_STATIC_DIR", default_value = "public")]
    pub static_dir: PathBuf,

    /// Key used to verify auth cookies; a random one is generated if unset
    #[arg(long, env = "AUTH_SECRET", hide_env_values = true)]
    pub auth_secret: Option<String>,

    /// Print a signed auth cookie for NAME and exit (needs --auth-secret)
    #[arg(long, value_name = "NAME", requires = "auth_secret")]
    pub issue_cookie: Option<String>,

    /// Avatar URL to embed in an issued cookie
    #[arg(long, requires = "issue_cookie")]
    pub avatar_url: Option<String>,

    /// PEM certificate chain for HTTPS/WSS
    #[arg(long, env = "CHAT_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for HTTPS/WSS
    #[arg(long, env = "CHAT_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,
}

impl Config {
    pub fn hub(&self) -> HubConfig {
        HubConfig {
            exclude_sender: self.exclude_sender,
            queue_capacity: self.hub_queue,
        }
    }

    pub fn pump(&self) -> PumpConfig {
        PumpConfig {
            outbox_capacity: self.outbox_capacity,
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
            max_body_len: self.max_body_len,
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
        }
    }
}
