//! Command-line configuration.

use clap::Parser;

/// A small IRC server with a single-writer dispatch core.
#[derive(Parser, Debug, Clone)]
#[command(name = "rosella", version, about)]
pub struct Config {
    /// TCP listener address.
    #[arg(long, default_value = "0.0.0.0:6667")]
    pub listen_addr: String,

    /// Server identity, used as the source prefix of all server-generated
    /// replies.
    #[arg(long, default_value = "rosella")]
    pub server_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:6667".to_string(),
            server_name: "rosella".to_string(),
        }
    }
}
