use clap::Parser;
use tracing::info;

use rosella::config::Config;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Config::parse();
    info!(name = %config.server_name, "rosella starting");

    rosella::irc::server::run(config).await
}
