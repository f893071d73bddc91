use clap::Parser;
use porthole::{ApplicationConfig, entrypoint};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ApplicationConfig::parse();
    let default_filter = if config.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
    entrypoint(config).await
}
