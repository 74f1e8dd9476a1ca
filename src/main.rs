use anyhow::Context;
use companion_audio::config::Config;
use companion_audio::Runtime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    Runtime::init_logging();

    let config = Config::from_env().context("Failed to load configuration")?;
    let runtime = Runtime::start(config)
        .await
        .context("Failed to start audio core")?;
    tracing::info!("Running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    runtime.shutdown().await;
    Ok(())
}
