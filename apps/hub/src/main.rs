mod app;
mod config;
mod validator;

use tracing_subscriber::EnvFilter;

use config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,threateye=debug")),
        )
        .init();

    let config = AppConfig::load()?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr(),
        "starting ThreatEye hub"
    );

    app::run(config).await
}
