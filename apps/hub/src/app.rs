//! Wires the hub library to the process: listener, shutdown, stats.

use std::sync::Arc;
use std::time::Duration;

use threateye_hub_server::{Hub, HubServer, NoopClassifier};

use crate::config::AppConfig;
use crate::validator::StaticKeyValidator;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Builds a hub from `config` and binds its listener.
pub async fn start(config: &AppConfig) -> anyhow::Result<HubServer> {
    let validator = Arc::new(StaticKeyValidator::new(config.api_keys.clone()));
    let hub = Hub::new(config.hub_config(), validator, Arc::new(NoopClassifier));
    let server = HubServer::bind(hub, config.listen_addr()).await?;
    Ok(server)
}

/// Serves until Ctrl-C, then shuts the hub down.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let server = start(&config).await?;
    let hub = Arc::clone(server.hub());
    let mut listener = tokio::spawn(server.run());

    let mut stats = tokio::time::interval(STATS_INTERVAL);
    stats.tick().await;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("interrupt received");
                break;
            }

            result = &mut listener => {
                result??;
                return Ok(());
            }

            _ = stats.tick() => log_stats(&hub),
        }
    }

    hub.shutdown();
    listener.await??;
    log_stats(&hub);
    Ok(())
}

fn log_stats(hub: &Hub) {
    let s = hub.stats();
    tracing::info!(
        online = s.sessions_online,
        registered = s.sessions_registered,
        pending = s.pending_commands,
        observers = s.observers,
        published = s.events_published,
        dropped = s.events_dropped,
        skipped = s.classifications_skipped,
        "hub stats"
    );
}
