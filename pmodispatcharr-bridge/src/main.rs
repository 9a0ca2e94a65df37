use anyhow::Context;
use pmodispatcharr::{
    apply_actions, Action, AuthSession, Credentials, DispatcharrApi, DispatcharrConfig,
    DispatcharrCoordinator, EntitySink, TickError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Sink that publishes entity changes to the log
struct TracingSink;

impl EntitySink for TracingSink {
    fn apply(&mut self, action: &Action) {
        match action {
            Action::Create(id, view) => info!(
                stream = %id,
                entity = %view.display_name,
                attributes = %serde_json::Value::Object(view.attributes()),
                "➕ Stream entity created"
            ),
            Action::Update(id, view) => info!(
                stream = %id,
                entity = %view.display_name,
                title = view.media_title().unwrap_or("-"),
                attributes = %serde_json::Value::Object(view.attributes()),
                "🔄 Stream entity updated"
            ),
            Action::Remove(id) => info!(stream = %id, "➖ Stream entity removed"),
            Action::Count(n) => info!(active = n, "📺 Active streams"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_dir = std::env::args().nth(1).unwrap_or_default();
    let config = Arc::new(
        DispatcharrConfig::load_config(&config_dir).context("Failed to load configuration")?,
    );
    config
        .validate()
        .context("dispatcharr.host, dispatcharr.username and dispatcharr.password are required")?;

    let base_url = config.base_url()?;
    let api = Arc::new(
        DispatcharrApi::builder(&base_url)
            .timeout(Duration::from_secs(config.get_request_timeout_secs()?))
            .build()?,
    );
    let auth = AuthSession::new(
        api.clone(),
        Credentials::new(config.get_username()?, config.get_password()?),
    )
    .with_assumed_lifetime(config.get_token_lifetime_secs()?);
    let coordinator = DispatcharrCoordinator::new(api, auth, config.clone());

    let scan_interval = Duration::from_secs(config.get_scan_interval_secs()?.max(1));
    info!(
        "📡 Polling Dispatcharr at {} every {}s",
        base_url,
        scan_interval.as_secs()
    );

    let mut ticker = tokio::time::interval(scan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sink = TracingSink;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match coordinator.run_tick(chrono::Utc::now().into()).await {
                    Ok(actions) => apply_actions(&mut sink, &actions),
                    Err(TickError::TickInProgress) => debug!("Previous tick still running"),
                    // already logged by the coordinator
                    Err(e) => debug!("Tick failed: {}", e),
                }
            }
            _ = &mut shutdown => {
                info!("Stopping Dispatcharr bridge");
                break;
            }
        }
    }

    if coordinator.auth_problem() {
        warn!("Exiting while Dispatcharr still rejects the credentials");
    }
    Ok(())
}
