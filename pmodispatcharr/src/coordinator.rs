//! Tick driver: fetch, match, project, reconcile
//!
//! [`DispatcharrCoordinator::run_tick`] is the single entry point the
//! scheduler calls. All network reads complete before the exposed entity
//! set is touched: a tick that fails, or whose future is dropped half way,
//! leaves the previous state exactly as it was.
//!
//! # Example
//!
//! ```no_run
//! use pmodispatcharr::{
//!     apply_actions, AuthSession, Credentials, DispatcharrApi, DispatcharrConfig,
//!     DispatcharrCoordinator,
//! };
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = Arc::new(DispatcharrConfig::load_config("")?);
//! let api = Arc::new(DispatcharrApi::new(&config.base_url()?)?);
//! let auth = AuthSession::new(
//!     api.clone(),
//!     Credentials::new(config.get_username()?, config.get_password()?),
//! );
//! let coordinator = DispatcharrCoordinator::new(api, auth, config);
//!
//! let actions = coordinator.run_tick(chrono::Utc::now().into()).await?;
//! let mut applied: Vec<pmodispatcharr::Action> = Vec::new();
//! apply_actions(&mut applied, &actions);
//! # Ok::<(), anyhow::Error>(())
//! # }).unwrap();
//! ```

use crate::api::DataSource;
use crate::auth::AuthSession;
use crate::config::DispatcharrConfig;
use crate::error::{FetchError, TickError};
use crate::matcher::match_program;
use crate::models::{EpgDataset, RawStreamRecord, StreamIdentity, StreamView, Token};
use crate::projector::project;
use crate::reconcile::{Action, ExposedEntitySet, ReconcileSummary};
use chrono::{DateTime, FixedOffset};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Marks a tick as running; cleared on drop, including when the tick
/// future is cancelled
struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Data gathered by one tick, complete or not at all
struct Snapshot {
    streams: Vec<RawStreamRecord>,
    epg: Option<EpgDataset>,
}

/// Owns the exposed entity set of one Dispatcharr server
pub struct DispatcharrCoordinator {
    source: Arc<dyn DataSource>,
    auth: AuthSession,
    config: Arc<DispatcharrConfig>,
    exposed: Mutex<ExposedEntitySet>,
    tick_running: AtomicBool,
    auth_problem: AtomicBool,
}

impl DispatcharrCoordinator {
    pub fn new(
        source: Arc<dyn DataSource>,
        auth: AuthSession,
        config: Arc<DispatcharrConfig>,
    ) -> Self {
        let exposed = ExposedEntitySet::with_count_policy(config.get_count_policy());
        Self {
            source,
            auth,
            config,
            exposed: Mutex::new(exposed),
            tick_running: AtomicBool::new(false),
            auth_problem: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Arc<DispatcharrConfig> {
        &self.config
    }

    pub fn auth(&self) -> &AuthSession {
        &self.auth
    }

    /// True while a tick is executing
    pub fn tick_running(&self) -> bool {
        self.tick_running.load(Ordering::Acquire)
    }

    /// True while the backend keeps rejecting our credentials
    pub fn auth_problem(&self) -> bool {
        self.auth_problem.load(Ordering::Acquire)
    }

    /// Identities currently exposed, ascending
    pub async fn exposed_identities(&self) -> Vec<StreamIdentity> {
        self.exposed.lock().await.identities().cloned().collect()
    }

    /// Last exposed view of one stream
    pub async fn exposed_view(&self, id: &StreamIdentity) -> Option<StreamView> {
        self.exposed.lock().await.get(id).cloned()
    }

    /// Runs one fetch → match → project → reconcile cycle
    ///
    /// Returns the actions to apply, possibly none. On error no action is
    /// produced and the exposed set is untouched.
    ///
    /// # Errors
    ///
    /// * `TickError::TickInProgress` - the previous tick has not finished
    /// * `TickError::Auth` - no valid token could be obtained
    /// * `TickError::Fetch` - a data endpoint failed
    pub async fn run_tick(&self, now: DateTime<FixedOffset>) -> Result<Vec<Action>, TickError> {
        let Some(_running) = TickGuard::acquire(&self.tick_running) else {
            debug!("Skipping tick: previous tick still running");
            return Err(TickError::TickInProgress);
        };

        let snapshot = match self.fetch_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.note_failure(&err);
                return Err(err);
            }
        };

        let views: Vec<StreamView> = snapshot
            .streams
            .iter()
            .map(|raw| project(raw, match_program(raw.epg_key(), snapshot.epg.as_ref(), now)))
            .collect();

        let mut exposed = self.exposed.lock().await;
        exposed.set_count_policy(self.config.get_count_policy());
        let actions = exposed.reconcile(views);

        let summary = ReconcileSummary::from_actions(&actions, exposed.len());
        if summary.created + summary.updated + summary.removed > 0 {
            info!(
                created = summary.created,
                updated = summary.updated,
                removed = summary.removed,
                active = exposed.len(),
                "Dispatcharr streams changed"
            );
        } else {
            debug!(active = exposed.len(), "No stream changes");
        }

        Ok(actions)
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot, TickError> {
        let token = self.valid_token().await?;
        match self.fetch_with(&token).await {
            Err(err) if err.is_auth_error() => {
                debug!("Token refused by Dispatcharr, logging in again");
                self.auth.invalidate().await;
                let token = self.valid_token().await?;
                Ok(self.fetch_with(&token).await?)
            }
            other => Ok(other?),
        }
    }

    /// A token in hand ends an auth problem, whatever the fetch does next
    async fn valid_token(&self) -> Result<Token, TickError> {
        let token = self.auth.get_valid_token().await?;
        self.note_auth_success();
        Ok(token)
    }

    async fn fetch_with(&self, token: &Token) -> Result<Snapshot, FetchError> {
        let streams = self.source.fetch_active_streams(token).await?;

        // live option, re-read every tick
        let epg_enabled = self.config.get_epg_enabled().unwrap_or(true);
        let epg = if epg_enabled && !streams.is_empty() {
            Some(self.source.fetch_epg(token).await?)
        } else {
            None
        };

        Ok(Snapshot { streams, epg })
    }

    fn note_auth_success(&self) {
        if self.auth_problem.swap(false, Ordering::AcqRel) {
            info!("Dispatcharr authentication recovered");
        }
    }

    fn note_failure(&self, err: &TickError) {
        match err {
            TickError::Auth(auth_err) if auth_err.is_rejection() => {
                if !self.auth_problem.swap(true, Ordering::AcqRel) {
                    error!(
                        "Dispatcharr rejected the credentials for {}: {}",
                        self.auth.username(),
                        auth_err
                    );
                } else {
                    debug!("Dispatcharr still rejecting credentials: {}", auth_err);
                }
            }
            other => warn!("Dispatcharr tick abandoned, keeping current entities: {}", other),
        }
    }
}

impl std::fmt::Debug for DispatcharrCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcharrCoordinator")
            .field("auth", &self.auth)
            .field("auth_problem", &self.auth_problem())
            .finish()
    }
}
