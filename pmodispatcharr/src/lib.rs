//! Dispatcharr client library for PMOMusic
//!
//! This crate polls a Dispatcharr server for its active streams and program
//! guide, and turns the result into a deterministic list of entity
//! actions (create / update / remove / count) for a host platform.
//!
//! # Pipeline
//!
//! Every tick runs:
//!
//! 1. **Auth** ([`AuthSession`]): reuse or renew the bearer token
//! 2. **Fetch** ([`DataSource`]): active streams, then the EPG when enabled
//! 3. **Match** ([`match_program`]): the program airing now on each channel
//! 4. **Project** ([`project`]): one [`StreamView`] per stream
//! 5. **Reconcile** ([`ExposedEntitySet`]): diff against what is exposed
//!
//! [`DispatcharrCoordinator::run_tick`] chains the five steps. Scheduling the
//! ticks and applying the actions (through an [`EntitySink`]) is left to
//! the caller.
//!
//! # Failure policy
//!
//! - Rejected credentials surface as [`AuthError`] and are logged once per
//!   transition.
//! - A failed fetch ([`FetchError`]) abandons the tick; exposed entities stay
//!   as they are.
//! - A stream without a current program is not an error: its program
//!   fields are simply `None`.

pub mod api;
pub mod auth;
pub mod config;
pub mod coordinator;
pub mod encryption;
pub mod error;
pub mod matcher;
pub mod models;
pub mod projector;
pub mod reconcile;
pub mod sink;

// Re-exports
pub use api::{ClientBuilder, DataSource, DispatcharrApi};
pub use auth::{AuthSession, Authenticator, Credentials};
pub use config::DispatcharrConfig;
pub use coordinator::DispatcharrCoordinator;
pub use error::{AuthError, FetchError, TickError};
pub use matcher::match_program;
pub use models::{
    EpgDataset, EpgProgram, LoginResponse, RawStreamRecord, StreamIdentity, StreamView, Token,
};
pub use projector::{format_episode_number, normalize_entity_name, project};
pub use reconcile::{Action, CountPolicy, ExposedEntitySet, ReconcileSummary};
pub use sink::{apply_actions, EntitySink};
