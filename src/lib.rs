//! Daily Task Logger core: work sessions and their activities, gap
//! reconciliation, local persistence and remote state sync.
//!
//! Front ends drive the crate through [`AppState`] and the `*_impl`
//! functions in [`application::commands`].

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::auto_sync::{spawn_auto_sync, start_configured_auto_sync, AutoSyncSettings};
pub use application::bootstrap::{bootstrap_workspace, WorkspaceLayout};
pub use application::commands::{AppState, StateChange};
pub use application::remote_sync::{RemoteSyncService, SyncOutcome};
pub use domain::models::{Activity, ActivityType, Holiday, PausedTask, TaskStatus, WorkSession};
pub use domain::tracker::{StaleSessionPolicy, TrackerState};
pub use infrastructure::activity_store::StateSnapshot;
pub use infrastructure::error::InfraError;
