use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Bookkeeping for the remote document: when we last pushed, and the
/// `lastSync` the remote assigned to the newest document we saw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    pub last_push_time: Option<DateTime<Utc>>,
    pub last_remote_sync: Option<DateTime<Utc>>,
}

pub trait SyncStateRepository: Send + Sync {
    fn load(&self) -> Result<SyncState, InfraError>;
    fn record_push(&self, pushed_at: DateTime<Utc>) -> Result<(), InfraError>;
    fn record_remote_sync(&self, last_sync: DateTime<Utc>) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteSyncStateRepository {
    db_path: PathBuf,
}

impl SqliteSyncStateRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        Connection::open(&self.db_path).map_err(InfraError::from)
    }

    fn write_column(&self, column: &str, value: DateTime<Utc>) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute(
            &format!(
                "INSERT INTO sync_state (id, {column}) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET {column} = excluded.{column}"
            ),
            params![value.to_rfc3339()],
        )?;
        Ok(())
    }
}

fn parse_timestamp(raw: Option<String>, column: &str) -> Result<Option<DateTime<Utc>>, InfraError> {
    raw.map(|value| {
        DateTime::parse_from_rfc3339(&value)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(|error| {
                InfraError::InvalidConfig(format!("invalid sync_state.{column} '{value}': {error}"))
            })
    })
    .transpose()
}

impl SyncStateRepository for SqliteSyncStateRepository {
    fn load(&self) -> Result<SyncState, InfraError> {
        let connection = self.connect()?;
        let row: Option<(Option<String>, Option<String>)> = connection
            .query_row(
                "SELECT last_push_time, last_remote_sync FROM sync_state WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((last_push_time, last_remote_sync)) = row else {
            return Ok(SyncState::default());
        };

        Ok(SyncState {
            last_push_time: parse_timestamp(last_push_time, "last_push_time")?,
            last_remote_sync: parse_timestamp(last_remote_sync, "last_remote_sync")?,
        })
    }

    fn record_push(&self, pushed_at: DateTime<Utc>) -> Result<(), InfraError> {
        self.write_column("last_push_time", pushed_at)
    }

    fn record_remote_sync(&self, last_sync: DateTime<Utc>) -> Result<(), InfraError> {
        self.write_column("last_remote_sync", last_sync)
    }
}

#[derive(Debug, Default)]
pub struct InMemorySyncStateRepository {
    state: Mutex<SyncState>,
}

impl InMemorySyncStateRepository {
    fn update(&self, apply: impl FnOnce(&mut SyncState)) -> Result<(), InfraError> {
        let mut state = self
            .state
            .lock()
            .map_err(|error| InfraError::Storage(format!("sync state lock poisoned: {error}")))?;
        apply(&mut state);
        Ok(())
    }
}

impl SyncStateRepository for InMemorySyncStateRepository {
    fn load(&self) -> Result<SyncState, InfraError> {
        let state = self
            .state
            .lock()
            .map_err(|error| InfraError::Storage(format!("sync state lock poisoned: {error}")))?;
        Ok(state.clone())
    }

    fn record_push(&self, pushed_at: DateTime<Utc>) -> Result<(), InfraError> {
        self.update(|state| state.last_push_time = Some(pushed_at))
    }

    fn record_remote_sync(&self, last_sync: DateTime<Utc>) -> Result<(), InfraError> {
        self.update(|state| state.last_remote_sync = Some(last_sync))
    }
}
