use crate::infrastructure::error::InfraError;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

pub fn initialize_database(path: &Path) -> Result<(), InfraError> {
    let connection = Connection::open(path)?;
    connection.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// String-keyed persistence holding JSON-encoded values.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, InfraError>;
    fn set(&self, key: &str, value: &str) -> Result<(), InfraError>;
    fn remove(&self, key: &str) -> Result<(), InfraError>;

    /// Writes each entry in turn and stops at the first failure, keeping the
    /// entries already written. Backends that can write all or nothing
    /// override this, as both stores in this module do.
    fn set_many(&self, entries: &[(&str, String)]) -> Result<(), InfraError> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SqliteKeyValueStore {
    db_path: PathBuf,
}

impl SqliteKeyValueStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        Connection::open(&self.db_path).map_err(InfraError::from)
    }
}

const UPSERT_SQL: &str = "INSERT INTO kv_store (key, value, updated_at)
     VALUES (?1, ?2, ?3)
     ON CONFLICT(key) DO UPDATE SET
       value = excluded.value,
       updated_at = excluded.updated_at";

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, InfraError> {
        let connection = self.connect()?;
        let value = connection
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute(UPSERT_SQL, params![key, value, Utc::now().to_rfc3339()])?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn set_many(&self, entries: &[(&str, String)]) -> Result<(), InfraError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        let updated_at = Utc::now().to_rfc3339();
        for (key, value) in entries {
            transaction.execute(UPSERT_SQL, params![key, value, updated_at])?;
        }
        transaction.commit()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    values: Mutex<HashMap<String, String>>,
}

impl InMemoryKeyValueStore {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, InfraError> {
        self.values
            .lock()
            .map_err(|error| InfraError::Storage(format!("key-value lock poisoned: {error}")))
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, InfraError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), InfraError> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), InfraError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn set_many(&self, entries: &[(&str, String)]) -> Result<(), InfraError> {
        let mut values = self.lock()?;
        for (key, value) in entries {
            values.insert((*key).to_string(), value.clone());
        }
        Ok(())
    }
}

/// Reads and decodes `key`. Missing, null, unreadable or malformed data yields `fallback`.
pub fn load_json<T, S>(store: &S, key: &str, fallback: T) -> T
where
    T: DeserializeOwned,
    S: KeyValueStore + ?Sized,
{
    let raw = match store.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return fallback,
        Err(error) => {
            tracing::warn!(key, error = %error, "failed to read stored value, using fallback");
            return fallback;
        }
    };

    match serde_json::from_str::<Option<T>>(&raw) {
        Ok(Some(value)) => value,
        Ok(None) => fallback,
        Err(error) => {
            tracing::warn!(key, error = %error, "stored value is malformed, using fallback");
            fallback
        }
    }
}

pub fn save_json<T, S>(store: &S, key: &str, value: &T) -> Result<(), InfraError>
where
    T: Serialize + ?Sized,
    S: KeyValueStore + ?Sized,
{
    let encoded = serde_json::to_string(value)?;
    store.set(key, &encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_TEMP_DB: AtomicU64 = AtomicU64::new(1);

    struct TempDatabase {
        dir: PathBuf,
        path: PathBuf,
    }

    impl TempDatabase {
        fn new() -> Self {
            let sequence = NEXT_TEMP_DB.fetch_add(1, Ordering::Relaxed);
            let dir = std::env::temp_dir().join(format!(
                "daily-logger-storage-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            fs::create_dir_all(&dir).expect("create temp dir");
            let path = dir.join("store.sqlite");
            initialize_database(&path).expect("initialize database");
            Self { dir, path }
        }
    }

    impl Drop for TempDatabase {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    #[test]
    fn load_json_falls_back_on_missing_null_and_malformed_values() {
        let store = InMemoryKeyValueStore::default();
        let fallback = vec!["General".to_string()];

        assert_eq!(load_json(&store, "customProjects", fallback.clone()), fallback);

        store.set("customProjects", "null").expect("set null");
        assert_eq!(load_json(&store, "customProjects", fallback.clone()), fallback);

        store.set("customProjects", "{not json").expect("set garbage");
        assert_eq!(load_json(&store, "customProjects", fallback.clone()), fallback);

        save_json(&store, "customProjects", &vec!["Ops".to_string()]).expect("save");
        assert_eq!(
            load_json(&store, "customProjects", fallback),
            vec!["Ops".to_string()]
        );
    }

    #[test]
    fn sqlite_store_upserts_and_removes() {
        let database = TempDatabase::new();
        let store = SqliteKeyValueStore::new(&database.path);

        assert_eq!(store.get("workSessions").expect("get"), None);
        store.set("workSessions", "[]").expect("set");
        store.set("workSessions", "[1]").expect("overwrite");
        assert_eq!(store.get("workSessions").expect("get").as_deref(), Some("[1]"));

        store
            .set_many(&[("holidays", "[]".to_string()), ("settings", "{}".to_string())])
            .expect("set many");
        assert_eq!(store.get("settings").expect("get").as_deref(), Some("{}"));

        store.remove("workSessions").expect("remove");
        assert_eq!(store.get("workSessions").expect("get"), None);
    }

    /// Accepts every key except `broken`.
    #[derive(Default)]
    struct RejectingStore {
        inner: InMemoryKeyValueStore,
    }

    impl KeyValueStore for RejectingStore {
        fn get(&self, key: &str) -> Result<Option<String>, InfraError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), InfraError> {
            if key == "broken" {
                return Err(InfraError::Storage("rejected".to_string()));
            }
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), InfraError> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn default_set_many_keeps_entries_written_before_a_failure() {
        let store = RejectingStore::default();
        let result = store.set_many(&[
            ("holidays", "[]".to_string()),
            ("broken", "{}".to_string()),
            ("settings", "{}".to_string()),
        ]);

        assert!(matches!(result, Err(InfraError::Storage(_))));
        assert_eq!(store.get("holidays").expect("get").as_deref(), Some("[]"));
        assert_eq!(store.get("settings").expect("get"), None);
    }
}
