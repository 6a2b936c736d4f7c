use crate::application::commands::AppState;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_TEMP_WORKSPACE: AtomicUsize = AtomicUsize::new(0);

pub(crate) struct TempWorkspace {
    path: PathBuf,
}

impl TempWorkspace {
    pub(crate) fn new() -> Self {
        let sequence = NEXT_TEMP_WORKSPACE.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "daily-logger-tests-{}-{}",
            std::process::id(),
            sequence
        ));
        fs::create_dir_all(&path).expect("create temp workspace");
        Self { path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn app_state(&self, clock: &TestClock) -> AppState {
        AppState::with_clock(self.path.clone(), clock.provider()).expect("initialize app state")
    }
}

impl Drop for TempWorkspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Settable clock shared between a test and the state it drives.
#[derive(Clone)]
pub(crate) struct TestClock {
    millis: Arc<AtomicI64>,
}

impl TestClock {
    pub(crate) fn at(rfc3339: &str) -> Self {
        let start = DateTime::parse_from_rfc3339(rfc3339)
            .expect("valid datetime")
            .timestamp_millis();
        Self {
            millis: Arc::new(AtomicI64::new(start)),
        }
    }

    pub(crate) fn advance_minutes(&self, minutes: i64) {
        self.millis.fetch_add(minutes * 60_000, Ordering::SeqCst);
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).expect("valid millis")
    }

    pub(crate) fn provider(&self) -> Arc<dyn Fn() -> DateTime<Utc> + Send + Sync> {
        let clock = self.clone();
        Arc::new(move || clock.now())
    }
}
