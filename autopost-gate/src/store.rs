use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::instrument;

use crate::api::StoreError;
use crate::flags::{FlagKey, RemoteFlag};

/// Read side of the remote flag store. Writes happen out of band, in the admin tooling.
#[async_trait]
pub trait Client {
    /// Fetches every record among `keys`. Keys the store doesn't know are simply absent.
    async fn fetch_flags(&self, keys: &[FlagKey]) -> Result<Vec<RemoteFlag>, StoreError>;

    async fn fetch_flag(&self, key: &FlagKey) -> Result<RemoteFlag, StoreError>;
}

/// Flags stored in postgres, in a table shaped like:
///
/// ```sql
/// CREATE TABLE feature_flags (
///     flag_key   TEXT PRIMARY KEY,
///     is_enabled BOOLEAN NOT NULL DEFAULT FALSE,
///     flag_value JSONB
/// );
/// ```
pub struct PostgresFlagStore {
    pool: PgPool,
}

impl PostgresFlagStore {
    /// Connections are opened lazily, so the gate can start while the store is down.
    pub fn new(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<PostgresFlagStore, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(url)?;

        Ok(PostgresFlagStore { pool })
    }
}

#[async_trait]
impl Client for PostgresFlagStore {
    #[instrument(skip_all, fields(keys = keys.len()))]
    async fn fetch_flags(&self, keys: &[FlagKey]) -> Result<Vec<RemoteFlag>, StoreError> {
        let keys: Vec<String> = keys.iter().map(|k| k.as_str().to_string()).collect();

        let flags = sqlx::query_as::<_, RemoteFlag>(
            r#"
            SELECT flag_key, is_enabled, flag_value
              FROM feature_flags
             WHERE flag_key = ANY($1)
            "#,
        )
        .bind(keys)
        .fetch_all(&self.pool)
        .await?;

        Ok(flags)
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn fetch_flag(&self, key: &FlagKey) -> Result<RemoteFlag, StoreError> {
        let flag = sqlx::query_as::<_, RemoteFlag>(
            r#"
            SELECT flag_key, is_enabled, flag_value
              FROM feature_flags
             WHERE flag_key = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        flag.ok_or(StoreError::NotFound)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockStoreCall {
    pub op: String,
    pub keys: Vec<String>,
}

#[derive(Default)]
struct MockState {
    flags: HashMap<String, RemoteFlag>,
    batch_error: Option<StoreError>,
    single_error: Option<StoreError>,
    delay: Option<Duration>,
    calls: Vec<MockStoreCall>,
}

/// In-memory flag store for tests. Clones share state, so a test can flip a flag
/// or break the store while a gate holds another handle.
#[derive(Clone, Default)]
pub struct MockFlagStore {
    state: Arc<Mutex<MockState>>,
}

impl MockFlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flags(flags: &[(&str, bool)]) -> Self {
        let store = Self::new();
        for (key, enabled) in flags {
            store.set_flag(key, *enabled);
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_flag(&self, key: &str, enabled: bool) {
        self.lock()
            .flags
            .insert(key.to_string(), RemoteFlag::new(key, enabled));
    }

    pub fn set_remote_flag(&self, flag: RemoteFlag) {
        self.lock().flags.insert(flag.flag_key.clone(), flag);
    }

    /// Makes every batch fetch fail with `error`, `None` heals it.
    pub fn fail_batch(&self, error: Option<StoreError>) {
        self.lock().batch_error = error;
    }

    /// Makes every single flag fetch fail with `error`, `None` heals it.
    pub fn fail_single(&self, error: Option<StoreError>) {
        self.lock().single_error = error;
    }

    /// Breaks both fetch paths, like a store that can't be reached at all.
    pub fn go_down(&self) {
        let unavailable = StoreError::Unavailable("connection refused".to_string());
        self.fail_batch(Some(unavailable.clone()));
        self.fail_single(Some(unavailable));
    }

    pub fn recover(&self) {
        self.fail_batch(None);
        self.fail_single(None);
    }

    /// Every fetch sleeps this long before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    pub fn get_calls(&self) -> Vec<MockStoreCall> {
        self.lock().calls.clone()
    }

    pub fn batch_calls(&self) -> usize {
        self.get_calls()
            .iter()
            .filter(|c| c.op == "fetch_flags")
            .count()
    }

    pub fn single_calls(&self) -> usize {
        self.get_calls()
            .iter()
            .filter(|c| c.op == "fetch_flag")
            .count()
    }

    fn record(&self, op: &str, keys: Vec<String>) -> Option<Duration> {
        let mut state = self.lock();
        state.calls.push(MockStoreCall {
            op: op.to_string(),
            keys,
        });
        state.delay
    }
}

/// The answer is taken when the call starts, like a query reading a snapshot, and
/// handed back after the configured delay.
#[async_trait]
impl Client for MockFlagStore {
    async fn fetch_flags(&self, keys: &[FlagKey]) -> Result<Vec<RemoteFlag>, StoreError> {
        let delay = self.record(
            "fetch_flags",
            keys.iter().map(|k| k.as_str().to_string()).collect(),
        );
        let answer = {
            let state = self.lock();
            match &state.batch_error {
                Some(error) => Err(error.clone()),
                None => Ok(keys
                    .iter()
                    .filter_map(|k| state.flags.get(k.as_str()).cloned())
                    .collect()),
            }
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        answer
    }

    async fn fetch_flag(&self, key: &FlagKey) -> Result<RemoteFlag, StoreError> {
        let delay = self.record("fetch_flag", vec![key.as_str().to_string()]);
        let answer = {
            let state = self.lock();
            match &state.single_error {
                Some(error) => Err(error.clone()),
                None => state
                    .flags
                    .get(key.as_str())
                    .cloned()
                    .ok_or(StoreError::NotFound),
            }
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        answer
    }
}
