use std::path::{Path, PathBuf};
use std::time::Duration;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::config::EncryptionSecret;
use crate::metrics_consts::{FALLBACK_READS_COUNTER, FALLBACK_WRITES_COUNTER};

pub const SCHEMA_VERSION: u32 = 1;

// AES-GCM standard nonce, 96 bits
const NONCE_SIZE: usize = 12;

#[derive(Error, Debug)]
pub enum FallbackError {
    #[error("no encryption secret configured for the fallback store")]
    SecretMissing,
    #[error("fallback file i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode fallback snapshot: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("failed to encrypt fallback snapshot")]
    Encryption,
    #[error("failed to decrypt fallback snapshot: {0}")]
    Decryption(String),
    #[error("unsupported fallback schema version {0}")]
    SchemaVersion(u32),
}

/// Last kill switch decision computed from the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackSnapshot {
    pub decision: bool,
    /// Unix millis at which the decision was computed.
    pub timestamp: i64,
    pub schema_version: u32,
}

impl FallbackSnapshot {
    pub fn now(decision: bool) -> Self {
        FallbackSnapshot {
            decision,
            timestamp: Utc::now().timestamp_millis(),
            schema_version: SCHEMA_VERSION,
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        let age = Utc::now().timestamp_millis() - self.timestamp;
        // a snapshot from the future is as untrustworthy as an old one
        age >= 0 && u128::from(age.unsigned_abs()) <= ttl.as_millis()
    }
}

/// What actually lands on disk.
#[derive(Debug, Serialize, Deserialize)]
struct SealedSnapshot {
    nonce: String,
    ciphertext: String,
}

/// Removes the temp file unless it was renamed into place.
struct TempFile {
    path: PathBuf,
    committed: bool,
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("failed to remove fallback temp file: {}", e);
                }
            }
        }
    }
}

/// Restart-surviving copy of the last known kill switch decision.
///
/// The payload is sealed with AES-256-GCM under a key derived from the configured
/// secret, with a fresh random nonce for every write. Writes go to a temp file that
/// is renamed over the canonical path, so a reader never sees a partial file and
/// concurrent writers resolve to last-writer-wins.
///
/// Nothing in here propagates errors to the gate: `load` answers `None` for a
/// missing, stale, unreadable or tampered file and `save` only logs.
pub struct FallbackStore {
    path: PathBuf,
    cipher: Aes256Gcm,
    ttl: Duration,
    write_lock: Mutex<()>,
}

impl FallbackStore {
    pub fn new(
        path: impl Into<PathBuf>,
        secret: &EncryptionSecret,
        ttl: Duration,
    ) -> Result<FallbackStore, FallbackError> {
        if secret.is_empty() {
            return Err(FallbackError::SecretMissing);
        }
        let key = Sha256::digest(secret.expose().as_bytes());
        let cipher =
            Aes256Gcm::new_from_slice(key.as_slice()).map_err(|_| FallbackError::Encryption)?;

        Ok(FallbackStore {
            path: path.into(),
            cipher,
            ttl,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persists `decision`, logging instead of failing.
    pub async fn save(&self, decision: bool) {
        match self.write_snapshot(&FallbackSnapshot::now(decision)).await {
            Ok(()) => {
                metrics::counter!(FALLBACK_WRITES_COUNTER, "result" => "ok").increment(1);
                tracing::debug!(decision, "saved kill switch fallback snapshot");
            }
            Err(e) => {
                metrics::counter!(FALLBACK_WRITES_COUNTER, "result" => "error").increment(1);
                tracing::warn!("failed to save kill switch fallback snapshot: {}", e);
            }
        }
    }

    /// The persisted decision, if there is one younger than the TTL.
    pub async fn load(&self) -> Option<bool> {
        match self.read_snapshot().await {
            Ok(Some(snapshot)) if snapshot.is_fresh(self.ttl) => {
                metrics::counter!(FALLBACK_READS_COUNTER, "result" => "hit").increment(1);
                Some(snapshot.decision)
            }
            Ok(Some(snapshot)) => {
                metrics::counter!(FALLBACK_READS_COUNTER, "result" => "stale").increment(1);
                tracing::info!(
                    timestamp = snapshot.timestamp,
                    "ignoring stale kill switch fallback snapshot"
                );
                None
            }
            Ok(None) => {
                metrics::counter!(FALLBACK_READS_COUNTER, "result" => "missing").increment(1);
                None
            }
            Err(e) => {
                metrics::counter!(FALLBACK_READS_COUNTER, "result" => "corrupt").increment(1);
                tracing::warn!("unusable kill switch fallback snapshot: {}", e);
                None
            }
        }
    }

    #[instrument(skip_all)]
    pub(crate) async fn write_snapshot(
        &self,
        snapshot: &FallbackSnapshot,
    ) -> Result<(), FallbackError> {
        let sealed = self.seal(&serde_json::to_vec(snapshot)?)?;
        let bytes = serde_json::to_vec(&sealed)?;

        // released on every return path below
        let _guard = self.write_lock.lock().await;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            create_private_dir(dir).await?;
        }

        let mut temp = TempFile {
            path: self.temp_path(),
            committed: false,
        };
        let mut file = open_private_file(&temp.path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp.path, &self.path).await?;
        temp.committed = true;
        Ok(())
    }

    #[instrument(skip_all)]
    pub(crate) async fn read_snapshot(&self) -> Result<Option<FallbackSnapshot>, FallbackError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let sealed: SealedSnapshot = serde_json::from_slice(&bytes)?;
        let snapshot: FallbackSnapshot = serde_json::from_slice(&self.open(&sealed)?)?;
        if snapshot.schema_version != SCHEMA_VERSION {
            return Err(FallbackError::SchemaVersion(snapshot.schema_version));
        }
        Ok(Some(snapshot))
    }

    fn seal(&self, plaintext: &[u8]) -> Result<SealedSnapshot, FallbackError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| FallbackError::Encryption)?;

        Ok(SealedSnapshot {
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    fn open(&self, sealed: &SealedSnapshot) -> Result<Vec<u8>, FallbackError> {
        let nonce_bytes = BASE64
            .decode(&sealed.nonce)
            .map_err(|e| FallbackError::Decryption(format!("invalid nonce encoding: {e}")))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(FallbackError::Decryption("invalid nonce size".to_string()));
        }
        let ciphertext = BASE64
            .decode(&sealed.ciphertext)
            .map_err(|e| FallbackError::Decryption(format!("invalid ciphertext encoding: {e}")))?;

        self.cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| FallbackError::Decryption("authentication failed".to_string()))
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "fallback".to_string());
        self.path
            .with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::now_v7()))
    }
}

#[cfg(unix)]
async fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if tokio::fs::metadata(dir).await.is_ok() {
        return Ok(());
    }
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await
}

#[cfg(not(unix))]
async fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}

async fn open_private_file(path: &Path) -> std::io::Result<tokio::fs::File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path, secret: &str) -> FallbackStore {
        FallbackStore::new(
            dir.join("state").join("kill-switch-state.json"),
            &EncryptionSecret::new(secret),
            Duration::from_secs(3600),
        )
        .unwrap()
    }

    #[test]
    fn test_requires_a_secret() {
        let result = FallbackStore::new(
            "/tmp/unused.json",
            &EncryptionSecret::new("  "),
            Duration::from_secs(60),
        );
        assert!(matches!(result, Err(FallbackError::SecretMissing)));
    }

    #[tokio::test]
    async fn test_save_then_load_within_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), "s3cret");

        store.save(true).await;
        assert_eq!(store.load().await, Some(true));

        store.save(false).await;
        assert_eq!(store.load().await, Some(false));
    }

    #[tokio::test]
    async fn test_load_without_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), "s3cret");

        assert_eq!(store.load().await, None);
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_absent_regardless_of_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), "s3cret");

        let two_hours_ago = Utc::now().timestamp_millis() - 2 * 60 * 60 * 1000;
        store
            .write_snapshot(&FallbackSnapshot {
                decision: true,
                timestamp: two_hours_ago,
                schema_version: SCHEMA_VERSION,
            })
            .await
            .unwrap();

        // the snapshot is readable, just too old to trust
        assert!(store.read_snapshot().await.unwrap().is_some());
        assert_eq!(store.load().await, None);
    }

    #[tokio::test]
    async fn test_snapshot_from_the_future_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), "s3cret");

        store
            .write_snapshot(&FallbackSnapshot {
                decision: false,
                timestamp: Utc::now().timestamp_millis() + 10 * 60 * 1000,
                schema_version: SCHEMA_VERSION,
            })
            .await
            .unwrap();

        assert_eq!(store.load().await, None);
    }

    #[tokio::test]
    async fn test_payload_is_not_stored_in_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), "s3cret");

        store.save(true).await;
        let first = tokio::fs::read_to_string(store.path()).await.unwrap();
        store.save(true).await;
        let second = tokio::fs::read_to_string(store.path()).await.unwrap();

        assert!(!first.contains("decision"));
        assert!(!first.contains("schemaVersion"));
        // same payload, fresh nonce every time
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_wrong_secret_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        store_in(dir.path(), "s3cret").save(false).await;

        let other = store_in(dir.path(), "not the secret");

        assert_eq!(other.load().await, None);
        assert!(matches!(
            other.read_snapshot().await,
            Err(FallbackError::Decryption(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupted_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), "s3cret");
        store.save(true).await;

        tokio::fs::write(store.path(), b"{\"nonce\": \"AAAA\", \"cipher")
            .await
            .unwrap();
        assert_eq!(store.load().await, None);

        tokio::fs::write(store.path(), b"definitely not json")
            .await
            .unwrap();
        assert_eq!(store.load().await, None);
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), "s3cret");
        store.save(true).await;

        let raw = tokio::fs::read(store.path()).await.unwrap();
        let mut sealed: SealedSnapshot = serde_json::from_slice(&raw).unwrap();
        let mut ciphertext = BASE64.decode(&sealed.ciphertext).unwrap();
        ciphertext[0] ^= 0x01;
        sealed.ciphertext = BASE64.encode(ciphertext);
        tokio::fs::write(store.path(), serde_json::to_vec(&sealed).unwrap())
            .await
            .unwrap();

        assert_eq!(store.load().await, None);
    }

    #[tokio::test]
    async fn test_unknown_schema_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), "s3cret");

        store
            .write_snapshot(&FallbackSnapshot {
                decision: true,
                timestamp: Utc::now().timestamp_millis(),
                schema_version: 2,
            })
            .await
            .unwrap();

        assert!(matches!(
            store.read_snapshot().await,
            Err(FallbackError::SchemaVersion(2))
        ));
        assert_eq!(store.load().await, None);
    }

    #[tokio::test]
    async fn test_concurrent_saves_leave_one_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(store_in(dir.path(), "s3cret"));

        let writers: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.save(i % 2 == 0).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        assert!(store.load().await.is_some());
        let leftovers: Vec<_> = std::fs::read_dir(store.path().parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_and_directory_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), "s3cret");
        store.save(true).await;

        let file_mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        let dir_mode = std::fs::metadata(store.path().parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
        assert_eq!(dir_mode & 0o777, 0o700);
    }
}
