//! Durable, lock-guarded JSON document holding every job, log line and config value.
//!
//! All reads and writes go through [`Store::transaction`]: lock, load, apply,
//! rewrite, unlock. A body that returns `Err` leaves the file untouched.

mod lock;

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{QueueError, Result};
use crate::job::Job;

pub use lock::StoreLock;

/// Environment variable overriding the document location
pub const STORE_PATH_ENV: &str = "QUEUECTL_STORE";
/// Document file name used when no override is given
pub const DEFAULT_STORE_FILE: &str = "store.json";

pub const MAX_RETRIES_KEY: &str = "maxRetries";
pub const BACKOFF_BASE_KEY: &str = "backoffBase";
pub const DEFAULT_TIMEOUT_KEY: &str = "defaultTimeoutMs";

/// Store configuration options
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Location of the JSON document
    pub path: PathBuf,
    /// Lock attempts after the first before giving up with `LockTimeout`
    pub lock_retries: u32,
    /// First wait between lock attempts
    pub lock_min_wait: Duration,
    /// Ceiling on the wait between lock attempts
    pub lock_max_wait: Duration,
    /// Growth factor applied to the wait after each busy attempt
    pub lock_factor: f64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            path: PathBuf::from(DEFAULT_STORE_FILE),
            lock_retries: 50,
            lock_min_wait: Duration::from_millis(10),
            lock_max_wait: Duration::from_millis(100),
            lock_factor: 1.2,
        }
    }
}

impl StoreOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StoreOptions {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Defaults, with the path taken from `QUEUECTL_STORE` when set
    pub fn from_env() -> Self {
        match env::var(STORE_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => StoreOptions::new(path),
            _ => StoreOptions::default(),
        }
    }
}

/// Advisory log line; written by the engine, never read back by it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub job_id: String,
    pub level: String,
    pub message: String,
    pub ts: i64,
}

/// The whole persisted state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default = "default_config")]
    pub config: BTreeMap<String, String>,
}

impl Default for StoreDocument {
    fn default() -> Self {
        StoreDocument {
            jobs: Vec::new(),
            logs: Vec::new(),
            config: default_config(),
        }
    }
}

/// Configuration a fresh document is seeded with
pub fn default_config() -> BTreeMap<String, String> {
    BTreeMap::from([
        (MAX_RETRIES_KEY.to_string(), "3".to_string()),
        (BACKOFF_BASE_KEY.to_string(), "2".to_string()),
        (DEFAULT_TIMEOUT_KEY.to_string(), "30000".to_string()),
    ])
}

impl StoreDocument {
    pub fn find_job(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id == id)
    }

    pub fn find_job_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|job| job.id == id)
    }

    /// Append an advisory log line
    pub fn log(&mut self, job_id: &str, level: &str, message: impl Into<String>, ts: i64) {
        self.logs.push(LogEntry {
            job_id: job_id.to_string(),
            level: level.to_string(),
            message: message.into(),
            ts,
        });
    }

    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }

    /// Numeric config value, falling back when missing or malformed
    pub fn config_number<T: FromStr>(&self, key: &str, fallback: T) -> T {
        match self.config_value(key) {
            None => fallback,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!("Ignoring malformed config value {}={:?}", key, raw);
                fallback
            }),
        }
    }
}

/// Transactional access to the JSON document
#[derive(Debug, Clone)]
pub struct Store {
    options: StoreOptions,
    lock_path: PathBuf,
}

impl Store {
    pub fn new(options: StoreOptions) -> Self {
        let mut lock_name = options.path.clone().into_os_string();
        lock_name.push(".lock");

        Store {
            options,
            lock_path: PathBuf::from(lock_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.options.path
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Run `f` against the current document under the cross-process lock.
    ///
    /// The document is rewritten only when `f` returns `Ok`. `f` is synchronous
    /// so nothing can be awaited while the lock is held.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut StoreDocument) -> Result<T>,
    {
        self.ensure_parent_dir().await?;

        let _lock = StoreLock::acquire(&self.lock_path, &self.options).await?;
        debug!("Acquired store lock {}", self.lock_path.display());

        let mut document = self.load().await?;
        let result = f(&mut document)?;
        self.persist(&document).await?;

        Ok(result)
    }

    async fn ensure_parent_dir(&self) -> Result<()> {
        match self.options.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                tokio::fs::create_dir_all(parent).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn load(&self) -> Result<StoreDocument> {
        let raw = match tokio::fs::read_to_string(&self.options.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Initializing new store at {}", self.options.path.display());
                return Ok(StoreDocument::default());
            }
            Err(e) => return Err(QueueError::IoError(e)),
        };

        if raw.trim().is_empty() {
            return Ok(StoreDocument::default());
        }

        serde_json::from_str(&raw).map_err(|e| QueueError::SerializationError(e.to_string()))
    }

    async fn persist(&self, document: &StoreDocument) -> Result<()> {
        let data = serde_json::to_string_pretty(document)
            .map_err(|e| QueueError::SerializationError(e.to_string()))?;

        let mut tmp_name = self.options.path.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        tokio::fs::write(&tmp_path, data).await?;
        tokio::fs::rename(&tmp_path, &self.options.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobInput;
    use tempfile::tempdir;

    fn test_store(dir: &Path) -> Store {
        Store::new(StoreOptions::new(dir.join("store.json")))
    }

    #[tokio::test]
    async fn test_missing_document_is_initialized() {
        let temp_dir = tempdir().unwrap();
        let store = test_store(temp_dir.path());
        assert!(!store.path().exists());

        let (jobs, config) = store
            .transaction(|doc| Ok((doc.jobs.len(), doc.config.clone())))
            .await
            .unwrap();

        assert_eq!(jobs, 0);
        assert_eq!(config, default_config());
        assert!(store.path().exists());

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["config"]["backoffBase"], "2");
        assert_eq!(value["config"]["defaultTimeoutMs"], "30000");
        assert!(value["jobs"].as_array().unwrap().is_empty());
        assert!(value["logs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nested_store_path_is_created() {
        let temp_dir = tempdir().unwrap();
        let store = Store::new(StoreOptions::new(temp_dir.path().join("a/b/store.json")));

        store.transaction(|_| Ok(())).await.unwrap();
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn test_mutations_persist_across_transactions() {
        let temp_dir = tempdir().unwrap();
        let store = test_store(temp_dir.path());

        store
            .transaction(|doc| {
                doc.jobs.push(Job::new(JobInput::new("true").with_id("a"), 3, 0)?);
                doc.log("a", "info", "queued", 0);
                Ok(())
            })
            .await
            .unwrap();

        // A fresh handle sees what the first one wrote
        let other = test_store(temp_dir.path());
        let (found, logs) = other
            .transaction(|doc| Ok((doc.find_job("a").cloned(), doc.logs.len())))
            .await
            .unwrap();

        assert_eq!(found.unwrap().command, "true");
        assert_eq!(logs, 1);
    }

    #[tokio::test]
    async fn test_failed_body_leaves_document_unchanged() {
        let temp_dir = tempdir().unwrap();
        let store = test_store(temp_dir.path());
        store.transaction(|_| Ok(())).await.unwrap();
        let before = std::fs::read_to_string(store.path()).unwrap();

        let result: Result<()> = store
            .transaction(|doc| {
                doc.jobs.push(Job::new(JobInput::new("true"), 3, 0)?);
                Err(QueueError::InvalidArgument("abort".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_lock_timeout_aborts_operation() {
        let temp_dir = tempdir().unwrap();
        let options = StoreOptions {
            lock_retries: 2,
            lock_min_wait: Duration::from_millis(1),
            lock_max_wait: Duration::from_millis(2),
            ..StoreOptions::new(temp_dir.path().join("store.json"))
        };
        let store = Store::new(options.clone());
        store.transaction(|_| Ok(())).await.unwrap();

        let _held = StoreLock::acquire(&temp_dir.path().join("store.json.lock"), &options)
            .await
            .unwrap();

        let result = store.transaction(|doc| {
            doc.config.insert("touched".into(), "yes".into());
            Ok(())
        });
        assert!(matches!(result.await, Err(QueueError::LockTimeout(_))));

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(!raw.contains("touched"));
    }

    #[tokio::test]
    async fn test_concurrent_transactions_serialize() {
        let temp_dir = tempdir().unwrap();
        let store = test_store(temp_dir.path());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    store
                        .transaction(|doc| {
                            let n: u32 = doc.config_number("counter", 0);
                            doc.config.insert("counter".into(), (n + 1).to_string());
                            Ok(())
                        })
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let total: u32 = store
            .transaction(|doc| Ok(doc.config_number("counter", 0)))
            .await
            .unwrap();
        assert_eq!(total, 40);
    }

    #[test]
    fn test_config_number_falls_back_on_garbage() {
        let mut doc = StoreDocument::default();
        assert_eq!(doc.config_number(BACKOFF_BASE_KEY, 9.0), 2.0);

        doc.config.insert(BACKOFF_BASE_KEY.into(), "fast".into());
        assert_eq!(doc.config_number(BACKOFF_BASE_KEY, 2.0), 2.0);
        assert_eq!(doc.config_number::<u64>("missing", 7), 7);
    }

    #[test]
    fn test_reads_document_with_extra_fields() {
        let raw = r#"{"jobs":[],"logs":[],"workers":[],"config":{"backoffBase":"3"}}"#;
        let doc: StoreDocument = serde_json::from_str(raw).unwrap();
        assert_eq!(doc.config_value(BACKOFF_BASE_KEY), Some("3"));
    }
}
