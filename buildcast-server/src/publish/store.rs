//! Persistent status records for publish jobs.
//!
//! One JSON record per job, keyed by `<prefix><job_id>`, with an absolute
//! expiry. Expired rows read as missing and are swept by `purge_expired`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::aggregate;
use super::clock::{Clock, SystemClock};
use super::types::{BuildJob, Platform, PlatformBuildState, TransitionError};

/// Key namespace used when none is configured.
pub const DEFAULT_KEY_PREFIX: &str = "buildcast:publish:build:";

/// Default lifetime of a job record.
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Bound on compare-and-swap retries for one `update_platform` call.
const MAX_CAS_ATTEMPTS: u32 = 32;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Build job not found: {0}")]
    NotFound(String),
    #[error("Platform {platform} is not part of job {job_id}")]
    UnknownPlatform { job_id: String, platform: Platform },
    #[error("Gave up on job {0} after repeated concurrent writes")]
    Conflict(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn serde_err(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

/// Key-value persistence of job records.
///
/// A missing or expired record is `Ok(None)`, never an error.
pub trait StatusStore: Send + Sync {
    fn get(&self, job_id: &str) -> Result<Option<BuildJob>, StoreError>;

    /// Write the whole record, replacing any previous one, expiring after `ttl`.
    fn set(&self, job: &BuildJob, ttl: Duration) -> Result<(), StoreError>;

    /// Returns whether a live record was removed.
    fn delete(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Apply `mutator` to one platform slice and write the record back with
    /// the overall status recomputed. Concurrent calls for the same job are
    /// serialized; none of their changes is lost.
    ///
    /// The mutator may run more than once if another writer got in first.
    fn update_platform(
        &self,
        job_id: &str,
        platform: Platform,
        mutator: &mut dyn FnMut(&mut PlatformBuildState) -> Result<(), TransitionError>,
    ) -> Result<BuildJob, StoreError>;

    /// Number of live records.
    fn count(&self) -> Result<usize, StoreError>;

    /// Drop expired rows, returning how many went.
    fn purge_expired(&self) -> Result<usize, StoreError>;

    /// Drop every record in this store's namespace.
    fn clear(&self) -> Result<usize, StoreError>;
}

pub struct SqliteStatusStore {
    db: Mutex<Connection>,
    prefix: String,
    clock: Arc<dyn Clock>,
}

impl SqliteStatusStore {
    /// Open or create the status database.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(db_err)?;
        let store = SqliteStatusStore {
            db: Mutex::new(conn),
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            clock: Arc::new(SystemClock),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let db = self.db.lock();
        db.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS build_status (
                key TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                record_json TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_build_status_expiry ON build_status(expires_at);
            ",
        )
        .map_err(db_err)
    }

    pub fn key_for(&self, job_id: &str) -> String {
        format!("{}{}", self.prefix, job_id)
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn prefix_pattern(&self) -> String {
        let escaped = self
            .prefix
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        format!("{escaped}%")
    }

    /// Read the live row for a job: (version, record, expires_at).
    fn load(&self, key: &str) -> Result<Option<(i64, BuildJob, i64)>, StoreError> {
        let now = self.now_ms();
        let row: Option<(i64, String, i64)> = {
            let db = self.db.lock();
            db.query_row(
                "SELECT version, record_json, expires_at FROM build_status
                 WHERE key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(db_err)?
        };
        match row {
            Some((version, json, expires_at)) => {
                let job: BuildJob = serde_json::from_str(&json).map_err(serde_err)?;
                Ok(Some((version, job, expires_at)))
            }
            None => Ok(None),
        }
    }
}

// ─── StatusStore ─────────────────────────────────────────────────────────────

impl StatusStore for SqliteStatusStore {
    fn get(&self, job_id: &str) -> Result<Option<BuildJob>, StoreError> {
        Ok(self.load(&self.key_for(job_id))?.map(|(_, job, _)| job))
    }

    fn set(&self, job: &BuildJob, ttl: Duration) -> Result<(), StoreError> {
        let json = serde_json::to_string(job).map_err(serde_err)?;
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = self.now_ms().saturating_add(ttl_ms);
        let db = self.db.lock();
        db.execute(
            "INSERT OR REPLACE INTO build_status (key, version, record_json, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![self.key_for(&job.job_id), job.version as i64, json, expires_at],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn delete(&self, job_id: &str) -> Result<bool, StoreError> {
        let now = self.now_ms();
        let db = self.db.lock();
        let removed = db
            .execute(
                "DELETE FROM build_status WHERE key = ?1 AND expires_at > ?2",
                params![self.key_for(job_id), now],
            )
            .map_err(db_err)?;
        Ok(removed > 0)
    }

    fn update_platform(
        &self,
        job_id: &str,
        platform: Platform,
        mutator: &mut dyn FnMut(&mut PlatformBuildState) -> Result<(), TransitionError>,
    ) -> Result<BuildJob, StoreError> {
        let key = self.key_for(job_id);
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let Some((version, mut job, expires_at)) = self.load(&key)? else {
                return Err(StoreError::NotFound(job_id.to_string()));
            };
            let state = job
                .platform_states
                .get_mut(&platform)
                .ok_or_else(|| StoreError::UnknownPlatform {
                    job_id: job_id.to_string(),
                    platform,
                })?;
            mutator(state)?;

            aggregate::refresh(&mut job);
            job.updated_at = self.clock.now();
            job.version = version as u64 + 1;
            let json = serde_json::to_string(&job).map_err(serde_err)?;

            let written = {
                let db = self.db.lock();
                db.execute(
                    "UPDATE build_status SET version = ?1, record_json = ?2
                     WHERE key = ?3 AND version = ?4 AND expires_at = ?5",
                    params![job.version as i64, json, key, version, expires_at],
                )
                .map_err(db_err)?
            };
            if written == 1 {
                return Ok(job);
            }
            tracing::debug!(job_id, %platform, attempt, "Status write raced, retrying");
            std::thread::yield_now();
        }
        Err(StoreError::Conflict(job_id.to_string()))
    }

    fn count(&self) -> Result<usize, StoreError> {
        let now = self.now_ms();
        let db = self.db.lock();
        let n: i64 = db
            .query_row(
                "SELECT COUNT(*) FROM build_status
                 WHERE key LIKE ?1 ESCAPE '\\' AND expires_at > ?2",
                params![self.prefix_pattern(), now],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(n as usize)
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.now_ms();
        let db = self.db.lock();
        db.execute(
            "DELETE FROM build_status WHERE expires_at <= ?1",
            params![now],
        )
        .map_err(db_err)
    }

    fn clear(&self) -> Result<usize, StoreError> {
        let db = self.db.lock();
        db.execute(
            "DELETE FROM build_status WHERE key LIKE ?1 ESCAPE '\\'",
            params![self.prefix_pattern()],
        )
        .map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::clock::ManualClock;
    use crate::publish::types::{BuildStatus, Strategy};
    use chrono::{DateTime, TimeDelta, Utc};

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn job(id: &str, platforms: Vec<Platform>) -> BuildJob {
        BuildJob::new(id.into(), "proj".into(), platforms, Strategy::Parallel, t0())
    }

    fn test_store() -> (SqliteStatusStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = SqliteStatusStore::in_memory()
            .unwrap()
            .with_clock(clock.clone());
        (store, clock)
    }

    #[test]
    fn set_get_delete() {
        let (store, _) = test_store();
        let j = job("J1", vec![Platform::Android]);
        store.set(&j, DEFAULT_RECORD_TTL).unwrap();
        assert_eq!(store.get("J1").unwrap(), Some(j));
        assert!(store.delete("J1").unwrap());
        assert!(!store.delete("J1").unwrap());
        assert!(store.get("J1").unwrap().is_none());
    }

    #[test]
    fn missing_is_none_not_error() {
        let (store, _) = test_store();
        assert!(store.get("nope").unwrap().is_none());
        assert!(matches!(
            store.update_platform("nope", Platform::H5, &mut |s| s.start(t0())),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn record_expires_after_ttl() {
        let (store, clock) = test_store();
        store
            .set(&job("J1", vec![Platform::H5]), Duration::from_secs(60))
            .unwrap();
        clock.advance(TimeDelta::seconds(59));
        assert!(store.get("J1").unwrap().is_some());
        assert_eq!(store.count().unwrap(), 1);
        clock.advance(TimeDelta::seconds(1));
        assert!(store.get("J1").unwrap().is_none());
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(store.purge_expired().unwrap(), 1);
    }

    #[test]
    fn update_recomputes_overall_and_keeps_expiry() {
        let (store, clock) = test_store();
        store
            .set(
                &job("J1", vec![Platform::Android, Platform::H5]),
                Duration::from_secs(120),
            )
            .unwrap();

        let now = clock.now();
        let j = store
            .update_platform("J1", Platform::Android, &mut |s| s.start(now))
            .unwrap();
        assert_eq!(j.status, BuildStatus::InProgress);
        assert_eq!(j.version, 1);

        let j = store
            .update_platform("J1", Platform::Android, &mut |s| {
                s.succeed("J1/android/app.apk".into(), now)
            })
            .unwrap();
        assert_eq!(j.status, BuildStatus::Pending);

        store
            .update_platform("J1", Platform::H5, &mut |s| {
                s.start(now)?;
                s.fail("boom", now)
            })
            .unwrap();
        let j = store.get("J1").unwrap().unwrap();
        assert_eq!(j.status, BuildStatus::Failed);
        assert_eq!(j.version, 3);

        clock.advance(TimeDelta::seconds(120));
        assert!(store.get("J1").unwrap().is_none());
    }

    #[test]
    fn rejected_mutation_writes_nothing() {
        let (store, _) = test_store();
        store
            .set(&job("J1", vec![Platform::Ios]), DEFAULT_RECORD_TTL)
            .unwrap();
        let err = store
            .update_platform("J1", Platform::Ios, &mut |s| s.advance(40))
            .unwrap_err();
        assert!(matches!(err, StoreError::Transition(_)));
        assert_eq!(store.get("J1").unwrap().unwrap().version, 0);

        let err = store
            .update_platform("J1", Platform::Desktop, &mut |s| s.start(t0()))
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownPlatform { .. }));
    }

    #[test]
    fn concurrent_updates_lose_nothing() {
        let (store, _) = test_store();
        let store = Arc::new(store);
        store
            .set(&job("J1", Platform::ALL.to_vec()), DEFAULT_RECORD_TTL)
            .unwrap();

        let handles: Vec<_> = Platform::ALL
            .into_iter()
            .map(|platform| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for pct in [10u8, 20, 30, 40, 50] {
                        store
                            .update_platform("J1", platform, &mut |s| {
                                s.start(t0())?;
                                s.advance(pct)
                            })
                            .unwrap();
                    }
                    store
                        .update_platform("J1", platform, &mut |s| {
                            s.succeed(format!("J1/{platform}/app"), t0())
                        })
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let j = store.get("J1").unwrap().unwrap();
        assert_eq!(j.version, 30);
        assert_eq!(j.status, BuildStatus::Success);
        assert_eq!(j.count_with_status(BuildStatus::Success), 5);
    }

    #[test]
    fn namespaces_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.db");
        let path = path.to_str().unwrap();
        let a = SqliteStatusStore::open(path).unwrap().with_prefix("a:");
        let b = SqliteStatusStore::open(path).unwrap().with_prefix("b:");
        a.set(&job("J1", vec![Platform::H5]), DEFAULT_RECORD_TTL).unwrap();
        assert!(b.get("J1").unwrap().is_none());
        assert_eq!(a.count().unwrap(), 1);
        assert_eq!(b.count().unwrap(), 0);
        assert_eq!(b.clear().unwrap(), 0);
        assert_eq!(a.clear().unwrap(), 1);
        assert_eq!(a.key_for("J1"), "a:J1");
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.db");
        let path = path.to_str().unwrap();
        {
            let store = SqliteStatusStore::open(path).unwrap();
            store
                .set(&job("J1", vec![Platform::Desktop]), DEFAULT_RECORD_TTL)
                .unwrap();
        }
        let store = SqliteStatusStore::open(path).unwrap();
        assert_eq!(store.get("J1").unwrap().unwrap().platforms, vec![Platform::Desktop]);
    }
}
