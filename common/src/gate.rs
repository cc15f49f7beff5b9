// Scan gate: cross-process mutual exclusion around check-then-submit
//
// One invocation per (project, branch) may look at the scan queue and submit
// at a time. The file backend relies on flock, so a crashed holder's lock
// goes away with its process; the Redis backend uses an expiring lease.

use crate::catalog::CatalogClient;
use crate::clone_url::CloneUrl;
use crate::errors::GateError;
use crate::repo::RepoDetails;
use crate::scan::{ScanRequest, ScanService, ScanSubmission};
use async_trait::async_trait;
use fs2::FileExt;
use redis::aio::ConnectionManager;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Organization used when a clone URL does not reveal one
const FALLBACK_SCM_ORG: &str = "anyorg";

/// Stable lock name for a project branch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GateKey(String);

impl GateKey {
    pub fn new(project_id: &str, branch: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(project_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(branch.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

enum Held {
    File { file: File, path: PathBuf },
    Redis {
        conn: ConnectionManager,
        redis_key: String,
        token: String,
    },
}

/// Proof of holding a gate lock.
///
/// Call [`GateGuard::release`] when done; dropping the guard releases too,
/// but a Redis lease released on drop is best-effort.
pub struct GateGuard {
    key: GateKey,
    held: Option<Held>,
    acquired_at: Instant,
}

impl GateGuard {
    fn new(key: GateKey, held: Held) -> Self {
        Self {
            key,
            held: Some(held),
            acquired_at: Instant::now(),
        }
    }

    pub fn key(&self) -> &GateKey {
        &self.key
    }

    pub fn elapsed(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub async fn release(mut self) -> Result<(), GateError> {
        match self.held.take() {
            Some(Held::File { file, path }) => {
                tokio::task::spawn_blocking(move || release_file(&file, &path))
                    .await
                    .map_err(|e| GateError::Lock(e.to_string()))??
            }
            Some(Held::Redis {
                mut conn,
                redis_key,
                token,
            }) => release_lease(&mut conn, &redis_key, &token).await?,
            None => {}
        }
        debug!(key = %self.key.as_str(), held_ms = self.elapsed().as_millis() as u64, "Gate released");
        Ok(())
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        match self.held.take() {
            Some(Held::File { file, path }) => {
                if let Err(e) = release_file(&file, &path) {
                    warn!(key = %self.key.as_str(), error = %e, "Failed to unlock gate file on drop");
                }
            }
            Some(Held::Redis {
                mut conn,
                redis_key,
                token,
            }) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = release_lease(&mut conn, &redis_key, &token).await {
                            warn!(key = %redis_key, error = %e, "Failed to release gate lease on drop");
                        }
                    });
                }
                // The lease expires on its own
                Err(_) => warn!(key = %redis_key, "No runtime to release gate lease"),
            },
            None => {}
        }
    }
}

/// Non-blocking named exclusive lock
#[async_trait]
pub trait GateLock: Send + Sync {
    /// `Ok(None)` means another holder has the key
    async fn try_acquire(&self, key: &GateKey) -> Result<Option<GateGuard>, GateError>;
}

/// `flock` on `<lock_dir>/<key>.lock`
#[derive(Debug, Clone)]
pub struct FileGateLock {
    lock_dir: PathBuf,
}

impl FileGateLock {
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
        }
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    fn lock_path(&self, key: &GateKey) -> PathBuf {
        self.lock_dir.join(format!("{}.lock", key.as_str()))
    }
}

/// Lock files are unlinked on release, so a freshly locked file may already
/// be gone from the directory; this many reopen attempts before giving up
const FILE_LOCK_ATTEMPTS: usize = 3;

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn lock_file(lock_dir: &Path, path: &Path) -> std::io::Result<Option<File>> {
    std::fs::create_dir_all(lock_dir)?;

    for _ in 0..FILE_LOCK_ATTEMPTS {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => return Ok(None),
            Err(e) => return Err(e),
        }

        if is_linked(&file, path)? {
            return Ok(Some(file));
        }
        // Locked an inode a releasing holder just unlinked
        file.unlock()?;
    }

    Ok(None)
}

/// The locked file is still the one at `path`
#[cfg(unix)]
fn is_linked(file: &File, path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn is_linked(_file: &File, _path: &Path) -> std::io::Result<bool> {
    Ok(true)
}

/// Unlink while still holding the lock, then unlock
fn release_file(file: &File, path: &Path) -> std::io::Result<()> {
    if cfg!(unix) {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove gate lock file"),
        }
    }
    file.unlock()
}

#[async_trait]
impl GateLock for FileGateLock {
    async fn try_acquire(&self, key: &GateKey) -> Result<Option<GateGuard>, GateError> {
        let lock_dir = self.lock_dir.clone();
        let path = self.lock_path(key);

        let file = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || lock_file(&lock_dir, &path))
                .await
                .map_err(|e| GateError::Lock(e.to_string()))??
        };

        match file {
            Some(file) => {
                debug!(path = %path.display(), "Gate lock acquired");
                Ok(Some(GateGuard::new(key.clone(), Held::File { file, path })))
            }
            None => Ok(None),
        }
    }
}

/// `SET NX PX` lease with compare-and-delete release
#[derive(Clone)]
pub struct RedisGateLock {
    conn: ConnectionManager,
    lease: Duration,
}

impl RedisGateLock {
    #[instrument(skip(url))]
    pub async fn connect(url: &str, lease: Duration) -> Result<Self, GateError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected gate lock to Redis");
        Ok(Self { conn, lease })
    }

    fn redis_key(key: &GateKey) -> String {
        format!("scan-gate:{}", key.as_str())
    }
}

#[async_trait]
impl GateLock for RedisGateLock {
    async fn try_acquire(&self, key: &GateKey) -> Result<Option<GateGuard>, GateError> {
        let mut conn = self.conn.clone();
        let redis_key = Self::redis_key(key);
        let token = Uuid::new_v4().to_string();

        let result: Option<String> = redis::cmd("SET")
            .arg(&redis_key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(self.lease.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        if result.is_none() {
            return Ok(None);
        }

        debug!(key = %redis_key, lease_ms = self.lease.as_millis() as u64, "Gate lease acquired");
        Ok(Some(GateGuard::new(
            key.clone(),
            Held::Redis {
                conn,
                redis_key,
                token,
            },
        )))
    }
}

async fn release_lease(
    conn: &mut ConnectionManager,
    redis_key: &str,
    token: &str,
) -> Result<(), GateError> {
    let script = r#"
        if redis.call("get", KEYS[1]) == ARGV[1] then
            return redis.call("del", KEYS[1])
        else
            return 0
        end
    "#;

    let released: i32 = redis::Script::new(script)
        .key(redis_key)
        .arg(token)
        .invoke_async(conn)
        .await?;

    if released == 0 {
        warn!(key = %redis_key, "Gate lease expired before release");
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Submitted { scan_id: Option<String> },
    AlreadyRunning,
    Busy,
}

impl GateOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateOutcome::Submitted { .. } => "submitted",
            GateOutcome::AlreadyRunning => "already_running",
            GateOutcome::Busy => "busy",
        }
    }
}

/// Submits a scheduled scan unless one is already queued or running
pub struct ScanGate {
    lock: Arc<dyn GateLock>,
    catalog: Arc<dyn CatalogClient>,
    scans: Arc<dyn ScanService>,
}

impl ScanGate {
    pub fn new(
        lock: Arc<dyn GateLock>,
        catalog: Arc<dyn CatalogClient>,
        scans: Arc<dyn ScanService>,
    ) -> Self {
        Self {
            lock,
            catalog,
            scans,
        }
    }

    #[instrument(skip(self, request), fields(project_id = %request.project_id, branch = %request.branch))]
    pub async fn submit_if_idle(&self, request: &ScanRequest) -> Result<GateOutcome, GateError> {
        let key = GateKey::new(&request.project_id, &request.branch);
        let Some(guard) = self.lock.try_acquire(&key).await? else {
            debug!("Another invocation holds the gate, skipping");
            return Ok(GateOutcome::Busy);
        };

        let outcome = self.check_and_submit(request).await;

        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release gate");
        }
        outcome
    }

    async fn check_and_submit(&self, request: &ScanRequest) -> Result<GateOutcome, GateError> {
        let project = self
            .catalog
            .get_project(&request.project_id)
            .await?
            .ok_or_else(|| GateError::SubmissionRejected {
                project_id: request.project_id.clone(),
                reason: "project not found".to_string(),
            })?;

        let details = RepoDetails::new(self.catalog.as_ref(), &project);
        let submission = match details.repo_manager().await? {
            Some(repo_manager) => {
                let latest = self
                    .scans
                    .latest_scan_status(&request.project_id, &request.branch)
                    .await?;
                if latest.is_some_and(|status| status.is_in_flight()) {
                    info!(status = ?latest, "Latest scan still in flight, skipping");
                    return Ok(GateOutcome::AlreadyRunning);
                }

                let scm_id = repo_manager
                    .scm_id
                    .clone()
                    .ok_or_else(|| GateError::SubmissionRejected {
                        project_id: request.project_id.clone(),
                        reason: "repository manager has no SCM id".to_string(),
                    })?;
                let repo_url = if repo_manager.url.is_empty() {
                    request.repo_url.clone()
                } else {
                    repo_manager.url.clone()
                };
                let org = CloneUrl::parse(repo_manager.scm_type.as_deref().unwrap_or_default(), &repo_url)
                    .org
                    .unwrap_or_else(|| FALLBACK_SCM_ORG.to_string());

                ScanSubmission::RepoManager {
                    scm_id,
                    org,
                    scm_type: repo_manager.scm_type.clone(),
                    repo_identity: repo_manager.repo_identity.clone(),
                    repo_id: repo_manager.id.clone().or_else(|| project.repo_id.clone()),
                    repo_url,
                    project_id: request.project_id.clone(),
                    branch: request.branch.clone(),
                    engines: request.engines.clone(),
                }
            }
            None => {
                let in_flight = self
                    .scans
                    .count_scheduled_in_flight(&request.project_id, &request.branch)
                    .await?;
                if in_flight > 0 {
                    info!(in_flight, "Scheduled scan already running, skipping");
                    return Ok(GateOutcome::AlreadyRunning);
                }
                ScanSubmission::git(request)
            }
        };

        let scan_id = self.scans.submit_scan(&submission).await?;
        info!(scan_id = ?scan_id, "Scan submitted");
        Ok(GateOutcome::Submitted { scan_id })
    }
}
