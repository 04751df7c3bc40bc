//! Durable admin identity records.
//!
//! One JSON file per subject under `ADMIN_IDENTITIES_DIR`, plus a
//! username/email index and a bounded cleanup log. Records are the source of
//! truth: an index that disagrees on load is rebuilt from them. Every write
//! follows the same protocol: serialize to a temp file, fsync, rename over
//! the target, with a sibling backup taken first so a torn rename can be
//! restored.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::cognito::ProviderIdentity;
use crate::error::{HubError, HubResult};
use shared::SocketId;

const INDEX_FILE: &str = "admin-index.json";
const CLEANUP_LOG_FILE: &str = "cleanup-log.json";
const CLEANUP_LOG_CAP: usize = 500;

const LOCK_RETRIES: u32 = 3;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One operator principal. `active_sockets` is transient connection state
/// and is never written to disk; it is empty after every restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminIdentity {
    pub admin_id: String,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub owned_sessions: BTreeSet<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(skip)]
    pub active_sockets: HashSet<SocketId>,
}

/// Secondary index persisted next to the records. Records win on any
/// disagreement.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminIndex {
    record_count: usize,
    usernames: BTreeMap<String, String>,
    emails: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupLogEntry {
    pub admin_id: String,
    pub username: String,
    pub reason: String,
    pub removed_at: DateTime<Utc>,
}

pub struct AdminIdentityStore {
    dir: PathBuf,
    records: DashMap<String, AdminIdentity>,
    socket_index: DashMap<SocketId, String>,
    /// One writer at a time per admin id; acquired with bounded retry.
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AdminIdentityStore {
    /// Load every record from `dir`, creating it if needed, and verify the
    /// index against what was loaded.
    pub async fn load(dir: impl Into<PathBuf>) -> HubResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let store = Self {
            records: DashMap::new(),
            socket_index: DashMap::new(),
            write_locks: DashMap::new(),
            dir,
        };

        let mut entries = tokio::fs::read_dir(&store.dir).await?;
        let mut loaded = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json") || name == INDEX_FILE || name == CLEANUP_LOG_FILE {
                continue;
            }

            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<AdminIdentity>(&bytes) {
                    Ok(record) => {
                        store.records.insert(record.admin_id.clone(), record);
                        loaded += 1;
                    }
                    Err(e) => {
                        // Try the sibling backup before giving up on the record.
                        if let Some(record) = store.restore_from_backup(&path).await {
                            store.records.insert(record.admin_id.clone(), record);
                            loaded += 1;
                        } else {
                            let err = HubError::AdminDataCorrupted(format!(
                                "{}: {}",
                                path.display(),
                                e
                            ));
                            error!("{}", err);
                        }
                    }
                },
                Err(e) => error!("unreadable admin identity file {}: {}", path.display(), e),
            }
        }

        store.verify_or_rebuild_index().await;
        info!("loaded {} admin identities from {}", loaded, store.dir.display());
        Ok(store)
    }

    async fn restore_from_backup(&self, path: &Path) -> Option<AdminIdentity> {
        let backup = path.with_extension("json.bak");
        let bytes = tokio::fs::read(&backup).await.ok()?;
        let record: AdminIdentity = serde_json::from_slice(&bytes).ok()?;
        warn!(
            "restored admin identity {} from backup after corrupt primary",
            record.admin_id
        );
        if let Err(e) = tokio::fs::copy(&backup, path).await {
            error!("failed to restore {} from backup: {}", path.display(), e);
        }
        Some(record)
    }

    async fn verify_or_rebuild_index(&self) {
        let index_path = self.dir.join(INDEX_FILE);
        let on_disk: Option<AdminIndex> = match tokio::fs::read(&index_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).ok(),
            Err(_) => None,
        };

        let rebuilt = self.build_index();
        let needs_rewrite = match on_disk {
            Some(index) => {
                index.record_count != rebuilt.record_count
                    || index.usernames != rebuilt.usernames
                    || index.emails != rebuilt.emails
            }
            None => true,
        };

        if needs_rewrite {
            warn!("admin index missing or stale, rebuilding from records");
            if let Err(e) = self.persist_index(&rebuilt).await {
                error!("failed to persist rebuilt admin index: {}", e);
            }
        }
    }

    fn build_index(&self) -> AdminIndex {
        let mut index = AdminIndex {
            record_count: self.records.len(),
            ..Default::default()
        };
        for record in self.records.iter() {
            index
                .usernames
                .insert(record.username.clone(), record.admin_id.clone());
            index
                .emails
                .insert(record.email.clone(), record.admin_id.clone());
        }
        index
    }

    async fn persist_index(&self, index: &AdminIndex) -> HubResult<()> {
        let bytes = serde_json::to_vec_pretty(index)?;
        write_atomic(&self.dir, INDEX_FILE, &bytes).await
    }

    async fn persist_record(&self, record: &AdminIdentity) -> HubResult<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.dir, &format!("{}.json", record.admin_id), &bytes).await
    }

    /// Acquire the per-key write lock with the bounded retry policy. Callers
    /// that lose all retries get a retryable storage error.
    async fn acquire_write_lock(&self, admin_id: &str) -> HubResult<tokio::sync::OwnedMutexGuard<()>> {
        let lock = self
            .write_locks
            .entry(admin_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        for _ in 0..LOCK_RETRIES {
            if let Ok(guard) = lock.clone().try_lock_owned() {
                return Ok(guard);
            }
            tokio::time::sleep(LOCK_RETRY_DELAY).await;
        }
        match lock.try_lock_owned() {
            Ok(guard) => Ok(guard),
            Err(_) => Err(HubError::Storage(format!(
                "admin record {} is busy, try again",
                admin_id
            ))),
        }
    }

    /// Idempotent by subject: creates the record on first sight, refreshes
    /// display attributes and lastSeen on every call. Persists before the
    /// in-memory record is published.
    pub async fn get_or_create_from_provider(
        &self,
        identity: &ProviderIdentity,
    ) -> HubResult<AdminIdentity> {
        let _guard = self.acquire_write_lock(&identity.subject).await?;

        let now = Utc::now();
        let mut record = match self.records.get(&identity.subject) {
            Some(existing) => existing.clone(),
            None => {
                info!("creating admin identity for subject {}", identity.subject);
                AdminIdentity {
                    admin_id: identity.subject.clone(),
                    username: identity.username.clone(),
                    email: identity.email.clone(),
                    created_at: now,
                    last_seen: now,
                    owned_sessions: BTreeSet::new(),
                    groups: identity.groups.clone(),
                    active_sockets: HashSet::new(),
                }
            }
        };

        record.username = identity.username.clone();
        record.email = identity.email.clone();
        record.groups = identity.groups.clone();
        record.last_seen = now;

        self.persist_record(&record)
            .await
            .map_err(|e| HubError::AdminCreationFailed(e.to_string()))?;

        // Commit in place so transient socket state is never clobbered.
        match self.records.get_mut(&identity.subject) {
            Some(mut live) => {
                live.username = record.username.clone();
                live.email = record.email.clone();
                live.groups = record.groups.clone();
                live.last_seen = record.last_seen;
                record = live.clone();
            }
            None => {
                self.records.insert(record.admin_id.clone(), record.clone());
            }
        }

        let index = self.build_index();
        if let Err(e) = self.persist_index(&index).await {
            warn!("admin index write failed (will rebuild on next load): {}", e);
        }

        Ok(record)
    }

    pub async fn add_owned_session(&self, admin_id: &str, session_id: &str) -> HubResult<()> {
        let _guard = self.acquire_write_lock(admin_id).await?;

        let mut record = self
            .records
            .get(admin_id)
            .map(|r| r.value().clone())
            .ok_or(HubError::AdminNotFound)?;
        record.owned_sessions.insert(session_id.to_string());
        record.last_seen = Utc::now();
        self.persist_record(&record).await?;

        if let Some(mut live) = self.records.get_mut(admin_id) {
            live.owned_sessions.insert(session_id.to_string());
            live.last_seen = record.last_seen;
        }
        Ok(())
    }

    pub async fn remove_owned_session(&self, admin_id: &str, session_id: &str) -> HubResult<()> {
        let _guard = self.acquire_write_lock(admin_id).await?;

        let mut record = self
            .records
            .get(admin_id)
            .map(|r| r.value().clone())
            .ok_or(HubError::AdminNotFound)?;
        record.owned_sessions.remove(session_id);
        self.persist_record(&record).await?;

        if let Some(mut live) = self.records.get_mut(admin_id) {
            live.owned_sessions.remove(session_id);
        }
        Ok(())
    }

    /// In-memory only; socket handles are never written to disk.
    pub fn add_active_socket(&self, admin_id: &str, socket: SocketId) {
        if let Some(mut record) = self.records.get_mut(admin_id) {
            record.active_sockets.insert(socket);
        }
        self.socket_index.insert(socket, admin_id.to_string());
    }

    pub fn remove_active_socket(&self, socket: SocketId) {
        if let Some((_, admin_id)) = self.socket_index.remove(&socket) {
            if let Some(mut record) = self.records.get_mut(&admin_id) {
                record.active_sockets.remove(&socket);
            }
        }
    }

    pub fn lookup_by_socket(&self, socket: SocketId) -> Option<String> {
        self.socket_index.get(&socket).map(|id| id.value().clone())
    }

    /// Display lookup only; authorization always goes by admin id.
    pub fn lookup_by_username(&self, username: &str) -> Option<AdminIdentity> {
        self.records
            .iter()
            .find(|r| r.username == username)
            .map(|r| r.value().clone())
    }

    pub fn lookup_by_email(&self, email: &str) -> Option<AdminIdentity> {
        self.records
            .iter()
            .find(|r| r.email == email)
            .map(|r| r.value().clone())
    }

    pub fn get(&self, admin_id: &str) -> Option<AdminIdentity> {
        self.records.get(admin_id).map(|r| r.value().clone())
    }

    pub fn exists(&self, admin_id: &str) -> bool {
        self.records.contains_key(admin_id)
    }

    pub fn list_all(&self) -> Vec<AdminIdentity> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    /// Refresh lastSeen in memory. Durable on the next persisted mutation;
    /// heartbeats alone do not cost a disk write.
    pub fn touch(&self, admin_id: &str) {
        if let Some(mut record) = self.records.get_mut(admin_id) {
            record.last_seen = Utc::now();
        }
    }

    pub async fn delete(&self, admin_id: &str) -> HubResult<Option<AdminIdentity>> {
        let _guard = self.acquire_write_lock(admin_id).await?;

        let Some((_, record)) = self.records.remove(admin_id) else {
            return Ok(None);
        };

        for socket in &record.active_sockets {
            self.socket_index.remove(socket);
        }

        let path = self.dir.join(format!("{}.json", admin_id));
        remove_with_backup(&path).await?;

        let index = self.build_index();
        if let Err(e) = self.persist_index(&index).await {
            warn!("admin index write failed after delete: {}", e);
        }

        Ok(Some(record))
    }

    /// Delete identities with no owned sessions that have been idle past the
    /// retention window. Identities owning sessions are never removed here,
    /// regardless of age.
    pub async fn cleanup(&self, retention: Duration) -> Vec<CleanupLogEntry> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::days(90));

        let candidates: Vec<(String, String)> = self
            .records
            .iter()
            .filter(|r| r.owned_sessions.is_empty() && r.last_seen < cutoff)
            .map(|r| (r.admin_id.clone(), r.username.clone()))
            .collect();

        let mut removed = Vec::new();
        for (admin_id, username) in candidates {
            match self.delete(&admin_id).await {
                Ok(Some(_)) => {
                    info!("cleanup removed idle admin identity {}", admin_id);
                    removed.push(CleanupLogEntry {
                        admin_id,
                        username,
                        reason: "no owned sessions, idle past retention".to_string(),
                        removed_at: Utc::now(),
                    });
                }
                Ok(None) => {}
                Err(e) => error!("cleanup failed to delete {}: {}", admin_id, e),
            }
        }

        if !removed.is_empty() {
            if let Err(e) = self.append_cleanup_log(&removed).await {
                error!("failed to append cleanup log: {}", e);
            }
        }
        removed
    }

    async fn append_cleanup_log(&self, entries: &[CleanupLogEntry]) -> HubResult<()> {
        let path = self.dir.join(CLEANUP_LOG_FILE);
        let mut log: Vec<CleanupLogEntry> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        log.extend_from_slice(entries);
        if log.len() > CLEANUP_LOG_CAP {
            let excess = log.len() - CLEANUP_LOG_CAP;
            log.drain(..excess);
        }
        let bytes = serde_json::to_vec_pretty(&log)?;
        write_atomic(&self.dir, CLEANUP_LOG_FILE, &bytes).await
    }
}

/// The write protocol shared by every durable file in this store and the
/// session registry: sibling backup, temp write, fsync, rename, directory
/// fsync. On any failure the last durable state is left intact.
pub async fn write_atomic(dir: &Path, file_name: &str, bytes: &[u8]) -> HubResult<()> {
    let target = dir.join(file_name);
    let tmp = dir.join(format!("{}.tmp", file_name));
    let backup = dir.join(format!("{}.bak", file_name));

    if tokio::fs::try_exists(&target).await.unwrap_or(false) {
        tokio::fs::copy(&target, &backup).await?;
    }

    {
        let mut file = tokio::fs::File::create(&tmp).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, bytes).await?;
        file.sync_all().await?;
    }

    if let Err(e) = tokio::fs::rename(&tmp, &target).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        // A torn rename leaves the backup authoritative.
        if tokio::fs::try_exists(&backup).await.unwrap_or(false) {
            let _ = tokio::fs::copy(&backup, &target).await;
        }
        return Err(e.into());
    }

    // Directory fsync so the rename itself is durable.
    if let Ok(dir_file) = tokio::fs::File::open(dir).await {
        let _ = dir_file.sync_all().await;
    }

    Ok(())
}

async fn remove_with_backup(path: &Path) -> HubResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let backup = path.with_extension("json.bak");
    let _ = tokio::fs::remove_file(&backup).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(subject: &str, username: &str) -> ProviderIdentity {
        ProviderIdentity {
            subject: subject.to_string(),
            username: username.to_string(),
            email: format!("{}@example.com", username),
            groups: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent_by_subject() {
        let dir = tempfile::tempdir().unwrap();
        let store = AdminIdentityStore::load(dir.path()).await.unwrap();

        let first = store
            .get_or_create_from_provider(&identity("sub-1", "alice"))
            .await
            .unwrap();
        let second = store
            .get_or_create_from_provider(&identity("sub-1", "alice-renamed"))
            .await
            .unwrap();

        assert_eq!(first.admin_id, second.admin_id);
        assert_eq!(second.username, "alice-renamed");
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(store.list_all().len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_round_trip_drops_transient_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = AdminIdentityStore::load(dir.path()).await.unwrap();
            store
                .get_or_create_from_provider(&identity("sub-1", "alice"))
                .await
                .unwrap();
            store.add_owned_session("sub-1", "CHURCH-2025-001").await.unwrap();
            store.add_active_socket("sub-1", uuid::Uuid::new_v4());
            assert_eq!(store.get("sub-1").unwrap().active_sockets.len(), 1);
        }

        let reloaded = AdminIdentityStore::load(dir.path()).await.unwrap();
        let record = reloaded.get("sub-1").unwrap();
        assert_eq!(record.username, "alice");
        assert!(record.owned_sessions.contains("CHURCH-2025-001"));
        // activeSockets is empty on restart.
        assert!(record.active_sockets.is_empty());
    }

    #[tokio::test]
    async fn test_socket_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = AdminIdentityStore::load(dir.path()).await.unwrap();
        store
            .get_or_create_from_provider(&identity("sub-1", "alice"))
            .await
            .unwrap();

        let socket = uuid::Uuid::new_v4();
        store.add_active_socket("sub-1", socket);
        assert_eq!(store.lookup_by_socket(socket).as_deref(), Some("sub-1"));

        store.remove_active_socket(socket);
        assert_eq!(store.lookup_by_socket(socket), None);
        assert!(store.get("sub-1").unwrap().active_sockets.is_empty());
    }

    #[tokio::test]
    async fn test_index_rebuilt_when_stale() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = AdminIdentityStore::load(dir.path()).await.unwrap();
            store
                .get_or_create_from_provider(&identity("sub-1", "alice"))
                .await
                .unwrap();
            store
                .get_or_create_from_provider(&identity("sub-2", "bob"))
                .await
                .unwrap();
        }

        // Corrupt the index; records must win.
        tokio::fs::write(dir.path().join(INDEX_FILE), b"{\"recordCount\": 99}")
            .await
            .unwrap();

        let store = AdminIdentityStore::load(dir.path()).await.unwrap();
        assert_eq!(store.list_all().len(), 2);
        assert_eq!(
            store.lookup_by_username("bob").unwrap().admin_id,
            "sub-2"
        );

        let bytes = tokio::fs::read(dir.path().join(INDEX_FILE)).await.unwrap();
        let index: AdminIndex = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(index.record_count, 2);
    }

    #[tokio::test]
    async fn test_corrupt_record_without_backup_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = AdminIdentityStore::load(dir.path()).await.unwrap();
            store
                .get_or_create_from_provider(&identity("sub-1", "alice"))
                .await
                .unwrap();
        }

        // A record that parses in neither primary nor backup form.
        tokio::fs::write(dir.path().join("sub-2.json"), b"not json")
            .await
            .unwrap();

        let store = AdminIdentityStore::load(dir.path()).await.unwrap();
        assert!(store.exists("sub-1"));
        assert!(!store.exists("sub-2"));
    }

    #[tokio::test]
    async fn test_cleanup_never_removes_session_owners() {
        let dir = tempfile::tempdir().unwrap();
        let store = AdminIdentityStore::load(dir.path()).await.unwrap();

        store
            .get_or_create_from_provider(&identity("owner", "alice"))
            .await
            .unwrap();
        store.add_owned_session("owner", "X-2025-001").await.unwrap();
        store
            .get_or_create_from_provider(&identity("idle", "bob"))
            .await
            .unwrap();

        // Age both records far past any retention window.
        for id in ["owner", "idle"] {
            let mut record = store.get(id).unwrap();
            record.last_seen = Utc::now() - chrono::Duration::days(365);
            store.records.insert(id.to_string(), record);
        }

        let removed = store.cleanup(Duration::from_secs(90 * 24 * 3600)).await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].admin_id, "idle");
        assert!(store.exists("owner"));
        assert!(!store.exists("idle"));

        // Cleanup log was appended.
        let bytes = tokio::fs::read(dir.path().join(CLEANUP_LOG_FILE)).await.unwrap();
        let log: Vec<CleanupLogEntry> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].admin_id, "idle");
    }

    #[tokio::test]
    async fn test_write_atomic_leaves_backup() {
        let dir = tempfile::tempdir().unwrap();
        write_atomic(dir.path(), "r.json", b"{\"v\":1}").await.unwrap();
        write_atomic(dir.path(), "r.json", b"{\"v\":2}").await.unwrap();

        let current = tokio::fs::read(dir.path().join("r.json")).await.unwrap();
        assert_eq!(current, b"{\"v\":2}");
        let backup = tokio::fs::read(dir.path().join("r.json.bak")).await.unwrap();
        assert_eq!(backup, b"{\"v\":1}");
        // No temp file left behind.
        assert!(!dir.path().join("r.json.tmp").exists());
    }
}
