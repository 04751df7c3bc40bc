//! Session registry: the in-memory directory of live sessions plus their
//! best-effort on-disk mirror.
//!
//! Ownership-relevant mutations (`create`, `update_config`, `end`) persist
//! atomically before the in-memory record is replaced, so a failed write
//! rolls back cleanly. Listener roster changes are transient and never touch
//! disk. Broadcast iteration works on per-language snapshots so roster
//! mutations are not blocked mid-fanout.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{HubError, HubResult};
use crate::identity_store::write_atomic;
use shared::{
    is_valid_session_id, AccessMode, Language, ListenerCapabilities, SessionConfig, SessionStatus,
    SessionSummary, SocketId, TtsMode,
};

const LOCK_RETRIES: u32 = 3;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ListenerEntry {
    pub preferred_language: Language,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub capabilities: ListenerCapabilities,
}

/// One broadcast session. Socket handles and the listener roster are
/// transient; what survives a restart is identity, config, and status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub admin_id: String,
    pub created_by: String,
    pub config: SessionConfig,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: SessionStatus,
    #[serde(skip)]
    pub current_admin_socket: Option<SocketId>,
    #[serde(skip)]
    pub listeners: HashMap<SocketId, ListenerEntry>,
}

impl Session {
    pub fn to_summary(&self, requesting_admin: &str) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            admin_id: self.admin_id.clone(),
            created_by: self.created_by.clone(),
            config: self.config.clone(),
            status: self.status,
            listener_count: self.listeners.len(),
            created_at: self.created_at.to_rfc3339(),
            last_activity: self.last_activity.to_rfc3339(),
            is_owner: self.admin_id == requesting_admin,
        }
    }

    pub fn tts_available(&self) -> bool {
        self.config.tts_mode != TtsMode::Disabled
    }
}

/// Outcome of a config update, for the router to fan notifications out.
#[derive(Debug)]
pub struct ConfigUpdateOutcome {
    pub config: SessionConfig,
    pub removed_languages: Vec<Language>,
    /// Listeners whose language was removed, already migrated to the first
    /// still-enabled language. Each gets a language-removed notice.
    pub displaced_listeners: Vec<(SocketId, Language)>,
}

pub struct SessionRegistry {
    dir: PathBuf,
    sessions: DashMap<String, Session>,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
    socket_sessions: DashMap<SocketId, String>,
    max_listeners: usize,
}

impl SessionRegistry {
    /// Load persisted sessions. Socket state is cleared (no sockets exist
    /// yet); sessions whose owner is unknown are flagged by the orphan scan,
    /// not here.
    pub async fn load(dir: impl Into<PathBuf>, max_listeners: usize) -> HubResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let registry = Self {
            sessions: DashMap::new(),
            write_locks: DashMap::new(),
            socket_sessions: DashMap::new(),
            max_listeners,
            dir,
        };

        let mut entries = tokio::fs::read_dir(&registry.dir).await?;
        let mut loaded = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json") {
                continue;
            }

            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<Session>(&bytes) {
                    Ok(session) => {
                        registry.sessions.insert(session.session_id.clone(), session);
                        loaded += 1;
                    }
                    Err(e) => error!("corrupted session file {}: {}", path.display(), e),
                },
                Err(e) => error!("unreadable session file {}: {}", path.display(), e),
            }
        }

        info!("loaded {} sessions from {}", loaded, registry.dir.display());
        Ok(registry)
    }

    async fn acquire_write_lock(
        &self,
        session_id: &str,
    ) -> HubResult<tokio::sync::OwnedMutexGuard<()>> {
        let lock = self
            .write_locks
            .entry(session_id.to_string())
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
                "session {} is busy, try again",
                session_id
            ))),
        }
    }

    async fn persist(&self, session: &Session) -> HubResult<()> {
        let bytes = serde_json::to_vec_pretty(session)?;
        write_atomic(&self.dir, &format!("{}.json", session.session_id), &bytes).await
    }

    fn validate_config(config: &SessionConfig) -> HubResult<()> {
        if config.enabled_languages.is_empty() {
            return Err(HubError::InvalidConfig(
                "enabledLanguages must not be empty".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for lang in &config.enabled_languages {
            if !seen.insert(*lang) {
                return Err(HubError::InvalidConfig(format!(
                    "duplicate language {} in enabledLanguages",
                    lang
                )));
            }
        }
        Ok(())
    }

    /// Create and persist a session. The caller updates the owner's
    /// ownedSessions set afterwards; ownership here is fixed for the
    /// session's entire lifetime.
    pub async fn create(
        &self,
        session_id: &str,
        config: SessionConfig,
        admin_id: &str,
        socket: SocketId,
        created_by: &str,
    ) -> HubResult<Session> {
        if !is_valid_session_id(session_id) {
            return Err(HubError::InvalidSessionId(session_id.to_string()));
        }
        Self::validate_config(&config)?;

        let _guard = self.acquire_write_lock(session_id).await?;
        if self.sessions.contains_key(session_id) {
            return Err(HubError::SessionAlreadyExists(session_id.to_string()));
        }

        let now = Utc::now();
        let session = Session {
            session_id: session_id.to_string(),
            admin_id: admin_id.to_string(),
            created_by: created_by.to_string(),
            config,
            created_at: now,
            last_activity: now,
            status: SessionStatus::Active,
            current_admin_socket: Some(socket),
            listeners: HashMap::new(),
        };

        self.persist(&session)
            .await
            .map_err(|e| HubError::SessionCreationFailed(e.to_string()))?;
        self.sessions.insert(session.session_id.clone(), session.clone());

        info!("session {} created by {}", session_id, admin_id);
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    pub fn list(&self) -> Vec<Session> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    pub fn list_owned_by(&self, admin_id: &str) -> Vec<Session> {
        self.sessions
            .iter()
            .filter(|s| s.admin_id == admin_id)
            .map(|s| s.value().clone())
            .collect()
    }

    /// Read access is universal for authenticated admins; write access is
    /// owner-only. This asymmetry is the protocol contract.
    pub fn verify_access(&self, session_id: &str, admin_id: &str, mode: AccessMode) -> bool {
        match self.sessions.get(session_id) {
            Some(session) => match mode {
                AccessMode::Read => true,
                AccessMode::Write => session.admin_id == admin_id,
            },
            None => false,
        }
    }

    /// Advisory only; never used for authorization.
    pub fn update_current_admin_socket(&self, session_id: &str, socket: Option<SocketId>) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.current_admin_socket = socket;
        }
    }

    pub fn clear_admin_socket(&self, socket: SocketId) {
        for mut session in self.sessions.iter_mut() {
            if session.current_admin_socket == Some(socket) {
                session.current_admin_socket = None;
            }
        }
    }

    /// Apply a validated config change, returning what the router needs to
    /// notify affected listeners. Displaced listeners are migrated to the
    /// first still-enabled language so the roster invariant holds.
    pub async fn update_config(
        &self,
        session_id: &str,
        new_config: SessionConfig,
    ) -> HubResult<ConfigUpdateOutcome> {
        Self::validate_config(&new_config)?;

        let _guard = self.acquire_write_lock(session_id).await?;
        let mut session = self
            .get(session_id)
            .ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))?;
        if session.status == SessionStatus::Ended {
            return Err(HubError::OperationNotAllowed(
                "session has ended".to_string(),
            ));
        }

        let removed_languages: Vec<Language> = session
            .config
            .enabled_languages
            .iter()
            .filter(|l| !new_config.enabled_languages.contains(l))
            .copied()
            .collect();

        // Persist first; in-memory state is only touched once the write is
        // durable, so a failed write rolls back to the previous config.
        session.config = new_config.clone();
        session.last_activity = Utc::now();
        self.persist(&session)
            .await
            .map_err(|e| HubError::SessionUpdateFailed(e.to_string()))?;

        let fallback = new_config.enabled_languages[0];
        let mut displaced = Vec::new();
        if let Some(mut live) = self.sessions.get_mut(session_id) {
            live.config = new_config.clone();
            live.last_activity = session.last_activity;
            for (socket, entry) in live.listeners.iter_mut() {
                if removed_languages.contains(&entry.preferred_language) {
                    displaced.push((*socket, entry.preferred_language));
                    entry.preferred_language = fallback;
                }
            }
        }

        Ok(ConfigUpdateOutcome {
            config: new_config,
            removed_languages,
            displaced_listeners: displaced,
        })
    }

    pub fn add_listener(
        &self,
        session_id: &str,
        socket: SocketId,
        preferred_language: Language,
        capabilities: ListenerCapabilities,
    ) -> HubResult<Session> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))?;

        if session.status != SessionStatus::Active {
            return Err(HubError::OperationNotAllowed(
                "session is not active".to_string(),
            ));
        }
        if !session.config.enabled_languages.contains(&preferred_language) {
            return Err(HubError::InvalidLanguage(
                preferred_language.as_str().to_string(),
            ));
        }
        if session.listeners.len() >= self.max_listeners {
            return Err(HubError::ClientLimitReached(self.max_listeners));
        }

        let now = Utc::now();
        session.listeners.insert(
            socket,
            ListenerEntry {
                preferred_language,
                joined_at: now,
                last_seen: now,
                capabilities,
            },
        );
        session.last_activity = now;
        self.socket_sessions.insert(socket, session_id.to_string());

        Ok(session.clone())
    }

    /// Silent removal; used both for leave-session and socket disconnect.
    pub fn remove_listener(&self, socket: SocketId) -> Option<String> {
        let (_, session_id) = self.socket_sessions.remove(&socket)?;
        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            session.listeners.remove(&socket);
        }
        Some(session_id)
    }

    pub fn change_listener_language(
        &self,
        socket: SocketId,
        new_language: Language,
    ) -> HubResult<(String, Session)> {
        let session_id = self
            .socket_sessions
            .get(&socket)
            .map(|s| s.value().clone())
            .ok_or_else(|| HubError::SessionNotFound("not joined".to_string()))?;

        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| HubError::SessionNotFound(session_id.clone()))?;

        if !session.config.enabled_languages.contains(&new_language) {
            return Err(HubError::InvalidLanguage(new_language.as_str().to_string()));
        }
        match session.listeners.get_mut(&socket) {
            Some(entry) => {
                entry.preferred_language = new_language;
                entry.last_seen = Utc::now();
            }
            None => return Err(HubError::SessionNotFound(session_id.clone())),
        }

        Ok((session_id.clone(), session.clone()))
    }

    pub fn session_for_socket(&self, socket: SocketId) -> Option<String> {
        self.socket_sessions.get(&socket).map(|s| s.value().clone())
    }

    pub fn touch_listener(&self, socket: SocketId) {
        if let Some(session_id) = self.session_for_socket(socket) {
            if let Some(mut session) = self.sessions.get_mut(&session_id) {
                if let Some(entry) = session.listeners.get_mut(&socket) {
                    entry.last_seen = Utc::now();
                }
            }
        }
    }

    pub fn touch_activity(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.last_activity = Utc::now();
        }
    }

    /// Transition to `ended`, drop the roster, persist. Returns the sockets
    /// that were listening so the router can notify them. Ending an already
    /// ended session is a no-op.
    pub async fn end(&self, session_id: &str) -> HubResult<Vec<SocketId>> {
        let _guard = self.acquire_write_lock(session_id).await?;
        let mut session = self
            .get(session_id)
            .ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))?;

        if session.status == SessionStatus::Ended {
            return Ok(Vec::new());
        }

        session.status = SessionStatus::Ended;
        session.current_admin_socket = None;
        session.last_activity = Utc::now();
        self.persist(&session)
            .await
            .map_err(|e| HubError::SessionDeleteFailed(e.to_string()))?;

        let listeners: Vec<SocketId> = match self.sessions.get_mut(session_id) {
            Some(mut live) => {
                live.status = SessionStatus::Ended;
                live.current_admin_socket = None;
                live.last_activity = session.last_activity;
                let sockets: Vec<SocketId> = live.listeners.keys().copied().collect();
                live.listeners.clear();
                sockets
            }
            None => Vec::new(),
        };

        for socket in &listeners {
            self.socket_sessions.remove(socket);
        }

        info!("session {} ended ({} listeners dropped)", session_id, listeners.len());
        Ok(listeners)
    }

    /// Remove a session record and its file entirely. Ended sessions only;
    /// called by the maintenance sweep.
    pub async fn delete(&self, session_id: &str) -> HubResult<()> {
        let _guard = self.acquire_write_lock(session_id).await?;
        self.sessions.remove(session_id);

        let path = self.dir.join(format!("{}.json", session_id));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let _ = tokio::fs::remove_file(self.dir.join(format!("{}.json.bak", session_id))).await;
        Ok(())
    }

    /// Snapshot of listeners preferring `language`. Broadcast iterates the
    /// snapshot, so roster mutations proceed concurrently.
    pub fn listeners_in_language(
        &self,
        session_id: &str,
        language: Language,
    ) -> Vec<(SocketId, ListenerEntry)> {
        match self.sessions.get(session_id) {
            Some(session) => session
                .listeners
                .iter()
                .filter(|(_, e)| e.preferred_language == language)
                .map(|(s, e)| (*s, e.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn roster_snapshot(&self, session_id: &str) -> Vec<(SocketId, ListenerEntry)> {
        match self.sessions.get(session_id) {
            Some(session) => session
                .listeners
                .iter()
                .map(|(s, e)| (*s, e.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Distinct languages at least one listener currently prefers.
    pub fn languages_in_use(&self, session_id: &str) -> Vec<Language> {
        let mut langs: Vec<Language> = Vec::new();
        if let Some(session) = self.sessions.get(session_id) {
            for entry in session.listeners.values() {
                if !langs.contains(&entry.preferred_language) {
                    langs.push(entry.preferred_language);
                }
            }
        }
        langs
    }

    pub fn listener_counts(&self, session_id: &str) -> HashMap<Language, usize> {
        let mut counts = HashMap::new();
        if let Some(session) = self.sessions.get(session_id) {
            for entry in session.listeners.values() {
                *counts.entry(entry.preferred_language).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Sessions whose owner is missing from the identity store, or that have
    /// been idle past the timeout, or already ended: candidates for the
    /// maintenance sweep.
    pub fn sweep_candidates(
        &self,
        owner_exists: impl Fn(&str) -> bool,
        idle_timeout: Duration,
    ) -> SweepCandidates {
        let idle_cutoff = Utc::now()
            - chrono::Duration::from_std(idle_timeout).unwrap_or(chrono::Duration::hours(8));

        let mut orphaned = Vec::new();
        let mut idle = Vec::new();
        let mut ended = Vec::new();
        for session in self.sessions.iter() {
            if session.status == SessionStatus::Ended {
                ended.push(session.session_id.clone());
            } else if !owner_exists(&session.admin_id) {
                warn!(
                    "session {} is orphaned (owner {} no longer exists)",
                    session.session_id, session.admin_id
                );
                orphaned.push(session.session_id.clone());
            } else if session.last_activity < idle_cutoff {
                idle.push(session.session_id.clone());
            }
        }
        SweepCandidates { orphaned, idle, ended }
    }
}

#[derive(Debug, Default)]
pub struct SweepCandidates {
    pub orphaned: Vec<String>,
    pub idle: Vec<String>,
    pub ended: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::AudioQuality;

    fn config(langs: &[Language]) -> SessionConfig {
        SessionConfig {
            enabled_languages: langs.to_vec(),
            tts_mode: TtsMode::Neural,
            audio_quality: AudioQuality::High,
        }
    }

    async fn registry(dir: &std::path::Path) -> SessionRegistry {
        SessionRegistry::load(dir, 50).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_rejects_bad_ids_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path()).await;
        let socket = uuid::Uuid::new_v4();

        let err = reg
            .create("not a session id", config(&[Language::En]), "a1", socket, "Alice")
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidSessionId(_)));

        reg.create("CHURCH-2025-001", config(&[Language::En]), "a1", socket, "Alice")
            .await
            .unwrap();
        let err = reg
            .create("CHURCH-2025-001", config(&[Language::En]), "a2", socket, "Bob")
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::SessionAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_ownership_is_immutable_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let reg = registry(dir.path()).await;
            reg.create(
                "CHURCH-2025-001",
                config(&[Language::En, Language::Es]),
                "alice-sub",
                uuid::Uuid::new_v4(),
                "Alice",
            )
            .await
            .unwrap();
        }

        let reg = registry(dir.path()).await;
        let session = reg.get("CHURCH-2025-001").unwrap();
        assert_eq!(session.admin_id, "alice-sub");
        // Transient fields do not survive.
        assert!(session.current_admin_socket.is_none());
        assert!(session.listeners.is_empty());
    }

    #[tokio::test]
    async fn test_read_all_write_own() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path()).await;
        reg.create(
            "CHURCH-2025-001",
            config(&[Language::En]),
            "alice-sub",
            uuid::Uuid::new_v4(),
            "Alice",
        )
        .await
        .unwrap();

        assert!(reg.verify_access("CHURCH-2025-001", "alice-sub", AccessMode::Read));
        assert!(reg.verify_access("CHURCH-2025-001", "bob-sub", AccessMode::Read));
        assert!(reg.verify_access("CHURCH-2025-001", "alice-sub", AccessMode::Write));
        assert!(!reg.verify_access("CHURCH-2025-001", "bob-sub", AccessMode::Write));
        assert!(!reg.verify_access("MISSING-2025-001", "alice-sub", AccessMode::Read));
    }

    #[tokio::test]
    async fn test_roster_rules() {
        let dir = tempfile::tempdir().unwrap();
        let reg = SessionRegistry::load(dir.path(), 2).await.unwrap();
        reg.create(
            "CHURCH-2025-001",
            config(&[Language::En, Language::Es]),
            "a1",
            uuid::Uuid::new_v4(),
            "Alice",
        )
        .await
        .unwrap();

        let l1 = uuid::Uuid::new_v4();
        let l2 = uuid::Uuid::new_v4();
        let l3 = uuid::Uuid::new_v4();

        reg.add_listener("CHURCH-2025-001", l1, Language::Es, Default::default())
            .unwrap();

        // Language must be enabled.
        let err = reg
            .add_listener("CHURCH-2025-001", l2, Language::Fr, Default::default())
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidLanguage(_)));

        reg.add_listener("CHURCH-2025-001", l2, Language::En, Default::default())
            .unwrap();

        // Cap enforced.
        let err = reg
            .add_listener("CHURCH-2025-001", l3, Language::En, Default::default())
            .unwrap_err();
        assert!(matches!(err, HubError::ClientLimitReached(2)));

        let counts = reg.listener_counts("CHURCH-2025-001");
        assert_eq!(counts.get(&Language::Es), Some(&1));
        assert_eq!(counts.get(&Language::En), Some(&1));

        assert_eq!(reg.remove_listener(l1).as_deref(), Some("CHURCH-2025-001"));
        assert!(reg.remove_listener(l1).is_none());
        assert_eq!(reg.listeners_in_language("CHURCH-2025-001", Language::Es).len(), 0);
    }

    #[tokio::test]
    async fn test_update_config_reports_removed_languages() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path()).await;
        reg.create(
            "CHURCH-2025-001",
            config(&[Language::En, Language::Es, Language::Fr]),
            "a1",
            uuid::Uuid::new_v4(),
            "Alice",
        )
        .await
        .unwrap();

        let es_listener = uuid::Uuid::new_v4();
        reg.add_listener("CHURCH-2025-001", es_listener, Language::Es, Default::default())
            .unwrap();

        let outcome = reg
            .update_config("CHURCH-2025-001", config(&[Language::En, Language::Fr]))
            .await
            .unwrap();
        assert_eq!(outcome.removed_languages, vec![Language::Es]);
        assert_eq!(outcome.displaced_listeners, vec![(es_listener, Language::Es)]);

        // Displaced listener was migrated to a still-enabled language.
        let session = reg.get("CHURCH-2025-001").unwrap();
        assert_eq!(
            session.listeners[&es_listener].preferred_language,
            Language::En
        );
    }

    #[tokio::test]
    async fn test_ended_sessions_accept_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path()).await;
        reg.create(
            "CHURCH-2025-001",
            config(&[Language::En]),
            "a1",
            uuid::Uuid::new_v4(),
            "Alice",
        )
        .await
        .unwrap();

        let listener = uuid::Uuid::new_v4();
        reg.add_listener("CHURCH-2025-001", listener, Language::En, Default::default())
            .unwrap();

        let dropped = reg.end("CHURCH-2025-001").await.unwrap();
        assert_eq!(dropped, vec![listener]);

        // Idempotent.
        assert!(reg.end("CHURCH-2025-001").await.unwrap().is_empty());

        let err = reg
            .add_listener("CHURCH-2025-001", uuid::Uuid::new_v4(), Language::En, Default::default())
            .unwrap_err();
        assert!(matches!(err, HubError::OperationNotAllowed(_)));

        let err = reg
            .update_config("CHURCH-2025-001", config(&[Language::En]))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::OperationNotAllowed(_)));
    }

    #[tokio::test]
    async fn test_sweep_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path()).await;
        reg.create("LIVE-2025-001", config(&[Language::En]), "alice", uuid::Uuid::new_v4(), "A")
            .await
            .unwrap();
        reg.create("ORPH-2025-001", config(&[Language::En]), "ghost", uuid::Uuid::new_v4(), "G")
            .await
            .unwrap();
        reg.create("DONE-2025-001", config(&[Language::En]), "alice", uuid::Uuid::new_v4(), "A")
            .await
            .unwrap();
        reg.end("DONE-2025-001").await.unwrap();

        let candidates =
            reg.sweep_candidates(|admin| admin == "alice", Duration::from_secs(8 * 3600));
        assert_eq!(candidates.orphaned, vec!["ORPH-2025-001".to_string()]);
        assert_eq!(candidates.ended, vec!["DONE-2025-001".to_string()]);
        assert!(candidates.idle.is_empty());

        reg.delete("DONE-2025-001").await.unwrap();
        assert!(reg.get("DONE-2025-001").is_none());
        assert!(!dir.path().join("DONE-2025-001.json").exists());
    }
}
