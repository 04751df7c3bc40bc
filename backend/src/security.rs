//! Rate limiting, lockout, and the security audit ring.
//!
//! Two dimensions run simultaneously: per-IP windows guard `admin-auth`
//! attempts, per-subject windows guard authenticated operations. Each
//! dimension tracks a fast (minute) and a slow (hour) window. Repeated
//! failed authentications from one IP trip a lockout whose duration doubles
//! on consecutive lockouts; while locked, every auth attempt gets the same
//! answer regardless of credential validity.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::{HubError, HubResult};

const AUDIT_RING_CAP: usize = 1000;
/// Lockout duration stops doubling past this multiple of the base.
const LOCKOUT_BACKOFF_CAP: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    AuthSuccess,
    AuthFailure,
    TokenRejected,
    OwnershipViolation,
    RateLimited,
    TokenRefreshed,
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub subject: String,
    pub operation: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Bounded ring of security events. Oldest entries fall off; nothing here is
/// durable.
pub struct AuditLog {
    events: Mutex<VecDeque<AuditEvent>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, kind: AuditKind, subject: &str, operation: &str, reason: &str) {
        let mut events = self.events.lock().unwrap();
        if events.len() >= AUDIT_RING_CAP {
            events.pop_front();
        }
        events.push_back(AuditEvent {
            kind,
            subject: subject.to_string(),
            operation: operation.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
    }

    pub fn snapshot(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Drop events older than `age`; run by the maintenance loop.
    pub fn trim_older_than(&self, age: Duration) {
        let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::hours(24));
        let mut events = self.events.lock().unwrap();
        while events.front().is_some_and(|e| e.at < cutoff) {
            events.pop_front();
        }
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct SlidingWindow {
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    /// Record one hit and report whether either limit is now exceeded,
    /// with the seconds until the binding window frees a slot.
    fn check_and_record(
        &mut self,
        per_minute: u32,
        per_hour: u32,
        now: Instant,
    ) -> Result<(), u64> {
        while self
            .hits
            .front()
            .is_some_and(|t| now.duration_since(*t) > Duration::from_secs(3600))
        {
            self.hits.pop_front();
        }

        let hour_count = self.hits.len() as u32;
        let minute_count = self
            .hits
            .iter()
            .rev()
            .take_while(|t| now.duration_since(**t) <= Duration::from_secs(60))
            .count() as u32;

        if hour_count >= per_hour {
            let oldest = self.hits.front().copied().unwrap_or(now);
            let free_in = Duration::from_secs(3600).saturating_sub(now.duration_since(oldest));
            return Err(free_in.as_secs().max(1));
        }
        if minute_count >= per_minute {
            let oldest_in_minute = self
                .hits
                .iter()
                .rev()
                .take(minute_count as usize)
                .last()
                .copied()
                .unwrap_or(now);
            let free_in =
                Duration::from_secs(60).saturating_sub(now.duration_since(oldest_in_minute));
            return Err(free_in.as_secs().max(1));
        }

        self.hits.push_back(now);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct AuthState {
    window: SlidingWindow,
    recent_failures: VecDeque<Instant>,
    locked_until: Option<Instant>,
    lockout_streak: u32,
}

pub struct RateLimiter {
    auth_by_ip: DashMap<IpAddr, AuthState>,
    ops_by_subject: DashMap<(String, String), SlidingWindow>,
    auth_per_minute: u32,
    ops_per_minute: u32,
    lockout_threshold: u32,
    lockout_duration: Duration,
}

impl RateLimiter {
    pub fn new(
        auth_per_minute: u32,
        ops_per_second: u32,
        lockout_threshold: u32,
        lockout_duration: Duration,
    ) -> Self {
        Self {
            auth_by_ip: DashMap::new(),
            ops_by_subject: DashMap::new(),
            auth_per_minute: auth_per_minute.max(1),
            ops_per_minute: ops_per_second.max(1) * 60,
            lockout_threshold: lockout_threshold.max(1),
            lockout_duration,
        }
    }

    /// Gate an authentication attempt from `ip`. Must be called before the
    /// identity provider is consulted, so a locked-out caller learns nothing
    /// about credential validity.
    pub fn check_auth_attempt(&self, ip: IpAddr) -> HubResult<()> {
        let now = Instant::now();
        let mut state = self.auth_by_ip.entry(ip).or_default();

        if let Some(until) = state.locked_until {
            if now < until {
                return Err(HubError::AccountLocked {
                    retry_after: until.duration_since(now).as_secs().max(1),
                });
            }
            state.locked_until = None;
        }

        let per_hour = self.auth_per_minute * 10;
        state
            .window
            .check_and_record(self.auth_per_minute, per_hour, now)
            .map_err(|retry_after| HubError::RateLimited { retry_after })
    }

    /// Record a failed authentication; trips the lockout once the threshold
    /// of failures lands inside the lockout window.
    pub fn record_auth_failure(&self, ip: IpAddr) {
        let now = Instant::now();
        let mut state = self.auth_by_ip.entry(ip).or_default();

        while state
            .recent_failures
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.lockout_duration)
        {
            state.recent_failures.pop_front();
        }
        state.recent_failures.push_back(now);

        if state.recent_failures.len() as u32 >= self.lockout_threshold {
            state.lockout_streak = (state.lockout_streak + 1).min(LOCKOUT_BACKOFF_CAP.ilog2() + 1);
            let multiplier = 2u32.pow(state.lockout_streak - 1).min(LOCKOUT_BACKOFF_CAP);
            let duration = self.lockout_duration * multiplier;
            state.locked_until = Some(now + duration);
            state.recent_failures.clear();
            warn!(
                "locking out {} for {:?} after {} failed authentications",
                ip, duration, self.lockout_threshold
            );
        }
    }

    pub fn record_auth_success(&self, ip: IpAddr) {
        if let Some(mut state) = self.auth_by_ip.get_mut(&ip) {
            state.recent_failures.clear();
            state.lockout_streak = 0;
        }
    }

    /// Gate one authenticated operation for `subject`.
    pub fn check_operation(&self, subject: &str, operation: &str) -> HubResult<()> {
        let now = Instant::now();
        let mut window = self
            .ops_by_subject
            .entry((subject.to_string(), operation.to_string()))
            .or_default();

        let per_hour = self.ops_per_minute * 30;
        window
            .check_and_record(self.ops_per_minute, per_hour, now)
            .map_err(|retry_after| HubError::RateLimited { retry_after })
    }

    /// Drop idle per-subject windows; run by the maintenance loop.
    pub fn prune(&self) {
        let now = Instant::now();
        self.ops_by_subject.retain(|_, window| {
            window
                .hits
                .back()
                .is_some_and(|t| now.duration_since(*t) < Duration::from_secs(3600))
        });
        self.auth_by_ip.retain(|_, state| {
            state.locked_until.is_some_and(|u| u > now)
                || !state.recent_failures.is_empty()
                || state
                    .window
                    .hits
                    .back()
                    .is_some_and(|t| now.duration_since(*t) < Duration::from_secs(3600))
        });
    }
}
