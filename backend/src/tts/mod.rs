//! Speech synthesis with tiered fallback.
//!
//! The pipeline per request: provider tier (neural/standard, with timeout
//! and bounded retry) -> local sentinel (listener synthesizes on-device) ->
//! text-only sentinel (always available). An adaptive gate skips the
//! provider entirely while its rolling success rate is under the threshold,
//! so a provider outage degrades to sentinels immediately instead of eating
//! a timeout per language per broadcast.

mod polly;
pub mod voices;

pub use polly::PollySynthesizer;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{HubError, HubResult};
use shared::{AudioQuality, Language, TtsMode, VoiceTier, MAX_TTS_TEXT_CHARS};

/// Rolling window the adaptive gate inspects.
const GATE_WINDOW: usize = 10;
const GATE_MAX_AGE: Duration = Duration::from_secs(300);
const GATE_THRESHOLD: f64 = 0.2;
/// Below this many recent observations the gate stays open.
const GATE_MIN_SAMPLES: usize = 5;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Seam for the external synthesis provider; production uses
/// [`PollySynthesizer`], tests use programmable fakes.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        mode: TtsMode,
        sample_rate: &str,
    ) -> HubResult<Bytes>;
}

/// Result of one synthesis. Sentinel tiers carry no bytes; the listener
/// renders text or uses its own speech engine.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub bytes: Bytes,
    pub format: &'static str,
    pub voice_profile: String,
    pub duration_estimate_secs: f32,
    pub tier: VoiceTier,
    /// Set when the result is a lower tier than the request asked for.
    pub degraded_reason: Option<String>,
}

impl Synthesis {
    fn sentinel(tier: VoiceTier, reason: Option<String>) -> Self {
        Synthesis {
            bytes: Bytes::new(),
            format: "mp3",
            voice_profile: String::new(),
            duration_estimate_secs: 0.0,
            tier,
            degraded_reason: reason,
        }
    }
}

#[derive(Debug, Default)]
pub struct TtsMetrics {
    pub provider_attempts: AtomicU64,
    pub provider_successes: AtomicU64,
    pub provider_failures: AtomicU64,
    pub sentinel_results: AtomicU64,
}

pub struct TtsEngine {
    provider: Option<Arc<dyn SpeechSynthesizer>>,
    timeout: Duration,
    max_attempts: u32,
    outcomes: Mutex<VecDeque<(Instant, bool)>>,
    pub metrics: TtsMetrics,
}

impl TtsEngine {
    pub fn new(
        provider: Option<Arc<dyn SpeechSynthesizer>>,
        timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            provider,
            timeout,
            max_attempts: max_attempts.max(1),
            outcomes: Mutex::new(VecDeque::new()),
            metrics: TtsMetrics::default(),
        }
    }

    /// Engine with no provider configured: everything resolves to sentinels.
    pub fn disabled() -> Self {
        Self::new(None, Duration::from_secs(5), 1)
    }

    pub fn provider_configured(&self) -> bool {
        self.provider.is_some()
    }

    /// Synthesize `text` for `language` at the requested mode, walking the
    /// fallback chain as needed. Never returns an error for provider
    /// trouble; only input validation fails the call.
    pub async fn synthesize(
        &self,
        text: &str,
        language: Language,
        mode: TtsMode,
        quality: AudioQuality,
    ) -> HubResult<Synthesis> {
        if text.chars().count() > MAX_TTS_TEXT_CHARS {
            return Err(HubError::InvalidInput(format!(
                "text exceeds {} characters",
                MAX_TTS_TEXT_CHARS
            )));
        }
        if text.trim().is_empty() {
            return Err(HubError::InvalidInput("text is empty".to_string()));
        }

        match mode {
            TtsMode::Disabled => {
                self.metrics.sentinel_results.fetch_add(1, Ordering::Relaxed);
                return Ok(Synthesis::sentinel(VoiceTier::TextOnly, None));
            }
            TtsMode::Local => {
                self.metrics.sentinel_results.fetch_add(1, Ordering::Relaxed);
                return Ok(Synthesis::sentinel(VoiceTier::Local, None));
            }
            TtsMode::Neural | TtsMode::Standard => {}
        }

        let reason = match (&self.provider, voices::voice_for(language, mode)) {
            (Some(provider), Some(voice)) => {
                if self.gate_open() {
                    match self.try_provider(provider.clone(), text, voice, mode, quality).await {
                        Ok(bytes) => {
                            return Ok(Synthesis {
                                duration_estimate_secs: estimate_duration_secs(text),
                                bytes,
                                format: "mp3",
                                voice_profile: voice.to_string(),
                                tier: match mode {
                                    TtsMode::Neural => VoiceTier::Neural,
                                    _ => VoiceTier::Standard,
                                },
                                degraded_reason: None,
                            });
                        }
                        Err(e) => format!("provider failed: {}", e),
                    }
                } else {
                    "provider skipped: recent success rate below threshold".to_string()
                }
            }
            (None, _) => "no synthesis provider configured".to_string(),
            (_, None) => format!("no provider voice for {}/{:?}", language, mode),
        };

        warn!("synthesis for {} fell back to sentinel tier: {}", language, reason);
        self.metrics.sentinel_results.fetch_add(1, Ordering::Relaxed);
        Ok(Synthesis::sentinel(VoiceTier::Local, Some(reason)))
    }

    async fn try_provider(
        &self,
        provider: Arc<dyn SpeechSynthesizer>,
        text: &str,
        voice: &str,
        mode: TtsMode,
        quality: AudioQuality,
    ) -> HubResult<Bytes> {
        let sample_rate = voices::sample_rate_for(quality);
        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt - 1)).await;
            }
            self.metrics.provider_attempts.fetch_add(1, Ordering::Relaxed);

            let result = tokio::time::timeout(
                self.timeout,
                provider.synthesize(text, voice, mode, sample_rate),
            )
            .await;

            match result {
                Ok(Ok(bytes)) => {
                    self.metrics.provider_successes.fetch_add(1, Ordering::Relaxed);
                    self.record_outcome(true);
                    return Ok(bytes);
                }
                Ok(Err(e @ HubError::InvalidInput(_))) => {
                    // Input problems will not improve with retries.
                    self.metrics.provider_failures.fetch_add(1, Ordering::Relaxed);
                    self.record_outcome(false);
                    return Err(e);
                }
                Ok(Err(e)) => {
                    debug!("synthesis attempt {} failed: {}", attempt + 1, e);
                    self.metrics.provider_failures.fetch_add(1, Ordering::Relaxed);
                    self.record_outcome(false);
                    last_error = Some(e);
                }
                Err(_) => {
                    debug!("synthesis attempt {} timed out", attempt + 1);
                    self.metrics.provider_failures.fetch_add(1, Ordering::Relaxed);
                    self.record_outcome(false);
                    last_error = Some(HubError::Network(format!(
                        "synthesis timed out after {:?}",
                        self.timeout
                    )));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            HubError::ProviderUnavailable("synthesis failed".to_string())
        }))
    }

    fn record_outcome(&self, success: bool) {
        let mut outcomes = self.outcomes.lock().unwrap();
        outcomes.push_back((Instant::now(), success));
        while outcomes.len() > GATE_WINDOW {
            outcomes.pop_front();
        }
    }

    /// Whether the provider tier should be attempted at all.
    fn gate_open(&self) -> bool {
        let mut outcomes = self.outcomes.lock().unwrap();
        let now = Instant::now();
        while let Some((t, _)) = outcomes.front() {
            if now.duration_since(*t) > GATE_MAX_AGE {
                outcomes.pop_front();
            } else {
                break;
            }
        }

        if outcomes.len() < GATE_MIN_SAMPLES {
            return true;
        }
        let successes = outcomes.iter().filter(|(_, ok)| *ok).count();
        (successes as f64 / outcomes.len() as f64) >= GATE_THRESHOLD
    }
}

/// Rough speech duration from text length; good enough for player UI hints.
fn estimate_duration_secs(text: &str) -> f32 {
    let words = text.split_whitespace().count().max(1);
    words as f32 * 0.4
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicU64};

    /// Provider fake that fails the first `fail_first` calls, then succeeds.
    pub struct FlakySynthesizer {
        pub fail_first: AtomicU32,
        pub calls: AtomicU64,
    }

    impl FlakySynthesizer {
        pub fn failing(n: u32) -> Self {
            Self {
                fail_first: AtomicU32::new(n),
                calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for FlakySynthesizer {
        async fn synthesize(
            &self,
            text: &str,
            _voice: &str,
            _mode: TtsMode,
            _sample_rate: &str,
        ) -> HubResult<Bytes> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let remaining = self.fail_first.load(Ordering::Relaxed);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::Relaxed);
                return Err(HubError::ProviderUnavailable("synthetic failure".to_string()));
            }
            Ok(Bytes::from(format!("MP3:{}", text)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FlakySynthesizer;
    use super::*;

    fn engine(provider: FlakySynthesizer, attempts: u32) -> TtsEngine {
        TtsEngine::new(
            Some(Arc::new(provider)),
            Duration::from_secs(1),
            attempts,
        )
    }

    #[tokio::test]
    async fn test_provider_success_keeps_requested_tier() {
        let engine = engine(FlakySynthesizer::failing(0), 2);
        let result = engine
            .synthesize("Welcome", Language::Es, TtsMode::Neural, AudioQuality::High)
            .await
            .unwrap();
        assert_eq!(result.tier, VoiceTier::Neural);
        assert_eq!(result.voice_profile, "Lupe");
        assert!(!result.bytes.is_empty());
        assert!(result.degraded_reason.is_none());
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let engine = engine(FlakySynthesizer::failing(1), 2);
        let result = engine
            .synthesize("Welcome", Language::En, TtsMode::Standard, AudioQuality::Low)
            .await
            .unwrap();
        assert_eq!(result.tier, VoiceTier::Standard);
        assert_eq!(engine.metrics.provider_attempts.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fall_back_to_sentinel() {
        let engine = engine(FlakySynthesizer::failing(10), 2);
        let result = engine
            .synthesize("Welcome", Language::Fr, TtsMode::Neural, AudioQuality::High)
            .await
            .unwrap();
        assert_eq!(result.tier, VoiceTier::Local);
        assert!(result.bytes.is_empty());
        assert!(result.degraded_reason.is_some());
    }

    #[tokio::test]
    async fn test_adaptive_gate_skips_failing_provider() {
        let provider = FlakySynthesizer::failing(100);
        let engine = TtsEngine::new(
            Some(Arc::new(provider)),
            Duration::from_secs(1),
            1,
        );

        // Burn through enough failures to close the gate.
        for _ in 0..5 {
            engine
                .synthesize("x", Language::En, TtsMode::Neural, AudioQuality::High)
                .await
                .unwrap();
        }
        let attempts_before = engine.metrics.provider_attempts.load(Ordering::Relaxed);
        assert_eq!(attempts_before, 5);

        // Gate is closed now: no further provider attempts are made.
        let result = engine
            .synthesize("x", Language::En, TtsMode::Neural, AudioQuality::High)
            .await
            .unwrap();
        assert_eq!(result.tier, VoiceTier::Local);
        assert_eq!(
            engine.metrics.provider_attempts.load(Ordering::Relaxed),
            attempts_before
        );
    }

    #[tokio::test]
    async fn test_sentinel_modes_bypass_provider() {
        let engine = engine(FlakySynthesizer::failing(0), 2);
        let local = engine
            .synthesize("x", Language::En, TtsMode::Local, AudioQuality::High)
            .await
            .unwrap();
        assert_eq!(local.tier, VoiceTier::Local);

        let off = engine
            .synthesize("x", Language::En, TtsMode::Disabled, AudioQuality::High)
            .await
            .unwrap();
        assert_eq!(off.tier, VoiceTier::TextOnly);
        assert_eq!(engine.metrics.provider_attempts.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_oversized_text_rejected_before_any_tier() {
        let engine = engine(FlakySynthesizer::failing(0), 2);
        let text = "x".repeat(MAX_TTS_TEXT_CHARS + 1);
        let err = engine
            .synthesize(&text, Language::En, TtsMode::Neural, AudioQuality::High)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidInput(_)));
        assert_eq!(engine.metrics.provider_attempts.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_no_provider_means_sentinels() {
        let engine = TtsEngine::disabled();
        let result = engine
            .synthesize("Welcome", Language::En, TtsMode::Neural, AudioQuality::High)
            .await
            .unwrap();
        assert_eq!(result.tier, VoiceTier::Local);
    }
}
