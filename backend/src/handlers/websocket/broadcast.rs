//! The translation fan-out hot path.
//!
//! One `broadcast-translation` frame becomes at most one personalized
//! `translation` frame per listener: only languages someone is actually
//! listening to are synthesized, synthesis runs with bounded concurrency,
//! and a per-language failure degrades that language to a sentinel tier
//! without touching the others.

use futures_util::{stream, StreamExt};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::admin_socket::verify_write_access;
use super::FrameSender;
use crate::audio_cache::CachedAudio;
use crate::error::{HubError, HubResult};
use crate::tts::voices;
use crate::AppState;
use shared::{
    now_iso, AudioQuality, Language, ServerFrame, SessionStatus, TtsMode, VoiceTier,
};

/// Synthesis result as the router consumes it: a cache handle when real
/// audio exists, a sentinel tier otherwise.
#[derive(Debug, Clone)]
pub struct CachedSynthesis {
    pub tier: VoiceTier,
    pub audio: Option<CachedAudio>,
    pub degraded_reason: Option<String>,
}

/// Cache-first synthesis: serve an existing object when the content address
/// matches, otherwise synthesize and publish the result. Sentinel tiers are
/// never cached (there is nothing to store).
pub async fn synthesize_with_cache(
    app_state: &AppState,
    text: &str,
    language: Language,
    mode: TtsMode,
    quality: AudioQuality,
) -> HubResult<CachedSynthesis> {
    if mode == TtsMode::Disabled {
        return Ok(CachedSynthesis {
            tier: VoiceTier::TextOnly,
            audio: None,
            degraded_reason: None,
        });
    }

    if let Some(voice) = voices::voice_for(language, mode) {
        if let Some(hit) = app_state.audio_cache.lookup(text, language, voice, "mp3") {
            debug!("audio cache hit for {}/{}", language, voice);
            return Ok(CachedSynthesis {
                tier: match mode {
                    TtsMode::Neural => VoiceTier::Neural,
                    _ => VoiceTier::Standard,
                },
                audio: Some(hit),
                degraded_reason: None,
            });
        }
    }

    let synthesis = app_state.tts.synthesize(text, language, mode, quality).await?;

    match synthesis.tier {
        VoiceTier::Neural | VoiceTier::Standard => {
            let stored = app_state
                .audio_cache
                .put(
                    text,
                    language,
                    &synthesis.voice_profile,
                    synthesis.format,
                    synthesis.bytes,
                    synthesis.duration_estimate_secs,
                )
                .await;
            Ok(CachedSynthesis {
                tier: synthesis.tier,
                audio: Some(stored),
                degraded_reason: None,
            })
        }
        VoiceTier::Local | VoiceTier::TextOnly => Ok(CachedSynthesis {
            tier: synthesis.tier,
            audio: None,
            degraded_reason: synthesis.degraded_reason,
        }),
    }
}

#[allow(clippy::too_many_arguments)]
pub(super) async fn handle_broadcast(
    app_state: &AppState,
    tx: &FrameSender,
    admin_id: &str,
    session_id: &str,
    source_text: &str,
    translations: HashMap<Language, String>,
    generate_tts: bool,
    voice_tier: Option<TtsMode>,
) -> HubResult<()> {
    verify_write_access(app_state, admin_id, session_id, "broadcast-translation")?;

    let session = app_state
        .registry
        .get(session_id)
        .ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))?;
    if session.status != SessionStatus::Active {
        return Err(HubError::OperationNotAllowed(
            "session is not active".to_string(),
        ));
    }

    let roster = app_state.registry.roster_snapshot(session_id);
    if roster.is_empty() {
        debug!("broadcast on {} with no listeners, nothing to do", session_id);
        return Ok(());
    }

    // Languages worth synthesizing: someone listens to them AND the
    // operator provided a translation.
    let active_languages: Vec<Language> = app_state
        .registry
        .languages_in_use(session_id)
        .into_iter()
        .filter(|l| translations.contains_key(l))
        .collect();

    let effective_mode = match voice_tier {
        Some(TtsMode::Disabled) | None => session.config.tts_mode,
        Some(requested) => requested,
    };
    let requested_tier = match effective_mode {
        TtsMode::Neural => VoiceTier::Neural,
        TtsMode::Standard => VoiceTier::Standard,
        TtsMode::Local => VoiceTier::Local,
        TtsMode::Disabled => VoiceTier::TextOnly,
    };

    let synthesize = generate_tts && session.tts_available();
    let mut audio_by_language: HashMap<Language, CachedSynthesis> = HashMap::new();

    if synthesize && !active_languages.is_empty() {
        let quality = session.config.audio_quality;
        let results: Vec<(Language, CachedSynthesis)> = stream::iter(
            active_languages.iter().copied().map(|language| {
                let text = translations[&language].clone();
                async move {
                    let result = synthesize_with_cache(
                        app_state,
                        &text,
                        language,
                        effective_mode,
                        quality,
                    )
                    .await;
                    (language, result)
                }
            }),
        )
        .buffer_unordered(app_state.config.broadcast_synthesis_concurrency)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .map(|(language, result)| match result {
            Ok(synthesis) => (language, synthesis),
            Err(e) => {
                // Per-language failure is tolerated: that language just
                // goes out without audio.
                warn!("synthesis for {} failed during broadcast: {}", language, e);
                (
                    language,
                    CachedSynthesis {
                        tier: VoiceTier::TextOnly,
                        audio: None,
                        degraded_reason: Some(e.to_string()),
                    },
                )
            }
        })
        .collect();

        for (language, synthesis) in results {
            if let Some(reason) = &synthesis.degraded_reason {
                let _ = tx.send(ServerFrame::TtsFallback {
                    session_id: session_id.to_string(),
                    language: Some(language),
                    requested: requested_tier,
                    actual: synthesis.tier,
                    reason: reason.clone(),
                    timestamp: now_iso(),
                });
            }
            audio_by_language.insert(language, synthesis);
        }
    }

    // The session may have ended while synthesis was in flight; remaining
    // frames are dropped.
    match app_state.registry.get(session_id) {
        Some(current) if current.status == SessionStatus::Active => {}
        _ => {
            debug!("session {} ended mid-broadcast, dropping frames", session_id);
            return Ok(());
        }
    }

    // Per-language snapshots: listeners whose language has no translation
    // are skipped (never disconnected), and roster mutations during the
    // fan-out are not blocked.
    let mut delivered = 0usize;
    for language in translations.keys().copied() {
        for (socket, entry) in app_state.registry.listeners_in_language(session_id, language) {
            let text = &translations[&language];

            let (audio_url, audio, tier, tts_available) = match audio_by_language.get(&language) {
                Some(synthesis) if synthesis.audio.is_some() => {
                    let cached = synthesis.audio.as_ref().unwrap();
                    if entry.capabilities.can_play_synthesized {
                        (
                            Some(cached.url.clone()),
                            Some(cached.metadata.clone()),
                            Some(synthesis.tier),
                            true,
                        )
                    } else if entry.capabilities.can_synthesize_locally {
                        (None, None, Some(VoiceTier::Local), false)
                    } else {
                        (None, None, Some(VoiceTier::TextOnly), false)
                    }
                }
                Some(synthesis) => {
                    let tier = if synthesis.tier == VoiceTier::Local
                        && entry.capabilities.can_synthesize_locally
                    {
                        VoiceTier::Local
                    } else {
                        VoiceTier::TextOnly
                    };
                    (None, None, Some(tier), false)
                }
                None => (None, None, None, false),
            };

            if app_state.connections.send_to(
                socket,
                ServerFrame::Translation {
                    session_id: session_id.to_string(),
                    source_text: source_text.to_string(),
                    language,
                    text: text.clone(),
                    audio_url,
                    audio,
                    tts_available,
                    tier,
                    timestamp: now_iso(),
                },
            ) {
                delivered += 1;
            }
        }
    }

    app_state.registry.touch_activity(session_id);
    debug!(
        "broadcast on {} delivered to {} listeners across {} languages",
        session_id,
        delivered,
        active_languages.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{drain, test_state, StateOptions};
    use shared::{ListenerCapabilities, SessionConfig};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn caps(play: bool, local: bool) -> ListenerCapabilities {
        ListenerCapabilities {
            can_play_synthesized: play,
            can_synthesize_locally: local,
        }
    }

    fn config(langs: &[Language]) -> SessionConfig {
        SessionConfig {
            enabled_languages: langs.to_vec(),
            tts_mode: TtsMode::Neural,
            audio_quality: AudioQuality::High,
        }
    }

    async fn join(
        state: &Arc<crate::AppState>,
        session: &str,
        language: Language,
        capabilities: ListenerCapabilities,
    ) -> (Uuid, mpsc::UnboundedReceiver<ServerFrame>) {
        let socket = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        state.connections.register(socket, tx);
        state
            .registry
            .add_listener(session, socket, language, capabilities)
            .unwrap();
        (socket, rx)
    }

    async fn setup_session(state: &Arc<crate::AppState>, langs: &[Language]) -> String {
        let session_id = "CHURCH-2025-001".to_string();
        state
            .registry
            .create(&session_id, config(langs), "alice-sub", Uuid::new_v4(), "Alice")
            .await
            .unwrap();
        session_id
    }

    fn translations(pairs: &[(Language, &str)]) -> HashMap<Language, String> {
        pairs.iter().map(|(l, t)| (*l, t.to_string())).collect()
    }

    #[tokio::test]
    async fn test_language_filter_exactly_one_frame_per_matching_listener() {
        let state = test_state(StateOptions::default()).await;
        let session = setup_session(&state, &[Language::En, Language::Es, Language::Fr]).await;

        let (_, mut es_rx) = join(&state, &session, Language::Es, caps(true, false)).await;
        let (_, mut fr_rx) = join(&state, &session, Language::Fr, caps(true, false)).await;
        let (op_tx, _op_rx) = mpsc::unbounded_channel();

        // Translations cover es but not fr.
        handle_broadcast(
            &state,
            &op_tx,
            "alice-sub",
            &session,
            "Welcome",
            translations(&[(Language::En, "Welcome"), (Language::Es, "Bienvenidos")]),
            false,
            None,
        )
        .await
        .unwrap();

        let es_frames = drain(&mut es_rx);
        assert_eq!(es_frames.len(), 1);
        match &es_frames[0] {
            ServerFrame::Translation { language, text, audio_url, .. } => {
                assert_eq!(*language, Language::Es);
                assert_eq!(text, "Bienvenidos");
                assert!(audio_url.is_none());
            }
            other => panic!("expected translation, got {:?}", other),
        }

        // The fr listener is skipped, not disconnected.
        assert!(drain(&mut fr_rx).is_empty());
        assert!(state.registry.roster_snapshot(&session).len() == 2);
    }

    #[tokio::test]
    async fn test_broadcast_with_tts_serves_cached_url() {
        let state = test_state(StateOptions::default()).await;
        let session = setup_session(&state, &[Language::En, Language::Es]).await;
        let (_, mut es_rx) = join(&state, &session, Language::Es, caps(true, false)).await;
        let (op_tx, mut op_rx) = mpsc::unbounded_channel();

        for _ in 0..2 {
            handle_broadcast(
                &state,
                &op_tx,
                "alice-sub",
                &session,
                "Welcome",
                translations(&[(Language::Es, "Bienvenidos")]),
                true,
                Some(TtsMode::Neural),
            )
            .await
            .unwrap();
        }

        let frames = drain(&mut es_rx);
        assert_eq!(frames.len(), 2);
        for frame in &frames {
            match frame {
                ServerFrame::Translation {
                    audio_url,
                    audio,
                    tts_available,
                    tier,
                    ..
                } => {
                    let url = audio_url.as_ref().expect("audio url");
                    assert!(url.contains("/audio/"));
                    assert!(url.ends_with(".mp3"));
                    assert_eq!(audio.as_ref().unwrap().format, "mp3");
                    assert!(*tts_available);
                    assert_eq!(*tier, Some(VoiceTier::Neural));
                }
                other => panic!("expected translation, got {:?}", other),
            }
        }

        // Identical text: one external synthesis, second broadcast is a
        // cache hit.
        assert_eq!(state.tts.metrics.provider_attempts.load(std::sync::atomic::Ordering::Relaxed), 1);
        // No fallback notices on the operator channel.
        assert!(drain(&mut op_rx).is_empty());

        // The served URL resolves in the audio store.
        let url_frame = frames.first().unwrap();
        if let ServerFrame::Translation { audio_url: Some(url), .. } = url_frame {
            let key = url.rsplit('/').next().unwrap().trim_end_matches(".mp3");
            let (bytes, format) = state.audio_cache.get(key).await.unwrap();
            assert!(!bytes.is_empty());
            assert_eq!(format, "mp3");
        }
    }

    #[tokio::test]
    async fn test_provider_outage_degrades_to_text_only() {
        let state = test_state(StateOptions { provider_failures: 1000, ..Default::default() }).await;
        let session = setup_session(&state, &[Language::En, Language::Es]).await;
        let (_, mut es_rx) = join(&state, &session, Language::Es, caps(true, false)).await;
        let (op_tx, mut op_rx) = mpsc::unbounded_channel();

        // Repeated broadcasts against a dead provider: every one still
        // succeeds, listeners keep receiving text.
        for _ in 0..11 {
            handle_broadcast(
                &state,
                &op_tx,
                "alice-sub",
                &session,
                "Welcome",
                translations(&[(Language::Es, "Bienvenidos")]),
                true,
                None,
            )
            .await
            .unwrap();
        }

        let frames = drain(&mut es_rx);
        assert_eq!(frames.len(), 11);
        let last = frames.last().unwrap();
        match last {
            ServerFrame::Translation {
                audio_url,
                tts_available,
                tier,
                text,
                ..
            } => {
                assert!(audio_url.is_none());
                assert!(!tts_available);
                assert_eq!(*tier, Some(VoiceTier::TextOnly));
                assert_eq!(text, "Bienvenidos");
            }
            other => panic!("expected translation, got {:?}", other),
        }

        // Operator was told about the degradation.
        let notices = drain(&mut op_rx);
        assert!(notices
            .iter()
            .any(|f| matches!(f, ServerFrame::TtsFallback { .. })));
    }

    #[tokio::test]
    async fn test_non_owner_broadcast_is_rejected() {
        let state = test_state(StateOptions::default()).await;
        let session = setup_session(&state, &[Language::En]).await;
        let (_, mut rx) = join(&state, &session, Language::En, caps(true, false)).await;
        let (op_tx, _op_rx) = mpsc::unbounded_channel();

        let err = handle_broadcast(
            &state,
            &op_tx,
            "bob-sub",
            &session,
            "hi",
            translations(&[(Language::En, "hi")]),
            false,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HubError::SessionNotOwned(_)));
        assert!(drain(&mut rx).is_empty());

        // The violation was audited.
        assert!(state
            .audit
            .snapshot()
            .iter()
            .any(|e| e.kind == crate::security::AuditKind::OwnershipViolation));
    }

    #[tokio::test]
    async fn test_listener_without_playback_gets_sentinel() {
        let state = test_state(StateOptions::default()).await;
        let session = setup_session(&state, &[Language::En]).await;
        let (_, mut local_rx) = join(&state, &session, Language::En, caps(false, true)).await;
        let (_, mut bare_rx) = join(&state, &session, Language::En, caps(false, false)).await;
        let (op_tx, _op_rx) = mpsc::unbounded_channel();

        handle_broadcast(
            &state,
            &op_tx,
            "alice-sub",
            &session,
            "Welcome",
            translations(&[(Language::En, "Welcome")]),
            true,
            None,
        )
        .await
        .unwrap();

        match &drain(&mut local_rx)[0] {
            ServerFrame::Translation { audio_url, tier, .. } => {
                assert!(audio_url.is_none());
                assert_eq!(*tier, Some(VoiceTier::Local));
            }
            other => panic!("expected translation, got {:?}", other),
        }
        match &drain(&mut bare_rx)[0] {
            ServerFrame::Translation { audio_url, tier, .. } => {
                assert!(audio_url.is_none());
                assert_eq!(*tier, Some(VoiceTier::TextOnly));
            }
            other => panic!("expected translation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_roster_is_a_quiet_noop() {
        let state = test_state(StateOptions::default()).await;
        let session = setup_session(&state, &[Language::En]).await;
        let (op_tx, _op_rx) = mpsc::unbounded_channel();

        handle_broadcast(
            &state,
            &op_tx,
            "alice-sub",
            &session,
            "hi",
            translations(&[(Language::En, "hi")]),
            true,
            None,
        )
        .await
        .unwrap();

        // No synthesis was attempted for an empty room.
        assert_eq!(
            state.tts.metrics.provider_attempts.load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }
}
