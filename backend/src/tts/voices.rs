//! The closed voice catalog.
//!
//! Deterministic mapping from `(language, mode)` to a concrete Polly voice.
//! Every supported pair is listed here; there is no guessing for anything
//! else. Adding a language means adding its rows to this table.

use shared::{AudioQuality, Language, TtsMode};

/// Resolve the provider voice for a language/mode pair. `Local` and
/// `Disabled` have no provider voice.
pub fn voice_for(language: Language, mode: TtsMode) -> Option<&'static str> {
    let voice = match (language, mode) {
        (Language::En, TtsMode::Neural) => "Joanna",
        (Language::En, TtsMode::Standard) => "Salli",
        (Language::Es, TtsMode::Neural) => "Lupe",
        (Language::Es, TtsMode::Standard) => "Conchita",
        (Language::Fr, TtsMode::Neural) => "Lea",
        (Language::Fr, TtsMode::Standard) => "Celine",
        (Language::De, TtsMode::Neural) => "Vicki",
        (Language::De, TtsMode::Standard) => "Marlene",
        (Language::It, TtsMode::Neural) => "Bianca",
        (Language::It, TtsMode::Standard) => "Carla",
        (Language::Pt, TtsMode::Neural) => "Ines",
        (Language::Pt, TtsMode::Standard) => "Cristiano",
        (_, TtsMode::Local | TtsMode::Disabled) => return None,
    };
    Some(voice)
}

/// Polly mp3 sample rate for a session's audio quality setting.
pub fn sample_rate_for(quality: AudioQuality) -> &'static str {
    match quality {
        AudioQuality::High => "22050",
        AudioQuality::Medium => "16000",
        AudioQuality::Low => "8000",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_language_has_both_provider_voices() {
        for lang in Language::ALL {
            for mode in [TtsMode::Neural, TtsMode::Standard] {
                assert!(
                    voice_for(lang, mode).is_some(),
                    "missing voice for {:?}/{:?}",
                    lang,
                    mode
                );
            }
        }
    }

    #[test]
    fn test_sentinel_modes_have_no_voice() {
        for lang in Language::ALL {
            assert_eq!(voice_for(lang, TtsMode::Local), None);
            assert_eq!(voice_for(lang, TtsMode::Disabled), None);
        }
    }

    #[test]
    fn test_mapping_is_deterministic() {
        assert_eq!(voice_for(Language::Es, TtsMode::Neural), Some("Lupe"));
        assert_eq!(voice_for(Language::Es, TtsMode::Neural), Some("Lupe"));
        assert_eq!(voice_for(Language::De, TtsMode::Standard), Some("Marlene"));
    }
}
