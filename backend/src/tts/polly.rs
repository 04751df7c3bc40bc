//! AWS Polly synthesis provider.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_polly::config::Region;
use aws_sdk_polly::error::SdkError;
use aws_sdk_polly::operation::synthesize_speech::SynthesizeSpeechError;
use aws_sdk_polly::types::{Engine, OutputFormat, VoiceId};
use aws_sdk_polly::Client;
use bytes::Bytes;
use tracing::warn;

use super::SpeechSynthesizer;
use crate::error::{HubError, HubResult};
use shared::TtsMode;

pub struct PollySynthesizer {
    client: Client,
}

impl PollySynthesizer {
    pub async fn new(region: &str) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self {
            client: Client::new(&aws_config),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for PollySynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        mode: TtsMode,
        sample_rate: &str,
    ) -> HubResult<Bytes> {
        let engine = match mode {
            TtsMode::Neural => Engine::Neural,
            TtsMode::Standard => Engine::Standard,
            TtsMode::Local | TtsMode::Disabled => {
                return Err(HubError::Internal(format!(
                    "provider synthesis requested for sentinel mode {:?}",
                    mode
                )))
            }
        };

        let output = self
            .client
            .synthesize_speech()
            .output_format(OutputFormat::Mp3)
            .sample_rate(sample_rate)
            .text(text)
            .voice_id(VoiceId::from(voice))
            .engine(engine)
            .send()
            .await
            .map_err(classify_synthesize)?;

        let bytes = output
            .audio_stream
            .collect()
            .await
            .map_err(|e| HubError::Network(format!("audio stream read failed: {}", e)))?
            .into_bytes();

        if bytes.is_empty() {
            return Err(HubError::ProviderUnavailable(
                "provider returned an empty audio stream".to_string(),
            ));
        }
        Ok(bytes)
    }
}

fn classify_synthesize(e: SdkError<SynthesizeSpeechError>) -> HubError {
    match e.as_service_error() {
        Some(err) if err.is_text_length_exceeded_exception() => {
            HubError::InvalidInput("text too long for synthesis".to_string())
        }
        Some(err) if err.is_invalid_sample_rate_exception() => {
            HubError::InvalidInput("invalid sample rate".to_string())
        }
        Some(err) if err.is_language_not_supported_exception() => {
            HubError::InvalidInput("language not supported by voice".to_string())
        }
        Some(err) if err.is_service_failure_exception() => {
            HubError::ProviderUnavailable("speech provider reported a failure".to_string())
        }
        Some(err) => {
            warn!("unclassified Polly failure: {:?}", err);
            HubError::ProviderUnavailable(
                err.meta().message().unwrap_or("synthesis failed").to_string(),
            )
        }
        None => HubError::Network(e.to_string()),
    }
}
