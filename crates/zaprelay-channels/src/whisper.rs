//! Whisper-compatible speech-to-text, used for inbound voice notes.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use zaprelay_core::{config::TranscriptionConfig, error::RelayError, traits::Transcriber};

/// Whisper API response.
#[derive(Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Transcriber posting multipart uploads to `{base_url}/audio/transcriptions`.
pub struct WhisperTranscriber {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl WhisperTranscriber {
    /// `fallback_key` is used when the transcription section has no key of its own.
    pub fn new(config: &TranscriptionConfig, fallback_key: &str) -> Self {
        let api_key = if config.api_key.is_empty() {
            fallback_key.to_string()
        } else {
            config.api_key.clone()
        };
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        }
    }
}

/// File name with an extension Whisper accepts for the given MIME type.
fn upload_name(mime_type: &str) -> &'static str {
    let essence = mime_type.split(';').next().unwrap_or("").trim();
    match essence {
        "audio/mpeg" | "audio/mp3" => "voice.mp3",
        "audio/mp4" | "audio/m4a" | "audio/aac" => "voice.m4a",
        "audio/wav" | "audio/x-wav" => "voice.wav",
        "audio/webm" => "voice.webm",
        _ => "voice.ogg",
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: Vec<u8>, mime_type: &str) -> Result<String, RelayError> {
        if self.api_key.is_empty() {
            return Err(RelayError::Channel("whisper: no API key configured".into()));
        }
        let essence = mime_type.split(';').next().unwrap_or("audio/ogg").trim();
        let part = reqwest::multipart::Part::bytes(audio)
            .file_name(upload_name(mime_type))
            .mime_str(if essence.is_empty() { "audio/ogg" } else { essence })
            .map_err(|e| RelayError::Channel(format!("whisper mime error: {e}")))?;

        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .part("file", part);

        let resp = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| RelayError::Channel(format!("whisper request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::Channel(format!(
                "whisper API error {status}: {body}"
            )));
        }

        let result: WhisperResponse = resp
            .json()
            .await
            .map_err(|e| RelayError::Channel(format!("whisper response parse failed: {e}")))?;

        Ok(result.text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_name_by_mime() {
        assert_eq!(upload_name("audio/ogg; codecs=opus"), "voice.ogg");
        assert_eq!(upload_name("audio/mpeg"), "voice.mp3");
        assert_eq!(upload_name("audio/mp4"), "voice.m4a");
        assert_eq!(upload_name(""), "voice.ogg");
    }

    #[test]
    fn test_key_falls_back_to_ai_key() {
        let config = TranscriptionConfig::default();
        let t = WhisperTranscriber::new(&config, "sk-ai");
        assert_eq!(t.api_key, "sk-ai");

        let config = TranscriptionConfig {
            api_key: "sk-stt".into(),
            ..Default::default()
        };
        let t = WhisperTranscriber::new(&config, "sk-ai");
        assert_eq!(t.api_key, "sk-stt");
    }

    #[tokio::test]
    async fn test_missing_key_errors_without_request() {
        let t = WhisperTranscriber::new(&TranscriptionConfig::default(), "");
        let err = t.transcribe(vec![1, 2, 3], "audio/ogg").await.unwrap_err();
        assert!(err.to_string().contains("no API key"));
    }
}
