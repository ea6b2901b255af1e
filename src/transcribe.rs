use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;

/// Speech-to-text collaborator.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// `hint` lists names and places the speaker is likely to mention.
    async fn transcribe(&self, audio: Vec<u8>, file_name: &str, hint: &str)
    -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct OpenAiTranscriber {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiTranscriber {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/audio/transcriptions", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            model: model.into(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        file_name: &str,
        hint: &str,
    ) -> anyhow::Result<String> {
        let part = reqwest::multipart::Part::bytes(audio).file_name(file_name.to_owned());
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        if !hint.is_empty() {
            form = form.text("prompt", hint.to_owned());
        }

        tracing::info!(model = %self.model, hint_chars = hint.len(), "transcribe audio");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("POST {}", self.endpoint))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .context("read transcription response body")?;
        if !status.is_success() {
            anyhow::bail!("transcription API error ({status}): {raw}");
        }
        let parsed: TranscriptionResponse =
            serde_json::from_str(&raw).context("parse transcription response")?;
        Ok(parsed.text)
    }
}
