use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;

use crate::admission::QuotaTable;
use crate::openai::OpenAiConfig;

pub const DEFAULT_DATA_DIR: &str = "lifebook-data";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_FAST_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_DEEP_MODEL: &str = "gpt-4o";
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub fast_model: String,
    pub deep_model: String,
    pub transcription_model: String,
    pub http_timeout: Duration,
    pub quotas: QuotaTable,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        let http_timeout = match get("LIFEBOOK_HTTP_TIMEOUT_SECS") {
            Some(raw) => {
                let secs: u64 = raw.parse().with_context(|| {
                    format!("invalid LIFEBOOK_HTTP_TIMEOUT_SECS={raw:?}; expected whole seconds")
                })?;
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        };

        let quotas = match get("LIFEBOOK_QUOTA_FILE") {
            Some(path) => QuotaTable::load(PathBuf::from(&path).as_path())
                .with_context(|| format!("load LIFEBOOK_QUOTA_FILE={path}"))?,
            None => QuotaTable::default(),
        };

        Ok(Self {
            data_dir: get("LIFEBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            openai_api_key: get("OPENAI_API_KEY"),
            openai_base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_owned()),
            fast_model: get("LIFEBOOK_MODEL_FAST").unwrap_or_else(|| DEFAULT_FAST_MODEL.to_owned()),
            deep_model: get("LIFEBOOK_MODEL_DEEP").unwrap_or_else(|| DEFAULT_DEEP_MODEL.to_owned()),
            transcription_model: get("LIFEBOOK_MODEL_TRANSCRIPTION")
                .unwrap_or_else(|| DEFAULT_TRANSCRIPTION_MODEL.to_owned()),
            http_timeout,
            quotas,
        })
    }

    pub fn with_data_dir(mut self, data_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = data_dir {
            self.data_dir = dir;
        }
        self
    }

    pub fn api_key(&self) -> anyhow::Result<&str> {
        self.openai_api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY is required for model calls"))
    }

    pub fn openai_config(&self) -> anyhow::Result<OpenAiConfig> {
        Ok(OpenAiConfig {
            base_url: self.openai_base_url.clone(),
            api_key: self.api_key()?.to_owned(),
            fast_model: self.fast_model.clone(),
            deep_model: self.deep_model.clone(),
            timeout: self.http_timeout,
        })
    }
}
