use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime settings, read from the environment (after `.env` is loaded).
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    pub ollama_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub tesseract_cmd: String,
    pub tesseract_lang: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str, default: &str| -> String {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Ok(Self {
            bind: parse(&get("OCRCHAT_BIND", "127.0.0.1:8501"), "OCRCHAT_BIND")?,
            data_dir: PathBuf::from(get("OCRCHAT_DATA_DIR", ".")),
            ollama_url: get("OLLAMA_URL", "http://localhost:11434"),
            model: get("OLLAMA_MODEL", "llama2:latest"),
            max_tokens: parse(&get("OLLAMA_MAX_TOKENS", "200"), "OLLAMA_MAX_TOKENS")?,
            timeout: Duration::from_secs(parse(
                &get("OLLAMA_TIMEOUT_SECS", "120"),
                "OLLAMA_TIMEOUT_SECS",
            )?),
            tesseract_cmd: get("TESSERACT_CMD", "tesseract"),
            tesseract_lang: lookup("TESSERACT_LANG").filter(|v| !v.trim().is_empty()),
        })
    }
}

fn parse<T>(value: &str, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", key, value))
}
