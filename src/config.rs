use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result as AnyResult, anyhow};
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::llm::WireFormat;

pub const DEFAULT_ONLINE_ENDPOINT: &str = "https://api.deepseek.com/v1/chat/completions";
pub const DEFAULT_LOCAL_ENDPOINT: &str = "http://localhost:11434/v1/chat/completions";
const LOCAL_HISTORY_TURNS: usize = 5;
const ONLINE_HISTORY_TURNS: usize = 8;

#[derive(Parser, Clone, Debug)]
pub struct CliParams {
    /// Settings file holding backend, model and feature flags
    #[clap(long = "settings", value_name = "PATH", default_value = "ai_settings.json")]
    pub settings: PathBuf,

    /// Data context JSON files; pass multiple times and press Tab to switch
    #[clap(short = 'c', long = "context", value_name = "PATH")]
    pub contexts: Vec<PathBuf>,

    /// Ask a single question, stream the answer to stdout and exit
    #[clap(short = 'a', long = "ask", value_name = "QUESTION")]
    pub ask: Option<String>,

    /// Print the last N logged exchanges and exit
    #[clap(long = "print-log", value_name = "N")]
    pub print_log: Option<usize>,

    /// Directory for the tracing log file
    #[clap(long = "log-dir", value_name = "DIR", default_value = ".")]
    pub log_dir: PathBuf,

    /// Override the chat endpoint URL
    #[clap(long = "endpoint", env = "AI_API_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Override the API key
    #[clap(long = "api-key", env = "AI_API_KEY")]
    pub api_key: Option<String>,

    /// Override the model name
    #[clap(long = "model", env = "AI_MODEL")]
    pub model: Option<String>,

    /// Override the backend kind (online or local)
    #[clap(long = "backend", value_name = "KIND")]
    pub backend: Option<BackendKind>,

    /// Override the local service type (ollama or openai)
    #[clap(long = "local-service", value_name = "TYPE")]
    pub local_service: Option<LocalServiceType>,

    /// Request single-shot responses instead of streaming
    #[clap(long = "no-stream")]
    pub no_stream: bool,
}

impl CliParams {
    pub fn apply_overrides(&self, settings: &mut AiSettings) {
        if let Some(backend) = self.backend {
            if backend == BackendKind::Local
                && self.endpoint.is_none()
                && settings.endpoint == DEFAULT_ONLINE_ENDPOINT
            {
                settings.endpoint = DEFAULT_LOCAL_ENDPOINT.to_string();
            }
            settings.backend = backend;
        }
        if let Some(service) = self.local_service {
            settings.local_service = service;
        }
        if let Some(endpoint) = self.endpoint.as_deref() {
            settings.endpoint = normalize_endpoint(endpoint);
        }
        if let Some(api_key) = self.api_key.as_deref() {
            settings.api_key = api_key.trim().to_string();
        }
        if let Some(model) = self.model.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
            settings.model = model.to_string();
        }
        if self.no_stream {
            settings.streaming_enabled = false;
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Online,
    Local,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" | "remote" => Ok(BackendKind::Online),
            "local" => Ok(BackendKind::Local),
            other => Err(format!("unsupported backend `{other}` (use online or local)")),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalServiceType {
    Ollama,
    /// LM Studio, vLLM and other servers exposing `/v1/chat/completions`.
    #[serde(alias = "lmstudio")]
    OpenAi,
}

impl FromStr for LocalServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(LocalServiceType::Ollama),
            "openai" | "lmstudio" | "vllm" => Ok(LocalServiceType::OpenAi),
            other => Err(format!(
                "unsupported local service `{other}` (use ollama or openai)"
            )),
        }
    }
}

/// Persisted AI settings, written by an external settings surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    pub backend: BackendKind,
    pub provider: String,
    pub local_service: LocalServiceType,
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub analysis_enabled: bool,
    pub streaming_enabled: bool,
}

impl Default for AiSettings {
    fn default() -> Self {
        AiSettings {
            backend: BackendKind::Online,
            provider: "deepseek".to_string(),
            local_service: LocalServiceType::Ollama,
            endpoint: DEFAULT_ONLINE_ENDPOINT.to_string(),
            api_key: String::new(),
            model: "deepseek-chat".to_string(),
            max_tokens: 2000,
            temperature: 0.7,
            timeout_secs: 60,
            analysis_enabled: true,
            streaming_enabled: true,
        }
    }
}

impl AiSettings {
    pub fn load_or_init(path: impl AsRef<Path>) -> AnyResult<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => {
                let mut settings = serde_json::from_str::<AiSettings>(&contents)
                    .with_context(|| format!("解析 {} 失败", path.display()))?;
                settings.endpoint = normalize_endpoint(&settings.endpoint);
                Ok(settings)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let settings = AiSettings::default();
                let payload = serde_json::to_string_pretty(&settings)?;
                fs::write(path, payload).with_context(|| format!("无法写入 {}", path.display()))?;
                tracing::info!(path = %path.display(), "wrote default AI settings");
                Ok(settings)
            }
            Err(err) => Err(anyhow!("读取 {} 失败: {}", path.display(), err)),
        }
    }

    pub fn wire_format(&self) -> WireFormat {
        if self.backend == BackendKind::Local && self.local_service == LocalServiceType::Ollama {
            WireFormat::Ollama
        } else {
            WireFormat::OpenAi
        }
    }

    pub fn history_limit(&self) -> usize {
        match self.backend {
            BackendKind::Local => LOCAL_HISTORY_TURNS,
            BackendKind::Online => ONLINE_HISTORY_TURNS,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn api_key(&self) -> Option<&str> {
        let key = self.api_key.trim();
        if key.is_empty() { None } else { Some(key) }
    }

    pub fn validate(&self) -> Result<(), ChatError> {
        if self.endpoint.trim().is_empty() {
            return Err(ChatError::Config("未配置 API 地址".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(ChatError::Config("未配置模型名称".to_string()));
        }
        Ok(())
    }

    pub fn backend_label(&self) -> String {
        match self.backend {
            BackendKind::Online => format!("在线 · {} · {}", self.provider, self.model),
            BackendKind::Local => {
                let service = match self.local_service {
                    LocalServiceType::Ollama => "Ollama",
                    LocalServiceType::OpenAi => "OpenAI 兼容",
                };
                format!("本地 · {} · {}", service, self.model)
            }
        }
    }
}

pub fn normalize_endpoint(value: &str) -> String {
    value.trim().trim_end_matches('/').to_string()
}
