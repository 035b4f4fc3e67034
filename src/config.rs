use serde::Deserialize;

use crate::prompts::PROMPT_VERSION;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Postgres URL. Without it the service runs on the in-memory store.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_exam_data_dir")]
    pub exam_data_dir: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_llm_base_url")]
    pub llm_base_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    #[serde(default = "default_dictionary_path")]
    pub dictionary_path: String,
    #[serde(default = "default_prompt_version")]
    pub prompt_version: String,
}

impl Settings {
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg =
            config::Config::builder().add_source(config::Environment::default().separator("__"));

        if let Ok(path) = std::env::var("BACKEND_CONFIG_FILE") {
            cfg = cfg.add_source(config::File::with_name(&path).required(false));
        }

        let settings: Settings = cfg.build()?.try_deserialize()?;
        Ok(settings.normalized())
    }

    fn normalized(mut self) -> Self {
        if self.port == 0 {
            self.port = default_port();
        }
        if self.bind_host.is_empty() {
            self.bind_host = default_bind_host();
        }
        if self.prompt_version.trim().is_empty() {
            self.prompt_version = default_prompt_version();
        }
        self.llm_api_key = self.llm_api_key.filter(|k| !k.trim().is_empty());
        self.database_url = self.database_url.filter(|u| !u.trim().is_empty());
        self
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            port: default_port(),
            database_url: None,
            exam_data_dir: default_exam_data_dir(),
            llm_api_key: None,
            llm_base_url: default_llm_base_url(),
            llm_model: default_llm_model(),
            llm_timeout_secs: default_llm_timeout_secs(),
            dictionary_path: default_dictionary_path(),
            prompt_version: default_prompt_version(),
        }
    }
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    std::env::var("BACKEND_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

fn default_exam_data_dir() -> String {
    "./data/exams".to_string()
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    90
}

fn default_dictionary_path() -> String {
    "./data/dict/ipadic".to_string()
}

fn default_prompt_version() -> String {
    PROMPT_VERSION.to_string()
}
