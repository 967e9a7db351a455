//! Environment-driven service configuration.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub db_path: String,
    pub session_timeout: Duration,
    pub stream_poll: Duration,
    pub stream_grace: Duration,
    pub max_upload_bytes: usize,
    pub model_endpoint: String,
    pub model_api_key: Option<String>,
    pub vision_model: String,
    pub scenario_model: String,
    pub model_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 9110,
            bind: "127.0.0.1".to_string(),
            db_path: "./page_analysis.db".to_string(),
            session_timeout: Duration::from_secs(3600),
            stream_poll: Duration::from_millis(500),
            stream_grace: Duration::from_millis(500),
            max_upload_bytes: 10 * 1024 * 1024,
            model_endpoint: "http://localhost:11434/v1/chat/completions".to_string(),
            model_api_key: None,
            vision_model: "qwen2.5-vl".to_string(),
            scenario_model: "qwen2.5".to_string(),
            model_timeout: Duration::from_secs(300),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values keep defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        Self {
            port: lookup("PAGE_ANALYSIS_PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            bind: lookup("PAGE_ANALYSIS_BIND").unwrap_or(defaults.bind),
            db_path: lookup("PAGE_ANALYSIS_DB_PATH").unwrap_or(defaults.db_path),
            session_timeout: parsed("SESSION_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_timeout),
            stream_poll: parsed("STREAM_POLL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.stream_poll),
            stream_grace: parsed("STREAM_GRACE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.stream_grace),
            max_upload_bytes: parsed("MAX_UPLOAD_BYTES")
                .map(|n| n as usize)
                .unwrap_or(defaults.max_upload_bytes),
            model_endpoint: lookup("MODEL_ENDPOINT").unwrap_or(defaults.model_endpoint),
            model_api_key: lookup("MODEL_API_KEY"),
            vision_model: lookup("VISION_MODEL").unwrap_or(defaults.vision_model),
            scenario_model: lookup("SCENARIO_MODEL").unwrap_or(defaults.scenario_model),
            model_timeout: parsed("MODEL_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.model_timeout),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
