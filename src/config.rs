use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::selector::SelectionLimits;

#[derive(Clone, Debug)]
pub struct CompletionConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub referer: String,
    pub title: String,
}

#[derive(Clone, Debug)]
pub struct SelectionConfig {
    pub candidate_cap: usize,
    pub fallback_pool: usize,
    pub timeout_ms: u64,
    pub concept_table_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub max_requests: i64,
    pub window_secs: i64,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub completion: CompletionConfig,
    pub selection: SelectionConfig,
    pub rate_limit: RateLimitConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let data_dir = env::var("GUIDE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        Self {
            bind_addr: env::var("GUIDE_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            data_dir,
            completion: CompletionConfig {
                base_url: env::var("OPENROUTER_BASE_URL")
                    .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string()),
                api_key: env::var("OPENROUTER_API_KEY")
                    .ok()
                    .filter(|key| !key.trim().is_empty()),
                model: env::var("OPENROUTER_MODEL")
                    .unwrap_or_else(|_| "openai/gpt-oss-20b:free".to_string()),
                max_tokens: parse_env("COMPLETION_MAX_TOKENS", 500),
                temperature: parse_env("COMPLETION_TEMPERATURE", 0.8),
                referer: env::var("OPENROUTER_REFERER")
                    .unwrap_or_else(|_| "http://localhost".to_string()),
                title: env::var("OPENROUTER_TITLE")
                    .unwrap_or_else(|_| "Spiritual Chat App".to_string()),
            },
            selection: SelectionConfig {
                candidate_cap: parse_env("SELECTION_CANDIDATE_CAP", 50),
                fallback_pool: parse_env("SELECTION_FALLBACK_POOL", 10),
                timeout_ms: parse_env("SELECTION_TIMEOUT_MS", 2_500),
                concept_table_path: env::var("CONCEPT_TABLE_PATH").ok().map(PathBuf::from),
            },
            rate_limit: RateLimitConfig {
                max_requests: parse_env("RATE_LIMIT_MAX_REQUESTS", 20),
                window_secs: parse_env("RATE_LIMIT_WINDOW_SECS", 60),
            },
        }
    }

    pub fn sqlite_dsn(&self) -> String {
        format!("sqlite://{}", self.data_dir.join("guide.sqlite3").display())
    }

    pub fn selection_limits(&self) -> SelectionLimits {
        SelectionLimits {
            candidate_cap: self.selection.candidate_cap.max(1),
            fallback_pool: self.selection.fallback_pool.max(1),
            timeout: Duration::from_millis(self.selection.timeout_ms.max(1)),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
