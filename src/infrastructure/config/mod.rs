use serde::Deserialize;
use std::env;

use crate::domain::dialogue::MAX_ROUND_LENGTH;
use crate::infrastructure::admission::DEFAULT_CONCURRENT_SYNTHESES;
use crate::infrastructure::synthesizer::session::DEFAULT_ENDPOINT;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub tts_app_id: String,
    pub tts_access_token: String,
    pub tts_endpoint: String,
    pub max_concurrent_syntheses: usize,
    pub max_round_length: usize,
    pub task_timeout_minutes: u64,
    pub monitor_namespace: String,
    pub environment: Environment,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        let config = Config {
            tts_app_id: env::var("TTS_APP_ID")?,
            tts_access_token: env::var("TTS_ACCESS_TOKEN")?,
            tts_endpoint: env::var("TTS_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string()),
            max_concurrent_syntheses: env::var("MAX_CONCURRENT_SYNTHESES")
                .unwrap_or_else(|_| DEFAULT_CONCURRENT_SYNTHESES.to_string())
                .parse()?,
            max_round_length: env::var("MAX_ROUND_LENGTH")
                .unwrap_or_else(|_| MAX_ROUND_LENGTH.to_string())
                .parse()?,
            task_timeout_minutes: env::var("TASK_TIMEOUT_MINUTES")
                .unwrap_or_else(|_| "40".to_string())
                .parse()?,
            monitor_namespace: env::var("MONITOR_NAMESPACE")
                .unwrap_or_else(|_| "task_monitor".to_string()),
            environment: env::var("ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string())
                .parse::<String>()
                .map(|s| match s.as_str() {
                    "production" => Environment::Production,
                    _ => Environment::Development,
                })?,
            log_format: env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .parse::<String>()
                .map(|s| match s.as_str() {
                    "json" => LogFormat::Json,
                    _ => LogFormat::Pretty,
                })?,
        };

        Ok(config)
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }

    pub fn task_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.task_timeout_minutes * 60)
    }
}
