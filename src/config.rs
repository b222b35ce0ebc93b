use std::{env, str::FromStr, time::Duration};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Supabase,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown store backend {0:?} (expected memory or supabase)")]
pub struct UnknownBackend(pub String);

impl FromStr for StoreBackend {
    type Err = UnknownBackend;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "memory" | "" => Ok(StoreBackend::Memory),
            "supabase" => Ok(StoreBackend::Supabase),
            _ => Err(UnknownBackend(input.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub request_max_bytes: usize,
    pub max_drafts: usize,
    pub draft_idle: Duration,
    pub store: StoreBackend,
    pub metrics_key: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT").unwrap_or(8000),
            // ten 5 MiB images as base64 plus JSON overhead
            request_max_bytes: env_parse::<usize>("REQUEST_MAX_BYTES")
                .filter(|v| *v > 0)
                .unwrap_or(72 * 1024 * 1024),
            max_drafts: env_parse::<usize>("MAX_DRAFTS")
                .filter(|v| *v > 0)
                .unwrap_or(256),
            draft_idle: Duration::from_secs(
                env_parse::<u64>("DRAFT_IDLE_SECS")
                    .filter(|v| *v > 0)
                    .unwrap_or(30 * 60),
            ),
            store: env_parse("INTAKE_STORE").unwrap_or(StoreBackend::Memory),
            metrics_key: env::var("METRICS_KEY").ok().filter(|v| !v.is_empty()),
        }
    }
}

pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}
