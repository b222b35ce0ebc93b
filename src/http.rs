use crate::config::env_parse;
use reqwest::Client;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    /// `None` leaves requests unbounded.
    pub request: Option<Duration>,
    pub connect: Duration,
}

impl HttpTimeouts {
    pub fn from_env() -> Self {
        Self {
            request: Some(Duration::from_secs(
                env_parse("HTTP_TIMEOUT_SECS").unwrap_or(15),
            )),
            connect: connect_from_env(),
        }
    }

    /// Inference calls are slow and carry no deadline unless
    /// `LLM_TIMEOUT_SECS` sets one.
    pub fn for_inference() -> Self {
        Self {
            request: env_parse::<u64>("LLM_TIMEOUT_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            connect: connect_from_env(),
        }
    }
}

fn connect_from_env() -> Duration {
    Duration::from_secs(env_parse("HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(5))
}

pub fn build_client() -> Client {
    build_client_with(&HttpTimeouts::from_env())
}

pub fn build_client_with(timeouts: &HttpTimeouts) -> Client {
    let mut builder = Client::builder().connect_timeout(timeouts.connect);
    if let Some(request) = timeouts.request {
        builder = builder.timeout(request);
    }
    builder.build().unwrap_or_else(|_| Client::new())
}
