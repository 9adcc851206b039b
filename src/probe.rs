use once_cell::sync::Lazy;
use reqwest::{Client, Method, Proxy};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("HTTP {0}")]
    Status(u16),
    #[error("request timed out")]
    Timeout,
    #[error("request error: {0}")]
    Transport(String),
}

/// Outcome of one probe. Failures of any origin (config, session, HTTP) are
/// folded into `error`; scheduled checks record them as DOWN rather than
/// aborting anything.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub ok: bool,
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
}

impl ProbeReport {
    pub fn up(latency_ms: f64) -> Self {
        Self {
            ok: true,
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    pub fn down(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            latency_ms: None,
            error: Some(error.into()),
        }
    }

    pub fn from_result(result: Result<f64, ProbeError>) -> Self {
        match result {
            Ok(latency_ms) => Self::up(latency_ms),
            Err(e) => Self::down(e.to_string()),
        }
    }
}

/// One HTTP request to issue through a session or transport.
#[derive(Debug, Clone)]
pub struct ProxiedRequest<'a> {
    pub method: Method,
    pub url: &'a str,
    pub form: Option<&'a [(&'a str, String)]>,
    pub timeout: Duration,
}

impl<'a> ProxiedRequest<'a> {
    pub fn get(url: &'a str, timeout: Duration) -> Self {
        Self {
            method: Method::GET,
            url,
            form: None,
            timeout,
        }
    }

    pub fn post_form(url: &'a str, form: &'a [(&'a str, String)], timeout: Duration) -> Self {
        Self {
            method: Method::POST,
            url,
            form: Some(form),
            timeout,
        }
    }
}

static DIRECT_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .user_agent(concat!("proxywatch/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("Failed to build HTTP client")
});

/// Shared client for direct (unproxied) requests; timeouts are per request.
pub fn direct_client() -> &'static Client {
    &DIRECT_CLIENT
}

/// Fresh client routed through the given socks5h proxy.
pub fn socks_client(proxy_url: &str) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(concat!("proxywatch/", env!("CARGO_PKG_VERSION")))
        .proxy(Proxy::all(proxy_url)?)
        .build()
}

/// Issues the request and classifies the result: 2xx is success with the
/// elapsed time, anything else is a failure with its status or fault.
pub async fn timed_request(client: &Client, request: &ProxiedRequest<'_>) -> Result<f64, ProbeError> {
    let mut builder = client
        .request(request.method.clone(), request.url)
        .timeout(request.timeout);
    if let Some(form) = request.form {
        builder = builder.form(form);
    }

    let start = Instant::now();
    match builder.send().await {
        Ok(response) => {
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            let status = response.status();
            if status.is_success() {
                Ok(elapsed_ms)
            } else {
                Err(ProbeError::Status(status.as_u16()))
            }
        }
        Err(e) if e.is_timeout() => Err(ProbeError::Timeout),
        Err(e) => Err(ProbeError::Transport(e.to_string())),
    }
}

/// GET returning the response JSON; None on any fault (callers treat the
/// long-poll as best-effort).
pub async fn json_request(
    client: &Client,
    url: &str,
    query: &[(&str, String)],
    timeout: Duration,
) -> Option<Value> {
    match client.get(url).query(query).timeout(timeout).send().await {
        Ok(response) => match response.json().await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!("long-poll response decode failed: {e}");
                None
            }
        },
        Err(e) => {
            tracing::debug!("long-poll request failed: {e}");
            None
        }
    }
}
