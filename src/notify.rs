use crate::model::{AlertSettings, ProxyEndpoint, TransportMode};
use crate::probe::{self, ProxiedRequest};
use crate::session::Prober;
use crate::store::Store;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const BUS_API_BASE: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const SOCKS_SEND_TIMEOUT: Duration = Duration::from_secs(15);
/// Long-poll: the bus holds the request up to 20s, so the client waits a
/// little longer than that.
const POLL_WAIT_SECS: u64 = 20;
const POLL_TIMEOUT: Duration = Duration::from_secs(25);

fn api_url(token: &str, method: &str) -> String {
    format!("{BUS_API_BASE}/bot{token}/{method}")
}

/// Routes outbound messages (and the bot's inbound long-poll) through the
/// configured transport: direct, via a SOCKS proxy, or relayed through a
/// monitored endpoint. Sends are best-effort and never raise.
pub struct Notifier {
    store: Arc<Store>,
    prober: Arc<dyn Prober>,
    relay_timeout: Duration,
}

impl Notifier {
    pub fn new(store: Arc<Store>, prober: Arc<dyn Prober>, relay_timeout: Duration) -> Self {
        Self {
            store,
            prober,
            relay_timeout,
        }
    }

    pub async fn endpoint_down(&self, endpoint: &ProxyEndpoint, error: Option<&str>) {
        let text = format!(
            "❌ Endpoint '{}' is DOWN.\nHost: {}:{}\nError: {}",
            endpoint.name,
            endpoint.host,
            endpoint.port,
            error.unwrap_or("-"),
        );
        self.send(&text).await;
    }

    pub async fn endpoint_recovered(&self, endpoint: &ProxyEndpoint, latency_ms: Option<f64>) {
        let settings = self.store.settings();
        if !settings.notify_on_recover {
            return;
        }
        let text = match latency_ms {
            Some(latency) => format!(
                "✅ Endpoint '{}' is UP again.\nLatency: {latency:.0} ms",
                endpoint.name
            ),
            None => format!("✅ Endpoint '{}' is UP again.", endpoint.name),
        };
        self.send(&text).await;
    }

    /// Sends one message through the selected transport. Silently a no-op
    /// when the bus credentials are absent.
    pub async fn send(&self, text: &str) {
        let settings = self.store.settings();
        if !settings.bot_configured() {
            return;
        }
        let token = settings.bot_token.clone().unwrap_or_default();
        let chat_id = settings.chat_id.clone().unwrap_or_default();

        match transport_of(&settings) {
            TransportMode::None => self.send_direct(&token, &chat_id, text).await,
            TransportMode::Socks => self.send_via_socks(&settings, &token, &chat_id, text).await,
            TransportMode::ViaEndpoint => self.send_via_endpoint(&token, &chat_id, text).await,
        }
    }

    async fn send_direct(&self, token: &str, chat_id: &str, text: &str) {
        let url = api_url(token, "sendMessage");
        let form = [
            ("chat_id", chat_id.to_string()),
            ("text", text.to_string()),
        ];
        let request = ProxiedRequest::post_form(&url, &form, SEND_TIMEOUT);
        if let Err(e) = probe::timed_request(probe::direct_client(), &request).await {
            tracing::warn!("direct message send failed: {e}");
        }
    }

    async fn send_via_socks(&self, settings: &AlertSettings, token: &str, chat_id: &str, text: &str) {
        // Incomplete proxy coordinates fall back to direct.
        let Some(proxy_url) = settings.socks_proxy_url() else {
            self.send_direct(token, chat_id, text).await;
            return;
        };

        let client = match probe::socks_client(&proxy_url) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!("socks client build failed: {e}");
                return;
            }
        };
        let url = api_url(token, "sendMessage");
        let form = [
            ("chat_id", chat_id.to_string()),
            ("text", text.to_string()),
        ];
        let request = ProxiedRequest::post_form(&url, &form, SOCKS_SEND_TIMEOUT);
        if let Err(e) = probe::timed_request(&client, &request).await {
            tracing::warn!("socks message send failed: {e}");
        }
    }

    async fn send_via_endpoint(&self, token: &str, chat_id: &str, text: &str) {
        let Some(relay) = self.choose_relay() else {
            tracing::warn!("no eligible relay endpoint, falling back to direct send");
            self.send_direct(token, chat_id, text).await;
            return;
        };

        let url = api_url(token, "sendMessage");
        let form = [
            ("chat_id", chat_id.to_string()),
            ("text", text.to_string()),
        ];
        let report = self
            .prober
            .check(
                &relay,
                ProxiedRequest::post_form(&url, &form, self.relay_timeout),
            )
            .await;

        if !report.ok {
            tracing::warn!(
                "relayed send through endpoint {} failed: {}, falling back to direct",
                relay.id,
                report.error.as_deref().unwrap_or("unknown"),
            );
            self.send_direct(token, chat_id, text).await;
        }
    }

    /// Relay endpoint for via-endpoint mode: the configured one when it is
    /// present and enabled, otherwise the enabled endpoint whose latest check
    /// is UP with the lowest latency, ties broken by the most recent check.
    pub fn choose_relay(&self) -> Option<ProxyEndpoint> {
        let settings = self.store.settings();
        if let Some(id) = settings.relay_endpoint_id {
            if let Some(endpoint) = self.store.get(id) {
                if endpoint.enabled {
                    return Some(endpoint);
                }
            }
        }

        let mut best: Option<(ProxyEndpoint, f64, chrono::DateTime<chrono::Utc>)> = None;
        for endpoint in self.store.enabled() {
            let Some(last) = self.store.latest_check(endpoint.id) else {
                continue;
            };
            if !last.is_up() {
                continue;
            }
            // UP records always carry a latency; treat a missing one as worst.
            let latency = last.latency_ms.unwrap_or(f64::INFINITY);
            let better = match &best {
                None => true,
                Some((_, best_latency, best_at)) => {
                    latency < *best_latency
                        || (latency == *best_latency && last.checked_at > *best_at)
                }
            };
            if better {
                best = Some((endpoint, latency, last.checked_at));
            }
        }
        best.map(|(endpoint, _, _)| endpoint)
    }

    /// Long-polls the bus for updates through the same transport selection.
    /// None on any fault; the poller treats that as an idle round.
    pub async fn get_updates(&self, offset: i64) -> Option<Value> {
        let settings = self.store.settings();
        let token = settings.bot_token.clone().filter(|t| !t.is_empty())?;
        let url = api_url(&token, "getUpdates");
        let query = [
            ("timeout", POLL_WAIT_SECS.to_string()),
            ("offset", (offset + 1).to_string()),
        ];

        match transport_of(&settings) {
            TransportMode::None => {
                probe::json_request(probe::direct_client(), &url, &query, POLL_TIMEOUT).await
            }
            TransportMode::Socks => match settings.socks_proxy_url() {
                Some(proxy_url) => match probe::socks_client(&proxy_url) {
                    Ok(client) => probe::json_request(&client, &url, &query, POLL_TIMEOUT).await,
                    Err(e) => {
                        tracing::warn!("socks client build failed: {e}");
                        None
                    }
                },
                None => {
                    probe::json_request(probe::direct_client(), &url, &query, POLL_TIMEOUT).await
                }
            },
            TransportMode::ViaEndpoint => {
                let Some(relay) = self.choose_relay() else {
                    tracing::warn!("no eligible relay endpoint, polling directly");
                    return probe::json_request(probe::direct_client(), &url, &query, POLL_TIMEOUT)
                        .await;
                };
                match self
                    .prober
                    .fetch_json(&relay, &url, &query, POLL_TIMEOUT)
                    .await
                {
                    Some(value) => Some(value),
                    None => {
                        // Any relay failure falls back to a direct poll.
                        probe::json_request(probe::direct_client(), &url, &query, POLL_TIMEOUT)
                            .await
                    }
                }
            }
        }
    }
}

fn transport_of(settings: &AlertSettings) -> TransportMode {
    if !settings.use_proxy {
        TransportMode::None
    } else {
        settings.proxy_mode
    }
}
