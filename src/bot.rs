use crate::model::Outcome;
use crate::notify::Notifier;
use crate::scheduler;
use crate::session::Prober;
use crate::store::Store;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

const IDLE_SLEEP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Menu,
    Status,
    List,
    TestAll,
    TestOne(u64),
    TestUsage,
}

impl Command {
    fn parse(text: &str) -> Command {
        match text {
            "/start" | "/help" => Command::Menu,
            "/status" => Command::Status,
            "/servers" => Command::List,
            _ if text.starts_with("/test_all") => Command::TestAll,
            _ if text.starts_with("/test") => {
                let parts: Vec<&str> = text.split_whitespace().collect();
                match parts.as_slice() {
                    [_, id] if id.chars().all(|c| c.is_ascii_digit()) && !id.is_empty() => {
                        match id.parse() {
                            Ok(id) => Command::TestOne(id),
                            Err(_) => Command::TestUsage,
                        }
                    }
                    _ => Command::TestUsage,
                }
            }
            // Anything unrecognized gets the menu back.
            _ => Command::Menu,
        }
    }
}

/// Long-polls the message bus for commands through the notifier's transport
/// selection. The first chat to send anything is registered as the sole
/// authorized recipient; everyone else is ignored afterwards.
pub struct CommandBot {
    store: Arc<Store>,
    notifier: Arc<Notifier>,
    prober: Arc<dyn Prober>,
    test_url: String,
    request_timeout: Duration,
}

impl CommandBot {
    pub fn new(
        store: Arc<Store>,
        notifier: Arc<Notifier>,
        prober: Arc<dyn Prober>,
        test_url: String,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            prober,
            test_url,
            request_timeout,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!("command bot poller started");
        let mut offset: i64 = 0;

        loop {
            let settings = self.store.settings();
            if settings.bot_token.as_deref().map_or(true, str::is_empty) {
                if idle(&mut shutdown).await {
                    break;
                }
                continue;
            }

            let data = tokio::select! {
                data = self.notifier.get_updates(offset) => data,
                _ = shutdown.recv() => break,
            };

            let Some(data) = data else {
                if idle(&mut shutdown).await {
                    break;
                }
                continue;
            };
            if !data.get("ok").and_then(Value::as_bool).unwrap_or(false) {
                tracing::warn!("getUpdates not ok: {data}");
                if idle(&mut shutdown).await {
                    break;
                }
                continue;
            }

            if let Some(updates) = data.get("result").and_then(Value::as_array) {
                for update in updates {
                    if let Some(id) = update.get("update_id").and_then(Value::as_i64) {
                        offset = id;
                    }
                    self.handle_update(update).await;
                }
            }
        }
        tracing::info!("command bot poller stopped");
    }

    async fn handle_update(&self, update: &Value) {
        let Some(message) = update
            .get("message")
            .or_else(|| update.get("edited_message"))
        else {
            return;
        };
        let Some(chat_id) = message.pointer("/chat/id").and_then(Value::as_i64) else {
            return;
        };
        let chat_id = chat_id.to_string();
        let text = message
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if text.is_empty() {
            return;
        }

        let mut settings = self.store.settings();
        if settings.chat_id.as_deref().map_or(true, str::is_empty) {
            // First chat to speak becomes the authorized recipient.
            self.store
                .update_settings(|s| s.chat_id = Some(chat_id.clone()));
            tracing::info!("registered chat {chat_id} as the bot admin");
            self.notifier
                .send("This chat is now registered as the proxywatch admin ✅")
                .await;
            settings = self.store.settings();
        }
        if settings.chat_id.as_deref() != Some(chat_id.as_str()) {
            return;
        }

        match Command::parse(&text) {
            Command::Menu => self.send_menu().await,
            Command::Status => self.send_status().await,
            Command::List => self.send_list().await,
            Command::TestAll => self.test_all().await,
            Command::TestOne(id) => self.test_one(id).await,
            Command::TestUsage => {
                self.notifier
                    .send("Bad test command format.\nExample:\n/test 1")
                    .await;
            }
        }
    }

    async fn send_menu(&self) {
        self.notifier
            .send(
                "👋 Welcome to the proxywatch admin panel\n\n\
                 Commands:\n\
                 /status - aggregate endpoint status\n\
                 /servers - endpoint list\n\
                 /test_all - test every endpoint\n\
                 /test <ID> - test one endpoint (example: /test 1)\n",
            )
            .await;
    }

    async fn send_status(&self) {
        let endpoints = self.store.all();
        if endpoints.is_empty() {
            self.notifier.send("No endpoints registered yet.").await;
            return;
        }

        let (mut up, mut down, mut unknown) = (0, 0, 0);
        for endpoint in &endpoints {
            match self.store.latest_check(endpoint.id) {
                None => unknown += 1,
                Some(check) if check.outcome == Outcome::Up => up += 1,
                Some(_) => down += 1,
            }
        }

        self.notifier
            .send(&format!(
                "📊 Endpoint status:\n\nTotal: {}\nUP: {up}\nDOWN: {down}\nUnknown (never checked): {unknown}",
                endpoints.len(),
            ))
            .await;
    }

    async fn send_list(&self) {
        let endpoints = self.store.all();
        if endpoints.is_empty() {
            self.notifier.send("No endpoints registered yet.").await;
            return;
        }

        let mut lines = vec!["📋 Endpoints:".to_string()];
        for endpoint in &endpoints {
            let last = self.store.latest_check(endpoint.id);
            lines.push(format!(
                "ID {} - {} ({} {}:{}) → {} / {}",
                endpoint.id,
                endpoint.name,
                endpoint.protocol,
                endpoint.host,
                endpoint.port,
                status_text(last.as_ref().map(|c| c.outcome)),
                latency_text(last.as_ref().and_then(|c| c.latency_ms)),
            ));
        }
        self.notifier.send(&lines.join("\n")).await;
    }

    async fn test_all(&self) {
        let endpoints = self.store.all();
        if endpoints.is_empty() {
            self.notifier.send("No endpoints registered yet.").await;
            return;
        }

        let mut lines = vec!["⏱ Testing all endpoints:".to_string()];
        for endpoint in &endpoints {
            let result = scheduler::run_single_check(
                &self.store,
                self.prober.as_ref(),
                &self.notifier,
                &self.test_url,
                self.request_timeout,
                endpoint,
            )
            .await;
            lines.push(format!(
                "ID {} - {} → {} / {}",
                endpoint.id,
                endpoint.name,
                status_text(Some(result.outcome)),
                latency_text(result.latency_ms),
            ));
        }
        self.notifier.send(&lines.join("\n")).await;
    }

    async fn test_one(&self, id: u64) {
        let Some(endpoint) = self.store.get(id) else {
            self.notifier
                .send(&format!("No endpoint with ID {id}."))
                .await;
            return;
        };

        let result = scheduler::run_single_check(
            &self.store,
            self.prober.as_ref(),
            &self.notifier,
            &self.test_url,
            self.request_timeout,
            &endpoint,
        )
        .await;

        self.notifier
            .send(&format!(
                "Test result:\n\nID: {}\nName: {}\nAddress: {}:{}\nStatus: {}\nLatency: {}\nError: {}",
                endpoint.id,
                endpoint.name,
                endpoint.host,
                endpoint.port,
                status_text(Some(result.outcome)),
                latency_text(result.latency_ms),
                result.error.as_deref().unwrap_or("-"),
            ))
            .await;
    }
}

async fn idle(shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        _ = sleep(IDLE_SLEEP) => false,
        _ = shutdown.recv() => true,
    }
}

fn status_text(outcome: Option<Outcome>) -> &'static str {
    match outcome {
        Some(Outcome::Up) => "UP",
        Some(Outcome::Down) => "DOWN",
        None => "-",
    }
}

fn latency_text(latency_ms: Option<f64>) -> String {
    match latency_ms {
        Some(latency) => format!("{latency:.0}ms"),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_to_their_handlers() {
        assert_eq!(Command::parse("/start"), Command::Menu);
        assert_eq!(Command::parse("/help"), Command::Menu);
        assert_eq!(Command::parse("/status"), Command::Status);
        assert_eq!(Command::parse("/servers"), Command::List);
        assert_eq!(Command::parse("/test_all"), Command::TestAll);
        assert_eq!(Command::parse("/test 12"), Command::TestOne(12));
    }

    #[test]
    fn malformed_test_gets_usage() {
        assert_eq!(Command::parse("/test"), Command::TestUsage);
        assert_eq!(Command::parse("/test abc"), Command::TestUsage);
        assert_eq!(Command::parse("/test 1 2"), Command::TestUsage);
    }

    #[test]
    fn unknown_text_falls_back_to_menu() {
        assert_eq!(Command::parse("hello"), Command::Menu);
        assert_eq!(Command::parse("/unknown"), Command::Menu);
    }

    #[test]
    fn test_all_prefix_wins_over_test() {
        // "/test_all extra" is still test-all, not a malformed /test.
        assert_eq!(Command::parse("/test_all now"), Command::TestAll);
    }

    #[test]
    fn latency_formatting() {
        assert_eq!(latency_text(Some(31.7)), "32ms");
        assert_eq!(latency_text(None), "-");
    }
}
