use crate::model::{HealthCheckResult, Outcome, ProxyEndpoint};
use crate::notify::Notifier;
use crate::probe::ProxiedRequest;
use crate::session::Prober;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

/// Floor for the configured check interval, to keep a bad setting from
/// turning the tick into a hot loop.
pub const MIN_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alert {
    Down,
    Recovered,
}

/// Recurring health-check task. Ticks never overlap and endpoints are probed
/// strictly sequentially within a tick, so a tick lasts on the order of
/// endpoint count x (startup grace + probe timeout).
pub struct Scheduler {
    store: Arc<Store>,
    prober: Arc<dyn Prober>,
    notifier: Arc<Notifier>,
    test_url: String,
    request_timeout: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        prober: Arc<dyn Prober>,
        notifier: Arc<Notifier>,
        test_url: String,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            prober,
            notifier,
            test_url,
            request_timeout,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!("health check scheduler started");
        loop {
            let interval = self
                .store
                .settings()
                .check_interval_secs
                .max(MIN_INTERVAL_SECS);

            let endpoints = self.store.enabled();
            let mut up = 0usize;
            for endpoint in &endpoints {
                let result = run_single_check(
                    &self.store,
                    self.prober.as_ref(),
                    &self.notifier,
                    &self.test_url,
                    self.request_timeout,
                    endpoint,
                )
                .await;
                if result.is_up() {
                    up += 1;
                }
            }
            if !endpoints.is_empty() {
                tracing::debug!("tick done: {up}/{} endpoints up", endpoints.len());
            }

            tokio::select! {
                _ = sleep(Duration::from_secs(interval)) => {}
                _ = shutdown.recv() => {
                    tracing::info!("health check scheduler stopped");
                    return;
                }
            }
        }
    }
}

/// Probes one endpoint through a one-shot session, appends the result and
/// applies alert hysteresis. Session and probe faults are recorded as DOWN;
/// nothing here aborts the caller.
pub async fn run_single_check(
    store: &Store,
    prober: &dyn Prober,
    notifier: &Notifier,
    test_url: &str,
    request_timeout: Duration,
    endpoint: &ProxyEndpoint,
) -> HealthCheckResult {
    let report = prober
        .check(endpoint, ProxiedRequest::get(test_url, request_timeout))
        .await;

    let result = if report.ok {
        store.record_up(endpoint.id, report.latency_ms.unwrap_or_default())
    } else {
        store.record_down(
            endpoint.id,
            report.error.unwrap_or_else(|| "probe failed".into()),
        )
    };

    let threshold = store.settings().threshold();
    let history = store.recent_checks(endpoint.id, threshold + 1);
    match alert_decision(&history, threshold) {
        Some(Alert::Down) => {
            tracing::info!(
                "endpoint {} ({}) confirmed DOWN after {threshold} consecutive failures",
                endpoint.id,
                endpoint.name
            );
            notifier
                .endpoint_down(endpoint, result.error.as_deref())
                .await;
        }
        Some(Alert::Recovered) => {
            tracing::info!("endpoint {} ({}) recovered", endpoint.id, endpoint.name);
            notifier.endpoint_recovered(endpoint, result.latency_ms).await;
        }
        None => {}
    }

    result
}

/// Hysteresis over a newest-first history whose head is the result that was
/// just recorded. Both branches use the same trailing-run primitive:
/// - newest DOWN: alert when the run of consecutive DOWNs has just reached
///   the threshold, and never again while it keeps growing;
/// - newest UP: announce recovery when the run that just ended is exactly the
///   one a down-alert fired for. Shorter flaps stay silent.
pub fn alert_decision(history: &[HealthCheckResult], threshold: usize) -> Option<Alert> {
    let newest = history.first()?;
    match newest.outcome {
        Outcome::Down => {
            (trailing_down_run(history, 0, threshold + 1) == threshold).then_some(Alert::Down)
        }
        Outcome::Up => {
            (trailing_down_run(history, 1, threshold) == threshold).then_some(Alert::Recovered)
        }
    }
}

/// Length of the consecutive-DOWN run starting at `skip` in a newest-first
/// history, looking at no more than `cap` records.
fn trailing_down_run(history: &[HealthCheckResult], skip: usize, cap: usize) -> usize {
    history
        .iter()
        .skip(skip)
        .take(cap)
        .take_while(|r| r.outcome == Outcome::Down)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notifier;
    use crate::parser::parse_link;
    use crate::probe::ProbeReport;
    use crate::session::Prober;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn result(outcome: Outcome) -> HealthCheckResult {
        HealthCheckResult {
            id: 0,
            endpoint_id: 1,
            outcome,
            latency_ms: (outcome == Outcome::Up).then_some(10.0),
            error: (outcome == Outcome::Down).then(|| "timeout".into()),
            checked_at: Utc::now(),
        }
    }

    /// Newest-first history from an oldest-first outcome sequence.
    fn history(oldest_first: &[Outcome]) -> Vec<HealthCheckResult> {
        oldest_first.iter().rev().map(|o| result(*o)).collect()
    }

    use Outcome::{Down, Up};

    #[test]
    fn down_alert_fires_exactly_at_threshold() {
        assert_eq!(alert_decision(&history(&[Up, Down]), 3), None);
        assert_eq!(alert_decision(&history(&[Up, Down, Down]), 3), None);
        assert_eq!(
            alert_decision(&history(&[Up, Down, Down, Down]), 3),
            Some(Alert::Down)
        );
        // The run keeps growing: no repeat alert.
        assert_eq!(alert_decision(&history(&[Up, Down, Down, Down, Down]), 3), None);
    }

    #[test]
    fn recovery_fires_only_after_confirmed_down() {
        assert_eq!(
            alert_decision(&history(&[Down, Down, Down, Up]), 3),
            Some(Alert::Recovered)
        );
        // Flap of two never alerted, so its recovery is silent too.
        assert_eq!(alert_decision(&history(&[Down, Down, Up]), 3), None);
        // Consecutive UPs after a recovery stay silent.
        assert_eq!(alert_decision(&history(&[Down, Down, Down, Up, Up]), 3), None);
    }

    #[test]
    fn long_outage_recovery_is_still_announced() {
        assert_eq!(
            alert_decision(&history(&[Down, Down, Down, Down, Down, Up]), 3),
            Some(Alert::Recovered)
        );
    }

    #[test]
    fn threshold_one_alerts_on_every_transition() {
        assert_eq!(alert_decision(&history(&[Up, Down]), 1), Some(Alert::Down));
        assert_eq!(alert_decision(&history(&[Up, Down, Down]), 1), None);
        assert_eq!(
            alert_decision(&history(&[Down, Up]), 1),
            Some(Alert::Recovered)
        );
    }

    #[test]
    fn empty_history_is_silent() {
        assert_eq!(alert_decision(&[], 3), None);
    }

    struct FakeProber {
        reports: Mutex<VecDeque<ProbeReport>>,
    }

    impl FakeProber {
        fn scripted(reports: Vec<ProbeReport>) -> Self {
            Self {
                reports: Mutex::new(reports.into()),
            }
        }
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn check(&self, _: &ProxyEndpoint, _: ProxiedRequest<'_>) -> ProbeReport {
            self.reports
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ProbeReport::down("script exhausted"))
        }

        async fn fetch_json(
            &self,
            _: &ProxyEndpoint,
            _: &str,
            _: &[(&str, String)],
            _: Duration,
        ) -> Option<Value> {
            None
        }
    }

    #[tokio::test]
    async fn single_check_records_report_as_result() {
        let store = Arc::new(Store::new());
        let endpoint = store.insert(parse_link("vless://u@h:443#n").unwrap());
        let prober = FakeProber::scripted(vec![
            ProbeReport::up(25.0),
            ProbeReport::down("HTTP 503"),
        ]);
        let notifier = Notifier::new(
            store.clone(),
            Arc::new(FakeProber::scripted(vec![])),
            Duration::from_secs(1),
        );

        let up = run_single_check(
            &store,
            &prober,
            &notifier,
            "http://test.invalid",
            Duration::from_secs(1),
            &endpoint,
        )
        .await;
        assert!(up.is_up());
        assert_eq!(up.latency_ms, Some(25.0));

        let down = run_single_check(
            &store,
            &prober,
            &notifier,
            "http://test.invalid",
            Duration::from_secs(1),
            &endpoint,
        )
        .await;
        assert!(!down.is_up());
        assert_eq!(down.error.as_deref(), Some("HTTP 503"));

        assert_eq!(store.recent_checks(endpoint.id, 10).len(), 2);
    }
}
