use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::HealthCheckConfig;

/// One health probe attempt. `Err` carries a human-readable reason.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<(), String>;
}

/// GET against the configured endpoint; any 2xx is healthy.
pub struct HttpProbe {
    client: Client,
    endpoint: String,
}

pub fn build_http_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent("forge-manager health check")
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
}

impl HttpProbe {
    pub fn new(endpoint: String, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_http_client(timeout)?,
            endpoint,
        })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self) -> Result<(), String> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("health endpoint returned {status}"))
        }
    }
}

/// Tracks consecutive probe failures against a threshold.
///
/// Failures are data, not faults: nothing here returns an error. Polling more
/// often than `interval` returns the cached result without probing.
pub struct HealthChecker {
    probe: Option<Arc<dyn HealthProbe>>,
    interval: Duration,
    failure_threshold: u32,
    consecutive_failures: u32,
    last_poll: Option<DateTime<Utc>>,
    clock: Arc<dyn Clock>,
}

impl HealthChecker {
    pub fn from_config(config: &HealthCheckConfig, clock: Arc<dyn Clock>) -> reqwest::Result<Self> {
        let probe = match &config.endpoint {
            Some(endpoint) => {
                let probe: Arc<dyn HealthProbe> =
                    Arc::new(HttpProbe::new(endpoint.clone(), config.timeout)?);
                Some(probe)
            }
            None => None,
        };
        Ok(Self::new(probe, config.interval, config.failure_threshold, clock))
    }

    pub fn new(
        probe: Option<Arc<dyn HealthProbe>>,
        interval: Duration,
        failure_threshold: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            probe,
            interval,
            failure_threshold,
            consecutive_failures: 0,
            last_poll: None,
            clock,
        }
    }

    /// Probe if due and return the eligibility signal.
    pub async fn poll(&mut self) -> bool {
        let Some(probe) = self.probe.clone() else {
            return true;
        };

        let now = self.clock.now();
        if let Some(last) = self.last_poll {
            let interval =
                chrono::Duration::from_std(self.interval).unwrap_or(chrono::Duration::zero());
            if now - last < interval {
                return self.is_eligible();
            }
        }
        self.last_poll = Some(now);

        match probe.check().await {
            Ok(()) => {
                if self.consecutive_failures > 0 {
                    info!(
                        previous_failures = self.consecutive_failures,
                        "health check recovered"
                    );
                }
                self.consecutive_failures = 0;
            }
            Err(reason) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.failure_threshold {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.failure_threshold,
                        reason = %reason,
                        "health check failing, region not eligible to forge"
                    );
                } else {
                    debug!(
                        failures = self.consecutive_failures,
                        threshold = self.failure_threshold,
                        reason = %reason,
                        "health check failed"
                    );
                }
            }
        }
        self.is_eligible()
    }

    pub fn is_eligible(&self) -> bool {
        self.consecutive_failures < self.failure_threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_configured(&self) -> bool {
        self.probe.is_some()
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::testing::ScriptedProbe;

    fn http_checker(endpoint: String, threshold: u32) -> HealthChecker {
        let config = HealthCheckConfig {
            endpoint: Some(endpoint),
            interval: Duration::ZERO,
            timeout: Duration::from_millis(500),
            failure_threshold: threshold,
        };
        HealthChecker::from_config(&config, Arc::new(SystemClock)).unwrap()
    }

    #[tokio::test]
    async fn no_endpoint_is_always_healthy() {
        let config = HealthCheckConfig {
            endpoint: None,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(3),
            failure_threshold: 1,
        };
        let mut checker = HealthChecker::from_config(&config, Arc::new(SystemClock)).unwrap();
        assert!(!checker.is_configured());
        for _ in 0..5 {
            assert!(checker.poll().await);
        }
    }

    #[tokio::test]
    async fn http_2xx_is_healthy_and_5xx_counts_failures() {
        let server = MockServer::start();
        let mut ok = server.mock(|when, then| {
            when.method(GET).path("/health");
            then.status(204);
        });

        let mut checker = http_checker(server.url("/health"), 2);
        assert!(checker.poll().await);
        assert_eq!(checker.consecutive_failures(), 0);
        ok.assert();
        ok.delete();

        server.mock(|when, then| {
            when.method(GET).path("/health");
            then.status(503);
        });
        assert!(checker.poll().await, "one failure is below the threshold");
        assert_eq!(checker.consecutive_failures(), 1);
        assert!(!checker.poll().await);
        assert_eq!(checker.consecutive_failures(), 2);
    }

    #[tokio::test]
    async fn slow_endpoint_times_out_as_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/slow");
            then.status(200).delay(Duration::from_secs(2));
        });

        let mut checker = http_checker(server.url("/slow"), 1);
        assert!(!checker.poll().await);
        assert_eq!(checker.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn connection_refused_is_a_failure() {
        // Port 9 (discard) is essentially never listening in test environments.
        let mut checker = http_checker("http://127.0.0.1:9/health".to_string(), 1);
        assert!(!checker.poll().await);
    }

    #[tokio::test]
    async fn single_success_resets_counter() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.push_failures(3);
        probe.push_successes(1);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut checker = HealthChecker::new(Some(probe), Duration::from_secs(1), 3, clock.clone());

        for _ in 0..3 {
            checker.poll().await;
            clock.advance(Duration::from_secs(1));
        }
        assert!(!checker.is_eligible());
        assert_eq!(checker.consecutive_failures(), 3);

        assert!(checker.poll().await);
        assert_eq!(checker.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn polls_inside_interval_use_cached_result() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.push_failures(1);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut checker =
            HealthChecker::new(Some(probe.clone()), Duration::from_secs(30), 1, clock.clone());

        assert!(!checker.poll().await);
        clock.advance(Duration::from_secs(10));
        assert!(!checker.poll().await);
        assert_eq!(probe.calls(), 1);

        clock.advance(Duration::from_secs(20));
        // Script exhausted: the probe defaults to healthy.
        assert!(checker.poll().await);
        assert_eq!(probe.calls(), 2);
    }
}
