//! Readiness Monitor
//!
//! Polls a booting device until it reports `sys.boot_completed=1`.
//!
//! A freshly spawned emulator is invisible to adb for a while, then shows up
//! offline, then accepts shell commands long before the OS has finished
//! booting. Query failures are therefore retried silently until the first
//! successful contact. After contact, `max_rejections` consecutive failures
//! mean the device has stopped answering and polling gives up.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::adb::{AdbClient, AdbError, BOOT_COMPLETED_PROP};
use crate::process::{ProcessDriver, ProcessError};

/// Polling parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessPolicy {
    /// Delay before the second query
    pub poll_interval: Duration,
    /// Upper bound for the delay between queries
    pub max_poll_interval: Duration,
    /// Growth factor applied to the delay after each query
    pub backoff_factor: f64,
    /// Total time budget
    pub max_wait: Duration,
    /// Timeout of a single status query
    pub query_timeout: Duration,
    /// Consecutive failures after first contact before giving up
    pub max_rejections: u32,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_poll_interval: Duration::from_secs(5),
            backoff_factor: 1.5,
            max_wait: Duration::from_secs(300),
            query_timeout: Duration::from_secs(10),
            max_rejections: 5,
        }
    }
}

impl ReadinessPolicy {
    fn next_interval(&self, current: Duration) -> Duration {
        let factor = if self.backoff_factor.is_finite() && self.backoff_factor >= 1.0 {
            self.backoff_factor
        } else {
            1.0
        };
        let cap = self.max_poll_interval.max(self.poll_interval);
        Duration::try_from_secs_f64(current.as_secs_f64() * factor)
            .unwrap_or(cap)
            .min(cap)
    }
}

/// Outcome of waiting for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready { elapsed: Duration, polls: u32 },
    TimedOut { elapsed: Duration, polls: u32 },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }
}

/// Readiness errors
#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("device {serial} stopped responding after {rejections} failed queries: {last_error}")]
    Unresponsive {
        serial: String,
        rejections: u32,
        last_error: String,
    },
    #[error("waiting for {serial} was cancelled")]
    Cancelled { serial: String },
    #[error(transparent)]
    Process(ProcessError),
}

/// Waits for a booted device to become usable
#[async_trait]
pub trait ReadinessMonitor: Send + Sync {
    async fn wait_until_ready(
        &self,
        serial: &str,
        policy: &ReadinessPolicy,
        cancel: &CancellationToken,
    ) -> Result<Readiness, ReadinessError>;
}

/// Readiness monitor that queries the boot-completed property over adb
pub struct AdbReadinessMonitor<P: ProcessDriver> {
    adb: AdbClient<P>,
}

impl<P: ProcessDriver> AdbReadinessMonitor<P> {
    pub fn new(adb: AdbClient<P>) -> Self {
        Self { adb }
    }
}

#[async_trait]
impl<P: ProcessDriver> ReadinessMonitor for AdbReadinessMonitor<P> {
    async fn wait_until_ready(
        &self,
        serial: &str,
        policy: &ReadinessPolicy,
        cancel: &CancellationToken,
    ) -> Result<Readiness, ReadinessError> {
        let cancelled = || ReadinessError::Cancelled {
            serial: serial.to_string(),
        };
        let started = Instant::now();
        let max_rejections = policy.max_rejections.max(1);
        let mut interval = policy.poll_interval;
        let mut polls = 0u32;
        let mut contacted = false;
        let mut rejections = 0u32;

        debug!("waiting for {} to boot (max {:?})", serial, policy.max_wait);

        loop {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }

            polls += 1;
            match self
                .adb
                .get_prop(serial, BOOT_COMPLETED_PROP, policy.query_timeout, cancel)
                .await
            {
                Ok(value) if value == "1" => {
                    let elapsed = started.elapsed();
                    info!("{} booted after {:?} ({} polls)", serial, elapsed, polls);
                    return Ok(Readiness::Ready { elapsed, polls });
                }
                Ok(value) => {
                    if !contacted {
                        debug!("{} answered, boot in progress", serial);
                    }
                    contacted = true;
                    rejections = 0;
                    trace!("{} {}={:?}", serial, BOOT_COMPLETED_PROP, value);
                }
                Err(err) if err.is_cancelled() => return Err(cancelled()),
                Err(AdbError::Process(err @ ProcessError::NotFound { .. })) => {
                    return Err(ReadinessError::Process(err));
                }
                Err(err) if !contacted => {
                    trace!("{} not reachable yet: {}", serial, err);
                }
                Err(err) => {
                    rejections += 1;
                    warn!(
                        "{} query failed ({}/{}): {}",
                        serial, rejections, max_rejections, err
                    );
                    if rejections >= max_rejections {
                        return Err(ReadinessError::Unresponsive {
                            serial: serial.to_string(),
                            rejections,
                            last_error: err.to_string(),
                        });
                    }
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= policy.max_wait {
                warn!("{} not ready after {:?}", serial, elapsed);
                return Ok(Readiness::TimedOut { elapsed, polls });
            }

            let pause = interval.min(policy.max_wait - elapsed);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cancel.cancelled() => return Err(cancelled()),
            }
            interval = policy.next_interval(interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Reply, ScriptedDriver};
    use std::sync::Arc;

    const PROP_QUERY: &str = "getprop sys.boot_completed";

    fn monitor(driver: &Arc<ScriptedDriver>) -> AdbReadinessMonitor<ScriptedDriver> {
        AdbReadinessMonitor::new(AdbClient::new(Arc::clone(driver), "adb"))
    }

    fn fast_policy() -> ReadinessPolicy {
        ReadinessPolicy {
            poll_interval: Duration::from_millis(5),
            max_poll_interval: Duration::from_millis(20),
            backoff_factor: 2.0,
            max_wait: Duration::from_secs(5),
            query_timeout: Duration::from_secs(1),
            max_rejections: 3,
        }
    }

    #[tokio::test]
    async fn test_ready_after_transient_failures() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.on_sequence(
            PROP_QUERY,
            vec![
                Reply::failure(1, "error: device 'emulator-5556' not found"),
                Reply::failure(1, "error: device offline"),
                Reply::stdout("\n"),
                Reply::stdout("0\n"),
                Reply::stdout("1\n"),
            ],
        );

        let outcome = monitor(&driver)
            .wait_until_ready("emulator-5556", &fast_policy(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, Readiness::Ready { polls: 5, .. }));
    }

    #[test]
    fn test_backoff_survives_extreme_factors() {
        let policy = ReadinessPolicy {
            backoff_factor: 1e300,
            ..fast_policy()
        };
        assert_eq!(
            policy.next_interval(Duration::from_millis(5)),
            Duration::from_millis(20)
        );
        assert_eq!(policy.next_interval(Duration::MAX), Duration::from_millis(20));

        let policy = ReadinessPolicy {
            backoff_factor: f64::NAN,
            ..fast_policy()
        };
        assert_eq!(policy.next_interval(Duration::from_millis(5)), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_zero_max_wait_times_out_after_one_query() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.on(PROP_QUERY, Reply::stdout("0"));

        let policy = ReadinessPolicy {
            max_wait: Duration::ZERO,
            ..fast_policy()
        };
        let outcome = monitor(&driver)
            .wait_until_ready("emulator-5556", &policy, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, Readiness::TimedOut { polls: 1, .. }));
        assert_eq!(driver.count(PROP_QUERY), 1);
    }

    #[tokio::test]
    async fn test_never_ready_times_out() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.on(PROP_QUERY, Reply::failure(1, "error: device 'emulator-5556' not found"));

        let policy = ReadinessPolicy {
            max_wait: Duration::from_millis(60),
            ..fast_policy()
        };
        let outcome = monitor(&driver)
            .wait_until_ready("emulator-5556", &policy, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.is_ready());
    }

    #[tokio::test]
    async fn test_rejections_after_contact_are_surfaced() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.on_sequence(
            PROP_QUERY,
            vec![
                Reply::stdout("0"),
                Reply::failure(1, "error: device offline"),
            ],
        );

        let err = monitor(&driver)
            .wait_until_ready("emulator-5556", &fast_policy(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ReadinessError::Unresponsive { rejections, .. } => assert_eq!(rejections, 3),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(driver.count(PROP_QUERY), 4);
    }

    #[tokio::test]
    async fn test_missing_adb_is_not_retried() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.on(PROP_QUERY, Reply::Missing);

        let err = monitor(&driver)
            .wait_until_ready("emulator-5556", &fast_policy(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReadinessError::Process(ProcessError::NotFound { .. })));
        assert_eq!(driver.count(PROP_QUERY), 1);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_polling() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.on(PROP_QUERY, Reply::stdout("0"));

        let policy = ReadinessPolicy {
            poll_interval: Duration::from_secs(10),
            max_poll_interval: Duration::from_secs(10),
            ..fast_policy()
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = monitor(&driver)
            .wait_until_ready("emulator-5556", &policy, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ReadinessError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = fast_policy();
        let mut interval = policy.poll_interval;
        for _ in 0..10 {
            interval = policy.next_interval(interval);
        }
        assert_eq!(interval, Duration::from_millis(20));
    }
}
