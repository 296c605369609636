//! Activity launching
//!
//! Starts an activity with `am start` and then confirms that the target
//! package actually reached the foreground. `am start` reports success for
//! activities that crash straight after `onCreate`, so its exit status alone
//! is not trusted.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::adb::{component_package, AdbClient, AdbError};
use crate::package::ActivitySpec;
use crate::process::{ProcessDriver, ProcessError, ProcessOutput};

/// Options for launching an activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    /// How long to wait for the package to reach the foreground
    pub verify_timeout: Duration,
    /// Delay between foreground checks
    pub poll_interval: Duration,
    /// Force-stop the package before starting it (`am start -S`)
    pub stop_existing: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            verify_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(500),
            stop_existing: false,
        }
    }
}

/// Why a launch failed
#[derive(Debug, thiserror::Error)]
pub enum LaunchFailure {
    #[error("package {0} is not installed")]
    PackageNotInstalled(String),
    #[error("activity {0} does not exist")]
    ActivityNotFound(String),
    #[error("activity manager refused the launch: {0}")]
    Rejected(String),
    #[error(
        "activity did not reach the foreground (foreground: {})",
        .observed.as_deref().unwrap_or("none")
    )]
    NotInForeground { observed: Option<String> },
    #[error("device not reachable: {0}")]
    DeviceNotReady(String),
    #[error(transparent)]
    Process(ProcessError),
}

/// Launch error
#[derive(Debug, thiserror::Error)]
#[error("failed to launch {component}: {reason}")]
pub struct LaunchError {
    pub activity: String,
    pub component: String,
    #[source]
    pub reason: LaunchFailure,
}

impl LaunchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(&self.reason, LaunchFailure::Process(e) if e.is_cancelled())
    }
}

/// A confirmed launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    pub activity: String,
    pub component: String,
    /// Foreground component observed on the device
    pub resumed: String,
    pub pid: Option<u32>,
    pub elapsed: Duration,
}

/// Launches activities on a device
#[async_trait]
pub trait ActivityLauncher: Send + Sync {
    async fn launch(
        &self,
        serial: &str,
        activity: &ActivitySpec,
        options: &LaunchOptions,
        cancel: &CancellationToken,
    ) -> Result<Launched, LaunchError>;
}

/// Launcher backed by `am start` over adb
pub struct AdbActivityLauncher<P: ProcessDriver> {
    adb: AdbClient<P>,
}

impl<P: ProcessDriver> AdbActivityLauncher<P> {
    pub fn new(adb: AdbClient<P>) -> Self {
        Self { adb }
    }

    /// Poll the foreground activity until it belongs to `package`
    async fn await_foreground(
        &self,
        serial: &str,
        package: &str,
        options: &LaunchOptions,
        cancel: &CancellationToken,
    ) -> Result<String, LaunchFailure> {
        // No deadline when the timeout does not fit in an Instant
        let deadline = Instant::now().checked_add(options.verify_timeout);
        let mut observed = None;

        loop {
            match self.adb.resumed_activity(serial, cancel).await {
                Ok(Some(component)) if component_package(&component) == package => {
                    return Ok(component);
                }
                Ok(current) => {
                    trace!("{} foreground: {:?}", serial, current);
                    observed = current;
                }
                Err(err) if err.is_cancelled() => return Err(adb_failure(err)),
                Err(err) => debug!("foreground check on {} failed: {}", serial, err),
            }

            let now = Instant::now();
            let pause = match deadline {
                Some(deadline) if now >= deadline => {
                    return Err(LaunchFailure::NotInForeground { observed });
                }
                Some(deadline) => options.poll_interval.min(deadline - now),
                None => options.poll_interval,
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cancel.cancelled() => {
                    return Err(LaunchFailure::Process(ProcessError::Cancelled {
                        program: self.adb.adb_path().to_path_buf(),
                    }));
                }
            }
        }
    }
}

fn adb_failure(err: AdbError) -> LaunchFailure {
    match err {
        AdbError::Process(e) => LaunchFailure::Process(e),
        other => LaunchFailure::DeviceNotReady(other.to_string()),
    }
}

/// Interpret `am start` output; `None` means the intent was delivered
pub fn parse_start_failure(component: &str, output: &ProcessOutput) -> Option<LaunchFailure> {
    let combined = output.combined();

    if combined.contains("Error type 3") || combined.contains("does not exist") {
        return Some(LaunchFailure::ActivityNotFound(component.to_string()));
    }

    let complaint = combined.lines().map(str::trim).find(|line| {
        line.starts_with("Error:")
            || line.contains("Exception")
            || line.starts_with("Permission Denial")
            || line.starts_with("Warning: Activity not started")
    });
    if let Some(line) = complaint {
        // An already running instance is brought to the front, which is fine
        if line.contains("current task has been brought to the front") {
            return None;
        }
        return Some(LaunchFailure::Rejected(line.to_string()));
    }

    if !output.success() {
        return Some(LaunchFailure::Rejected(combined.trim().to_string()));
    }
    None
}

#[async_trait]
impl<P: ProcessDriver> ActivityLauncher for AdbActivityLauncher<P> {
    async fn launch(
        &self,
        serial: &str,
        activity: &ActivitySpec,
        options: &LaunchOptions,
        cancel: &CancellationToken,
    ) -> Result<Launched, LaunchError> {
        let component = activity.component();
        let fail = |reason: LaunchFailure| LaunchError {
            activity: activity.id.clone(),
            component: component.clone(),
            reason,
        };
        let package = activity.package_name.as_str();

        let installed = self
            .adb
            .package_path(serial, package, cancel)
            .await
            .map_err(|e| fail(adb_failure(e)))?;
        if installed.is_none() {
            return Err(fail(LaunchFailure::PackageNotInstalled(package.to_string())));
        }

        info!("Launching {} on {}", component, serial);
        let started = Instant::now();
        let output = self
            .adb
            .start_activity(serial, &component, options.stop_existing, cancel)
            .await
            .map_err(|e| fail(adb_failure(e)))?;
        if let Some(reason) = parse_start_failure(&component, &output) {
            warn!("am start {} on {} failed: {}", component, serial, reason);
            return Err(fail(reason));
        }

        let resumed = self
            .await_foreground(serial, package, options, cancel)
            .await
            .map_err(fail)?;

        let pid = match self.adb.pid_of(serial, package, cancel).await {
            Ok(pid) => pid,
            Err(err) => {
                debug!("pidof {} on {} failed: {}", package, serial, err);
                None
            }
        };

        let elapsed = started.elapsed();
        info!("{} in foreground on {} (pid {:?})", resumed, serial, pid);
        Ok(Launched {
            activity: activity.id.clone(),
            component,
            resumed,
            pid,
            elapsed,
        })
    }
}
