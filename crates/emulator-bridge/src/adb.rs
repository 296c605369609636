//! ADB (Android Debug Bridge) Client
//!
//! Communicates with devices via ADB. All invocations go through a
//! [`ProcessDriver`], so every call is bounded by a timeout and cancellable.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::device::{parse_device_list, Device, DeviceState};
use crate::process::{
    CommandRequest, ProcessDriver, ProcessError, ProcessOutput, DEFAULT_COMMAND_TIMEOUT,
};

/// Property set to `1` once the device has finished booting
pub const BOOT_COMPLETED_PROP: &str = "sys.boot_completed";

/// ADB errors
#[derive(Debug, thiserror::Error)]
pub enum AdbError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device offline: {0}")]
    DeviceOffline(String),
    #[error("device unauthorized: {0}")]
    Unauthorized(String),
    #[error("adb server unavailable: {0}")]
    ServerUnavailable(String),
    #[error("adb command failed with exit {code}: {detail}")]
    CommandFailed { code: i32, detail: String },
}

impl AdbError {
    /// The call was cancelled by the caller
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AdbError::Process(e) if e.is_cancelled())
    }
}

/// Map adb's own transport complaints on stderr to typed errors
fn classify_transport(output: &ProcessOutput) -> Option<AdbError> {
    for line in output.stderr.lines() {
        let lower = line.trim().to_ascii_lowercase();
        if !(lower.starts_with("error:") || lower.starts_with("adb:")) {
            continue;
        }
        let detail = line.trim().to_string();
        if lower.contains("device offline") {
            return Some(AdbError::DeviceOffline(detail));
        }
        if lower.contains("unauthorized") {
            return Some(AdbError::Unauthorized(detail));
        }
        if lower.contains("no devices")
            || (lower.contains("device") && lower.contains("not found"))
        {
            return Some(AdbError::DeviceNotFound(detail));
        }
        if lower.contains("cannot connect to daemon") || lower.contains("server version") {
            return Some(AdbError::ServerUnavailable(detail));
        }
    }
    None
}

/// ADB Client
pub struct AdbClient<P: ProcessDriver> {
    driver: Arc<P>,
    adb: PathBuf,
    timeout: Duration,
}

impl<P: ProcessDriver> Clone for AdbClient<P> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            adb: self.adb.clone(),
            timeout: self.timeout,
        }
    }
}

impl<P: ProcessDriver> AdbClient<P> {
    /// Create a new ADB client
    pub fn new(driver: Arc<P>, adb: impl Into<PathBuf>) -> Self {
        Self {
            driver,
            adb: adb.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Default timeout for short commands
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn adb_path(&self) -> &Path {
        &self.adb
    }

    /// Run an ADB command; a non-zero exit is an error
    async fn run(
        &self,
        args: &[&str],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, AdbError> {
        let output = self.exec(args, timeout, cancel).await?;
        if !output.success() {
            return Err(AdbError::CommandFailed {
                code: output.exit_code,
                detail: output.combined(),
            });
        }
        Ok(output)
    }

    /// Run an ADB command, returning the output of non-zero exits that are
    /// not transport errors
    async fn exec(
        &self,
        args: &[&str],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, AdbError> {
        debug!("adb {:?}", args);
        let request = CommandRequest::new(&self.adb).args(args.iter().copied()).timeout(timeout);
        let output = self.driver.run(&request, cancel).await?;
        match classify_transport(&output) {
            Some(err) => Err(err),
            None => Ok(output),
        }
    }

    /// List connected devices
    pub async fn list_devices(&self, cancel: &CancellationToken) -> Result<Vec<Device>, AdbError> {
        let output = self.run(&["devices", "-l"], self.timeout, cancel).await?;
        Ok(parse_device_list(&output.stdout))
    }

    /// Connection state of a device
    pub async fn get_state(
        &self,
        serial: &str,
        cancel: &CancellationToken,
    ) -> Result<DeviceState, AdbError> {
        let output = self.run(&["-s", serial, "get-state"], self.timeout, cancel).await?;
        Ok(DeviceState::from_adb(&output.stdout))
    }

    /// Get device property
    pub async fn get_prop(
        &self,
        serial: &str,
        prop: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, AdbError> {
        let output = self
            .run(&["-s", serial, "shell", "getprop", prop], timeout, cancel)
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    /// Run a shell command on the device; the remote exit code is kept in the output
    pub async fn shell(
        &self,
        serial: &str,
        args: &[&str],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, AdbError> {
        let mut full_args = vec!["-s", serial, "shell"];
        full_args.extend_from_slice(args);
        self.exec(&full_args, timeout, cancel).await
    }

    /// Install an APK; the output is returned for the caller to interpret
    pub async fn install(
        &self,
        serial: &str,
        apk_path: &Path,
        flags: &[&str],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, AdbError> {
        let path_str = apk_path.to_string_lossy();
        let mut args = vec!["-s", serial, "install"];
        args.extend_from_slice(flags);
        args.push(&path_str);
        self.exec(&args, timeout, cancel).await
    }

    /// Path of an installed package's APK, or `None` if it is not installed
    pub async fn package_path(
        &self,
        serial: &str,
        package: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, AdbError> {
        let output = self
            .shell(serial, &["pm", "path", package], self.timeout, cancel)
            .await?;
        Ok(output
            .stdout
            .lines()
            .find_map(|l| l.trim().strip_prefix("package:"))
            .map(str::to_string))
    }

    /// Start an activity and wait for the launch to complete
    pub async fn start_activity(
        &self,
        serial: &str,
        component: &str,
        stop_existing: bool,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, AdbError> {
        let mut args = vec!["am", "start", "-W"];
        if stop_existing {
            args.push("-S");
        }
        args.extend_from_slice(&["-n", component]);
        self.shell(serial, &args, self.timeout, cancel).await
    }

    /// Component of the activity currently in the foreground
    pub async fn resumed_activity(
        &self,
        serial: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, AdbError> {
        let output = self
            .shell(serial, &["dumpsys", "activity", "activities"], self.timeout, cancel)
            .await?;
        Ok(parse_resumed_component(&output.stdout))
    }

    /// Process id of a running package, if the device reports one
    pub async fn pid_of(
        &self,
        serial: &str,
        package: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<u32>, AdbError> {
        let output = self
            .shell(serial, &["pidof", package], self.timeout, cancel)
            .await?;
        Ok(output
            .stdout
            .split_whitespace()
            .next()
            .and_then(|pid| pid.parse().ok()))
    }

    /// Ask the emulator to shut itself down via its console
    pub async fn emu_kill(&self, serial: &str, cancel: &CancellationToken) -> Result<(), AdbError> {
        self.run(&["-s", serial, "emu", "kill"], self.timeout, cancel).await?;
        Ok(())
    }
}

/// Extract the resumed activity component from `dumpsys activity activities`
pub fn parse_resumed_component(dumpsys: &str) -> Option<String> {
    const MARKERS: [&str; 3] = ["mResumedActivity", "topResumedActivity", "mFocusedActivity"];

    for marker in MARKERS {
        for line in dumpsys.lines().filter(|l| l.contains(marker)) {
            let component = line
                .split_whitespace()
                .find(|token| token.contains('/'))
                .map(|token| token.trim_end_matches('}').to_string());
            if component.is_some() {
                return component;
            }
        }
    }
    None
}

/// Package part of a `package/activity` component
pub fn component_package(component: &str) -> &str {
    component.split('/').next().unwrap_or(component)
}
