//! APK installation

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adb::{AdbClient, AdbError};
use crate::device::DeviceState;
use crate::package::PackageSpec;
use crate::process::{ProcessDriver, ProcessError, ProcessOutput};

/// Default timeout for `adb install`
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(240);

static FAILURE_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(INSTALL_(?:PARSE_)?FAILED_[A-Z0-9_]+)").expect("valid install failure regex")
});

static FAILURE_BRACKET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Failure \[([^\]]+)\]").expect("valid install bracket regex"));

/// Options for `adb install`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    /// Replace an existing installation (`-r`)
    pub force: bool,
    /// Allow version code downgrade (`-d`)
    pub allow_downgrade: bool,
    /// Grant all runtime permissions (`-g`)
    pub grant_permissions: bool,
    pub timeout: Duration,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            force: true,
            allow_downgrade: false,
            grant_permissions: false,
            timeout: DEFAULT_INSTALL_TIMEOUT,
        }
    }
}

impl InstallOptions {
    pub fn flags(&self) -> Vec<&'static str> {
        let mut flags = Vec::new();
        if self.force {
            flags.push("-r");
        }
        if self.allow_downgrade {
            flags.push("-d");
        }
        if self.grant_permissions {
            flags.push("-g");
        }
        flags
    }
}

/// Why an installation failed
#[derive(Debug, thiserror::Error)]
pub enum InstallFailure {
    #[error("artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),
    #[error("device not ready: {0}")]
    DeviceNotReady(String),
    #[error("insufficient storage: {0}")]
    StorageExhausted(String),
    #[error("rejected by package manager ({code}): {detail}")]
    Rejected { code: String, detail: String },
    #[error(transparent)]
    Process(ProcessError),
}

/// Installation error
#[derive(Debug, thiserror::Error)]
#[error("failed to install {package}: {reason}")]
pub struct InstallError {
    pub package: String,
    #[source]
    pub reason: InstallFailure,
}

impl InstallError {
    fn new(package: &PackageSpec, reason: InstallFailure) -> Self {
        Self {
            package: package.id.clone(),
            reason,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(&self.reason, InstallFailure::Process(e) if e.is_cancelled())
    }
}

/// Successful installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub package: String,
    pub serial: String,
    pub path: PathBuf,
    pub elapsed: Duration,
}

/// Installs packages on a device
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(
        &self,
        serial: &str,
        package: &PackageSpec,
        options: &InstallOptions,
        cancel: &CancellationToken,
    ) -> Result<InstallReport, InstallError>;
}

/// Installer backed by `adb install`
pub struct AdbPackageInstaller<P: ProcessDriver> {
    adb: AdbClient<P>,
}

impl<P: ProcessDriver> AdbPackageInstaller<P> {
    pub fn new(adb: AdbClient<P>) -> Self {
        Self { adb }
    }

    pub fn from_driver(driver: Arc<P>, adb: impl Into<PathBuf>) -> Self {
        Self::new(AdbClient::new(driver, adb))
    }
}

fn adb_failure(err: AdbError) -> InstallFailure {
    match err {
        AdbError::Process(e) => InstallFailure::Process(e),
        other => InstallFailure::DeviceNotReady(other.to_string()),
    }
}

/// Interpret `adb install` output; `None` means success
pub fn parse_install_failure(output: &ProcessOutput) -> Option<InstallFailure> {
    let combined = output.combined();

    let code = FAILURE_CODE
        .captures(&combined)
        .or_else(|| FAILURE_BRACKET.captures(&combined))
        .map(|c| c[1].trim().to_string());

    if code.is_none() && output.success() {
        return None;
    }

    let detail = combined.trim().to_string();
    let lower = detail.to_ascii_lowercase();
    if lower.contains("insufficient_storage") || lower.contains("not enough space") {
        return Some(InstallFailure::StorageExhausted(detail));
    }

    Some(InstallFailure::Rejected {
        code: code.unwrap_or_else(|| format!("exit {}", output.exit_code)),
        detail,
    })
}

fn check_artifact(path: &Path) -> Result<(), InstallFailure> {
    if path.is_file() {
        Ok(())
    } else {
        Err(InstallFailure::ArtifactNotFound(path.to_path_buf()))
    }
}

#[async_trait]
impl<P: ProcessDriver> PackageInstaller for AdbPackageInstaller<P> {
    async fn install(
        &self,
        serial: &str,
        package: &PackageSpec,
        options: &InstallOptions,
        cancel: &CancellationToken,
    ) -> Result<InstallReport, InstallError> {
        let fail = |reason: InstallFailure| InstallError::new(package, reason);

        check_artifact(&package.path).map_err(fail)?;

        let state = self
            .adb
            .get_state(serial, cancel)
            .await
            .map_err(|e| fail(adb_failure(e)))?;
        if state != DeviceState::Online {
            return Err(fail(InstallFailure::DeviceNotReady(format!(
                "{} is {}",
                serial,
                state.as_str()
            ))));
        }

        info!("Installing {} on {}", package.path.display(), serial);
        let started = Instant::now();
        let output = self
            .adb
            .install(serial, &package.path, &options.flags(), options.timeout, cancel)
            .await
            .map_err(|e| fail(adb_failure(e)))?;

        if let Some(reason) = parse_install_failure(&output) {
            warn!("install of {} on {} failed: {}", package.id, serial, reason);
            return Err(fail(reason));
        }

        let elapsed = started.elapsed();
        debug!("{} installed on {} in {:?}", package.id, serial, elapsed);
        Ok(InstallReport {
            package: package.id.clone(),
            serial: serial.to_string(),
            path: package.path.clone(),
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Reply, ScriptedDriver};
    use tempfile::TempDir;

    fn output(exit_code: i32, stdout: &str, stderr: &str) -> ProcessOutput {
        ProcessOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    fn apk(dir: &TempDir) -> PackageSpec {
        let path = dir.path().join("test.apk");
        std::fs::write(&path, b"PK\x03\x04").unwrap();
        PackageSpec::new("apk-1", path)
    }

    #[test]
    fn test_parse_install_output() {
        let success = output(0, "Performing Streamed Install\nSuccess\n", "");
        assert!(parse_install_failure(&success).is_none());

        match parse_install_failure(&output(
            1,
            "",
            "adb: failed to install test.apk: \
             Failure [INSTALL_FAILED_OLDER_SDK: Requires newer sdk version #21]",
        )) {
            Some(InstallFailure::Rejected { code, .. }) => {
                assert_eq!(code, "INSTALL_FAILED_OLDER_SDK")
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Older adb versions exit 0 on failure
        assert!(matches!(
            parse_install_failure(&output(0, "Failure [INSTALL_FAILED_INSUFFICIENT_STORAGE]", "")),
            Some(InstallFailure::StorageExhausted(_))
        ));

        match parse_install_failure(&output(1, "", "Failure [not a valid apk]")) {
            Some(InstallFailure::Rejected { code, .. }) => assert_eq!(code, "not a valid apk"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_flags() {
        assert_eq!(InstallOptions::default().flags(), vec!["-r"]);
        let options = InstallOptions {
            force: false,
            grant_permissions: true,
            ..Default::default()
        };
        assert_eq!(options.flags(), vec!["-g"]);
    }

    #[tokio::test]
    async fn test_missing_artifact_never_reaches_device() {
        let driver = Arc::new(ScriptedDriver::new());
        let installer = AdbPackageInstaller::from_driver(Arc::clone(&driver), "adb");
        let package = PackageSpec::new("apk-1", "/nonexistent/test.apk");

        let options = InstallOptions::default();
        let err = installer
            .install("emulator-5556", &package, &options, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.package, "apk-1");
        assert!(matches!(err.reason, InstallFailure::ArtifactNotFound(_)));
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_offline_device_is_not_ready() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(ScriptedDriver::new());
        driver.on("get-state", Reply::failure(1, "error: device offline"));
        let installer = AdbPackageInstaller::from_driver(Arc::clone(&driver), "adb");

        let options = InstallOptions::default();
        let err = installer
            .install("emulator-5556", &apk(&dir), &options, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.reason, InstallFailure::DeviceNotReady(_)));
        assert_eq!(driver.count(" install "), 0);
    }

    #[tokio::test]
    async fn test_install_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(ScriptedDriver::new());
        driver.on("get-state", Reply::stdout("device\n"));
        driver.on(" install ", Reply::stdout("Performing Streamed Install\nSuccess\n"));
        let installer = AdbPackageInstaller::from_driver(Arc::clone(&driver), "adb");
        let package = apk(&dir);

        let cancel = CancellationToken::new();
        let first = installer
            .install("emulator-5556", &package, &InstallOptions::default(), &cancel)
            .await
            .unwrap();
        installer
            .install("emulator-5556", &package, &InstallOptions::default(), &cancel)
            .await
            .unwrap();

        assert_eq!(first.serial, "emulator-5556");
        assert_eq!(driver.count(" install "), 2);
        let request = driver.last_request(" install ").unwrap();
        assert!(request.args.contains(&"-r".to_string()));
    }
}
