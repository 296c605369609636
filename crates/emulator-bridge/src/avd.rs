//! AVD (Android Virtual Device) Manager
//!
//! Creates and lists Android Virtual Devices.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::process::{CommandRequest, ProcessDriver, ProcessError};

/// Default timeout for `avdmanager create avd`
pub const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(120);

/// AVD Manager errors
#[derive(Debug, thiserror::Error)]
pub enum AvdError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("Failed to create AVD {name}: {detail}")]
    CreateFailed { name: String, detail: String },
}

/// AVD creation parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvdConfig {
    /// AVD name
    pub name: String,
    /// Overwrite an existing AVD with the same name
    pub force: bool,
    /// Target platform, e.g. `android-18`
    pub target: String,
    /// CPU ABI, e.g. `armeabi-v7a`
    pub abi: String,
    /// System image tag, e.g. `default` or `google_apis`
    pub tag: String,
    /// Full system image package; overrides target/tag/abi
    pub package: Option<String>,
    /// Device profile, e.g. `pixel_4`
    pub device: Option<String>,
    /// SD card size, e.g. `512M`
    pub sdcard: Option<String>,
}

impl Default for AvdConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            force: false,
            target: String::new(),
            abi: "x86_64".to_string(),
            tag: "default".to_string(),
            package: None,
            device: None,
            sdcard: None,
        }
    }
}

impl AvdConfig {
    /// Create a new AVD config with defaults
    pub fn new(name: &str, target: &str, abi: &str) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            abi: abi.to_string(),
            ..Default::default()
        }
    }

    /// System image package string for avdmanager
    pub fn system_image(&self) -> String {
        match self.package {
            Some(ref package) => package.clone(),
            None => format!("system-images;{};{};{}", self.target, self.tag, self.abi),
        }
    }

    /// API level parsed from the target, e.g. 18 for `android-18`
    pub fn api_level(&self) -> Option<u32> {
        self.target.strip_prefix("android-")?.parse().ok()
    }

    /// Arguments for `avdmanager`
    pub fn create_args(&self) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "avd".to_string(),
            "-n".to_string(),
            self.name.clone(),
            "-k".to_string(),
            self.system_image(),
        ];

        if let Some(ref device) = self.device {
            args.push("-d".to_string());
            args.push(device.clone());
        }

        if let Some(ref sdcard) = self.sdcard {
            args.push("-c".to_string());
            args.push(sdcard.clone());
        }

        if self.force {
            args.push("--force".to_string());
        }

        args
    }
}

/// Result of [`AvdManager::create_avd`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvdOutcome {
    /// A new AVD was written
    Created,
    /// An AVD with this name already existed and `force` was not set
    Reused,
}

/// AVD Manager
pub struct AvdManager<P: ProcessDriver> {
    driver: Arc<P>,
    avdmanager: PathBuf,
    emulator: PathBuf,
    timeout: Duration,
}

impl<P: ProcessDriver> AvdManager<P> {
    /// Create a new AVD manager
    pub fn new(
        driver: Arc<P>,
        avdmanager: impl Into<PathBuf>,
        emulator: impl Into<PathBuf>,
    ) -> Self {
        Self {
            driver,
            avdmanager: avdmanager.into(),
            emulator: emulator.into(),
            timeout: DEFAULT_CREATE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// List the names of all AVDs known to the emulator
    pub async fn list_avds(&self, cancel: &CancellationToken) -> Result<Vec<String>, AvdError> {
        let request = CommandRequest::new(&self.emulator).arg("-list-avds");
        let output = self.driver.run(&request, cancel).await?;

        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            // The emulator prints INFO/WARNING lines on some hosts
            .filter(|l| !l.is_empty() && !l.contains(' '))
            .map(String::from)
            .collect())
    }

    /// Create a new AVD.
    ///
    /// Without `force`, an existing AVD of the same name is reused as is.
    pub async fn create_avd(
        &self,
        config: &AvdConfig,
        cancel: &CancellationToken,
    ) -> Result<AvdOutcome, AvdError> {
        if !config.force {
            match self.list_avds(cancel).await {
                Ok(avds) if avds.iter().any(|a| a == &config.name) => {
                    info!("AVD {} already exists, reusing it", config.name);
                    return Ok(AvdOutcome::Reused);
                }
                Ok(_) => {}
                Err(AvdError::Process(e)) if e.is_cancelled() => return Err(e.into()),
                Err(e) => debug!("could not list AVDs, creating anyway: {}", e),
            }
        }

        info!("Creating AVD: {} ({})", config.name, config.system_image());

        // Answer "no" to the custom hardware profile question
        let request = CommandRequest::new(&self.avdmanager)
            .args(config.create_args())
            .stdin("no\n")
            .timeout(self.timeout);

        let output = self.driver.run(&request, cancel).await?;

        if !output.success() {
            return Err(AvdError::CreateFailed {
                name: config.name.clone(),
                detail: output.combined(),
            });
        }

        info!("AVD created successfully: {}", config.name);
        Ok(AvdOutcome::Created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Reply, ScriptedDriver};

    fn manager(driver: &Arc<ScriptedDriver>) -> AvdManager<ScriptedDriver> {
        AvdManager::new(Arc::clone(driver), "avdmanager", "emulator")
    }

    #[test]
    fn test_create_args() {
        let mut config = AvdConfig::new("testAVD", "android-18", "armeabi-v7a");
        config.force = true;
        assert_eq!(config.system_image(), "system-images;android-18;default;armeabi-v7a");
        assert_eq!(config.api_level(), Some(18));
        assert_eq!(
            config.create_args(),
            vec![
                "create",
                "avd",
                "-n",
                "testAVD",
                "-k",
                "system-images;android-18;default;armeabi-v7a",
                "--force"
            ]
        );
    }

    #[test]
    fn test_explicit_package_overrides() {
        let mut config = AvdConfig::new("pixel", "android-34", "x86_64");
        config.package = Some("system-images;android-34;google_apis;x86_64".into());
        assert_eq!(config.system_image(), "system-images;android-34;google_apis;x86_64");
    }

    #[tokio::test]
    async fn test_create_answers_hardware_prompt() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.on("emulator -list-avds", Reply::stdout(""));
        driver.on(
            "avdmanager create avd",
            Reply::stdout("Do you wish to create a custom hardware profile? [no]"),
        );

        let config = AvdConfig::new("testAVD", "android-18", "armeabi-v7a");
        let outcome = manager(&driver)
            .create_avd(&config, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, AvdOutcome::Created);

        let request = driver.last_request("avdmanager create avd").unwrap();
        assert_eq!(request.stdin.as_deref(), Some("no\n"));
    }

    #[tokio::test]
    async fn test_existing_avd_reused_without_force() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.on("emulator -list-avds", Reply::stdout("other\ntestAVD\n"));

        let config = AvdConfig::new("testAVD", "android-18", "armeabi-v7a");
        let outcome = manager(&driver)
            .create_avd(&config, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, AvdOutcome::Reused);
        assert_eq!(driver.count("avdmanager create"), 0);
    }

    #[tokio::test]
    async fn test_create_failure_reports_output() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.on(
            "avdmanager create avd",
            Reply::failure(
                1,
                "Error: Package path is not valid. Valid system image paths are: null",
            ),
        );

        let mut config = AvdConfig::new("testAVD", "android-99", "armeabi-v7a");
        config.force = true;
        let err = manager(&driver)
            .create_avd(&config, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            AvdError::CreateFailed { name, detail } => {
                assert_eq!(name, "testAVD");
                assert!(detail.contains("Package path is not valid"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
