//! Emulator Launcher
//!
//! Launches Android emulator instances. Booting only spawns the process;
//! waiting for the guest OS is the readiness monitor's job.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::avd::AvdConfig;
use crate::ports::emulator_serial;
use crate::process::{CommandRequest, ManagedProcess, ProcessDriver, ProcessError};

/// Emulator launch options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorOptions {
    /// Console port; allocated from the port pool when absent
    pub port: Option<u16>,
    /// Disable audio
    pub no_audio: bool,
    /// Run without a window
    pub no_window: bool,
    /// Disable boot animation
    pub no_boot_anim: bool,
    /// GPU mode (auto, host, swiftshader_indirect, etc.)
    pub gpu: Option<String>,
    /// Memory size in MB
    pub memory: Option<u32>,
    /// Number of cores
    pub cores: Option<u32>,
    /// Wipe data on launch
    pub wipe_data: bool,
    /// Skip the quick-boot snapshot
    pub cold_boot: bool,
    /// Additional arguments
    pub extra_args: Vec<String>,
}

impl EmulatorOptions {
    /// Options for headless/CI environments
    pub fn headless() -> Self {
        Self {
            gpu: Some("swiftshader_indirect".to_string()),
            no_audio: true,
            no_window: true,
            no_boot_anim: true,
            ..Default::default()
        }
    }

    /// Convert to command line arguments (the port is added by the launcher)
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.no_audio {
            args.push("-no-audio".to_string());
        }

        if self.no_window {
            args.push("-no-window".to_string());
        }

        if self.no_boot_anim {
            args.push("-no-boot-anim".to_string());
        }

        if let Some(ref gpu) = self.gpu {
            args.push("-gpu".to_string());
            args.push(gpu.clone());
        }

        if let Some(memory) = self.memory {
            args.push("-memory".to_string());
            args.push(memory.to_string());
        }

        if let Some(cores) = self.cores {
            args.push("-cores".to_string());
            args.push(cores.to_string());
        }

        if self.wipe_data {
            args.push("-wipe-data".to_string());
        }

        if self.cold_boot {
            args.push("-no-snapshot-load".to_string());
        }

        args.extend(self.extra_args.iter().cloned());

        args
    }
}

/// Everything needed to provision one emulator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmulatorSpec {
    /// Identifier used to reference this emulator
    pub id: String,
    /// AVD creation parameters
    pub create: AvdConfig,
    /// Launch parameters
    #[serde(default)]
    pub start: EmulatorOptions,
}

impl EmulatorSpec {
    pub fn new(id: &str, create: AvdConfig, start: EmulatorOptions) -> Self {
        Self {
            id: id.to_string(),
            create,
            start,
        }
    }
}

/// Running emulator instance
#[derive(Debug)]
pub struct EmulatorInstance {
    pub avd_name: String,
    pub port: u16,
    process: ManagedProcess,
}

impl EmulatorInstance {
    /// Get the serial for ADB
    pub fn serial(&self) -> String {
        emulator_serial(self.port)
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Check if the emulator process is still running
    pub fn is_running(&mut self) -> bool {
        self.process.is_running()
    }

    /// Wait for the emulator process to exit
    pub async fn wait(&mut self) -> Result<Option<i32>, ProcessError> {
        self.process.wait().await
    }

    /// Kill the emulator and reap its process
    pub async fn kill(&mut self) -> Result<(), ProcessError> {
        self.process.kill().await?;
        info!("Killed emulator: {} ({})", self.avd_name, self.serial());
        Ok(())
    }

    /// Recent emulator output lines
    pub fn output_tail(&self) -> Vec<String> {
        self.process.output_tail()
    }

    /// Error for an emulator that exited on its own
    pub fn exited_error(&self, code: Option<i32>) -> ProcessError {
        self.process.exited_error(code)
    }

    /// Stop supervising; the emulator keeps running
    pub fn detach(self) -> Option<u32> {
        self.process.detach()
    }
}

/// Emulator launcher
pub struct EmulatorLauncher<P: ProcessDriver> {
    driver: Arc<P>,
    emulator: PathBuf,
}

impl<P: ProcessDriver> EmulatorLauncher<P> {
    /// Create a new emulator launcher
    pub fn new(driver: Arc<P>, emulator: impl Into<PathBuf>) -> Self {
        Self {
            driver,
            emulator: emulator.into(),
        }
    }

    /// Full argument list for booting `avd_name` on `port`
    pub fn boot_args(avd_name: &str, port: u16, options: &EmulatorOptions) -> Vec<String> {
        let mut args = vec![
            "-avd".to_string(),
            avd_name.to_string(),
            "-port".to_string(),
            port.to_string(),
        ];
        args.extend(options.to_args());
        args
    }

    /// Spawn the emulator; returns as soon as the process is running
    pub fn boot(
        &self,
        avd_name: &str,
        port: u16,
        options: &EmulatorOptions,
    ) -> Result<EmulatorInstance, ProcessError> {
        info!("Launching emulator {} on port {}", avd_name, port);

        let request =
            CommandRequest::new(&self.emulator).args(Self::boot_args(avd_name, port, options));
        let process = self.driver.spawn(&request)?;

        Ok(EmulatorInstance {
            avd_name: avd_name.to_string(),
            port,
            process,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SystemProcessDriver;

    #[test]
    fn test_options_to_args() {
        let options = EmulatorOptions {
            no_audio: true,
            cold_boot: true,
            memory: Some(2048),
            extra_args: vec!["-verbose".into()],
            ..Default::default()
        };
        assert_eq!(
            options.to_args(),
            vec!["-no-audio", "-memory", "2048", "-no-snapshot-load", "-verbose"]
        );
    }

    #[test]
    fn test_boot_args_include_port() {
        let options = EmulatorOptions {
            port: Some(5556),
            no_audio: true,
            ..Default::default()
        };
        assert_eq!(
            EmulatorLauncher::<SystemProcessDriver>::boot_args("testAVD", 5556, &options),
            vec!["-avd", "testAVD", "-port", "5556", "-no-audio"]
        );
    }

    #[test]
    fn test_headless_options() {
        let args = EmulatorOptions::headless().to_args();
        assert!(args.contains(&"-no-window".to_string()));
        assert!(args.contains(&"swiftshader_indirect".to_string()));
    }

    #[test]
    fn test_spec_from_toml_defaults() {
        let spec: EmulatorSpec = toml::from_str(
            r#"
            id = "emulator-1"
            [create]
            name = "testAVD"
            force = true
            target = "android-18"
            abi = "armeabi-v7a"
            "#,
        )
        .unwrap();
        assert_eq!(spec.create.tag, "default");
        assert_eq!(spec.start, EmulatorOptions::default());
    }
}
