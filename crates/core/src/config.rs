//! Pilot Configuration
//!
//! Declarative description of what to run:
//! - emulators to create and boot
//! - APKs to install, with the activities they declare
//! - which (emulator, APK, activity) triples to launch
//! - SDK location and timeouts
//!
//! TOML by default; files ending in `.json` are read as JSON.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use avd_pilot_emulator_bridge::package::is_valid_package_name;
use avd_pilot_emulator_bridge::ports::{is_console_port, PortError};
use avd_pilot_emulator_bridge::{
    ActivitySpec, EmulatorSpec, InstallOptions, LaunchOptions, PackageSpec, ReadinessPolicy,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::orchestrator::OrchestratorSettings;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no emulators configured")]
    NoEmulators,

    #[error("duplicate {kind} id '{id}'")]
    DuplicateId { kind: &'static str, id: String },

    #[error("{kind} '{id}': {field} must not be empty")]
    EmptyField {
        kind: &'static str,
        id: String,
        field: &'static str,
    },

    #[error("emulator '{emulator}': {source}")]
    Port {
        emulator: String,
        #[source]
        source: PortError,
    },

    #[error("activity '{activity}': invalid package name '{name}'")]
    InvalidPackageName { activity: String, name: String },

    #[error("unknown {kind} '{id}'")]
    UnknownReference { kind: &'static str, id: String },

    #[error("invalid timeouts: {0}")]
    Timeouts(String),

    #[error("{0}")]
    Selection(String),
}

/// Android SDK settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    /// SDK root; detected from the environment when absent
    pub path: Option<PathBuf>,
}

/// Timeouts and polling parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Short adb commands
    pub command_secs: u64,
    /// `avdmanager create avd`
    pub create_secs: u64,
    /// Total time allowed for the guest to boot
    pub boot_max_wait_secs: u64,
    pub poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    pub backoff_factor: f64,
    /// A single boot-status query
    pub query_timeout_secs: u64,
    /// Failed boot-status queries tolerated after first contact
    pub max_rejections: u32,
    /// `adb install`
    pub install_secs: u64,
    /// Time for a launched activity to reach the foreground
    pub launch_verify_secs: u64,
    pub launch_poll_interval_ms: u64,
    /// Time between `adb emu kill` and killing the process
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_secs: 30,
            create_secs: 120,
            boot_max_wait_secs: 300,
            poll_interval_ms: 1000,
            max_poll_interval_ms: 5000,
            backoff_factor: 1.5,
            query_timeout_secs: 10,
            max_rejections: 5,
            install_secs: 240,
            launch_verify_secs: 15,
            launch_poll_interval_ms: 500,
            shutdown_grace_secs: 10,
        }
    }
}

/// Largest accepted growth factor between boot-status queries
pub const MAX_BACKOFF_FACTOR: f64 = 10.0;

impl TimeoutConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(1.0..=MAX_BACKOFF_FACTOR).contains(&self.backoff_factor) {
            return Err(ConfigError::Timeouts(format!(
                "backoff_factor must be between 1.0 and {}, got {}",
                MAX_BACKOFF_FACTOR, self.backoff_factor
            )));
        }
        if self.poll_interval_ms == 0 || self.launch_poll_interval_ms == 0 {
            return Err(ConfigError::Timeouts("poll intervals must be positive".into()));
        }
        if self.max_poll_interval_ms < self.poll_interval_ms {
            return Err(ConfigError::Timeouts(
                "max_poll_interval_ms must not be below poll_interval_ms".into(),
            ));
        }
        if self.command_secs == 0 || self.install_secs == 0 || self.query_timeout_secs == 0 {
            return Err(ConfigError::Timeouts("command timeouts must be positive".into()));
        }
        Ok(())
    }
}

/// An APK and the activities it declares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApkConfig {
    pub id: String,
    pub path: PathBuf,
    /// Reinstall over an existing installation
    #[serde(default = "default_true")]
    pub force: bool,
    #[serde(default)]
    pub allow_downgrade: bool,
    #[serde(default)]
    pub grant_permissions: bool,
    #[serde(default)]
    pub activities: Vec<ActivitySpec>,
}

fn default_true() -> bool {
    true
}

impl ApkConfig {
    pub fn package(&self) -> PackageSpec {
        PackageSpec::new(&self.id, self.path.clone())
    }

    pub fn activity(&self, id: &str) -> Option<&ActivitySpec> {
        self.activities.iter().find(|a| a.id == id)
    }
}

/// One (emulator, APK, activity) triple to launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchTarget {
    pub emulator: String,
    pub apk: String,
    pub activity: String,
}

/// A launch target with every reference resolved
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    pub emulator: EmulatorSpec,
    pub package: PackageSpec,
    pub activity: ActivitySpec,
    pub install: InstallOptions,
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
    pub sdk: SdkConfig,
    pub timeouts: TimeoutConfig,
    pub emulators: Vec<EmulatorSpec>,
    pub apks: Vec<ApkConfig>,
    pub launch: Vec<LaunchTarget>,
}

impl PilotConfig {
    /// Load, resolve relative paths against the file's directory, and validate
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading config from {:?}", path);
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let mut config = if is_json {
            Self::from_json_str(&contents)?
        } else {
            Self::from_toml_str(&contents)?
        };

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(contents)?)
    }

    /// Make relative APK and SDK paths relative to `base`
    pub fn resolve_paths(&mut self, base: &Path) {
        for apk in &mut self.apks {
            if apk.path.is_relative() {
                apk.path = base.join(&apk.path);
            }
        }
        if let Some(ref mut sdk) = self.sdk.path {
            if sdk.is_relative() {
                *sdk = base.join(&*sdk);
            }
        }
    }

    /// Check ids, names, ports, references and timeouts
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.emulators.is_empty() {
            return Err(ConfigError::NoEmulators);
        }

        let mut emulator_ids = HashSet::new();
        let mut ports = HashSet::new();
        for emulator in &self.emulators {
            validate_emulator(emulator)?;
            if !emulator_ids.insert(emulator.id.as_str()) {
                return Err(ConfigError::DuplicateId {
                    kind: "emulator",
                    id: emulator.id.clone(),
                });
            }
            if let Some(port) = emulator.start.port {
                if !ports.insert(port) {
                    return Err(ConfigError::Port {
                        emulator: emulator.id.clone(),
                        source: PortError::InUse(port),
                    });
                }
            }
        }

        let mut apk_ids = HashSet::new();
        for apk in &self.apks {
            if apk.id.trim().is_empty() {
                return Err(empty("apk", &apk.id, "id"));
            }
            if !apk_ids.insert(apk.id.as_str()) {
                return Err(ConfigError::DuplicateId {
                    kind: "apk",
                    id: apk.id.clone(),
                });
            }
            if apk.path.as_os_str().is_empty() {
                return Err(empty("apk", &apk.id, "path"));
            }

            let mut activity_ids = HashSet::new();
            for activity in &apk.activities {
                if activity.id.trim().is_empty() {
                    return Err(empty("activity", &activity.id, "id"));
                }
                if !activity_ids.insert(activity.id.as_str()) {
                    return Err(ConfigError::DuplicateId {
                        kind: "activity",
                        id: format!("{}/{}", apk.id, activity.id),
                    });
                }
                if activity.name.trim().is_empty() {
                    return Err(empty("activity", &activity.id, "name"));
                }
                if !is_valid_package_name(&activity.package_name) {
                    return Err(ConfigError::InvalidPackageName {
                        activity: activity.id.clone(),
                        name: activity.package_name.clone(),
                    });
                }
            }
        }

        for target in &self.launch {
            self.resolve(target)?;
        }

        self.timeouts.validate()
    }

    /// Orchestrator settings derived from `[timeouts]`
    pub fn settings(&self) -> OrchestratorSettings {
        let t = &self.timeouts;
        OrchestratorSettings {
            command_timeout: Duration::from_secs(t.command_secs),
            create_timeout: Duration::from_secs(t.create_secs),
            readiness: ReadinessPolicy {
                poll_interval: Duration::from_millis(t.poll_interval_ms),
                max_poll_interval: Duration::from_millis(t.max_poll_interval_ms),
                backoff_factor: t.backoff_factor,
                max_wait: Duration::from_secs(t.boot_max_wait_secs),
                query_timeout: Duration::from_secs(t.query_timeout_secs),
                max_rejections: t.max_rejections,
            },
            install: InstallOptions {
                timeout: Duration::from_secs(t.install_secs),
                ..InstallOptions::default()
            },
            launch: LaunchOptions {
                verify_timeout: Duration::from_secs(t.launch_verify_secs),
                poll_interval: Duration::from_millis(t.launch_poll_interval_ms),
                stop_existing: false,
            },
            shutdown_grace: Duration::from_secs(t.shutdown_grace_secs),
        }
    }

    pub fn emulator(&self, id: &str) -> Option<&EmulatorSpec> {
        self.emulators.iter().find(|e| e.id == id)
    }

    pub fn apk(&self, id: &str) -> Option<&ApkConfig> {
        self.apks.iter().find(|a| a.id == id)
    }

    /// Resolve a launch triple against the configured emulators and APKs
    pub fn resolve(&self, target: &LaunchTarget) -> Result<ResolvedTarget, ConfigError> {
        let unknown = |kind, id: &str| ConfigError::UnknownReference {
            kind,
            id: id.to_string(),
        };

        let emulator = self
            .emulator(&target.emulator)
            .ok_or_else(|| unknown("emulator", &target.emulator))?;
        let apk = self.apk(&target.apk).ok_or_else(|| unknown("apk", &target.apk))?;
        let activity = apk
            .activity(&target.activity)
            .ok_or_else(|| unknown("activity", &format!("{}/{}", target.apk, target.activity)))?;

        Ok(ResolvedTarget {
            emulator: emulator.clone(),
            package: apk.package(),
            activity: activity.clone(),
            install: InstallOptions {
                force: apk.force,
                allow_downgrade: apk.allow_downgrade,
                grant_permissions: apk.grant_permissions,
                timeout: Duration::from_secs(self.timeouts.install_secs),
            },
        })
    }

    /// Launch triples, either explicit or every activity of every APK on
    /// the single configured emulator
    pub fn targets(&self) -> Result<Vec<LaunchTarget>, ConfigError> {
        if !self.launch.is_empty() {
            return Ok(self.launch.clone());
        }

        let emulator = match self.emulators.as_slice() {
            [only] => only,
            [] => return Err(ConfigError::NoEmulators),
            _ => {
                return Err(ConfigError::Selection(
                    "several emulators configured; \
                     add [[launch]] entries to pair them with activities"
                        .into(),
                ))
            }
        };

        Ok(self
            .apks
            .iter()
            .flat_map(|apk| {
                apk.activities.iter().map(move |activity| LaunchTarget {
                    emulator: emulator.id.clone(),
                    apk: apk.id.clone(),
                    activity: activity.id.clone(),
                })
            })
            .collect())
    }

    /// Resolved targets matching the given id filters
    pub fn select(
        &self,
        emulator: Option<&str>,
        apk: Option<&str>,
        activity: Option<&str>,
    ) -> Result<Vec<ResolvedTarget>, ConfigError> {
        if let Some(id) = emulator {
            if self.emulator(id).is_none() {
                return Err(ConfigError::UnknownReference {
                    kind: "emulator",
                    id: id.to_string(),
                });
            }
        }
        if let Some(id) = apk {
            if self.apk(id).is_none() {
                return Err(ConfigError::UnknownReference {
                    kind: "apk",
                    id: id.to_string(),
                });
            }
        }

        let selected = self
            .targets()?
            .into_iter()
            .filter(|t| emulator.map_or(true, |id| t.emulator == id))
            .filter(|t| apk.map_or(true, |id| t.apk == id))
            .filter(|t| activity.map_or(true, |id| t.activity == id))
            .map(|t| self.resolve(&t))
            .collect::<Result<Vec<_>, _>>()?;

        if selected.is_empty() {
            return Err(ConfigError::Selection("nothing to launch for the given selection".into()));
        }
        Ok(selected)
    }
}

fn empty(kind: &'static str, id: &str, field: &'static str) -> ConfigError {
    ConfigError::EmptyField {
        kind,
        id: id.to_string(),
        field,
    }
}

/// Check a single emulator description
pub fn validate_emulator(spec: &EmulatorSpec) -> Result<(), ConfigError> {
    if spec.id.trim().is_empty() {
        return Err(empty("emulator", &spec.id, "id"));
    }
    if spec.create.name.trim().is_empty() {
        return Err(empty("emulator", &spec.id, "create.name"));
    }
    if spec.create.package.is_none() {
        if spec.create.target.trim().is_empty() {
            return Err(empty("emulator", &spec.id, "create.target"));
        }
        if spec.create.abi.trim().is_empty() {
            return Err(empty("emulator", &spec.id, "create.abi"));
        }
    }
    if let Some(port) = spec.start.port {
        if !is_console_port(port) {
            return Err(ConfigError::Port {
                emulator: spec.id.clone(),
                source: PortError::Invalid(port),
            });
        }
    }
    Ok(())
}
