//! Android Emulator Bridge
//!
//! Wraps the Android SDK command line tools: AVD creation, emulator
//! processes, and everything that talks to a device over ADB.

pub mod adb;
pub mod avd;
pub mod device;
pub mod emulator;
pub mod installer;
pub mod launcher;
pub mod package;
pub mod ports;
pub mod process;
pub mod readiness;
pub mod sdk;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use adb::{AdbClient, AdbError};
pub use avd::{AvdConfig, AvdError, AvdManager, AvdOutcome};
pub use device::{Device, DeviceState, DeviceType};
pub use emulator::{EmulatorInstance, EmulatorLauncher, EmulatorOptions, EmulatorSpec};
pub use installer::{
    AdbPackageInstaller, InstallError, InstallFailure, InstallOptions, InstallReport,
    PackageInstaller,
};
pub use launcher::{
    ActivityLauncher, AdbActivityLauncher, LaunchError, LaunchFailure, LaunchOptions, Launched,
};
pub use package::{ActivitySpec, PackageSpec};
pub use ports::{PortError, PortLease, PortPool};
pub use process::{
    CommandRequest, ManagedProcess, ProcessDriver, ProcessError, ProcessOutput,
    SystemProcessDriver,
};
pub use readiness::{
    AdbReadinessMonitor, Readiness, ReadinessError, ReadinessMonitor, ReadinessPolicy,
};
pub use sdk::SdkTools;
