//! avd-pilot - provision Android emulators and launch APK activities
//!
//! Sequences "create AVD -> boot emulator -> wait until ready -> install APK
//! -> launch activity" from a declarative configuration file.
//!
//! ## Architecture
//!
//! - `avd-pilot-core`: lifecycle orchestrator, configuration, events
//! - `avd-pilot-emulator-bridge`: process driver and the adb, avdmanager and
//!   emulator components

#![warn(clippy::all)]

pub mod commands;

// Re-export main components for library usage
pub use avd_pilot_core as core;
pub use avd_pilot_emulator_bridge as emulator;

/// Prelude module for convenient imports
pub mod prelude {
    pub use avd_pilot_core::{
        DeviceHandle, LifecycleError, LifecycleState, Orchestrator, OrchestratorSettings,
        PilotConfig,
    };
    pub use avd_pilot_emulator_bridge::{ActivitySpec, EmulatorSpec, PackageSpec, SdkTools};
    pub use tokio_util::sync::CancellationToken;
}
