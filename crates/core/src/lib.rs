//! avd-pilot core - lifecycle orchestration for Android emulators
//!
//! This crate drives devices through create, boot, wait-until-ready, install
//! and launch, loads the run configuration, and publishes lifecycle events.

pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod orchestrator;

pub use config::{
    ApkConfig, ConfigError, LaunchTarget, PilotConfig, ResolvedTarget, SdkConfig, TimeoutConfig,
};
pub use error::{FailureKind, LifecycleError, Operation, Phase, Result};
pub use events::{Event, EventBus, EventSubscription};
pub use lifecycle::LifecycleState;
pub use orchestrator::{DeviceHandle, Orchestrator, OrchestratorSettings};

/// avd-pilot version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
