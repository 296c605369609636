//! Device lifecycle state machine

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Uncreated,
    Creating,
    Created,
    Booting,
    Ready,
    Installing,
    Installed,
    Launching,
    Launched,
    Failed,
}

impl LifecycleState {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// The forward chain is strictly ordered. `Failed` is reachable from
    /// every state except itself. A ready device may be reinstalled or
    /// relaunched, but never sent back before `Ready`. The only way out of
    /// `Failed` is a new install, which the orchestrator allows only after a
    /// failed deploy on a still-running emulator.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        match (self, next) {
            (Failed, Installing) => true,
            (Failed, _) => false,
            (_, Failed) => true,
            (Uncreated, Creating)
            | (Creating, Created)
            | (Created, Booting)
            | (Booting, Ready)
            | (Ready, Installing)
            | (Installing, Installed)
            | (Installed, Launching)
            | (Launching, Launched) => true,
            // Reinstall and relaunch
            (Installed, Installing) | (Launched, Installing) | (Launched, Launching) => true,
            _ => false,
        }
    }

    /// The device has booted and accepts commands
    pub fn is_provisioned(self) -> bool {
        matches!(
            self,
            LifecycleState::Ready
                | LifecycleState::Installing
                | LifecycleState::Installed
                | LifecycleState::Launching
                | LifecycleState::Launched
        )
    }

    /// A resting state reached by a completed step
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            LifecycleState::Uncreated
                | LifecycleState::Created
                | LifecycleState::Ready
                | LifecycleState::Installed
                | LifecycleState::Launched
        )
    }

    pub fn is_failed(self) -> bool {
        self == LifecycleState::Failed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Uncreated => "Uncreated",
            LifecycleState::Creating => "Creating",
            LifecycleState::Created => "Created",
            LifecycleState::Booting => "Booting",
            LifecycleState::Ready => "Ready",
            LifecycleState::Installing => "Installing",
            LifecycleState::Installed => "Installed",
            LifecycleState::Launching => "Launching",
            LifecycleState::Launched => "Launched",
            LifecycleState::Failed => "Failed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
