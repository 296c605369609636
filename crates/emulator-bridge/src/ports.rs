//! Emulator console port allocation
//!
//! Each emulator claims an even console port (adb uses port + 1). A single
//! `PortPool` is shared by all concurrent provisions; every claim goes
//! through one mutex so two devices never receive the same port.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// First emulator console port
pub const CONSOLE_PORT_FIRST: u16 = 5554;

/// Last emulator console port
pub const CONSOLE_PORT_LAST: u16 = 5682;

/// Port allocation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("port {0} is not an emulator console port (even number in 5554..=5682)")]
    Invalid(u16),
    #[error("port {0} is already claimed by another device")]
    InUse(u16),
    #[error("no free emulator console ports")]
    Exhausted,
}

/// Whether `port` can be used as an emulator console port
pub fn is_console_port(port: u16) -> bool {
    (CONSOLE_PORT_FIRST..=CONSOLE_PORT_LAST).contains(&port) && port % 2 == 0
}

/// ADB serial of the emulator listening on `port`
pub fn emulator_serial(port: u16) -> String {
    format!("emulator-{}", port)
}

/// Get next available emulator port
fn next_emulator_port(used: &BTreeSet<u16>) -> Option<u16> {
    (CONSOLE_PORT_FIRST..=CONSOLE_PORT_LAST)
        .step_by(2)
        .find(|port| !used.contains(port))
}

/// Shared pool of claimed console ports
#[derive(Debug, Clone, Default)]
pub struct PortPool {
    claimed: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `preferred` if given, otherwise the lowest free port
    pub fn acquire(&self, preferred: Option<u16>) -> Result<PortLease, PortError> {
        match preferred {
            Some(port) => self.claim(port),
            None => self.allocate(),
        }
    }

    /// Claim a specific port
    pub fn claim(&self, port: u16) -> Result<PortLease, PortError> {
        if !is_console_port(port) {
            return Err(PortError::Invalid(port));
        }
        let mut claimed = self.claimed.lock();
        if !claimed.insert(port) {
            return Err(PortError::InUse(port));
        }
        debug!("claimed console port {}", port);
        Ok(self.lease(port))
    }

    /// Claim the lowest free port
    pub fn allocate(&self) -> Result<PortLease, PortError> {
        let mut claimed = self.claimed.lock();
        let port = next_emulator_port(&claimed).ok_or(PortError::Exhausted)?;
        claimed.insert(port);
        debug!("allocated console port {}", port);
        Ok(self.lease(port))
    }

    /// Currently claimed ports
    pub fn claimed(&self) -> Vec<u16> {
        self.claimed.lock().iter().copied().collect()
    }

    fn lease(&self, port: u16) -> PortLease {
        PortLease {
            port,
            claimed: Arc::clone(&self.claimed),
        }
    }
}

/// A claimed port, returned to the pool on drop
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    claimed: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn serial(&self) -> String {
        emulator_serial(self.port)
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.claimed.lock().remove(&self.port);
        debug!("released console port {}", self.port);
    }
}
