//! Packages and activities to deploy

use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static PACKAGE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_]*(\.[A-Za-z][A-Za-z0-9_]*)+$")
        .expect("valid package name regex")
});

/// Whether `name` is a valid Android application package name
pub fn is_valid_package_name(name: &str) -> bool {
    PACKAGE_NAME.is_match(name)
}

/// An installable artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub id: String,
    /// Path to the APK
    pub path: PathBuf,
}

impl PackageSpec {
    pub fn new(id: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.to_string(),
            path: path.into(),
        }
    }
}

/// A launchable activity of an installed package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySpec {
    pub id: String,
    /// Application package name, e.g. `org.jboss.aerogear`
    pub package_name: String,
    /// Activity class: `AeroGearMain`, `.AeroGearMain`,
    /// `org.jboss.aerogear.AeroGearMain` or a full `pkg/cls` component
    pub name: String,
}

impl ActivitySpec {
    pub fn new(id: &str, package_name: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            package_name: package_name.to_string(),
            name: name.to_string(),
        }
    }

    /// Component name for `am start -n`
    pub fn component(&self) -> String {
        let name = self.name.trim();
        if name.contains('/') {
            name.to_string()
        } else if name.contains('.') {
            format!("{}/{}", self.package_name, name)
        } else {
            format!("{}/.{}", self.package_name, name)
        }
    }
}
