//! SDK Tool Resolution
//!
//! Locates `adb`, `emulator` and `avdmanager` inside an Android SDK.

use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Paths to the SDK command-line tools
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkTools {
    sdk_root: Option<PathBuf>,
    adb: PathBuf,
    emulator: PathBuf,
    avdmanager: PathBuf,
}

impl SdkTools {
    /// Resolve tools from an explicit SDK path, the environment, or common
    /// install locations. Tools that cannot be found inside an SDK fall back
    /// to bare names looked up on `PATH`.
    pub fn resolve(explicit: Option<PathBuf>) -> Self {
        let root = explicit
            .into_iter()
            .chain(Self::sdk_candidates())
            .find(|p| Self::is_valid_sdk(p));

        match root {
            Some(root) => {
                info!("Using Android SDK at {:?}", root);
                Self::with_root(root)
            }
            None => {
                debug!("No Android SDK found, using tools from PATH");
                Self::from_path()
            }
        }
    }

    /// Tools inside the given SDK root
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let adb = find_tool(&root, &[&["platform-tools"]], "adb");
        let emulator = find_tool(&root, &[&["emulator"], &["tools"]], "emulator");
        let avdmanager = find_tool(
            &root,
            &[&["cmdline-tools", "latest", "bin"], &["tools", "bin"]],
            "avdmanager",
        );

        let mut tools = Self {
            sdk_root: Some(root),
            adb,
            emulator,
            avdmanager,
        };
        if let Ok(adb) = env::var("ADB_PATH") {
            tools.adb = PathBuf::from(adb);
        }
        tools
    }

    /// Bare tool names resolved through `PATH`
    pub fn from_path() -> Self {
        Self {
            sdk_root: None,
            adb: PathBuf::from(exe_name("adb")),
            emulator: PathBuf::from(exe_name("emulator")),
            avdmanager: PathBuf::from(script_name("avdmanager")),
        }
    }

    pub fn sdk_root(&self) -> Option<&Path> {
        self.sdk_root.as_deref()
    }

    pub fn adb(&self) -> &Path {
        &self.adb
    }

    pub fn emulator(&self) -> &Path {
        &self.emulator
    }

    pub fn avdmanager(&self) -> &Path {
        &self.avdmanager
    }

    fn sdk_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(sdk_root) = env::var("ANDROID_SDK_ROOT") {
            candidates.push(PathBuf::from(sdk_root));
        }
        if let Ok(android_home) = env::var("ANDROID_HOME") {
            candidates.push(PathBuf::from(android_home));
        }

        if let Some(home) = dirs::home_dir() {
            if cfg!(windows) {
                candidates.push(home.join("AppData").join("Local").join("Android").join("Sdk"));
            } else {
                candidates.push(home.join("Android").join("Sdk"));
                candidates.push(home.join("Library").join("Android").join("sdk"));
                candidates.push(home.join("android-sdk"));
            }
        }
        if cfg!(unix) {
            candidates.push(PathBuf::from("/opt/android-sdk"));
            candidates.push(PathBuf::from("/usr/local/android-sdk"));
        }

        candidates
    }

    fn is_valid_sdk(path: &Path) -> bool {
        path.join("platform-tools").is_dir() || path.join("emulator").is_dir()
    }
}

impl Default for SdkTools {
    fn default() -> Self {
        Self::from_path()
    }
}

fn exe_name(tool: &str) -> String {
    if cfg!(windows) {
        format!("{tool}.exe")
    } else {
        tool.to_string()
    }
}

fn script_name(tool: &str) -> String {
    if cfg!(windows) {
        format!("{tool}.bat")
    } else {
        tool.to_string()
    }
}

fn find_tool(root: &Path, subdirs: &[&[&str]], tool: &str) -> PathBuf {
    for dir in subdirs {
        let base = dir.iter().fold(root.to_path_buf(), |p, d| p.join(d));
        for name in [exe_name(tool), script_name(tool)] {
            let candidate = base.join(&name);
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    PathBuf::from(exe_name(tool))
}
