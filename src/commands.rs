//! CLI commands for avd-pilot
//!
//! Each command is a plain struct filled in by `main` and executed once.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use avd_pilot_core::error::Phase;
use avd_pilot_core::{
    DeviceHandle, Event, LifecycleError, Orchestrator, PilotConfig, ResolvedTarget,
};
use avd_pilot_emulator_bridge::{
    AdbClient, EmulatorSpec, Launched, SdkTools, SystemProcessDriver,
};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Resolve SDK tools from `--sdk`, then the config file, then the environment
fn sdk_tools(cli_sdk: Option<&PathBuf>, config: Option<&PilotConfig>) -> SdkTools {
    let explicit = cli_sdk
        .cloned()
        .or_else(|| config.and_then(|c| c.sdk.path.clone()));
    SdkTools::resolve(explicit)
}

/// Run command options
pub struct RunCommand {
    pub config: PathBuf,
    pub sdk: Option<PathBuf>,
    pub emulator: Option<String>,
    pub apk: Option<String>,
    pub activity: Option<String>,
    /// Leave emulators running after a successful run
    pub keep_running: bool,
    /// Provision distinct emulators concurrently
    pub parallel: bool,
}

/// What happened on one emulator
#[derive(Debug)]
pub struct DeviceReport {
    pub emulator: String,
    pub launched: Vec<Launched>,
    /// Pid of an emulator left running with `--keep-running`
    pub detached_pid: Option<u32>,
    pub error: Option<LifecycleError>,
}

/// Outcome of a `run`
#[derive(Debug, Default)]
pub struct RunReport {
    pub devices: Vec<DeviceReport>,
}

impl RunReport {
    /// 0 on success, 2 if any provisioning failed, 3 if only deployments failed
    pub fn exit_code(&self) -> u8 {
        let phases: Vec<Phase> = self
            .devices
            .iter()
            .filter_map(|d| d.error.as_ref().map(LifecycleError::phase))
            .collect();

        if phases.contains(&Phase::Provision) {
            2
        } else if phases.contains(&Phase::Deploy) {
            3
        } else {
            0
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &LifecycleError)> {
        self.devices
            .iter()
            .filter_map(|d| d.error.as_ref().map(|e| (d.emulator.as_str(), e)))
    }
}

impl RunCommand {
    /// Provision every selected emulator and deploy its targets
    pub async fn execute(&self) -> Result<RunReport> {
        let config = PilotConfig::load(&self.config)
            .await
            .with_context(|| format!("invalid configuration {}", self.config.display()))?;
        let targets = config.select(
            self.emulator.as_deref(),
            self.apk.as_deref(),
            self.activity.as_deref(),
        )?;
        let groups = group_by_emulator(targets);

        let tools = sdk_tools(self.sdk.as_ref(), Some(&config));
        let orchestrator = Orchestrator::new(&tools, config.settings());

        let timeline = spawn_timeline(orchestrator.event_bus().subscribe());

        let cancel = CancellationToken::new();
        let interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling in-flight work");
                    cancel.cancel();
                }
            })
        };

        let devices = if self.parallel && groups.len() > 1 {
            info!("Running {} emulators concurrently", groups.len());
            join_all(groups.iter().map(|(spec, targets)| {
                run_device(&orchestrator, spec, targets, self.keep_running, &cancel)
            }))
            .await
        } else {
            let mut devices = Vec::with_capacity(groups.len());
            for (spec, targets) in &groups {
                let report =
                    run_device(&orchestrator, spec, targets, self.keep_running, &cancel).await;
                devices.push(report);
            }
            devices
        };

        interrupt.abort();
        drop(orchestrator);
        if timeline.join().is_err() {
            warn!("event printer panicked");
        }

        Ok(RunReport { devices })
    }
}

/// Group targets by emulator, keeping first-seen order
fn group_by_emulator(targets: Vec<ResolvedTarget>) -> Vec<(EmulatorSpec, Vec<ResolvedTarget>)> {
    let mut groups: Vec<(EmulatorSpec, Vec<ResolvedTarget>)> = Vec::new();
    for target in targets {
        match groups.iter_mut().find(|(spec, _)| spec.id == target.emulator.id) {
            Some((_, group)) => group.push(target),
            None => groups.push((target.emulator.clone(), vec![target])),
        }
    }
    groups
}

/// Provision one emulator, deploy each target in order, then shut it down or
/// leave it running
async fn run_device(
    orchestrator: &Orchestrator,
    spec: &EmulatorSpec,
    targets: &[ResolvedTarget],
    keep_running: bool,
    cancel: &CancellationToken,
) -> DeviceReport {
    let mut report = DeviceReport {
        emulator: spec.id.clone(),
        launched: Vec::new(),
        detached_pid: None,
        error: None,
    };

    let mut handle = match orchestrator.provision(spec, cancel).await {
        Ok(handle) => handle,
        Err(err) => {
            report.error = Some(err);
            return report;
        }
    };

    for target in targets {
        match orchestrator
            .deploy_with(&mut handle, &target.package, &target.install, &target.activity, cancel)
            .await
        {
            Ok(launched) => report.launched.push(launched),
            Err(err) => {
                report.error = Some(err);
                break;
            }
        }
    }

    if keep_running && report.error.is_none() {
        report.detached_pid = leave_running(handle);
    } else if let Err(err) = orchestrator.shutdown(handle).await {
        warn!("{}: {}", spec.id, err);
    }
    report
}

fn leave_running(handle: DeviceHandle) -> Option<u32> {
    let serial = handle.serial().unwrap_or_default();
    let pid = handle.detach();
    info!("Leaving {} running (pid {:?})", serial, pid);
    pid
}

/// Print a per-device timeline until the event bus goes away
fn spawn_timeline(events: avd_pilot_core::EventSubscription) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for event in events.iter() {
            match event {
                Event::StateChanged { device, from, to } => {
                    println!("[{}] {} -> {}", device, from, to);
                }
                Event::EmulatorSpawned { device, serial, pid } => match pid {
                    Some(pid) => println!("[{}] emulator {} started (pid {})", device, serial, pid),
                    None => println!("[{}] emulator {} started", device, serial),
                },
                Event::DeviceReady { device, serial, elapsed } => {
                    println!("[{}] {} ready in {:.1}s", device, serial, elapsed.as_secs_f64());
                }
                Event::PackageInstalled { device, package } => {
                    println!("[{}] installed {}", device, package);
                }
                Event::ActivityLaunched { device, component, .. } => {
                    println!("[{}] launched {}", device, component);
                }
                Event::StepFailed { device, operation, kind, .. } => {
                    println!("[{}] {} failed ({})", device, operation, kind);
                }
                Event::EmulatorStopped { device, serial } => {
                    println!("[{}] emulator {} stopped", device, serial);
                }
            }
        }
    })
}

/// Validate command options
pub struct ValidateCommand {
    pub config: PathBuf,
}

impl ValidateCommand {
    /// Load the configuration and print what `run` would do
    pub async fn execute(&self) -> Result<()> {
        let config = PilotConfig::load(&self.config)
            .await
            .with_context(|| format!("invalid configuration {}", self.config.display()))?;
        let targets = config.select(None, None, None)?;

        println!("Configuration OK: {}", self.config.display());
        println!(
            "  {} emulator(s), {} apk(s), {} launch target(s)",
            config.emulators.len(),
            config.apks.len(),
            targets.len()
        );
        for target in &targets {
            println!(
                "  {} <- {} ({}) -> {}",
                target.emulator.id,
                target.package.id,
                target.package.path.display(),
                target.activity.component()
            );
        }
        Ok(())
    }
}

/// Device list command
pub struct DevicesCommand {
    pub sdk: Option<PathBuf>,
}

impl DevicesCommand {
    /// List all devices adb knows about
    pub async fn execute(&self) -> Result<()> {
        let tools = sdk_tools(self.sdk.as_ref(), None);
        let adb = AdbClient::new(Arc::new(SystemProcessDriver), tools.adb());
        let devices = adb.list_devices(&CancellationToken::new()).await?;

        if devices.is_empty() {
            println!("No devices connected");
        } else {
            println!("Connected devices:");
            for device in devices {
                println!("  {} - {}", device.display_name(), device.state.as_str());
            }
        }

        Ok(())
    }
}
