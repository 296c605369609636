//! Lifecycle Orchestrator
//!
//! Drives a device through create -> boot -> wait until ready -> install ->
//! launch. Every step checks the device's lifecycle state first and rejects
//! out-of-order requests; a failing step moves the device to `Failed` and
//! aborts the steps after it. Nothing is retried automatically, but a device
//! whose install or launch failed can be deployed again while its emulator
//! is still running.
//!
//! Devices are owned by the caller as [`DeviceHandle`]s. Steps take the handle
//! by `&mut`, so operations on one device never overlap, while the
//! orchestrator itself is shared (`&self`) between concurrently provisioned
//! devices. The only state they share is the console port pool.

use std::sync::Arc;
use std::time::Duration;

use avd_pilot_emulator_bridge::{
    ActivityLauncher, ActivitySpec, AdbActivityLauncher, AdbClient, AdbPackageInstaller,
    AdbReadinessMonitor, AvdError, AvdManager, EmulatorInstance, EmulatorLauncher, EmulatorSpec,
    InstallOptions, InstallReport, LaunchOptions, Launched, PackageInstaller, PackageSpec,
    PortError, PortLease, PortPool, ProcessDriver, ProcessError, Readiness, ReadinessError,
    ReadinessMonitor, ReadinessPolicy, SdkTools, SystemProcessDriver,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{validate_emulator, ConfigError};
use crate::error::{FailureKind, LifecycleError, Operation, Phase, Result};
use crate::events::{Event, EventBus};
use crate::lifecycle::LifecycleState;

use LifecycleState::{
    Booting, Created, Creating, Failed, Installed, Installing, Launching, Ready, Uncreated,
};

/// Timeouts and polling parameters used by the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// Short adb commands
    pub command_timeout: Duration,
    /// `avdmanager create avd`
    pub create_timeout: Duration,
    pub readiness: ReadinessPolicy,
    /// Install options used by [`Orchestrator::deploy`]
    pub install: InstallOptions,
    pub launch: LaunchOptions,
    /// Time allowed for a graceful emulator exit before it is killed
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            create_timeout: Duration::from_secs(120),
            readiness: ReadinessPolicy::default(),
            install: InstallOptions::default(),
            launch: LaunchOptions::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// A device being orchestrated.
///
/// Dropping a handle kills its emulator unless the handle was detached.
#[derive(Debug)]
pub struct DeviceHandle {
    spec: EmulatorSpec,
    run_id: Uuid,
    state: LifecycleState,
    history: Vec<LifecycleState>,
    lease: Option<PortLease>,
    instance: Option<EmulatorInstance>,
    last_failure: Option<String>,
    failed_in: Option<Operation>,
}

impl DeviceHandle {
    /// A fresh, uncreated device for `spec`
    pub fn new(spec: &EmulatorSpec) -> Self {
        Self {
            spec: spec.clone(),
            run_id: Uuid::new_v4(),
            state: Uncreated,
            history: vec![Uncreated],
            lease: None,
            instance: None,
            last_failure: None,
            failed_in: None,
        }
    }

    /// Identifier of the emulator description
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &EmulatorSpec {
        &self.spec
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Every state the device has been in, oldest first
    pub fn history(&self) -> &[LifecycleState] {
        &self.history
    }

    /// Console port, once booted
    pub fn port(&self) -> Option<u16> {
        self.lease.as_ref().map(PortLease::port)
    }

    /// ADB serial, once booted
    pub fn serial(&self) -> Option<String> {
        self.lease.as_ref().map(PortLease::serial)
    }

    /// OS pid of the emulator process
    pub fn pid(&self) -> Option<u32> {
        self.instance.as_ref().and_then(EmulatorInstance::pid)
    }

    pub fn is_running(&mut self) -> bool {
        self.instance
            .as_mut()
            .map(EmulatorInstance::is_running)
            .unwrap_or(false)
    }

    /// Recent emulator output
    pub fn output_tail(&self) -> Vec<String> {
        self.instance
            .as_ref()
            .map(EmulatorInstance::output_tail)
            .unwrap_or_default()
    }

    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    /// The most recent resting state, ignoring in-flight and failed states
    pub fn last_good_state(&self) -> Option<LifecycleState> {
        self.history.iter().rev().copied().find(|s| s.is_settled())
    }

    /// A failed install or launch on a running emulator may be deployed again
    pub fn can_redeploy(&mut self) -> bool {
        self.state == Failed
            && self.failed_in.map(Operation::phase) == Some(Phase::Deploy)
            && self.is_running()
    }

    /// Leave the emulator running after the handle is gone; returns its pid
    pub fn detach(mut self) -> Option<u32> {
        self.instance.take().and_then(EmulatorInstance::detach)
    }
}

/// Lifecycle orchestrator, generic over the process driver and the three
/// device-facing components so each can be substituted independently
pub struct Orchestrator<
    P: ProcessDriver = SystemProcessDriver,
    M: ReadinessMonitor = AdbReadinessMonitor<P>,
    I: PackageInstaller = AdbPackageInstaller<P>,
    L: ActivityLauncher = AdbActivityLauncher<P>,
> {
    avds: AvdManager<P>,
    emulators: EmulatorLauncher<P>,
    adb: AdbClient<P>,
    monitor: M,
    installer: I,
    launcher: L,
    ports: PortPool,
    events: Arc<EventBus>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    /// Orchestrator running the real SDK tools
    pub fn new(tools: &SdkTools, settings: OrchestratorSettings) -> Self {
        Self::with_driver(Arc::new(SystemProcessDriver), tools, settings)
    }
}

impl<P: ProcessDriver>
    Orchestrator<P, AdbReadinessMonitor<P>, AdbPackageInstaller<P>, AdbActivityLauncher<P>>
{
    /// Orchestrator whose every component goes through `driver`
    pub fn with_driver(driver: Arc<P>, tools: &SdkTools, settings: OrchestratorSettings) -> Self {
        let adb =
            AdbClient::new(Arc::clone(&driver), tools.adb()).with_timeout(settings.command_timeout);
        Self::from_parts(
            driver,
            tools,
            AdbReadinessMonitor::new(adb.clone()),
            AdbPackageInstaller::new(adb.clone()),
            AdbActivityLauncher::new(adb),
            settings,
        )
    }
}

impl<P, M, I, L> Orchestrator<P, M, I, L>
where
    P: ProcessDriver,
    M: ReadinessMonitor,
    I: PackageInstaller,
    L: ActivityLauncher,
{
    /// Assemble an orchestrator from individual components
    pub fn from_parts(
        driver: Arc<P>,
        tools: &SdkTools,
        monitor: M,
        installer: I,
        launcher: L,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            avds: AvdManager::new(Arc::clone(&driver), tools.avdmanager(), tools.emulator())
                .with_timeout(settings.create_timeout),
            emulators: EmulatorLauncher::new(Arc::clone(&driver), tools.emulator()),
            adb: AdbClient::new(driver, tools.adb()).with_timeout(settings.command_timeout),
            monitor,
            installer,
            launcher,
            ports: PortPool::new(),
            events: Arc::new(EventBus::new()),
            settings,
        }
    }

    /// Get the event bus for subscribing to events
    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn ports(&self) -> &PortPool {
        &self.ports
    }

    pub fn adb(&self) -> &AdbClient<P> {
        &self.adb
    }

    /// Create, boot, and wait for a new device.
    ///
    /// On failure the emulator process, if any, has been killed and reaped
    /// and its port released before this returns.
    pub async fn provision(
        &self,
        spec: &EmulatorSpec,
        cancel: &CancellationToken,
    ) -> Result<DeviceHandle> {
        let mut handle = DeviceHandle::new(spec);
        let span = info_span!("provision", emulator = %spec.id, run_id = %handle.run_id);

        let result = async {
            info!("Provisioning AVD {}", spec.create.name);
            self.create(&mut handle, cancel).await?;
            self.boot(&mut handle, cancel).await?;
            self.wait_until_ready(&mut handle, cancel).await
        }
        .instrument(span.clone())
        .await;

        match result {
            Ok(()) => Ok(handle),
            Err(err) => {
                self.teardown(&mut handle).instrument(span).await;
                Err(err)
            }
        }
    }

    /// Install `package` and launch `activity` with the default install options
    pub async fn deploy(
        &self,
        handle: &mut DeviceHandle,
        package: &PackageSpec,
        activity: &ActivitySpec,
        cancel: &CancellationToken,
    ) -> Result<Launched> {
        let options = self.settings.install.clone();
        self.deploy_with(handle, package, &options, activity, cancel).await
    }

    /// Install `package` with `options` and launch `activity`
    pub async fn deploy_with(
        &self,
        handle: &mut DeviceHandle,
        package: &PackageSpec,
        options: &InstallOptions,
        activity: &ActivitySpec,
        cancel: &CancellationToken,
    ) -> Result<Launched> {
        let span = info_span!(
            "deploy",
            emulator = %handle.id(),
            run_id = %handle.run_id,
            apk = %package.id
        );
        async {
            self.install(handle, package, options, cancel).await?;
            self.launch(handle, activity, cancel).await
        }
        .instrument(span)
        .await
    }

    /// Create the AVD. Requires `Uncreated`.
    pub async fn create(
        &self,
        handle: &mut DeviceHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        const OP: Operation = Operation::Create;
        require(handle, OP, &[Uncreated])?;

        if let Err(err) = validate_emulator(&handle.spec) {
            return Err(self.fail(handle, OP, FailureKind::Configuration(err)));
        }

        self.transition(handle, Creating);
        match self.avds.create_avd(&handle.spec.create, cancel).await {
            Ok(outcome) => {
                debug!("AVD {} {:?}", handle.spec.create.name, outcome);
                self.transition(handle, Created);
                Ok(())
            }
            Err(AvdError::Process(e)) if e.is_cancelled() => {
                Err(self.fail(handle, OP, FailureKind::Cancelled))
            }
            Err(AvdError::Process(e)) => Err(self.fail(handle, OP, FailureKind::Process(e))),
            Err(e) => Err(self.fail(handle, OP, FailureKind::Create(e))),
        }
    }

    /// Claim a console port and spawn the emulator. Requires `Created`.
    ///
    /// Returns as soon as the process runs; the guest is still booting.
    pub async fn boot(&self, handle: &mut DeviceHandle, cancel: &CancellationToken) -> Result<()> {
        const OP: Operation = Operation::Boot;
        require(handle, OP, &[Created])?;

        if cancel.is_cancelled() {
            return Err(self.fail(handle, OP, FailureKind::Cancelled));
        }

        let lease = match self.ports.acquire(handle.spec.start.port) {
            Ok(lease) => lease,
            Err(source) => {
                let err = ConfigError::Port {
                    emulator: handle.spec.id.clone(),
                    source,
                };
                return Err(self.fail(handle, OP, FailureKind::Configuration(err)));
            }
        };
        let (port, serial) = (lease.port(), lease.serial());

        // An emulator started outside this process may already own the port
        match self.adb.list_devices(cancel).await {
            Ok(devices) if devices.iter().any(|d| d.serial == serial) => {
                let err = ConfigError::Port {
                    emulator: handle.spec.id.clone(),
                    source: PortError::InUse(port),
                };
                return Err(self.fail(handle, OP, FailureKind::Configuration(err)));
            }
            Ok(_) => {}
            Err(e) if e.is_cancelled() => return Err(self.fail(handle, OP, FailureKind::Cancelled)),
            Err(e) => debug!("could not list devices before boot: {}", e),
        }

        handle.lease = Some(lease);
        self.transition(handle, Booting);

        let booted = self
            .emulators
            .boot(&handle.spec.create.name, port, &handle.spec.start);
        let instance = match booted {
            Ok(instance) => instance,
            Err(e) => return Err(self.fail(handle, OP, FailureKind::Process(e))),
        };
        info!(
            "Emulator {} spawned as {} (pid {:?})",
            handle.spec.create.name,
            serial,
            instance.pid()
        );
        self.events.emit(Event::EmulatorSpawned {
            device: handle.spec.id.clone(),
            serial,
            pid: instance.pid(),
        });
        handle.instance = Some(instance);
        Ok(())
    }

    /// Wait for the guest to finish booting. Requires `Booting`.
    ///
    /// Fails early if the emulator process exits while waiting.
    pub async fn wait_until_ready(
        &self,
        handle: &mut DeviceHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        const OP: Operation = Operation::WaitReady;
        require(handle, OP, &[Booting])?;

        let serial = handle.serial().unwrap_or_default();
        let policy = &self.settings.readiness;

        let kind = match handle.instance.as_mut() {
            None => FailureKind::Process(ProcessError::Exited {
                program: "emulator".into(),
                code: None,
                output_tail: Vec::new(),
            }),
            Some(instance) => {
                let outcome = tokio::select! {
                    result = self.monitor.wait_until_ready(&serial, policy, cancel) => Ok(result),
                    exit = instance.wait() => Err(exit),
                };
                match outcome {
                    Ok(Ok(Readiness::Ready { elapsed, polls })) => {
                        info!("{} ready after {:?} ({} polls)", serial, elapsed, polls);
                        self.transition(handle, Ready);
                        self.events.emit(Event::DeviceReady {
                            device: handle.spec.id.clone(),
                            serial,
                            elapsed,
                        });
                        return Ok(());
                    }
                    Ok(Ok(Readiness::TimedOut { elapsed, polls })) => FailureKind::BootTimeout {
                        serial,
                        waited: elapsed,
                        polls,
                    },
                    Ok(Err(ReadinessError::Cancelled { .. })) => FailureKind::Cancelled,
                    Ok(Err(ReadinessError::Process(e))) => FailureKind::Process(e),
                    Ok(Err(e)) => FailureKind::DeviceUnresponsive(e),
                    Err(Ok(code)) => {
                        warn!("emulator for {} exited with {:?} while booting", serial, code);
                        FailureKind::Process(instance.exited_error(code))
                    }
                    Err(Err(e)) => FailureKind::Process(e),
                }
            }
        };

        Err(self.fail(handle, OP, kind))
    }

    /// Install a package. Requires `Ready`, `Installed` or `Launched`, or a
    /// device whose previous install or launch failed while it kept running.
    pub async fn install(
        &self,
        handle: &mut DeviceHandle,
        package: &PackageSpec,
        options: &InstallOptions,
        cancel: &CancellationToken,
    ) -> Result<InstallReport> {
        const OP: Operation = Operation::Install;
        if !handle.can_redeploy() {
            require(handle, OP, &[Ready, Installed, LifecycleState::Launched])?;
        }

        let serial = handle.serial().unwrap_or_default();
        self.transition(handle, Installing);

        match self.installer.install(&serial, package, options, cancel).await {
            Ok(report) => {
                info!("{} installed on {} in {:?}", package.id, serial, report.elapsed);
                self.transition(handle, Installed);
                self.events.emit(Event::PackageInstalled {
                    device: handle.spec.id.clone(),
                    package: package.id.clone(),
                });
                Ok(report)
            }
            Err(e) if e.is_cancelled() => Err(self.fail(handle, OP, FailureKind::Cancelled)),
            Err(e) => Err(self.fail(handle, OP, FailureKind::Install(e))),
        }
    }

    /// Launch an activity and confirm it is in the foreground. Requires
    /// `Installed` or `Launched`.
    pub async fn launch(
        &self,
        handle: &mut DeviceHandle,
        activity: &ActivitySpec,
        cancel: &CancellationToken,
    ) -> Result<Launched> {
        const OP: Operation = Operation::Launch;
        require(handle, OP, &[Installed, LifecycleState::Launched])?;

        let serial = handle.serial().unwrap_or_default();
        self.transition(handle, Launching);

        match self.launcher.launch(&serial, activity, &self.settings.launch, cancel).await {
            Ok(launched) => {
                info!("{} launched on {} (pid {:?})", launched.component, serial, launched.pid);
                self.transition(handle, LifecycleState::Launched);
                self.events.emit(Event::ActivityLaunched {
                    device: handle.spec.id.clone(),
                    component: launched.component.clone(),
                    pid: launched.pid,
                });
                Ok(launched)
            }
            Err(e) if e.is_cancelled() => Err(self.fail(handle, OP, FailureKind::Cancelled)),
            Err(e) => Err(self.fail(handle, OP, FailureKind::Launch(e))),
        }
    }

    /// Stop the emulator: ask it to exit via its console, kill it after the
    /// grace period, and release its port
    pub async fn shutdown(&self, mut handle: DeviceHandle) -> Result<()> {
        let Some(mut instance) = handle.instance.take() else {
            handle.lease = None;
            return Ok(());
        };
        let serial = instance.serial();
        let span = info_span!("shutdown", emulator = %handle.id(), run_id = %handle.run_id);

        async {
            if instance.is_running() {
                // Fresh token: shutdown also runs after the caller cancelled
                let quiet = CancellationToken::new();
                if let Err(e) = self.adb.emu_kill(&serial, &quiet).await {
                    debug!("emu kill {} failed: {}", serial, e);
                }

                match tokio::time::timeout(self.settings.shutdown_grace, instance.wait()).await {
                    Ok(Ok(code)) => debug!("{} exited with {:?}", serial, code),
                    Ok(Err(e)) => debug!("waiting for {} failed: {}", serial, e),
                    Err(_) => warn!(
                        "{} still running after {:?}, killing it",
                        serial, self.settings.shutdown_grace
                    ),
                }
            }

            if let Err(e) = instance.kill().await {
                return Err(LifecycleError::new(
                    Operation::Shutdown,
                    handle.state,
                    FailureKind::Process(e),
                ));
            }

            info!("Emulator {} stopped", serial);
            handle.lease = None;
            self.events.emit(Event::EmulatorStopped {
                device: handle.spec.id.clone(),
                serial: serial.clone(),
            });
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Kill and reap the emulator without a graceful exit and release the port
    async fn teardown(&self, handle: &mut DeviceHandle) {
        if let Some(mut instance) = handle.instance.take() {
            let serial = instance.serial();
            if let Err(e) = instance.kill().await {
                warn!("failed to kill emulator {}: {}", serial, e);
            }
            self.events.emit(Event::EmulatorStopped {
                device: handle.spec.id.clone(),
                serial,
            });
        }
        handle.lease = None;
    }

    fn transition(&self, handle: &mut DeviceHandle, next: LifecycleState) {
        let from = handle.state;
        debug_assert!(from.can_transition_to(next), "{} -> {}", from, next);
        debug!("{}: {} -> {}", handle.spec.id, from, next);

        handle.state = next;
        handle.history.push(next);
        self.events.emit(Event::StateChanged {
            device: handle.spec.id.clone(),
            from,
            to: next,
        });
    }

    fn fail(
        &self,
        handle: &mut DeviceHandle,
        operation: Operation,
        kind: FailureKind,
    ) -> LifecycleError {
        let err = LifecycleError::new(operation, handle.state, kind)
            .with_last_good(handle.last_good_state());
        warn!("{}: {}", handle.spec.id, err);

        handle.last_failure = Some(err.to_string());
        handle.failed_in = Some(operation);
        self.transition(handle, Failed);
        self.events.emit(Event::StepFailed {
            device: handle.spec.id.clone(),
            operation: operation.to_string(),
            kind: err.kind_name(),
            message: err.kind.to_string(),
        });
        err
    }
}

fn require(
    handle: &DeviceHandle,
    operation: Operation,
    expected: &'static [LifecycleState],
) -> Result<()> {
    if expected.contains(&handle.state) {
        Ok(())
    } else {
        Err(LifecycleError::precondition(operation, expected, handle.state)
            .with_last_good(handle.last_good_state()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use avd_pilot_emulator_bridge::testing::{Reply, ScriptedDriver, SpawnBehavior};
    use avd_pilot_emulator_bridge::{AvdConfig, EmulatorOptions};
    use std::path::Path;
    use tempfile::TempDir;

    const RESUMED: &str =
        "  mResumedActivity: ActivityRecord{3f1c u0 org.jboss.aerogear/.AeroGearMain t12}\n";

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            readiness: ReadinessPolicy {
                poll_interval: Duration::from_millis(10),
                max_poll_interval: Duration::from_millis(20),
                backoff_factor: 1.5,
                max_wait: Duration::from_secs(10),
                query_timeout: Duration::from_secs(1),
                max_rejections: 3,
            },
            launch: LaunchOptions {
                verify_timeout: Duration::from_millis(200),
                poll_interval: Duration::from_millis(10),
                stop_existing: false,
            },
            shutdown_grace: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn orchestrator(
        driver: &Arc<ScriptedDriver>,
        settings: OrchestratorSettings,
    ) -> Orchestrator<ScriptedDriver> {
        Orchestrator::with_driver(Arc::clone(driver), &SdkTools::from_path(), settings)
    }

    /// A device that boots on the second query and accepts everything
    fn healthy_device() -> Arc<ScriptedDriver> {
        let driver = Arc::new(ScriptedDriver::new());
        driver.on("adb devices", Reply::stdout("List of devices attached\n\n"));
        driver.on_sequence(
            "getprop sys.boot_completed",
            vec![Reply::failure(1, "error: device offline"), Reply::stdout("1\n")],
        );
        driver.on("get-state", Reply::stdout("device\n"));
        driver.on(" install ", Reply::stdout("Performing Streamed Install\nSuccess\n"));
        driver.on("pm path", Reply::stdout("package:/data/app/org.jboss.aerogear-1/base.apk\n"));
        driver.on("am start", Reply::stdout("Status: ok\nLaunchState: COLD\n"));
        driver.on("dumpsys activity", Reply::stdout(RESUMED));
        driver.on("pidof", Reply::stdout("4242\n"));
        driver
    }

    fn test_avd() -> EmulatorSpec {
        let mut create = AvdConfig::new("testAVD", "android-18", "armeabi-v7a");
        create.force = true;
        let start = EmulatorOptions {
            port: Some(5556),
            no_audio: true,
            ..Default::default()
        };
        EmulatorSpec::new("emulator-1", create, start)
    }

    fn test_apk(dir: &TempDir) -> PackageSpec {
        let apks = dir.path().join("apks");
        std::fs::create_dir_all(&apks).unwrap();
        let path = apks.join("test.apk");
        std::fs::write(&path, b"PK\x03\x04").unwrap();
        PackageSpec::new("apk-1", path)
    }

    fn aerogear_main() -> ActivitySpec {
        ActivitySpec::new("activity-1", "org.jboss.aerogear", "AeroGearMain")
    }

    fn process_gone(pid: u32) -> bool {
        !Path::new(&format!("/proc/{pid}")).exists()
    }

    /// Killed children are reaped by tokio in the background
    async fn wait_gone(pid: u32) -> bool {
        for _ in 0..100 {
            if process_gone(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_provision_and_deploy_reach_launched() {
        let dir = TempDir::new().unwrap();
        let driver = healthy_device();
        let orchestrator = orchestrator(&driver, settings());
        let events = orchestrator.event_bus().subscribe();
        let cancel = CancellationToken::new();

        let mut handle = orchestrator.provision(&test_avd(), &cancel).await.unwrap();
        assert_eq!(handle.state(), Ready);
        assert_eq!(handle.serial().as_deref(), Some("emulator-5556"));

        let launched = orchestrator
            .deploy(&mut handle, &test_apk(&dir), &aerogear_main(), &cancel)
            .await
            .unwrap();
        assert_eq!(launched.component, "org.jboss.aerogear/.AeroGearMain");
        assert_eq!(launched.pid, Some(4242));
        assert_eq!(
            handle.history(),
            &[
                Uncreated,
                Creating,
                Created,
                Booting,
                Ready,
                Installing,
                Installed,
                Launching,
                LifecycleState::Launched,
            ]
        );

        let create = driver.last_request("avdmanager create avd").unwrap();
        assert!(create.args.contains(&"system-images;android-18;default;armeabi-v7a".to_string()));
        assert!(create.args.contains(&"--force".to_string()));
        let boot = driver.last_request("-avd testAVD").unwrap();
        assert_eq!(&boot.args[..5], &["-avd", "testAVD", "-port", "5556", "-no-audio"]);
        let created_at = driver.position("avdmanager create").unwrap();
        assert!(created_at < driver.position("-avd testAVD").unwrap());

        let pid = handle.pid().unwrap();
        orchestrator.shutdown(handle).await.unwrap();
        assert!(process_gone(pid));
        assert!(orchestrator.ports().claimed().is_empty());

        let received = events.drain();
        assert!(!received
            .iter()
            .any(|e| matches!(e, Event::StateChanged { to: Failed, .. })));
        assert!(received
            .iter()
            .any(|e| matches!(e, Event::EmulatorStopped { .. })));
    }

    #[tokio::test]
    async fn test_install_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let driver = healthy_device();
        let orchestrator = orchestrator(&driver, settings());
        let cancel = CancellationToken::new();
        let package = test_apk(&dir);
        let options = InstallOptions::default();

        let mut handle = orchestrator.provision(&test_avd(), &cancel).await.unwrap();
        orchestrator.install(&mut handle, &package, &options, &cancel).await.unwrap();
        orchestrator.install(&mut handle, &package, &options, &cancel).await.unwrap();

        assert_eq!(handle.state(), Installed);
        assert_eq!(driver.count(" install "), 2);
        assert!(driver.last_request(" install ").unwrap().args.contains(&"-r".to_string()));
    }

    #[tokio::test]
    async fn test_deploy_before_ready_is_rejected() {
        let dir = TempDir::new().unwrap();
        let driver = healthy_device();
        let orchestrator = orchestrator(&driver, settings());
        let cancel = CancellationToken::new();

        let mut handle = DeviceHandle::new(&test_avd());
        orchestrator.create(&mut handle, &cancel).await.unwrap();

        let err = orchestrator
            .deploy(&mut handle, &test_apk(&dir), &aerogear_main(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind_name(), "StatePreconditionError");
        assert_eq!(err.state, Created);
        assert_eq!(handle.state(), Created);
        assert_eq!(driver.count("get-state"), 0);
        assert_eq!(driver.count(" install "), 0);

        let err = orchestrator.wait_until_ready(&mut handle, &cancel).await.unwrap_err();
        assert!(matches!(err.kind, FailureKind::StatePrecondition { .. }));
    }

    #[tokio::test]
    async fn test_zero_wait_times_out_and_reaps_emulator() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.on("getprop sys.boot_completed", Reply::stdout("0\n"));
        let mut settings = settings();
        settings.readiness.max_wait = Duration::ZERO;
        let orchestrator = orchestrator(&driver, settings);

        let err = orchestrator
            .provision(&test_avd(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind_name(), "BootTimeoutError");
        assert_eq!(err.state, Booting);
        assert_eq!(driver.count("getprop sys.boot_completed"), 1);

        let pids = driver.spawned_pids();
        assert_eq!(pids.len(), 1);
        assert!(process_gone(pids[0]));
        assert!(orchestrator.ports().claimed().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_provision_leaves_no_emulator() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.on("getprop sys.boot_completed", Reply::stdout("0\n"));
        let orchestrator = orchestrator(&driver, settings());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let err = orchestrator.provision(&test_avd(), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.state, Booting);

        let pids = driver.spawned_pids();
        assert_eq!(pids.len(), 1);
        assert!(process_gone(pids[0]));
    }

    #[tokio::test]
    async fn test_emulator_crash_while_booting() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.on(
            "getprop sys.boot_completed",
            Reply::failure(1, "error: device 'emulator-5556' not found"),
        );
        driver.set_spawn(SpawnBehavior::Exit {
            code: 1,
            output: "PANIC: Missing emulator engine program for 'arm' CPU.".to_string(),
            after: Duration::from_millis(200),
        });
        let orchestrator = orchestrator(&driver, settings());

        let err = orchestrator
            .provision(&test_avd(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.operation, Operation::WaitReady);
        match err.kind {
            FailureKind::Process(ProcessError::Exited { code, output_tail, .. }) => {
                assert_eq!(code, Some(1));
                assert!(output_tail.iter().any(|l| l.contains("PANIC")));
            }
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_failure_stops_before_boot() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.on("avdmanager create avd", Reply::failure(1, "Error: Package path is not valid."));
        let orchestrator = orchestrator(&driver, settings());

        let err = orchestrator
            .provision(&test_avd(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind_name(), "ProcessError");
        assert_eq!(err.state, Creating);
        assert!(driver.spawned_pids().is_empty());
    }

    #[tokio::test]
    async fn test_taken_port_is_rejected() {
        let driver = healthy_device();
        let orchestrator = orchestrator(&driver, settings());
        let _held = orchestrator.ports().claim(5556).unwrap();

        let err = orchestrator
            .provision(&test_avd(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind_name(), "ConfigurationError");
        assert_eq!(err.state, Created);
        assert!(driver.spawned_pids().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_provisions_get_distinct_ports() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.on("getprop sys.boot_completed", Reply::stdout("1\n"));
        let orchestrator = orchestrator(&driver, settings());
        let cancel = CancellationToken::new();

        let mut first = test_avd();
        first.start.port = None;
        let mut second = first.clone();
        second.id = "emulator-2".into();
        second.create.name = "otherAVD".into();

        let (a, b) = tokio::join!(
            orchestrator.provision(&first, &cancel),
            orchestrator.provision(&second, &cancel)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.port(), b.port());
        assert_eq!(orchestrator.ports().claimed().len(), 2);

        orchestrator.shutdown(a).await.unwrap();
        orchestrator.shutdown(b).await.unwrap();
        assert!(orchestrator.ports().claimed().is_empty());
    }

    #[tokio::test]
    async fn test_failed_deploy_can_be_retried() {
        let dir = TempDir::new().unwrap();
        let driver = healthy_device();
        let orchestrator = orchestrator(&driver, settings());
        let cancel = CancellationToken::new();
        let mut handle = orchestrator.provision(&test_avd(), &cancel).await.unwrap();

        let missing = PackageSpec::new("apk-1", dir.path().join("missing.apk"));
        let err = orchestrator
            .deploy(&mut handle, &missing, &aerogear_main(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind_name(), "InstallError");
        assert_eq!(err.state, Installing);
        assert_eq!(err.last_good, Some(Ready));
        assert!(err.user_message().contains("(state Installing, last good Ready)"));
        assert_eq!(handle.state(), Failed);
        assert_eq!(handle.last_good_state(), Some(Ready));
        assert!(handle.can_redeploy());

        let launched = orchestrator
            .deploy(&mut handle, &test_apk(&dir), &aerogear_main(), &cancel)
            .await
            .unwrap();
        assert_eq!(launched.component, "org.jboss.aerogear/.AeroGearMain");
        assert_eq!(
            &handle.history()[4..],
            &[
                Ready,
                Installing,
                Failed,
                Installing,
                Installed,
                Launching,
                LifecycleState::Launched,
            ]
        );
        assert_eq!(handle.last_good_state(), Some(LifecycleState::Launched));

        orchestrator.shutdown(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_boot_cannot_be_deployed() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(ScriptedDriver::new());
        driver.on("getprop sys.boot_completed", Reply::stdout("0\n"));
        let mut settings = settings();
        settings.readiness.max_wait = Duration::ZERO;
        let orchestrator = orchestrator(&driver, settings);
        let cancel = CancellationToken::new();

        let mut handle = DeviceHandle::new(&test_avd());
        orchestrator.create(&mut handle, &cancel).await.unwrap();
        orchestrator.boot(&mut handle, &cancel).await.unwrap();
        let err = orchestrator.wait_until_ready(&mut handle, &cancel).await.unwrap_err();
        assert_eq!(err.last_good, Some(Created));
        assert!(handle.is_running());
        assert!(!handle.can_redeploy());

        let err = orchestrator
            .deploy(&mut handle, &test_apk(&dir), &aerogear_main(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind_name(), "StatePreconditionError");
        assert_eq!(err.state, Failed);
        assert_eq!(handle.state(), Failed);
        assert_eq!(driver.count(" install "), 0);

        orchestrator.shutdown(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_caller_timeout_kills_emulator() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.on("getprop sys.boot_completed", Reply::stdout("0\n"));
        let orchestrator = orchestrator(&driver, settings());

        let outcome = tokio::time::timeout(
            Duration::from_millis(200),
            orchestrator.provision(&test_avd(), &CancellationToken::new()),
        )
        .await;
        assert!(outcome.is_err());

        let pids = driver.spawned_pids();
        assert_eq!(pids.len(), 1);
        assert!(wait_gone(pids[0]).await);
        assert!(orchestrator.ports().claimed().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_handle_kills_emulator() {
        let driver = healthy_device();
        let orchestrator = orchestrator(&driver, settings());

        let handle = orchestrator
            .provision(&test_avd(), &CancellationToken::new())
            .await
            .unwrap();
        let pid = handle.pid().unwrap();
        drop(handle);

        assert!(wait_gone(pid).await);
        assert!(orchestrator.ports().claimed().is_empty());
    }

    #[tokio::test]
    async fn test_detached_handle_keeps_emulator() {
        let driver = healthy_device();
        let orchestrator = orchestrator(&driver, settings());

        let handle = orchestrator
            .provision(&test_avd(), &CancellationToken::new())
            .await
            .unwrap();
        let pid = handle.detach().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!process_gone(pid));
        assert!(orchestrator.ports().claimed().is_empty());

        let status = std::process::Command::new("kill")
            .args(["-9", &pid.to_string()])
            .status()
            .unwrap();
        assert!(status.success());
        assert!(wait_gone(pid).await);
    }
}
