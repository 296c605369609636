//! avd-pilot command line entry point

use std::path::PathBuf;
use std::process::ExitCode;

use avd_pilot::commands::{DevicesCommand, RunCommand, ValidateCommand};
use clap::{ArgAction, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// avd-pilot version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(
    name = "avd-pilot",
    version,
    about = "Provision Android emulators and launch APK activities"
)]
struct Cli {
    /// More output (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Android SDK root (defaults to ANDROID_SDK_ROOT / ANDROID_HOME)
    #[arg(long, global = true)]
    sdk: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Provision emulators, install APKs and launch activities
    Run {
        #[arg(short, long)]
        config: PathBuf,
        /// Only this emulator id
        #[arg(long)]
        emulator: Option<String>,
        /// Only this APK id
        #[arg(long)]
        apk: Option<String>,
        /// Only this activity id
        #[arg(long)]
        activity: Option<String>,
        /// Leave emulators running after a successful run
        #[arg(long)]
        keep_running: bool,
        /// Provision distinct emulators concurrently
        #[arg(long)]
        parallel: bool,
    },
    /// Check a configuration file and print the planned launches
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// List devices reported by adb
    Devices,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    info!("avd-pilot v{}", VERSION);

    let result = match cli.cmd {
        Cmd::Run {
            config,
            emulator,
            apk,
            activity,
            keep_running,
            parallel,
        } => {
            let command = RunCommand {
                config,
                sdk: cli.sdk,
                emulator,
                apk,
                activity,
                keep_running,
                parallel,
            };
            command.execute().await.map(|report| {
                for (emulator, err) in report.failures() {
                    eprintln!("[{}] {}", emulator, err.user_message());
                }
                for device in &report.devices {
                    if let Some(pid) = device.detached_pid {
                        println!("[{}] still running (pid {})", device.emulator, pid);
                    }
                }
                report.exit_code()
            })
        }
        Cmd::Validate { config } => ValidateCommand { config }.execute().await.map(|_| 0),
        Cmd::Devices => DevicesCommand { sdk: cli.sdk }.execute().await.map(|_| 0),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{:#}", err);
            ExitCode::from(1)
        }
    }
}
