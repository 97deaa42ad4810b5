use std::env;
use futures::StreamExt;
use log::{info, warn, LevelFilter};
use tokio::time::{timeout, Duration};

use crate::cli::{CalibrateCommand, Cli, CliCommand};
use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::device::types::{ConnectionState, Settings, TransportKind};
use crate::device::DeviceLink;
use crate::error::AppRunError;

pub mod cli;
pub mod config;
pub mod device;
pub mod error;

/// How long `show` waits for the socket device to report its settings.
const SETTINGS_REPORT_WAIT: Duration = Duration::from_secs(3);

pub fn init_logging(level: LevelFilter) {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).expect("Failed to open LOG_FILE")
        );
    }

    dispatch.apply().expect("Failed to initialize logger");
}

pub fn run(cli: Cli) -> Result<(), AppRunError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|source| AppRunError::Runtime { source })?;

    runtime.block_on(run_async(cli))
}

async fn run_async(cli: Cli) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync()?;
    let mut locker = config_io.locker()?;
    // one process owns the device link for as long as this guard lives
    let _guard = locker.lock()?;

    let mut config = config_io.read().await?;

    if let CliCommand::Config { write_defaults } = cli.command {
        if write_defaults {
            config = Config::default();
            config_io.save(&config).await?;
        }
        println!("{}", config_io.path().to_string_lossy());
        println!("{}", serde_json::to_string_pretty(&config).map_err(crate::error::ConfigError::from)?);
        return Ok(());
    }

    if let Some(transport) = cli.transport_override() {
        config.transport = transport;
    }

    let link = DeviceLink::from_config(&config);
    let result = match connect(&link).await {
        Ok(()) => run_command(&link, &cli.command).await,
        Err(err) => Err(err),
    };

    link.disconnect().await;
    result
}

async fn connect(link: &DeviceLink) -> Result<(), AppRunError> {
    info!("Connecting over {:?}...", link.kind());

    match link.connect().await {
        ConnectionState::Ready => Ok(()),
        ConnectionState::Failed(kind) => Err(AppRunError::ConnectFailed { kind }),
        other => {
            warn!("Connect ended in state {}", other);
            Err(AppRunError::ConnectFailed { kind: crate::error::ErrorKind::NotConnected })
        },
    }
}

async fn run_command(link: &DeviceLink, command: &CliCommand) -> Result<(), AppRunError> {
    match command {
        CliCommand::Status { seconds } => {
            let status = link.subscribe_status(|status| match status.telemetry {
                Some(telemetry) => println!("throttle {:.3} mode {} {:?}", status.throttle, status.mode, telemetry),
                None => println!("throttle {:.3} mode {}", status.throttle, status.mode),
            });
            let calibration = link.subscribe_calibration(|calibration| println!("calibration {:?}", calibration));

            let mut states = link.watch_state();
            let _ = timeout(Duration::from_secs(*seconds), async {
                while states.changed().await.is_ok() {
                    let state = *states.borrow_and_update();
                    println!("state {}", state);
                    if let ConnectionState::Failed(_) = state {
                        break;
                    }
                }
            }).await;

            status.unsubscribe();
            calibration.unsubscribe();
        },
        CliCommand::Show => {
            if link.kind() == TransportKind::Socket {
                wait_for_settings(link).await;
            }
            print_settings(&link.read_cached());
        },
        CliCommand::Push(args) => {
            link.apply_local(&args.patch())?;
            link.push_all().await?;
            print_settings(&link.read_cached());
        },
        CliCommand::Calibrate(CalibrateCommand::Start) => {
            link.start_calibration().await?;
            println!("Calibration started; move the throttle through its full range");
        },
        CliCommand::Calibrate(CalibrateCommand::Reset) => {
            link.reset_calibration().await?;
            println!("Calibration reset");
            println!("{:?}", link.read_calibration().await?);
        },
        CliCommand::Calibrate(CalibrateCommand::Show) => {
            println!("{:?}", link.read_calibration().await?);
        },
        CliCommand::Config { .. } => {},
    }

    Ok(())
}

async fn wait_for_settings(link: &DeviceLink) {
    let (sender, mut receiver) = futures::channel::mpsc::unbounded();
    let unsubscribe = link.subscribe_settings(move |settings| {
        let _ = sender.unbounded_send(settings);
    });

    if timeout(SETTINGS_REPORT_WAIT, receiver.next()).await.is_err() {
        warn!("The device did not report its settings; showing the cached values");
    }
    unsubscribe.unsubscribe();
}

fn print_settings(settings: &Settings) {
    println!("mode         {}", settings.mode);
    println!("start color  {:?}", <(u8, u8, u8)>::from(settings.start_color));
    println!("end color    {:?}", <(u8, u8, u8)>::from(settings.end_color));
    println!("speed        {} ms", settings.speed_ms);
    println!("brightness   {}", settings.brightness);
    println!("leds         {}", settings.led_count);
    println!("threshold    {}%", settings.afterburner_threshold_pct);
}
