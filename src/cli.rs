use clap::{Args, Parser, Subcommand};

use crate::device::types::{Mode, Rgb8, SettingsPatch, TransportKind};

#[derive(Parser, Debug)]
#[command(author, version)]
#[command(about = "Talks to an afterburner LED controller over bluetooth LE or its WiFi WebSocket.", long_about = None)]
pub struct Cli {
    /// Log debug output, including every frame
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Use the WebSocket transport regardless of the config file
    #[arg(long, global = true, conflicts_with = "packet")]
    pub socket: bool,

    /// Use the bluetooth LE transport regardless of the config file
    #[arg(long, global = true)]
    pub packet: bool,

    #[command(subcommand)]
    pub command: CliCommand,
}

impl Cli {
    pub fn transport_override(&self) -> Option<TransportKind> {
        match (self.socket, self.packet) {
            (true, _) => Some(TransportKind::Socket),
            (_, true) => Some(TransportKind::Packet),
            _ => None,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Print throttle status and calibration updates
    Status {
        /// Stop after this many seconds
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },

    /// Print the settings stored on the device
    Show,

    /// Change settings and write all of them to the device
    Push(PushArgs),

    /// Throttle calibration (bluetooth LE only)
    #[command(subcommand)]
    Calibrate(CalibrateCommand),

    /// Print the config file, or write the defaults to it
    Config {
        #[arg(long)]
        write_defaults: bool,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrateCommand {
    Start,
    Reset,
    Show,
}

#[derive(Args, Debug, Default)]
pub struct PushArgs {
    /// linear, ease, pulse or 0-2
    #[arg(long, value_parser = parse_mode)]
    pub mode: Option<Mode>,

    /// r,g,b
    #[arg(long, value_parser = parse_color)]
    pub start_color: Option<Rgb8>,

    /// r,g,b
    #[arg(long, value_parser = parse_color)]
    pub end_color: Option<Rgb8>,

    /// Animation period in milliseconds (100-5000)
    #[arg(long)]
    pub speed: Option<u16>,

    /// 10-255
    #[arg(long)]
    pub brightness: Option<u8>,

    /// Number of LEDs on the strip (1-300)
    #[arg(long)]
    pub leds: Option<u16>,

    /// Afterburner threshold in percent (0-100)
    #[arg(long)]
    pub threshold: Option<u8>,
}

impl PushArgs {
    pub fn patch(&self) -> SettingsPatch {
        SettingsPatch {
            mode: self.mode,
            start_color: self.start_color,
            end_color: self.end_color,
            speed_ms: self.speed,
            brightness: self.brightness,
            led_count: self.leds,
            afterburner_threshold_pct: self.threshold,
        }
    }
}

fn parse_mode(value: &str) -> Result<Mode, String> {
    if let Ok(number) = value.parse::<u8>() {
        return Mode::try_from(number).map_err(|err| err.to_string());
    }

    Mode::all()
        .into_iter()
        .find(|mode| mode.to_string().eq_ignore_ascii_case(value))
        .ok_or_else(|| format!("unknown mode {:?}", value))
}

fn parse_color(value: &str) -> Result<Rgb8, String> {
    let parts = value
        .split(',')
        .map(|part| part.trim().parse::<u8>().map_err(|err| format!("{:?}: {}", part, err)))
        .collect::<Result<Vec<_>, _>>()?;

    match parts.as_slice() {
        [r, g, b] => Ok(Rgb8::new(*r, *g, *b)),
        _ => Err(format!("expected r,g,b but got {:?}", value)),
    }
}
