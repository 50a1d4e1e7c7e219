//! Mock plane for exercising the autopilot over TCP.
//!
//! Reports its remaining distance once per period, switches to altitude
//! reports when asked for a frequency, and presses the button for any LED the
//! autopilot lights.

use autopilot::agents::led::button_for_led;
use autopilot::protocol::{encode, Command, FrameBuffer};
use clap::{App, Arg};
use colored::*;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error, info, warn};

const DEFAULT_PORT: &str = "8090";
const DEFAULT_PERIOD_MS: &str = "100";
const DEFAULT_ALTITUDE: &str = "11000";
const COMMAND_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Clone, Copy)]
struct PlaneConfig {
    period: Duration,
    altitude: u16,
}

#[derive(Debug, Default)]
struct PlaneState {
    flying: bool,
    period_number: u32,
    remaining: u16,
    /// Periods between altitude reports, 0 when disabled.
    altitude_stride: u32,
    altitude_since: u32,
    pending_press: Option<u8>,
    manual: bool,
}

impl PlaneState {
    fn apply(&mut self, command: Command, config: &PlaneConfig) -> bool {
        match command {
            Command::Go(total) => {
                info!("🛫 Go received, distance to fly: {}", total);
                self.flying = true;
                self.remaining = total;
                self.period_number = 0;
            }
            Command::Speed(speed) => {
                self.remaining = self.remaining.saturating_sub(speed);
            }
            Command::Altitude(millis) => {
                let period_ms = config.period.as_millis().max(1) as u32;
                self.altitude_stride = u32::from(millis) / period_ms;
                self.altitude_since = self.period_number;
                info!("Altitude reports every {} periods", self.altitude_stride);
            }
            Command::Led(led) => {
                self.pending_press = button_for_led(led);
            }
            Command::Manual(value) => {
                self.manual = value != 0;
                info!("Manual mode {}", if self.manual { "on" } else { "off" });
            }
            Command::End => {
                info!("🛬 End received");
                return false;
            }
            other => warn!("Plane ignores {}", other),
        }
        true
    }

    /// Report for the period that just started, if any.
    fn tick(&mut self, config: &PlaneConfig) -> Option<Command> {
        if !self.flying {
            return None;
        }
        self.period_number += 1;
        let since = self.period_number.saturating_sub(self.altitude_since);
        if self.altitude_stride > 0 && since > 0 && since % self.altitude_stride == 0 {
            return Some(Command::Altitude(config.altitude));
        }
        if let Some(button) = self.pending_press.take() {
            return Some(Command::Press(button));
        }
        Some(Command::Distance(self.remaining))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("autopilot-plane")
        .version("0.1.0")
        .author("Embedded Systems Lab")
        .about("🛩️  Mock plane speaking the autopilot wire protocol")
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Port to listen on")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("period")
                .long("period")
                .value_name("MILLIS")
                .help("Report period in milliseconds")
                .takes_value(true)
                .default_value(DEFAULT_PERIOD_MS),
        )
        .arg(
            Arg::with_name("altitude")
                .long("altitude")
                .value_name("ALTITUDE")
                .help("Altitude reported when asked")
                .takes_value(true)
                .default_value(DEFAULT_ALTITUDE),
        )
        .get_matches();

    let period_ms: u64 = matches.value_of("period").unwrap_or(DEFAULT_PERIOD_MS).parse()?;
    let config = PlaneConfig {
        period: Duration::from_millis(period_ms.max(1)),
        altitude: matches.value_of("altitude").unwrap_or(DEFAULT_ALTITUDE).parse()?,
    };
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT);

    println!("{}", "🛩️  Mock Plane".bold());
    println!("================");

    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!("🌐 Waiting for the autopilot on port {}", port);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("🔗 Autopilot connected: {}", addr);
        match fly(stream, config).await {
            Ok(()) => println!("{}", "✅ Flight completed".green()),
            Err(e) => println!("{} {}", "❌ Flight aborted:".red(), e),
        }
    }
}

async fn fly(stream: TcpStream, config: PlaneConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Command>(COMMAND_CHANNEL_SIZE);

    let read_task = tokio::spawn(async move {
        let mut frames = FrameBuffer::new();
        let mut chunk = [0u8; 64];
        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("Link read failed: {}", e);
                    break;
                }
            };
            for &byte in &chunk[..n] {
                frames.push(byte);
                match frames.take_command() {
                    Some(Ok(command)) => {
                        if tx.send(command).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => warn!("Dropping malformed frame: {}", e),
                    None => {}
                }
            }
        }
    });

    let mut state = PlaneState::default();
    let mut interval = time::interval(config.period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Some(report) = state.tick(&config) {
                    debug!("Period {} report {}", state.period_number, report);
                    send(&mut writer, report).await?;
                }
            }
            received = rx.recv() => {
                let Some(command) = received else {
                    error!("Autopilot closed the link");
                    break;
                };
                if matches!(command, Command::Go(_)) {
                    // Period 0 starts at the go command.
                    interval.reset();
                }
                if !state.apply(command, &config) {
                    break;
                }
            }
        }
    }

    read_task.abort();
    Ok(())
}

async fn send(writer: &mut OwnedWriteHalf, command: Command) -> std::io::Result<()> {
    writer.write_all(&encode(&command)).await
}
