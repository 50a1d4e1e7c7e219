use autopilot::config::TestCase;
use autopilot::link::{LinkReader, LinkWriter};
use autopilot::presentation::LogPresentation;
use autopilot::queue::CommandQueue;
use autopilot::scheduler::AlarmScheduler;
use autopilot::session::AutopilotSession;
use clap::{App, Arg};
use colored::*;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{info, warn, Level};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8090";
const LINK_READ_TIMEOUT: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("autopilot")
        .version("0.1.0")
        .author("Embedded Systems Lab")
        .about("✈️  Autopilot - arbitrates plane commands period by period")
        .arg(
            Arg::with_name("test-case")
                .help("Test case JSON file")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Plane host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Plane port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .validator(|v| match v.parse::<u16>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Port must be a valid number".into()),
                }),
        )
        .arg(
            Arg::with_name("log-level")
                .short("l")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log verbosity")
                .takes_value(true)
                .possible_values(&["error", "warn", "info", "debug", "trace"])
                .default_value("info"),
        )
        .get_matches();

    let level = match matches.value_of("log-level").unwrap_or("info") {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let path = matches.value_of("test-case").unwrap_or_default();
    let test_case = match TestCase::load(Path::new(path)) {
        Ok(test_case) => test_case,
        Err(e) => {
            eprintln!("{} {}", "❌ Error:".red().bold(), e);
            std::process::exit(1);
        }
    };

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT);
    let address = format!("{}:{}", host, port);
    println!("{} {}", "🔗 Connecting to plane at".cyan(), address.bold());

    // The link threads block on the socket, so hand them a std stream.
    let stream = TcpStream::connect(&address).await?.into_std()?;
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(LINK_READ_TIMEOUT))?;
    let read_half = stream.try_clone()?;

    let queue = Arc::new(CommandQueue::new(test_case.queue_timeout()));
    let screen = Arc::new(LogPresentation);
    let reader = LinkReader::spawn(read_half, Arc::clone(&queue), screen.clone())?;
    let link = Arc::new(LinkWriter::new(stream));
    let alarms = AlarmScheduler::start()?;

    let mut session = AutopilotSession::new(
        test_case,
        queue,
        link.clone(),
        screen,
        alarms.clone(),
    );
    session.start(Instant::now())?;
    println!("{}", "🚀 Go command sent, flight in progress".green().bold());

    let interrupt = session.finish_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, ending the flight");
            interrupt.raise();
        }
    });

    let stats = tokio::task::spawn_blocking(move || {
        session.wait_until_finished(None);
        session.finish()
    })
    .await??;

    reader.join();
    alarms.shutdown();
    info!("{} commands written to the plane", link.commands_sent());

    println!("{}", "🏁 Flight finished".green().bold());
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
