//! Byte transport collaborators and the two link threads' logic.

use crate::presentation::{Presentation, ScreenUpdate};
use crate::protocol::{encode, Command, FrameBuffer};
use crate::queue::CommandQueue;
use parking_lot::Mutex;
use std::io::{self, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// Blocking byte source. `Ok(None)` means the read timed out.
pub trait ByteSource: Send {
    fn read_one_byte(&mut self) -> io::Result<Option<u8>>;
}

pub trait ByteSink: Send {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Outbound command path used by agents.
pub trait CommandSink: Send + Sync {
    fn send(&self, command: Command);
}

impl ByteSource for TcpStream {
    fn read_one_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte) {
            Ok(0) => Err(io::Error::new(ErrorKind::UnexpectedEof, "link closed by peer")),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl ByteSink for TcpStream {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_all(bytes)?;
        self.flush()
    }
}

/// Serialises concurrent writers onto one byte sink.
pub struct LinkWriter<W: ByteSink> {
    sink: Mutex<W>,
    sent: Mutex<u64>,
}

impl<W: ByteSink> LinkWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink: Mutex::new(sink),
            sent: Mutex::new(0),
        }
    }

    pub fn commands_sent(&self) -> u64 {
        *self.sent.lock()
    }
}

impl<W: ByteSink> CommandSink for LinkWriter<W> {
    fn send(&self, command: Command) {
        debug!("Writing {}", command);
        let frame = encode(&command);
        let mut sink = self.sink.lock();
        match sink.write_bytes(&frame) {
            Ok(()) => *self.sent.lock() += 1,
            Err(e) => error!("Failed to write {}: {}", command, e),
        }
    }
}

/// Keeps every sent command in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    commands: Mutex<Vec<Command>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    pub fn count(&self, wanted: Command) -> usize {
        self.commands.lock().iter().filter(|&&c| c == wanted).count()
    }
}

impl CommandSink for RecordingSink {
    fn send(&self, command: Command) {
        self.commands.lock().push(command);
    }
}

/// Reads frames from the link and queues the decoded commands.
pub struct LinkReader {
    alive: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LinkReader {
    pub fn spawn<S>(
        source: S,
        queue: Arc<CommandQueue>,
        screen: Arc<dyn Presentation>,
    ) -> io::Result<Self>
    where
        S: ByteSource + 'static,
    {
        let alive = Arc::new(AtomicBool::new(true));
        let worker_alive = Arc::clone(&alive);
        let handle = thread::Builder::new()
            .name("link-reader".into())
            .spawn(move || read_loop(source, &queue, screen.as_ref(), &worker_alive))?;
        Ok(Self {
            alive,
            handle: Some(handle),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Stops after the current blocking read returns or times out.
    pub fn stop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn join(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Link reader thread panicked");
            }
        }
    }
}

fn read_loop<S: ByteSource>(
    mut source: S,
    queue: &CommandQueue,
    screen: &dyn Presentation,
    alive: &AtomicBool,
) {
    info!("Link reader thread has begun");
    let mut buffer = FrameBuffer::new();
    while alive.load(Ordering::SeqCst) {
        let byte = match source.read_one_byte() {
            Ok(Some(byte)) => byte,
            Ok(None) => {
                trace!("Link read timed out");
                continue;
            }
            Err(e) => {
                warn!("Link reader stopping: {}", e);
                break;
            }
        };
        buffer.push(byte);
        match buffer.take_command() {
            Some(Ok(command)) => {
                forward_report(&command, screen);
                debug!(
                    "Queueing {} received at {:.3}",
                    command,
                    queue.current_relative_timestamp()
                );
                queue.put(command, None);
            }
            Some(Err(e)) => warn!("Dropping malformed frame: {}", e),
            None => {}
        }
    }
    alive.store(false, Ordering::SeqCst);
    info!("Link reader thread is exiting");
}

fn forward_report(command: &Command, screen: &dyn Presentation) {
    match *command {
        Command::Distance(distance) => {
            info!("Distance report: {}", distance);
            screen.update(ScreenUpdate::Distance(distance));
        }
        Command::Altitude(altitude) => {
            info!("Altitude report: {}", altitude);
            screen.update(ScreenUpdate::Altitude(altitude));
        }
        _ => {}
    }
}
