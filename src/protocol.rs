use arrayvec::ArrayString;
use core::fmt::{self, Write as _};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;
use tracing::{debug, error, warn};

pub const CMD_START_BYTE: u8 = b'$';
pub const CMD_END_BYTE: u8 = b'#';
pub const CMD_ID_LEN: usize = 3;
pub const MAX_PAYLOAD_WIDTH: usize = 4;
pub const MAX_FRAME_SIZE: usize = 16;

const_assert!(MAX_FRAME_SIZE >= 1 + CMD_ID_LEN + MAX_PAYLOAD_WIDTH + 1);

/// One encoded command, start and end markers included.
pub type Frame = Vec<u8, MAX_FRAME_SIZE>;

/// Altitude report periods understood by the plane, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum AltitudePeriod {
    /// Stop reporting altitude.
    Off = 0,
    Ms200 = 200,
    Ms400 = 400,
    Ms600 = 600,
}

impl AltitudePeriod {
    pub fn from_millis(value: u16) -> Option<Self> {
        match value {
            0 => Some(AltitudePeriod::Off),
            200 => Some(AltitudePeriod::Ms200),
            400 => Some(AltitudePeriod::Ms400),
            600 => Some(AltitudePeriod::Ms600),
            _ => None,
        }
    }

    pub fn millis(self) -> u16 {
        self as u16
    }
}

pub const LED_OFF: u8 = 0;
pub const LED_MIN: u8 = 1;
pub const LED_MAX: u8 = 4;

/// Three-letter command identifiers as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandId {
    Speed,
    Distance,
    Altitude,
    Press,
    Led,
    Fuel,
    Turbulence,
    AltitudeFreq,
    Go,
    End,
    Manual,
}

impl CommandId {
    pub const ALL: [CommandId; 11] = [
        CommandId::Speed,
        CommandId::Distance,
        CommandId::Altitude,
        CommandId::Press,
        CommandId::Led,
        CommandId::Fuel,
        CommandId::Turbulence,
        CommandId::AltitudeFreq,
        CommandId::Go,
        CommandId::End,
        CommandId::Manual,
    ];

    pub fn as_bytes(self) -> &'static [u8; CMD_ID_LEN] {
        match self {
            CommandId::Speed => b"SPD",
            CommandId::Distance => b"DST",
            CommandId::Altitude => b"ALT",
            CommandId::Press => b"PRS",
            CommandId::Led => b"LED",
            CommandId::Fuel => b"FUE",
            CommandId::Turbulence => b"TUR",
            CommandId::AltitudeFreq => b"FRE",
            CommandId::Go => b"GOO",
            CommandId::End => b"END",
            CommandId::Manual => b"MAN",
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.as_bytes() == bytes)
    }

    /// Number of hex digits carried after the id. `None` for ids the core never
    /// decodes.
    pub fn payload_width(self) -> Option<usize> {
        match self {
            CommandId::Speed
            | CommandId::Distance
            | CommandId::Altitude
            | CommandId::Fuel
            | CommandId::Go => Some(4),
            CommandId::Press | CommandId::Led | CommandId::Manual => Some(2),
            CommandId::End => Some(0),
            CommandId::Turbulence | CommandId::AltitudeFreq => None,
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_bytes().escape_ascii())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    Speed(u16),
    Distance(u16),
    Altitude(u16),
    /// Button pressed on the plane side.
    Press(u8),
    Led(u8),
    Fuel(u16),
    /// Start of the flight, carrying the total distance.
    Go(u16),
    End,
    Manual(u8),
}

impl Command {
    pub fn id(&self) -> CommandId {
        match self {
            Command::Speed(_) => CommandId::Speed,
            Command::Distance(_) => CommandId::Distance,
            Command::Altitude(_) => CommandId::Altitude,
            Command::Press(_) => CommandId::Press,
            Command::Led(_) => CommandId::Led,
            Command::Fuel(_) => CommandId::Fuel,
            Command::Go(_) => CommandId::Go,
            Command::End => CommandId::End,
            Command::Manual(_) => CommandId::Manual,
        }
    }

    fn payload(&self) -> Option<u16> {
        match *self {
            Command::Speed(v)
            | Command::Distance(v)
            | Command::Altitude(v)
            | Command::Fuel(v)
            | Command::Go(v) => Some(v),
            Command::Press(v) | Command::Led(v) | Command::Manual(v) => Some(u16::from(v)),
            Command::End => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.payload() {
            Some(value) => write!(f, "{}({})", self.id(), value),
            None => write!(f, "{}", self.id()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame of {len} bytes is too short")]
    Truncated { len: usize },
    #[error("frame does not begin with the start byte (found {found:#04x})")]
    MissingStart { found: u8 },
    #[error("frame does not end with the end byte (found {found:#04x})")]
    MissingEnd { found: u8 },
    #[error("unknown command id {}", .id.escape_ascii())]
    UnknownCommand { id: [u8; CMD_ID_LEN] },
    #[error("command id {id} has no decoder")]
    Unsupported { id: CommandId },
    #[error("invalid payload {payload:?} for {id}: expected {width} hex digits")]
    InvalidPayload {
        id: CommandId,
        payload: String,
        width: usize,
    },
}

/// Encodes a command into a self-delimited frame.
pub fn encode(command: &Command) -> Frame {
    let mut frame = Frame::new();
    let id = command.id();
    // Capacity is guaranteed by the const assertion on MAX_FRAME_SIZE.
    let _ = frame.push(CMD_START_BYTE);
    let _ = frame.extend_from_slice(id.as_bytes());
    if let (Some(value), Some(width)) = (command.payload(), id.payload_width()) {
        let mut digits = ArrayString::<MAX_PAYLOAD_WIDTH>::new();
        let _ = write!(digits, "{:0width$x}", value, width = width);
        let _ = frame.extend_from_slice(digits.as_bytes());
    }
    let _ = frame.push(CMD_END_BYTE);
    frame
}

/// Parses one complete frame.
pub fn decode(buffer: &[u8]) -> Result<Command, ProtocolError> {
    let (&first, &last) = match (buffer.first(), buffer.last()) {
        (Some(first), Some(last)) if buffer.len() >= CMD_ID_LEN + 2 => (first, last),
        _ => return Err(ProtocolError::Truncated { len: buffer.len() }),
    };
    if first != CMD_START_BYTE {
        return Err(ProtocolError::MissingStart { found: first });
    }
    if last != CMD_END_BYTE {
        return Err(ProtocolError::MissingEnd { found: last });
    }

    let raw_id = &buffer[1..=CMD_ID_LEN];
    let id = CommandId::from_bytes(raw_id).ok_or_else(|| {
        let mut unknown = [0u8; CMD_ID_LEN];
        unknown.copy_from_slice(raw_id);
        ProtocolError::UnknownCommand { id: unknown }
    })?;
    let width = id.payload_width().ok_or(ProtocolError::Unsupported { id })?;

    let payload = &buffer[1 + CMD_ID_LEN..buffer.len() - 1];
    let value = parse_hex(payload, width).ok_or_else(|| ProtocolError::InvalidPayload {
        id,
        payload: String::from_utf8_lossy(payload).into_owned(),
        width,
    })?;

    let narrow = || {
        u8::try_from(value).map_err(|_| ProtocolError::InvalidPayload {
            id,
            payload: String::from_utf8_lossy(payload).into_owned(),
            width,
        })
    };

    Ok(match id {
        CommandId::Speed => Command::Speed(value),
        CommandId::Distance => Command::Distance(value),
        CommandId::Altitude => Command::Altitude(value),
        CommandId::Fuel => Command::Fuel(value),
        CommandId::Go => Command::Go(value),
        CommandId::Press => Command::Press(narrow()?),
        CommandId::Led => Command::Led(narrow()?),
        CommandId::Manual => Command::Manual(narrow()?),
        CommandId::End => Command::End,
        CommandId::Turbulence | CommandId::AltitudeFreq => {
            return Err(ProtocolError::Unsupported { id })
        }
    })
}

fn parse_hex(payload: &[u8], width: usize) -> Option<u16> {
    if payload.len() != width {
        return None;
    }
    if width == 0 {
        return Some(0);
    }
    if !payload.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let text = core::str::from_utf8(payload).ok()?;
    u16::from_str_radix(text, 16).ok()
}

/// Incremental frame assembler fed one byte at a time from the link.
///
/// Holds at most one completed frame; it must be taken before the next byte
/// arrives.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Frame,
    complete: bool,
    discarded_frames: u32,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one byte. Returns `false` when the byte was dropped.
    pub fn push(&mut self, byte: u8) -> bool {
        if self.complete {
            error!(
                "Byte received but the previously built frame was never taken; discarding {:?}",
                self.buffer.escape_ascii().to_string()
            );
            self.discarded_frames = self.discarded_frames.saturating_add(1);
            self.reset();
        }

        if self.buffer.is_empty() {
            if byte != CMD_START_BYTE {
                return false;
            }
            let _ = self.buffer.push(byte);
            return true;
        }

        if byte == CMD_START_BYTE {
            warn!("Start byte received before the end byte, restarting frame");
            self.discarded_frames = self.discarded_frames.saturating_add(1);
            self.buffer.clear();
            let _ = self.buffer.push(byte);
            return true;
        }

        if self.buffer.push(byte).is_err() {
            warn!("Frame exceeded {} bytes without an end byte, discarding", MAX_FRAME_SIZE);
            self.discarded_frames = self.discarded_frames.saturating_add(1);
            self.reset();
            return false;
        }
        if byte == CMD_END_BYTE {
            self.complete = true;
        }
        true
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Takes the completed frame and resets the buffer.
    pub fn take(&mut self) -> Option<Frame> {
        if !self.complete {
            return None;
        }
        let frame = core::mem::take(&mut self.buffer);
        self.reset();
        Some(frame)
    }

    pub fn take_command(&mut self) -> Option<Result<Command, ProtocolError>> {
        self.take().map(|frame| {
            let parsed = decode(&frame);
            debug!("FrameBuffer parsed {:?}", parsed);
            parsed
        })
    }

    /// Partial or completed frames thrown away so far.
    pub fn discarded_frames(&self) -> u32 {
        self.discarded_frames
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.complete = false;
    }
}
