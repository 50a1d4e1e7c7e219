use autopilot::protocol::{decode, encode, Command, CommandId, FrameBuffer, ProtocolError};

#[test]
fn test_decode_inverts_encode() {
    let commands = [
        Command::Speed(10),
        Command::Distance(0),
        Command::Distance(u16::MAX),
        Command::Altitude(600),
        Command::Press(7),
        Command::Led(0),
        Command::Fuel(0x0abc),
        Command::Go(10000),
        Command::End,
        Command::Manual(1),
    ];
    for command in commands {
        let frame = encode(&command);
        assert_eq!(decode(&frame), Ok(command), "frame {:?}", frame);
    }
}

#[test]
fn test_exact_wire_bytes() {
    assert_eq!(&encode(&Command::Speed(10))[..], b"$SPD000a#");
    assert_eq!(&encode(&Command::Press(5))[..], b"$PRS05#");
    assert_eq!(&encode(&Command::Go(10000))[..], b"$GOO2710#");
    assert_eq!(&encode(&Command::Manual(0))[..], b"$MAN00#");
    assert_eq!(&encode(&Command::End)[..], b"$END#");
}

#[test]
fn test_malformed_frames_are_rejected() {
    assert!(matches!(
        decode(b"#DST0010#"),
        Err(ProtocolError::MissingStart { found: b'#' })
    ));
    assert!(matches!(
        decode(b"$DST0010$"),
        Err(ProtocolError::MissingEnd { found: b'$' })
    ));
    assert!(matches!(
        decode(b"$XYZ0010#"),
        Err(ProtocolError::UnknownCommand { id }) if &id == b"XYZ"
    ));
    assert!(matches!(
        decode(b"$DST00g0#"),
        Err(ProtocolError::InvalidPayload { id: CommandId::Distance, .. })
    ));
    assert!(matches!(
        decode(b"$DST010#"),
        Err(ProtocolError::InvalidPayload { .. })
    ));
    assert!(matches!(
        decode(b"$PRS0005#"),
        Err(ProtocolError::InvalidPayload { .. })
    ));
    assert!(matches!(decode(b"$EN#"), Err(ProtocolError::Truncated { .. })));
    assert!(decode(b"").is_err());
}

#[test]
fn test_unused_ids_are_recognized_but_unsupported() {
    assert!(matches!(
        decode(b"$TUR0001#"),
        Err(ProtocolError::Unsupported { id: CommandId::Turbulence })
    ));
    assert!(matches!(
        decode(b"$FRE0001#"),
        Err(ProtocolError::Unsupported { .. })
    ));
}

#[test]
fn test_frame_buffer_recovers_from_noise_and_restarts() {
    let mut buffer = FrameBuffer::new();
    let mut decoded = Vec::new();
    for &byte in b"xx$DST00$ALT2ee0#junk$END#" {
        buffer.push(byte);
        if let Some(result) = buffer.take_command() {
            decoded.push(result);
        }
    }
    assert_eq!(
        decoded,
        vec![Ok(Command::Altitude(0x2ee0)), Ok(Command::End)]
    );
}

#[test]
fn test_frame_buffer_reports_bad_frames_and_continues() {
    let mut buffer = FrameBuffer::new();
    let mut results = Vec::new();
    for &byte in b"$ZZZ00#$PRS04#" {
        buffer.push(byte);
        if let Some(result) = buffer.take_command() {
            results.push(result);
        }
    }
    assert_eq!(results.len(), 2);
    assert!(results[0].is_err());
    assert_eq!(results[1], Ok(Command::Press(4)));
}

#[test]
fn test_unconsumed_frame_is_discarded_by_next_byte() {
    let mut buffer = FrameBuffer::new();
    for &byte in b"$PRS04#" {
        buffer.push(byte);
    }
    assert!(buffer.is_complete());
    for &byte in b"$PRS05#" {
        buffer.push(byte);
    }
    assert_eq!(buffer.discarded_frames(), 1);
    assert_eq!(buffer.take_command(), Some(Ok(Command::Press(5))));
    assert_eq!(buffer.take(), None);
}
