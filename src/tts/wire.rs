//! Binary framing for the bidirectional TTS backend.
//!
//! Every frame starts with a 4-byte header packed as two 4-bit nibbles per
//! byte: `[version|header_size, msg_type|flags, serialization|compression,
//! reserved]`. Event-flagged frames follow with a big-endian 32-bit event
//! code and, depending on the event, length-prefixed id/metadata strings and
//! a length-prefixed payload.

use crate::error::{DialogueError, Result};

/// Protocol version nibble.
pub const PROTOCOL_VERSION: u8 = 0b0001;
/// Header size nibble (in 4-byte units).
pub const HEADER_SIZE: u8 = 0b0001;

/// Flag nibble: the optional section starts with an event code.
pub const FLAG_WITH_EVENT: u8 = 0b0100;

/// Serialization nibble values.
pub const SERIALIZATION_NONE: u8 = 0b0000;
pub const SERIALIZATION_JSON: u8 = 0b0001;

/// Compression nibble values.
pub const COMPRESSION_NONE: u8 = 0b0000;

/// Frame kind, from the second header byte's high nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    FullClientRequest,
    FullServerResponse,
    AudioOnlyResponse,
    ErrorInformation,
}

impl MessageType {
    fn nibble(self) -> u8 {
        match self {
            Self::FullClientRequest => 0b0001,
            Self::FullServerResponse => 0b1001,
            Self::AudioOnlyResponse => 0b1011,
            Self::ErrorInformation => 0b1111,
        }
    }

    fn from_nibble(nibble: u8) -> Result<Self> {
        match nibble {
            0b0001 => Ok(Self::FullClientRequest),
            0b1001 => Ok(Self::FullServerResponse),
            0b1011 => Ok(Self::AudioOnlyResponse),
            0b1111 => Ok(Self::ErrorInformation),
            other => Err(DialogueError::Protocol(format!(
                "unknown TTS message type nibble {other:#06b}"
            ))),
        }
    }
}

/// Event codes used by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    None,
    StartConnection,
    FinishConnection,
    ConnectionStarted,
    ConnectionFailed,
    ConnectionFinished,
    StartSession,
    FinishSession,
    SessionStarted,
    SessionFinished,
    SessionFailed,
    TaskRequest,
    TtsSentenceStart,
    TtsSentenceEnd,
    TtsResponse,
}

impl Event {
    pub fn code(self) -> i32 {
        match self {
            Self::None => 0,
            Self::StartConnection => 1,
            Self::FinishConnection => 2,
            Self::ConnectionStarted => 50,
            Self::ConnectionFailed => 51,
            Self::ConnectionFinished => 52,
            Self::StartSession => 100,
            Self::FinishSession => 102,
            Self::SessionStarted => 150,
            Self::SessionFinished => 152,
            Self::SessionFailed => 153,
            Self::TaskRequest => 200,
            Self::TtsSentenceStart => 350,
            Self::TtsSentenceEnd => 351,
            Self::TtsResponse => 352,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        Ok(match code {
            0 => Self::None,
            1 => Self::StartConnection,
            2 => Self::FinishConnection,
            50 => Self::ConnectionStarted,
            51 => Self::ConnectionFailed,
            52 => Self::ConnectionFinished,
            100 => Self::StartSession,
            102 => Self::FinishSession,
            150 => Self::SessionStarted,
            152 => Self::SessionFinished,
            153 => Self::SessionFailed,
            200 => Self::TaskRequest,
            350 => Self::TtsSentenceStart,
            351 => Self::TtsSentenceEnd,
            352 => Self::TtsResponse,
            other => {
                return Err(DialogueError::Protocol(format!(
                    "unknown TTS event code {other}"
                )));
            }
        })
    }

    /// Which optional fields accompany this event, in wire order.
    fn layout(self) -> FieldLayout {
        match self {
            Self::None => FieldLayout::default(),
            Self::StartConnection | Self::FinishConnection => FieldLayout {
                payload: true,
                ..FieldLayout::default()
            },
            Self::ConnectionStarted => FieldLayout {
                connection_id: true,
                ..FieldLayout::default()
            },
            Self::ConnectionFailed => FieldLayout {
                meta: true,
                ..FieldLayout::default()
            },
            Self::SessionStarted | Self::SessionFinished | Self::SessionFailed => FieldLayout {
                session_id: true,
                meta: true,
                ..FieldLayout::default()
            },
            // Everything else carries the generic id + payload shape,
            // including the ConnectionFinished acknowledgment.
            Self::ConnectionFinished
            | Self::StartSession
            | Self::FinishSession
            | Self::TaskRequest
            | Self::TtsSentenceStart
            | Self::TtsSentenceEnd
            | Self::TtsResponse => FieldLayout {
                session_id: true,
                payload: true,
                ..FieldLayout::default()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct FieldLayout {
    connection_id: bool,
    session_id: bool,
    meta: bool,
    payload: bool,
}

/// One decoded (or to-be-encoded) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub flags: u8,
    pub serialization: u8,
    pub compression: u8,
    pub event: Event,
    pub connection_id: Option<String>,
    pub session_id: Option<String>,
    pub meta: Option<String>,
    pub error_code: Option<i32>,
    pub payload: Option<Vec<u8>>,
}

impl Frame {
    /// A client request frame carrying `event` plus its fields.
    pub fn request(event: Event, session_id: Option<&str>, payload: Option<&[u8]>) -> Self {
        Self {
            message_type: MessageType::FullClientRequest,
            flags: FLAG_WITH_EVENT,
            serialization: SERIALIZATION_JSON,
            compression: COMPRESSION_NONE,
            event,
            connection_id: None,
            session_id: session_id.map(str::to_owned),
            meta: None,
            error_code: None,
            payload: payload.map(<[u8]>::to_vec),
        }
    }

    /// Encode to the wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            16 + self.payload.as_ref().map_or(0, Vec::len)
                + self.session_id.as_ref().map_or(0, String::len),
        );
        out.push((PROTOCOL_VERSION << 4) | HEADER_SIZE);
        out.push((self.message_type.nibble() << 4) | (self.flags & 0x0f));
        out.push((self.serialization << 4) | (self.compression & 0x0f));
        out.push(0);

        if self.message_type == MessageType::ErrorInformation {
            out.extend_from_slice(&self.error_code.unwrap_or(0).to_be_bytes());
            write_block(&mut out, self.payload.as_deref().unwrap_or_default());
            return out;
        }

        if self.flags & FLAG_WITH_EVENT != 0 {
            out.extend_from_slice(&self.event.code().to_be_bytes());
            let layout = self.event.layout();
            if layout.connection_id {
                write_block(&mut out, self.connection_id.as_deref().unwrap_or_default().as_bytes());
            }
            if layout.session_id {
                write_block(&mut out, self.session_id.as_deref().unwrap_or_default().as_bytes());
            }
            if layout.meta {
                write_block(&mut out, self.meta.as_deref().unwrap_or_default().as_bytes());
            }
            if layout.payload {
                write_block(&mut out, self.payload.as_deref().unwrap_or_default());
            }
        }
        out
    }

    /// Decode a wire frame.
    ///
    /// # Errors
    ///
    /// Fails on short input, unknown type/event nibbles, or truncated
    /// length-prefixed blocks.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(DialogueError::Protocol(format!(
                "TTS frame too short: {} bytes",
                bytes.len()
            )));
        }
        let message_type = MessageType::from_nibble(bytes[1] >> 4)?;
        let flags = bytes[1] & 0x0f;
        let serialization = bytes[2] >> 4;
        let compression = bytes[2] & 0x0f;

        let mut frame = Self {
            message_type,
            flags,
            serialization,
            compression,
            event: Event::None,
            connection_id: None,
            session_id: None,
            meta: None,
            error_code: None,
            payload: None,
        };
        let mut offset = 4;

        if message_type == MessageType::ErrorInformation {
            frame.error_code = Some(read_i32(bytes, &mut offset)?);
            frame.payload = Some(read_block(bytes, &mut offset)?);
            return Ok(frame);
        }

        if flags & FLAG_WITH_EVENT != 0 {
            frame.event = Event::from_code(read_i32(bytes, &mut offset)?)?;
            let layout = frame.event.layout();
            if layout.connection_id {
                frame.connection_id = Some(read_string(bytes, &mut offset)?);
            }
            if layout.session_id {
                frame.session_id = Some(read_string(bytes, &mut offset)?);
            }
            if layout.meta {
                frame.meta = Some(read_string(bytes, &mut offset)?);
            }
            if layout.payload {
                frame.payload = Some(read_block(bytes, &mut offset)?);
            }
        }
        Ok(frame)
    }
}

fn write_block(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as i32).to_be_bytes());
    out.extend_from_slice(data);
}

fn read_i32(bytes: &[u8], offset: &mut usize) -> Result<i32> {
    let end = *offset + 4;
    let slice = bytes
        .get(*offset..end)
        .ok_or_else(|| DialogueError::Protocol("TTS frame truncated reading i32".to_owned()))?;
    *offset = end;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(slice);
    Ok(i32::from_be_bytes(buf))
}

fn read_block(bytes: &[u8], offset: &mut usize) -> Result<Vec<u8>> {
    let len = read_i32(bytes, offset)?;
    let len = usize::try_from(len)
        .map_err(|_| DialogueError::Protocol(format!("negative TTS block length {len}")))?;
    let end = *offset + len;
    let slice = bytes
        .get(*offset..end)
        .ok_or_else(|| DialogueError::Protocol("TTS frame truncated reading block".to_owned()))?;
    *offset = end;
    Ok(slice.to_vec())
}

fn read_string(bytes: &[u8], offset: &mut usize) -> Result<String> {
    let block = read_block(bytes, offset)?;
    String::from_utf8(block)
        .map_err(|e| DialogueError::Protocol(format!("TTS frame string not UTF-8: {e}")))
}
