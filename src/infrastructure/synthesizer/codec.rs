//! Binary framing for the speech service's v3 WebSocket protocol.
//!
//! Every frame starts with a fixed four byte header:
//!
//! ```text
//! byte 0: protocol version (high nibble) | header size / 4 (low nibble)
//! byte 1: message type (high nibble)     | flags (low nibble)
//! byte 2: serialization (high nibble)    | compression (low nibble)
//! byte 3: reserved
//! ```
//!
//! After the header come optional sections in a fixed order: a signed
//! sequence number when the sequence flag bits are set, a big-endian event
//! code when the event flag is set, a length-prefixed session id for
//! session-scoped events, a u32 error code for error frames, and finally
//! the length-prefixed payload.

use super::SynthesisError;

pub const PROTOCOL_VERSION: u8 = 0b0001;
pub const HEADER_SIZE_WORDS: u8 = 0b0001;

pub const FLAG_POSITIVE_SEQ: u8 = 0b0001;
pub const FLAG_NEGATIVE_SEQ: u8 = 0b0011;
pub const FLAG_WITH_EVENT: u8 = 0b0100;

pub const SERIALIZATION_RAW: u8 = 0b0000;
pub const SERIALIZATION_JSON: u8 = 0b0001;
pub const COMPRESSION_NONE: u8 = 0b0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    FullClientRequest = 0b0001,
    AudioOnlyClient = 0b0010,
    FullServerResponse = 0b1001,
    AudioOnlyServer = 0b1011,
    FrontEndResultServer = 0b1100,
    Error = 0b1111,
}

impl MsgType {
    fn from_nibble(value: u8) -> Result<Self, SynthesisError> {
        match value {
            0b0001 => Ok(Self::FullClientRequest),
            0b0010 => Ok(Self::AudioOnlyClient),
            0b1001 => Ok(Self::FullServerResponse),
            0b1011 => Ok(Self::AudioOnlyServer),
            0b1100 => Ok(Self::FrontEndResultServer),
            0b1111 => Ok(Self::Error),
            other => Err(SynthesisError::Protocol(format!(
                "unknown message type {:#06b}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
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
    PodcastRoundStart,
    PodcastRoundResponse,
    PodcastRoundEnd,
    PodcastEnd,
    /// Event codes this client does not interpret. The service adds
    /// informational events over time; receivers skip these instead of
    /// failing the session.
    Unknown(u32),
}

impl EventType {
    pub fn code(self) -> u32 {
        match self {
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
            Self::PodcastRoundStart => 360,
            Self::PodcastRoundResponse => 361,
            Self::PodcastRoundEnd => 362,
            Self::PodcastEnd => 363,
            Self::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
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
            360 => Self::PodcastRoundStart,
            361 => Self::PodcastRoundResponse,
            362 => Self::PodcastRoundEnd,
            363 => Self::PodcastEnd,
            other => Self::Unknown(other),
        }
    }

    /// Connection-level events (codes below 100) travel without a session
    /// id; everything from `StartSession` up is scoped to one. Unrecognized
    /// codes follow the same numbering convention.
    pub fn carries_session_id(self) -> bool {
        self.code() >= Self::StartSession.code()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MsgType,
    pub flags: u8,
    pub sequence: Option<i32>,
    pub event: Option<EventType>,
    pub session_id: Option<String>,
    pub error_code: Option<u32>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn event(msg_type: MsgType, event: EventType, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            flags: FLAG_WITH_EVENT,
            sequence: None,
            event: Some(event),
            session_id: None,
            error_code: None,
            payload,
        }
    }

    pub fn session_event(
        msg_type: MsgType,
        event: EventType,
        session_id: &str,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            ..Self::event(msg_type, event, payload)
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        let serialization = match self.msg_type {
            MsgType::AudioOnlyClient | MsgType::AudioOnlyServer => SERIALIZATION_RAW,
            _ => SERIALIZATION_JSON,
        };
        let mut out = Vec::with_capacity(16 + self.payload.len());
        out.push((PROTOCOL_VERSION << 4) | HEADER_SIZE_WORDS);
        out.push(((self.msg_type as u8) << 4) | self.flags);
        out.push((serialization << 4) | COMPRESSION_NONE);
        out.push(0);

        if self.flags & FLAG_POSITIVE_SEQ != 0 {
            out.extend_from_slice(&self.sequence.unwrap_or(0).to_be_bytes());
        }
        if self.flags & FLAG_WITH_EVENT != 0 {
            let event = self.event.expect("event flag set without an event");
            out.extend_from_slice(&event.code().to_be_bytes());
            if event.carries_session_id() {
                let session = self.session_id.as_deref().unwrap_or("");
                out.extend_from_slice(&(session.len() as u32).to_be_bytes());
                out.extend_from_slice(session.as_bytes());
            }
        }
        if self.msg_type == MsgType::Error {
            out.extend_from_slice(&self.error_code.unwrap_or(0).to_be_bytes());
        }
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self, SynthesisError> {
        let mut cursor = Cursor::new(data);
        let b0 = cursor.u8()?;
        if b0 >> 4 != PROTOCOL_VERSION {
            return Err(SynthesisError::Protocol(format!(
                "unsupported protocol version {}",
                b0 >> 4
            )));
        }
        let b1 = cursor.u8()?;
        let msg_type = MsgType::from_nibble(b1 >> 4)?;
        let flags = b1 & 0x0f;
        cursor.skip(2)?;

        let sequence = if flags & FLAG_POSITIVE_SEQ != 0 {
            Some(cursor.i32()?)
        } else {
            None
        };

        let mut event = None;
        let mut session_id = None;
        if flags & FLAG_WITH_EVENT != 0 {
            let parsed = EventType::from_code(cursor.u32()?);
            if parsed.carries_session_id() {
                let len = cursor.u32()? as usize;
                let raw = cursor.bytes(len)?;
                session_id = Some(String::from_utf8_lossy(raw).into_owned());
            }
            event = Some(parsed);
        }

        let error_code = if msg_type == MsgType::Error {
            Some(cursor.u32()?)
        } else {
            None
        };

        let len = cursor.u32()? as usize;
        let payload = cursor.bytes(len)?.to_vec();

        Ok(Self {
            msg_type,
            flags,
            sequence,
            event,
            session_id,
            error_code,
            payload,
        })
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], SynthesisError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                SynthesisError::Protocol(format!(
                    "frame truncated: wanted {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.data.len()
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<(), SynthesisError> {
        self.bytes(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, SynthesisError> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, SynthesisError> {
        let raw = self.bytes(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn i32(&mut self) -> Result<i32, SynthesisError> {
        let raw = self.bytes(4)?;
        Ok(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
}

// ---- client handshake frames -------------------------------------------

pub fn start_connection() -> Message {
    Message::event(
        MsgType::FullClientRequest,
        EventType::StartConnection,
        b"{}".to_vec(),
    )
}

pub fn finish_connection() -> Message {
    Message::event(
        MsgType::FullClientRequest,
        EventType::FinishConnection,
        b"{}".to_vec(),
    )
}

pub fn start_session(session_id: &str, payload: Vec<u8>) -> Message {
    Message::session_event(
        MsgType::FullClientRequest,
        EventType::StartSession,
        session_id,
        payload,
    )
}

pub fn finish_session(session_id: &str) -> Message {
    Message::session_event(
        MsgType::FullClientRequest,
        EventType::FinishSession,
        session_id,
        b"{}".to_vec(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trips_connection_event() {
        let msg = start_connection();
        let decoded = Message::unmarshal(&msg.marshal()).unwrap();
        assert_eq!(decoded.msg_type, MsgType::FullClientRequest);
        assert_eq!(decoded.event, Some(EventType::StartConnection));
        assert_eq!(decoded.session_id, None);
        assert_eq!(decoded.payload, b"{}");
    }

    #[test]
    fn round_trips_session_event_with_id() {
        let msg = start_session("sess-42", br#"{"action":3}"#.to_vec());
        let decoded = Message::unmarshal(&msg.marshal()).unwrap();
        assert_eq!(decoded.event, Some(EventType::StartSession));
        assert_eq!(decoded.session_id.as_deref(), Some("sess-42"));
        assert_eq!(decoded.payload, br#"{"action":3}"#);
    }

    #[test]
    fn error_frame_carries_code() {
        let err = Message {
            msg_type: MsgType::Error,
            flags: 0,
            sequence: None,
            event: None,
            session_id: None,
            error_code: Some(45000292),
            payload: br#"{"error":"quota"}"#.to_vec(),
        };
        let decoded = Message::unmarshal(&err.marshal()).unwrap();
        assert_eq!(decoded.msg_type, MsgType::Error);
        assert_eq!(decoded.error_code, Some(45000292));
        assert_eq!(decoded.payload, br#"{"error":"quota"}"#);
    }

    #[test]
    fn rejects_truncated_frame() {
        let mut raw = start_connection().marshal();
        raw.truncate(raw.len() - 1);
        assert!(matches!(
            Message::unmarshal(&raw),
            Err(SynthesisError::Protocol(_))
        ));
    }

    #[test]
    fn rejects_unknown_message_type() {
        // Version ok, message type nibble 0b0101 is unassigned.
        let raw = [0x11, 0b0101_0000, 0x10, 0x00, 0, 0, 0, 0];
        assert!(matches!(
            Message::unmarshal(&raw),
            Err(SynthesisError::Protocol(_))
        ));
    }

    #[test]
    fn preserves_unassigned_event_codes() {
        let msg = Message::session_event(
            MsgType::FullServerResponse,
            EventType::Unknown(350),
            "sess-7",
            b"{}".to_vec(),
        );
        let decoded = Message::unmarshal(&msg.marshal()).unwrap();
        assert_eq!(decoded.event, Some(EventType::Unknown(350)));
        assert_eq!(decoded.session_id.as_deref(), Some("sess-7"));
    }

    #[test]
    fn audio_frames_marshal_as_raw_serialization() {
        let msg = Message::session_event(
            MsgType::AudioOnlyServer,
            EventType::PodcastRoundResponse,
            "s",
            vec![1, 2, 3],
        );
        let raw = msg.marshal();
        assert_eq!(raw[2] >> 4, SERIALIZATION_RAW);
        let decoded = Message::unmarshal(&raw).unwrap();
        assert_eq!(decoded.payload, vec![1, 2, 3]);
    }
}
