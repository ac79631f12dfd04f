//! Protocol error and the server error/notice carrier.
use bytes::{Buf, Bytes};

/// An error when translating buffer from postgres.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("does not support the type of message in the protocol: 0x{tag:02x}")]
    UnknownTag { tag: u8 },
    #[error("protocol message size error: {len}")]
    FrameSize { len: i32 },
    #[error("data segmentation error")]
    Segmentation,
    #[error("protocol version 3.0 is not supported by the server")]
    VersionNegotiation,
    #[error("unexpected message 0x{found:02x} during {phase}")]
    UnexpectedPhase { found: u8, phase: &'static str },
    #[error("expected message 0x{expect:02x}, found 0x{found:02x}")]
    Unexpected { expect: u8, found: u8 },
    #[error("unknown ready status: 0x{status:02x}")]
    UnknownReadyStatus { status: u8 },
    #[error("postgres string did not nul terminated")]
    MissingNul,
    #[error("postgres sent non utf8 string: {0}")]
    NonUtf8(std::str::Utf8Error),
}

impl ProtocolError {
    pub(crate) fn unknown(tag: u8) -> ProtocolError {
        Self::UnknownTag { tag }
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected { expect, found }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::UnexpectedPhase { found, phase }
    }
}

/// An error or notice reported by the server.
///
/// The body of both `ErrorResponse` and `NoticeResponse` consists of
/// identified fields, each a code byte followed by a nul terminated string,
/// closed by a zero byte. Unrecognized fields are skipped.
///
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Clone, Default)]
pub struct PgMessage {
    severity: String,
    code: String,
    message: String,
}

impl PgMessage {
    /// Severity of the report, `ERROR`, `WARNING`, `NOTICE` and friends.
    pub fn severity(&self) -> &str {
        &self.severity
    }

    /// The SQLSTATE code.
    ///
    /// <https://www.postgresql.org/docs/current/errcodes-appendix.html>
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The primary human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Walk the identified fields of an `ErrorResponse` or `NoticeResponse`
    /// body.
    ///
    /// Fields are consumed strictly while inside the payload; absent fields
    /// stay empty. The localized `S` severity is a fallback for the
    /// non-localized `V`.
    pub(crate) fn parse(mut body: Bytes) -> PgMessage {
        let mut msg = PgMessage::default();
        let mut localized_severity = String::new();

        while body.has_remaining() {
            let field = body.get_u8();
            if field == 0 {
                break;
            }
            let value = match read_nul_str(&mut body) {
                Some(value) => value,
                None => break,
            };
            match field {
                b'V' => msg.severity = value,
                b'S' => localized_severity = value,
                b'C' => msg.code = value,
                b'M' => msg.message = value,
                _ => {}
            }
        }

        if msg.severity.is_empty() {
            msg.severity = localized_severity;
        }
        msg
    }
}

fn read_nul_str(body: &mut Bytes) -> Option<String> {
    let end = body.iter().position(|b| *b == 0)?;
    let value = String::from_utf8_lossy(&body[..end]).into_owned();
    body.advance(end + 1);
    Some(value)
}

impl std::error::Error for PgMessage {}

impl std::fmt::Display for PgMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.severity.is_empty() {
            write!(f, "{}: ", self.severity)?;
        }
        f.write_str(&self.message)?;
        if !self.code.is_empty() {
            write!(f, " ({})", self.code)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PgMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgMessage")
            .field("severity", &self.severity)
            .field("code", &self.code)
            .field("message", &self.message)
            .finish()
    }
}
