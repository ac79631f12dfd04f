//! `minipg` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::{
    connection::ParseError,
    postgres::{PgMessage, ProtocolError},
    value::{DecodeError, EncodeError},
};

/// A specialized [`Result`] type for `minipg` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `minipg` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub(crate) fn context(mut self, context: impl Into<String>) -> Error {
        self.context = context.into();
        self
    }
}

/// All possible error kind from `minipg` library.
pub enum ErrorKind {
    /// Socket dial/read/write failure.
    Io(io::Error),
    /// Malformed or unexpected wire traffic.
    Protocol(ProtocolError),
    /// An `ErrorResponse` reported by the server.
    Database(PgMessage),
    /// The server requested an authentication method other than MD5.
    UnsupportedAuth(UnsupportedAuth),
    /// A bind value could not be encoded.
    Encode(EncodeError),
    /// A result column could not be decoded.
    Decode(DecodeError),
    /// Connection url could not be parsed.
    Config(ParseError),
    /// The connection is closed; enqueued queries are dropped with this.
    ConnectionClosed,
    /// An operation was issued against a query in an incompatible state.
    InvalidState(&'static str),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<io::Error>e => ErrorKind::Io(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<PgMessage>e => ErrorKind::Database(e));
from!(<UnsupportedAuth>e => ErrorKind::UnsupportedAuth(e));
from!(<EncodeError>e => ErrorKind::Encode(e));
from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<ParseError>e => ErrorKind::Config(e));

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind {}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::UnsupportedAuth(e) => e.fmt(f),
            Self::Encode(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
            Self::Config(e) => e.fmt(f),
            Self::ConnectionClosed => f.write_str("connection closed"),
            Self::InvalidState(what) => f.write_str(what),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// The server requested an authentication method this client does not speak.
#[derive(Debug)]
pub struct UnsupportedAuth {
    pub(crate) method: i32,
}

impl std::error::Error for UnsupportedAuth {}

impl fmt::Display for UnsupportedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "authentication method {} requested by the server is not supported, only md5 and trust are",
            self.method,
        )
    }
}
