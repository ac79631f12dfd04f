//! Postgres Frontend Messages
//!
//! All struct fields here mirror the actual message sent to postgres.
use bytes::{BufMut, BytesMut};

use crate::ext::{BufMutExt, UsizeExt};

/// Write the buffer length at the first 4 bytes.
///
/// Note to exclude the message tag when writing postgres message length.
fn pg_write_len(mut buf: &mut [u8]) {
    let len = buf.len().to_i32();
    buf.put_i32(len);
}

/// Write a frontend message to `buf`.
///
/// The length word is reserved up front and patched after the body has been
/// serialised, so messages with non obvious sizes (`Bind`) take the same path
/// as everything else.
pub fn write<F: FrontendProtocol>(msg: F, buf: &mut BytesMut) {
    buf.put_u8(F::MSGTYPE);
    let offset = buf.len();
    buf.put_i32(0);
    msg.encode_body(buf);
    pg_write_len(&mut buf[offset..]);
}

/// A type which can be encoded into postgres frontend message.
///
/// For historical reasons, the very first message sent by the client (the
/// startup message) has no initial message-type byte.
///
/// Thus, [`Startup`] does not implement [`FrontendProtocol`].
pub trait FrontendProtocol {
    /// Message type tag.
    const MSGTYPE: u8;

    /// Write the main body of the message, everything after the length word.
    fn encode_body(self, buf: &mut BytesMut);
}

/// Postgres Startup frontend message.
///
/// For historical reasons, the very first message sent by the client (the
/// startup message) has no initial message-type byte, and its length word
/// includes itself.
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required; there is no default.
    pub user: &'a str,
    /// The database to connect to. Defaults to the user name.
    pub database: Option<&'a str>,
}

impl Startup<'_> {
    pub fn write(self, buf: &mut BytesMut) {
        let offset = buf.len();

        // Int32 Length of message contents in bytes, including self.
        // reserve 4 bytes for length
        buf.put_i32(0);

        // Int32(196608)
        // The protocol version number. The most significant 16 bits are the
        // major version number (3 for the protocol described here). The least
        // significant 16 bits are the minor version number (0).
        buf.put_i32(196608);

        // The protocol version number is followed by one or more pairs of
        // parameter name and value strings.

        buf.put_nul_string("user");
        buf.put_nul_string(self.user);

        if let Some(db) = self.database {
            buf.put_nul_string("database");
            buf.put_nul_string(db);
        }

        // A zero byte is required as a terminator after the last name/value pair.
        buf.put_u8(b'\0');

        // write the length, Startup has no message tag
        pg_write_len(&mut buf[offset..]);
    }
}

/// Identifies the message as a password response.
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    /// The password (encrypted, if requested).
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';

    fn encode_body(self, buf: &mut BytesMut) {
        buf.put_nul_string(self.password);
    }
}

/// Identifies the message as a Parse command.
pub struct Parse<'a> {
    /// Prepared statement name (an empty string selects the unnamed prepared
    /// statement).
    pub statement: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
}

impl FrontendProtocol for Parse<'_> {
    const MSGTYPE: u8 = b'P';

    fn encode_body(self, buf: &mut BytesMut) {
        buf.put_nul_string(self.statement);
        buf.put_nul_string(self.sql);

        // The number of parameter data types specified (can be zero).
        //
        // Leaving the list empty lets the server infer every parameter type;
        // the inferred oids come back in `ParameterDescription`.
        buf.put_i16(0);
    }
}

/// Identifies the message as a Bind command.
///
/// Opens the unnamed portal over `statement` with every parameter and every
/// result column in binary format.
pub struct Bind<'a> {
    /// The name of the source prepared statement (an empty string selects the
    /// unnamed prepared statement).
    pub statement: &'a str,
    /// The number of parameter values.
    ///
    /// This must match the number of parameters needed by the query.
    pub params_len: u16,
    /// Parameter values, each already length prefixed in the binary format.
    pub params: &'a [u8],
}

impl FrontendProtocol for Bind<'_> {
    const MSGTYPE: u8 = b'B';

    fn encode_body(self, buf: &mut BytesMut) {
        // unnamed destination portal
        buf.put_nul_string("");
        buf.put_nul_string(self.statement);

        if self.params_len == 0 {
            // no parameter format codes, no parameters
            buf.put_i16(0);
            buf.put_i16(0);
        } else {
            // a single format code applied to all parameters: binary
            buf.put_i16(1);
            buf.put_i16(1);
            buf.put_u16(self.params_len);
            buf.put_slice(self.params);
        }

        // a single result-column format code applied to all columns: binary
        buf.put_i16(1);
        buf.put_i16(1);
    }
}

/// Identifies the message as a Describe command.
pub struct Describe<'a> {
    /// `'S'` to describe a prepared statement; or `'P'` to describe a portal.
    pub kind: u8,
    /// The name of the prepared statement or portal to describe
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const MSGTYPE: u8 = b'D';

    fn encode_body(self, buf: &mut BytesMut) {
        buf.put_u8(self.kind);
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as an Execute command.
pub struct Execute<'a> {
    /// The name of the portal to execute (an empty string selects the unnamed
    /// portal).
    pub portal: &'a str,
    /// Maximum number of rows to return, if portal contains a query that
    /// returns rows (ignored otherwise). Zero denotes "no limit".
    pub max_rows: i32,
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    fn encode_body(self, buf: &mut BytesMut) {
        buf.put_nul_string(self.portal);
        buf.put_i32(self.max_rows);
    }
}

/// Identifies the message as a Sync command.
pub struct Sync;

impl FrontendProtocol for Sync {
    const MSGTYPE: u8 = b'S';

    fn encode_body(self, _: &mut BytesMut) {}
}

/// Identifies the message as a termination.
pub struct Terminate;

impl FrontendProtocol for Terminate {
    const MSGTYPE: u8 = b'X';

    fn encode_body(self, _: &mut BytesMut) {}
}
