//! Postgres wire protocol, version 3.0.
//!
//! <https://www.postgresql.org/docs/current/protocol.html>
pub mod frontend;
pub mod backend;

mod auth;
mod error;
mod framer;
mod pg_type;

pub use backend::{BackendMessage, BackendProtocol};
pub use error::{PgMessage, ProtocolError};
pub use frontend::FrontendProtocol;
pub use pg_type::{Oid, TypeKind};

pub(crate) use auth::md5_password;
pub(crate) use framer::Framer;
