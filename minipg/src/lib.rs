//! Minimal Postgres frontend.
//!
//! One TCP connection, MD5 password authentication, and the extended query
//! protocol with binary parameters and binary results.
//!
//! # Examples
//!
//! One-shot query:
//!
//! ```no_run
//! use minipg::{Config, Connection, Query};
//!
//! # async fn app() -> minipg::Result<()> {
//! let conn = Connection::dial(Config::default()).await?;
//!
//! let query = Query::new(&conn);
//! query.exec("SELECT 420").await?;
//!
//! assert_eq!(query.row_count(), 1);
//! let value = query.value(0, 0)?;
//! # Ok(())
//! # }
//! ```
//!
//! Prepared statement with bound values:
//!
//! ```no_run
//! use minipg::{Config, Connection, Query, Value};
//!
//! # async fn app() -> minipg::Result<()> {
//! let conn = Connection::dial(Config::default()).await?;
//!
//! let query = Query::new(&conn);
//! query.prepare("SELECT $1::int8").await?;
//! query.bind_value(0, Value::Int8(i64::MAX))?;
//! query.exec_prepared().await?;
//!
//! assert_eq!(query.value(0, 0)?, Value::Int8(i64::MAX));
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The library is deliberately single threaded: [`Connection`] and [`Query`]
//! are cheap clones over a shared interior and are not `Send`. Whoever awaits
//! an outstanding query future drives the shared connection; queries complete
//! in submission order no matter which future did the driving.

pub mod common;
mod ext;
mod io;
mod net;

// Protocol
pub mod postgres;

// Encoding
mod value;

// Component
mod statement;
pub mod row;

// Connection
pub mod connection;
pub mod query;

mod error;

#[doc(inline)]
pub use connection::{Config, Connection};
#[doc(inline)]
pub use query::Query;
#[doc(inline)]
pub use row::Field;
#[doc(inline)]
pub use value::{DecodeError, EncodeError, Value};
#[doc(inline)]
pub use postgres::{Oid, PgMessage, TypeKind};
#[doc(inline)]
pub use error::{Error, ErrorKind, Result, UnsupportedAuth};
