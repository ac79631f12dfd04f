//! The startup and authentication phase.
//!
//! <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-START-UP>
use super::ConnInner;
use crate::{
    error::{Result, UnsupportedAuth},
    postgres::{BackendMessage, ProtocolError, backend::Authentication, frontend, md5_password},
};

/// Send the startup packet, drive authentication to `AuthenticationOk`, then
/// absorb the session preamble up to the first `ReadyForQuery`.
///
/// Once this returns, the session parameter map is populated and the backend
/// identity recorded; the first query cannot race the startup frames.
pub(super) async fn startup(io: &mut ConnInner) -> Result<()> {
    // To begin a session, a frontend opens a connection to the server and
    // sends a startup message.
    let user = io.config.user.clone();
    let database = io.config.dbname.clone();
    io.send_startup(frontend::Startup {
        user: user.as_str(),
        database: database.as_ref().map(|db| db.as_str()),
    });

    // The server then sends an appropriate authentication request message,
    // to which the frontend must reply with an appropriate authentication
    // response message (such as a password). For all authentication methods
    // except GSSAPI, SSPI and SASL, there is at most one request and one
    // response.
    loop {
        match io.recv().await? {
            BackendMessage::Authentication(auth) => match auth {
                Authentication::Md5Password { salt } => {
                    let password =
                        md5_password(io.config.user.as_str(), io.config.pass.as_str(), salt);
                    io.send(frontend::PasswordMessage { password: &password });
                }
                Authentication::Ok => break,
                Authentication::Other(method) => {
                    return Err(UnsupportedAuth { method }.into());
                }
            },
            BackendMessage::ErrorResponse(err) => return Err(err.to_message().into()),
            BackendMessage::NoticeResponse(notice) => {
                tracing::warn!("{}", notice.to_message());
            }
            BackendMessage::NegotiateProtocolVersion(_) => {
                return Err(ProtocolError::VersionNegotiation.into());
            }
            other => {
                return Err(
                    ProtocolError::unexpected_phase(other.msgtype(), "authentication").into()
                );
            }
        }
    }

    io.authenticated = true;

    // After having received AuthenticationOk, the frontend must wait for
    // further messages from the server. In this phase a backend process is
    // being started, and the frontend is just an interested bystander. In the
    // normal case the backend will send some ParameterStatus messages,
    // BackendKeyData, and finally ReadyForQuery.
    loop {
        match io.recv().await? {
            BackendMessage::ReadyForQuery(_) => break,
            BackendMessage::ParameterStatus(status) => {
                io.params.insert(status.name, status.value);
            }
            BackendMessage::BackendKeyData(key) => io.backend = Some(key),
            BackendMessage::NoticeResponse(notice) => {
                tracing::warn!("{}", notice.to_message());
            }
            BackendMessage::ErrorResponse(err) => return Err(err.to_message().into()),
            BackendMessage::NegotiateProtocolVersion(_) => {
                return Err(ProtocolError::VersionNegotiation.into());
            }
            other => {
                return Err(ProtocolError::unexpected_phase(other.msgtype(), "startup").into());
            }
        }
    }

    Ok(())
}
