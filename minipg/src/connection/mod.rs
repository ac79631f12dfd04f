//! Postgres connection and its state machine.
mod config;
mod startup;

pub use config::{Config, ParseError};

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    future::poll_fn,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, ready},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWrite;

use crate::{
    common::verbose,
    error::{Error, ErrorKind, Result},
    ext::UsizeExt,
    io,
    net::Socket,
    postgres::{
        BackendMessage, BackendProtocol, Framer, FrontendProtocol, PgMessage, ProtocolError,
        backend::{self, ReadyStatus},
        frontend,
    },
    query::QueryState,
    statement::StatementName,
};

const DEFAULT_BUF_CAPACITY: usize = 1024;

/// How long a graceful close waits for the `Terminate` bytes to drain.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// A single postgres connection.
///
/// `Connection` is a cheap clone over a shared interior and is deliberately
/// not `Send`: all progress happens on whichever task awaits an outstanding
/// [`Query`][crate::Query] future.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Rc<RefCell<ConnInner>>,
}

impl Connection {
    /// Dial the server and authenticate.
    ///
    /// Resolving is the `connected` event: the startup packet was accepted
    /// and, if challenged, the MD5 password exchange succeeded.
    pub async fn dial(config: Config) -> Result<Connection> {
        let socket = Socket::connect_tcp(config.host.as_str(), config.port)
            .await
            .map_err(|e| Error::from(e).context("failed to dial server"))?;
        Self::dial_socket(socket, config).await
    }

    pub(crate) async fn dial_socket(socket: Socket, config: Config) -> Result<Connection> {
        let mut inner = ConnInner::new(socket, config);
        startup::startup(&mut inner).await?;
        tracing::debug!(user = inner.config.user.as_str(), "connected");
        Ok(Connection { inner: Rc::new(RefCell::new(inner)) })
    }

    /// Whether the session is authenticated and the transport still open.
    pub fn is_connected(&self) -> bool {
        let inner = self.inner.borrow();
        inner.authenticated && !inner.closed
    }

    /// Gracefully close the connection.
    ///
    /// Idempotent. Sends `Terminate` when the session is authenticated and
    /// waits a bounded time for the bytes to drain before shutting the
    /// socket. Every query still in the queue is dropped and fails with
    /// [`ErrorKind::ConnectionClosed`].
    pub async fn close(&self) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            inner.drop_queue();
            if inner.authenticated {
                frontend::write(frontend::Terminate, &mut inner.write_buf);
            }
        }

        let flush = poll_fn(|cx| self.inner.borrow_mut().poll_flush(cx));
        let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flush).await;

        let _ = poll_fn(|cx| {
            let mut inner = self.inner.borrow_mut();
            Pin::new(&mut inner.socket).poll_shutdown(cx)
        })
        .await;

        tracing::debug!("disconnected");
        Ok(())
    }

    /// Current value of a session run-time parameter.
    ///
    /// The map is updated by every `ParameterStatus` the server sends, at any
    /// point of the session.
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.inner.borrow().params.get(name).cloned()
    }

    /// Process ID of the server backend, once reported.
    ///
    /// Retained together with the secret key for future cancel-request
    /// support.
    pub fn backend_pid(&self) -> Option<i32> {
        self.inner.borrow().backend.map(|k| k.process_id)
    }

    /// Drain the notices that were not attributable to any query.
    pub fn take_notices(&self) -> Vec<PgMessage> {
        std::mem::take(&mut self.inner.borrow_mut().notices)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Connection")
            .field("authenticated", &inner.authenticated)
            .field("closed", &inner.closed)
            .field("queued", &inner.queue.len())
            .finish()
    }
}

pub(crate) struct ConnInner {
    // io
    socket: Socket,
    framer: Framer,
    write_buf: BytesMut,

    // session
    pub(crate) config: Config,
    params: HashMap<String, String>,
    backend: Option<backend::BackendKeyData>,
    pub(crate) authenticated: bool,
    pub(crate) closed: bool,

    // tasks
    queue: VecDeque<Rc<RefCell<QueryState>>>,
    stmt_seq: u64,

    // connection-routed reports
    notices: Vec<PgMessage>,
    pending_error: Option<PgMessage>,
}

impl ConnInner {
    fn new(socket: Socket, config: Config) -> ConnInner {
        ConnInner {
            socket,
            framer: Framer::new(),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            config,
            params: HashMap::new(),
            backend: None,
            authenticated: false,
            closed: false,
            queue: VecDeque::new(),
            stmt_seq: 0,
            notices: Vec::new(),
            pending_error: None,
        }
    }

    pub(crate) fn next_statement(&mut self) -> StatementName {
        StatementName::next(&mut self.stmt_seq)
    }

    pub(crate) fn send<F: FrontendProtocol>(&mut self, message: F) {
        frontend::write(message, &mut self.write_buf);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        startup.write(&mut self.write_buf);
    }

    fn poll_flush(&mut self, cx: &mut Context) -> Poll<std::io::Result<()>> {
        io::poll_write_all(&mut self.socket, &mut self.write_buf, cx)
    }

    /// Receive the next backend message, flushing buffered requests first.
    ///
    /// Only used during the startup phase; once the queue is live, frames go
    /// through [`poll_drive`][ConnInner::poll_drive] instead.
    async fn recv(&mut self) -> Result<BackendMessage> {
        poll_fn(|cx| {
            ready!(self.poll_flush(cx))?;
            let (tag, body) = ready!(self.framer.poll_frame(&mut self.socket, cx))?;
            verbose!(tag = tag as char, len = body.len(), "recv");
            Poll::Ready(BackendMessage::decode(tag, body).map_err(Error::from))
        })
        .await
    }

    /// Enqueue a query; the queue head is started immediately.
    pub(crate) fn submit(&mut self, query: &Rc<RefCell<QueryState>>) -> Result<()> {
        if self.closed || !self.authenticated {
            return Err(ErrorKind::ConnectionClosed.into());
        }
        self.queue.push_back(query.clone());
        if self.queue.len() == 1 {
            self.start_task(query);
        }
        Ok(())
    }

    /// Serialise the request frames for the task at the queue head.
    fn start_task(&mut self, query: &Rc<RefCell<QueryState>>) {
        let state = query.borrow();

        if state.prepare {
            if state.prepare_finished {
                let payload = state.bind_payload.clone().unwrap_or_else(Bytes::new);
                let statement = state.statement.as_ref().expect("prepared query has a name");
                verbose!(statement = statement.as_str(), "bind-execute");
                self.send(frontend::Bind {
                    statement: statement.as_str(),
                    params_len: state.param_oids.len().to_u16(),
                    params: &payload,
                });
                self.send(frontend::Execute { portal: "", max_rows: 0 });
                self.send(frontend::Sync);
            } else {
                let statement = state.statement.as_ref().expect("prepared query has a name");
                verbose!(statement = statement.as_str(), sql = %state.sql, "parse-describe");
                self.send(frontend::Parse { statement: statement.as_str(), sql: &state.sql });
                self.send(frontend::Describe { kind: b'S', name: statement.as_str() });
                self.send(frontend::Sync);
            }
        } else {
            verbose!(sql = %state.sql, "one-shot");
            self.send(frontend::Parse { statement: "", sql: &state.sql });
            self.send(frontend::Bind { statement: "", params_len: 0, params: &[] });
            self.send(frontend::Describe { kind: b'P', name: "" });
            self.send(frontend::Execute { portal: "", max_rows: 0 });
            self.send(frontend::Sync);
        }
    }

    /// Flush buffered requests, then read and dispatch inbound frames until
    /// the transport has nothing more to give.
    ///
    /// `Ready(Ok)` only means the connection is closed; callers learn about
    /// their own query from its state, not from this return.
    pub(crate) fn poll_drive(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }

        let mut complete_seen = false;
        loop {
            match self.poll_flush(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(self.fatal(e.into()))),
                Poll::Pending => return Poll::Pending,
            }

            match self.framer.poll_frame(&mut self.socket, cx) {
                Poll::Ready(Ok((tag, body))) => {
                    if tag == backend::CommandComplete::MSGTYPE {
                        complete_seen = true;
                    }
                    if let Err(e) = self.dispatch(tag, body) {
                        return Poll::Ready(Err(self.fatal(e)));
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(self.fatal(e))),
                Poll::Pending => {
                    if complete_seen && !self.framer.residual_ok() {
                        let err = self.fatal(ProtocolError::Segmentation.into());
                        return Poll::Ready(Err(err));
                    }
                    return Poll::Pending;
                }
            }
        }
    }

    fn dispatch(&mut self, tag: u8, body: Bytes) -> Result<()> {
        let message = BackendMessage::decode(tag, body)?;
        verbose!(tag = tag as char, "dispatch");

        match message {
            // allowed in any state
            BackendMessage::ParameterStatus(status) => {
                self.params.insert(status.name, status.value);
            }
            BackendMessage::BackendKeyData(key) => self.backend = Some(key),

            BackendMessage::NoticeResponse(notice) => {
                let notice = notice.to_message();
                tracing::warn!("{notice}");
                match self.queue.front() {
                    Some(head) => head.borrow_mut().notices.push(notice),
                    None => self.notices.push(notice),
                }
            }
            BackendMessage::ErrorResponse(err) => {
                let err = err.to_message();
                match self.queue.front() {
                    Some(head) => {
                        let mut state = head.borrow_mut();
                        if state.error.is_none() {
                            state.error = Some(ErrorKind::Database(err));
                        }
                    }
                    None => {
                        tracing::error!("{err}");
                        self.pending_error = Some(err);
                    }
                }
            }

            BackendMessage::ParameterDescription(desc) => {
                self.head(tag)?.borrow_mut().param_oids = desc.oids;
            }
            BackendMessage::RowDescription(desc) => {
                self.head(tag)?.borrow_mut().fields = desc.fields;
            }
            BackendMessage::DataRow(row) => {
                self.head(tag)?.borrow_mut().rows.push(row.body);
            }

            BackendMessage::CommandComplete(_)
            | BackendMessage::ParseComplete(_)
            | BackendMessage::BindComplete(_)
            | BackendMessage::NoData(_)
            | BackendMessage::EmptyQueryResponse(_) => {}

            BackendMessage::ReadyForQuery(ready) => match ready.status {
                ReadyStatus::Idle | ReadyStatus::Transaction => self.end_task(),
                // a failed transaction block only releases a task whose error
                // is already surfaced; see DESIGN.md
                ReadyStatus::Failed => {
                    let errored =
                        self.queue.front().is_some_and(|q| q.borrow().error.is_some());
                    if errored {
                        self.end_task();
                    }
                }
            },

            BackendMessage::NegotiateProtocolVersion(_) => {
                return Err(ProtocolError::VersionNegotiation.into());
            }
            BackendMessage::Authentication(_) => {
                return Err(ProtocolError::unexpected_phase(tag, "ready session").into());
            }
        }

        Ok(())
    }

    /// The in-flight query, which query-scoped frames are demultiplexed to.
    fn head(&self, tag: u8) -> Result<&Rc<RefCell<QueryState>>> {
        self.queue
            .front()
            .ok_or_else(|| ProtocolError::unexpected_phase(tag, "idle session").into())
    }

    /// Dequeue the head task, fire its completion and start the next one.
    fn end_task(&mut self) {
        let Some(query) = self.queue.pop_front() else { return };

        {
            let mut state = query.borrow_mut();
            if state.prepare && state.bind_values.is_empty() && state.error.is_none() {
                // prepare-and-describe finished; values may be bound now
                state.prepare_finished = true;
            }
            state.done = true;
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
        }

        if let Some(next) = self.queue.front().cloned() {
            self.start_task(&next);
        }
    }

    /// Tear the connection down; every queued query is dropped.
    fn fatal(&mut self, err: Error) -> Error {
        self.closed = true;
        self.drop_queue();

        // a server FATAL report usually precedes the transport dying, surface
        // it instead of the bare io error
        match self.pending_error.take() {
            Some(report) if matches!(err.kind(), ErrorKind::Io(_)) => {
                ErrorKind::Database(report).into()
            }
            _ => err,
        }
    }

    fn drop_queue(&mut self) {
        while let Some(query) = self.queue.pop_front() {
            let mut state = query.borrow_mut();
            if state.error.is_none() {
                state.error = Some(ErrorKind::ConnectionClosed);
            }
            state.done = true;
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
        }
    }
}
