//! The caller-facing query object.
//!
//! A [`Query`] accumulates everything the server reports about one statement:
//! parameter oids from `ParameterDescription`, column descriptors from
//! `RowDescription`, and the verbatim row payloads from each `DataRow`. Cells
//! are only decoded when [`value`][Query::value] asks for them.
use std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

use bytes::Bytes;

use crate::{
    connection::{ConnInner, Connection},
    error::{Error, ErrorKind, Result},
    postgres::{Oid, PgMessage},
    row::{self, Field},
    statement::StatementName,
    value::{self, DecodeError, Value},
};

/// A query bound to a [`Connection`].
///
/// Cloning shares the same underlying state; the connection's task queue
/// holds the same shared state while the query is in flight, so dropping
/// every handle does not cancel a submitted query.
#[derive(Clone)]
pub struct Query {
    conn: Rc<RefCell<ConnInner>>,
    state: Rc<RefCell<QueryState>>,
}

pub(crate) struct QueryState {
    pub(crate) sql: String,
    pub(crate) prepare: bool,
    pub(crate) prepare_finished: bool,
    pub(crate) statement: Option<StatementName>,
    pub(crate) param_oids: Vec<Oid>,
    pub(crate) bind_values: Vec<Value>,
    pub(crate) fields: Vec<Field>,
    pub(crate) rows: Vec<Bytes>,
    pub(crate) bind_payload: Option<Bytes>,
    pub(crate) notices: Vec<PgMessage>,
    pub(crate) error: Option<ErrorKind>,
    pub(crate) done: bool,
    pub(crate) queued: bool,
    pub(crate) waker: Option<Waker>,
}

impl QueryState {
    fn new() -> QueryState {
        QueryState {
            sql: String::new(),
            prepare: false,
            prepare_finished: false,
            statement: None,
            param_oids: Vec::new(),
            bind_values: Vec::new(),
            fields: Vec::new(),
            rows: Vec::new(),
            bind_payload: None,
            notices: Vec::new(),
            error: None,
            done: false,
            queued: false,
            waker: None,
        }
    }

    fn in_flight(&self) -> bool {
        self.queued && !self.done
    }
}

impl Query {
    /// Create a query bound to `conn`.
    pub fn new(conn: &Connection) -> Query {
        Query {
            conn: conn.inner.clone(),
            state: Rc::new(RefCell::new(QueryState::new())),
        }
    }

    /// One-shot execution of `sql`.
    ///
    /// Resolving `Ok` is the execute-finished event; results are inspected
    /// through [`fields`][Query::fields], [`row_count`][Query::row_count] and
    /// [`value`][Query::value].
    pub fn exec(&self, sql: &str) -> Completion<'_> {
        let early = self.begin(sql, false).err();
        Completion { query: self, early }
    }

    /// Parse and describe `sql` as a server-side prepared statement.
    ///
    /// Resolving `Ok` is the prepare-finished event; the discovered parameter
    /// oids are available through [`param_types`][Query::param_types] and
    /// values may be bound.
    pub fn prepare(&self, sql: &str) -> Completion<'_> {
        let early = self.begin(sql, true).err();
        Completion { query: self, early }
    }

    /// Execute the prepared statement with the currently bound values.
    ///
    /// Bind values are encoded here, in the order dictated by the server's
    /// parameter description; an unsupported oid or an arity mismatch fails
    /// the returned future without anything being written to the socket.
    pub fn exec_prepared(&self) -> Completion<'_> {
        let early = self.begin_prepared().err();
        Completion { query: self, early }
    }

    /// Bind `value` to the parameter at `index` (zero based, `$1` is zero).
    ///
    /// Only permitted once prepare finished and the statement is not being
    /// executed; positions in between are padded with `NULL`.
    pub fn bind_value(&self, index: usize, value: Value) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.prepare_finished {
            return Err(ErrorKind::InvalidState("bind before prepare finished").into());
        }
        if state.in_flight() {
            return Err(ErrorKind::InvalidState("query is already in flight").into());
        }
        if index >= state.bind_values.len() {
            state.bind_values.resize(index + 1, Value::Null);
        }
        state.bind_values[index] = value;
        Ok(())
    }

    /// The most recently submitted SQL text.
    pub fn last_query(&self) -> String {
        self.state.borrow().sql.clone()
    }

    /// The currently bound parameter values.
    pub fn bind_values(&self) -> Vec<Value> {
        self.state.borrow().bind_values.clone()
    }

    /// Parameter type oids discovered by `prepare`, in `$n` order.
    pub fn param_types(&self) -> Vec<Oid> {
        self.state.borrow().param_oids.clone()
    }

    /// Column descriptors of the most recent result.
    pub fn fields(&self) -> Vec<Field> {
        self.state.borrow().fields.clone()
    }

    /// Number of rows received.
    pub fn row_count(&self) -> usize {
        self.state.borrow().rows.len()
    }

    /// Number of result columns.
    pub fn column_count(&self) -> usize {
        self.state.borrow().fields.len()
    }

    /// Decode the cell at (`row`, `col`).
    ///
    /// Decoding happens on demand against the retained row payload; a `NULL`
    /// cell yields [`Value::Null`] whatever the column type.
    pub fn value(&self, row: usize, col: usize) -> Result<Value, DecodeError> {
        let state = self.state.borrow();
        let payload = state.rows.get(row).ok_or(DecodeError::RowNotFound(row))?;
        row::value_at(payload, &state.fields, col)
    }

    /// Drain the notices the server attached to this query.
    pub fn take_notices(&self) -> Vec<PgMessage> {
        std::mem::take(&mut self.state.borrow_mut().notices)
    }

    fn begin(&self, sql: &str, prepare: bool) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            if state.in_flight() {
                return Err(ErrorKind::InvalidState("query is already in flight").into());
            }

            state.sql = sql.into();
            state.prepare = prepare;
            state.prepare_finished = false;
            state.statement = None;
            state.param_oids.clear();
            state.bind_values.clear();
            state.fields.clear();
            state.rows.clear();
            state.bind_payload = None;
            state.notices.clear();
            state.error = None;
            state.done = false;
            state.queued = false;

            if prepare {
                state.statement = Some(self.conn.borrow_mut().next_statement());
            }
        }
        self.submit()
    }

    fn begin_prepared(&self) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            if state.in_flight() {
                return Err(ErrorKind::InvalidState("query is already in flight").into());
            }
            if !state.prepare || !state.prepare_finished {
                return Err(ErrorKind::InvalidState("statement is not prepared").into());
            }

            let payload = value::encode_params(&state.param_oids, &state.bind_values)?;
            state.bind_payload = Some(payload);
            state.rows.clear();
            state.notices.clear();
            state.error = None;
            state.done = false;
            state.queued = false;
        }
        self.submit()
    }

    fn submit(&self) -> Result<()> {
        let mut conn = self.conn.borrow_mut();
        conn.submit(&self.state)?;
        self.state.borrow_mut().queued = true;
        Ok(())
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Query")
            .field("sql", &state.sql)
            .field("prepare", &state.prepare)
            .field("prepare_finished", &state.prepare_finished)
            .field("statement", &state.statement)
            .field("param_oids", &state.param_oids)
            .field("bind_values", &state.bind_values.len())
            .field("fields", &state.fields.len())
            .field("rows", &state.rows.len())
            .finish()
    }
}

/// Future of a submitted query, resolving when its completion fires.
///
/// Polling any outstanding completion drives the shared connection, so
/// earlier queries in the queue make progress too.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Completion<'a> {
    query: &'a Query,
    early: Option<Error>,
}

impl Future for Completion<'_> {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(err) = self.early.take() {
            return Poll::Ready(Err(err));
        }

        {
            let mut state = self.query.state.borrow_mut();
            if state.done {
                return Poll::Ready(take_result(&mut state));
            }
            state.waker = Some(cx.waker().clone());
        }

        let drive = self.query.conn.borrow_mut().poll_drive(cx);

        let mut state = self.query.state.borrow_mut();
        match drive {
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) | Poll::Pending if state.done => {
                Poll::Ready(take_result(&mut state))
            }
            // drive only resolves cleanly when the connection was closed
            Poll::Ready(Ok(())) => Poll::Ready(Err(ErrorKind::ConnectionClosed.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn take_result(state: &mut QueryState) -> Result<()> {
    match state.error.take() {
        Some(kind) => Err(kind.into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use std::{
        future::Future,
        pin::Pin,
        task::{Context, Poll, Waker},
    };

    use tokio::io::AsyncWriteExt;

    use crate::{
        ErrorKind, Query, Value,
        connection::testing::*,
        postgres::ProtocolError,
    };

    fn poll_once<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        let mut cx = Context::from_waker(Waker::noop());
        Pin::new(fut).poll(&mut cx)
    }

    #[tokio::test]
    async fn simple_query_happy_path() {
        let (conn, mut server) = connected_pair().await;
        server.write_all(&select_one_response(1)).await.unwrap();

        let query = Query::new(&conn);
        query.exec("SELECT 1").await.unwrap();

        assert_eq!(query.row_count(), 1);
        assert_eq!(query.column_count(), 1);
        assert_eq!(query.fields()[0].type_oid(), 23);
        assert_eq!(query.value(0, 0).unwrap(), Value::Int4(1));
        assert_eq!(query.last_query(), "SELECT 1");
    }

    #[tokio::test]
    async fn one_shot_request_frames() {
        let (conn, mut server) = connected_pair().await;
        server.write_all(&select_one_response(1)).await.unwrap();

        let query = Query::new(&conn);
        query.exec("SELECT 1").await.unwrap();

        let frames = read_until_sync(&mut server).await;
        let tags = frames.iter().map(|f| f.0).collect::<Vec<_>>();
        assert_eq!(tags, [b'P', b'B', b'D', b'E', b'S']);

        // unnamed statement, the sql, empty parameter type list
        assert_eq!(frames[0].1, b"\0SELECT 1\0\x00\x00");
        // portal describe
        assert_eq!(frames[2].1, b"P\0");
    }

    #[tokio::test]
    async fn segmented_delivery_equals_single_shot() {
        let response = select_one_response(7);

        for split in 0..response.len() {
            let (conn, mut server) = connected_pair().await;
            let query = Query::new(&conn);

            let mut fut = query.exec("SELECT 7");
            server.write_all(&response[..split]).await.unwrap();
            let first = poll_once(&mut fut);
            server.write_all(&response[split..]).await.unwrap();
            match first {
                Poll::Ready(res) => res.unwrap(),
                Poll::Pending => fut.await.unwrap(),
            }

            assert_eq!(query.row_count(), 1, "split at {split}");
            assert_eq!(query.value(0, 0).unwrap(), Value::Int4(7), "split at {split}");
        }
    }

    #[tokio::test]
    async fn queries_complete_in_submission_order() {
        let (conn, mut server) = connected_pair().await;
        let first = Query::new(&conn);
        let second = Query::new(&conn);

        let mut fut1 = first.exec("SELECT 1");
        let mut fut2 = second.exec("SELECT 2");

        // only the head response is available
        server.write_all(&select_one_response(1)).await.unwrap();
        assert!(poll_once(&mut fut2).is_pending());

        // driving through the second future still completed the first
        match poll_once(&mut fut1) {
            Poll::Ready(res) => res.unwrap(),
            Poll::Pending => panic!("first query should have completed"),
        }
        assert_eq!(first.value(0, 0).unwrap(), Value::Int4(1));
        assert_eq!(second.row_count(), 0);

        server.write_all(&select_one_response(2)).await.unwrap();
        fut2.await.unwrap();
        assert_eq!(second.value(0, 0).unwrap(), Value::Int4(2));

        // the requests hit the wire in submission order
        let batch1 = read_until_sync(&mut server).await;
        let batch2 = read_until_sync(&mut server).await;
        assert!(batch1[0].1.ends_with(b"SELECT 1\0\x00\x00"));
        assert!(batch2[0].1.ends_with(b"SELECT 2\0\x00\x00"));
    }

    #[tokio::test]
    async fn server_error_routes_to_query() {
        let (conn, mut server) = connected_pair().await;
        server
            .write_all(&error_response(&[
                (b'V', "ERROR"),
                (b'C', "42601"),
                (b'M', "syntax error at or near \"SELEC\""),
            ]))
            .await
            .unwrap();
        server.write_all(&ready_for_query(b'I')).await.unwrap();

        let query = Query::new(&conn);
        let err = query.exec("SELEC 1").await.unwrap_err();
        match err.kind() {
            ErrorKind::Database(report) => {
                assert_eq!(report.severity(), "ERROR");
                assert_eq!(report.code(), "42601");
            }
            other => panic!("expected database error, got {other:?}"),
        }

        // the connection survives a server-reported error
        assert!(conn.is_connected());
        server.write_all(&select_one_response(3)).await.unwrap();
        let next = Query::new(&conn);
        next.exec("SELECT 3").await.unwrap();
        assert_eq!(next.value(0, 0).unwrap(), Value::Int4(3));
    }

    #[tokio::test]
    async fn failed_transaction_status_releases_errored_query() {
        let (conn, mut server) = connected_pair().await;
        server
            .write_all(&error_response(&[(b'V', "ERROR"), (b'C', "22012"), (b'M', "division by zero")]))
            .await
            .unwrap();
        server.write_all(&ready_for_query(b'E')).await.unwrap();

        let query = Query::new(&conn);
        let err = query.exec("SELECT 1/0").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Database(_)));
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn transaction_status_completes_task() {
        let (conn, mut server) = connected_pair().await;
        let mut response = msg(b'1', &[]);
        response.extend(msg(b'2', &[]));
        response.extend(command_complete("BEGIN"));
        response.extend(ready_for_query(b'T'));
        server.write_all(&response).await.unwrap();

        let query = Query::new(&conn);
        query.exec("BEGIN").await.unwrap();
        assert_eq!(query.row_count(), 0);
    }

    #[tokio::test]
    async fn notices_route_to_the_query() {
        let (conn, mut server) = connected_pair().await;
        let mut response = msg(b'1', &[]);
        response.extend(msg(b'2', &[]));
        response.extend(notice_response(&[
            (b'V', "NOTICE"),
            (b'C', "00000"),
            (b'M', "table \"foo\" does not exist, skipping"),
        ]));
        response.extend(command_complete("DROP TABLE"));
        response.extend(ready_for_query(b'I'));
        server.write_all(&response).await.unwrap();

        let query = Query::new(&conn);
        query.exec("DROP TABLE IF EXISTS foo").await.unwrap();

        let notices = query.take_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].severity(), "NOTICE");
        assert!(query.take_notices().is_empty());
        assert!(conn.take_notices().is_empty());
    }

    #[tokio::test]
    async fn prepared_statement_round_trip() {
        let (conn, mut server) = connected_pair().await;

        let mut response = msg(b'1', &[]);
        response.extend(parameter_description(&[20]));
        response.extend(row_description(&[("int8", 20)]));
        response.extend(ready_for_query(b'I'));
        server.write_all(&response).await.unwrap();

        let query = Query::new(&conn);
        query.prepare("SELECT $1::int8").await.unwrap();
        assert_eq!(query.param_types(), [20]);
        assert_eq!(query.fields()[0].type_oid(), 20);

        query.bind_value(0, Value::Int8(i64::MAX)).unwrap();

        let mut response = msg(b'2', &[]);
        response.extend(data_row(&[Some(&i64::MAX.to_be_bytes())]));
        response.extend(command_complete("SELECT 1"));
        response.extend(ready_for_query(b'I'));
        server.write_all(&response).await.unwrap();

        query.exec_prepared().await.unwrap();
        assert_eq!(query.value(0, 0).unwrap(), Value::Int8(i64::MAX));

        // parse-describe batch for the named statement
        let prepare_frames = read_until_sync(&mut server).await;
        let tags = prepare_frames.iter().map(|f| f.0).collect::<Vec<_>>();
        assert_eq!(tags, [b'P', b'D', b'S']);
        assert_eq!(prepare_frames[0].1, b"stmt_1\0SELECT $1::int8\0\x00\x00");
        assert_eq!(prepare_frames[1].1, b"Sstmt_1\0");

        // bind-execute batch with the binary parameter image
        let exec_frames = read_until_sync(&mut server).await;
        let tags = exec_frames.iter().map(|f| f.0).collect::<Vec<_>>();
        assert_eq!(tags, [b'B', b'E', b'S']);

        let mut bind = vec![];
        bind.extend_from_slice(b"\0stmt_1\0");
        bind.extend_from_slice(&[0, 1, 0, 1]); // one param format code, binary
        bind.extend_from_slice(&[0, 1]); // one parameter
        bind.extend_from_slice(&8_i32.to_be_bytes());
        bind.extend_from_slice(&i64::MAX.to_be_bytes());
        bind.extend_from_slice(&[0, 1, 0, 1]); // one result format code, binary
        assert_eq!(exec_frames[0].1, bind);
    }

    #[tokio::test]
    async fn unsupported_bind_oid_writes_nothing() {
        let (conn, mut server) = connected_pair().await;

        // point (oid 600) is outside the codec catalogue
        let mut response = msg(b'1', &[]);
        response.extend(parameter_description(&[600]));
        response.extend(row_description(&[("p", 600)]));
        response.extend(ready_for_query(b'I'));
        server.write_all(&response).await.unwrap();

        let query = Query::new(&conn);
        query.prepare("SELECT $1").await.unwrap();
        query.bind_value(0, Value::Int4(1)).unwrap();

        let err = query.exec_prepared().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Encode(_)));
        assert!(err.to_string().starts_with("The binding does not support the type OID: 600"));

        // nothing was queued, the connection moves on to the next submission
        server.write_all(&select_one_response(9)).await.unwrap();
        let next = Query::new(&conn);
        next.exec("SELECT 9").await.unwrap();

        let prepare_frames = read_until_sync(&mut server).await;
        assert_eq!(prepare_frames[0].0, b'P');
        let next_frames = read_until_sync(&mut server).await;
        // no Bind for the named statement ever reached the wire
        assert_eq!(next_frames.iter().map(|f| f.0).collect::<Vec<_>>(), [b'P', b'B', b'D', b'E', b'S']);
        assert!(next_frames[0].1.ends_with(b"SELECT 9\0\x00\x00"));
    }

    #[tokio::test]
    async fn bind_arity_mismatch() {
        let (conn, mut server) = connected_pair().await;

        let mut response = msg(b'1', &[]);
        response.extend(parameter_description(&[23, 23]));
        response.extend(row_description(&[("a", 23)]));
        response.extend(ready_for_query(b'I'));
        server.write_all(&response).await.unwrap();

        let query = Query::new(&conn);
        query.prepare("SELECT $1 + $2").await.unwrap();
        query.bind_value(0, Value::Int4(1)).unwrap();

        let err = query.exec_prepared().await.unwrap_err();
        assert!(err.to_string().starts_with("Incorrect value binding size: 1 != 2"));
    }

    #[tokio::test]
    async fn bind_preconditions() {
        let (conn, mut server) = connected_pair().await;

        let query = Query::new(&conn);
        let err = query.bind_value(0, Value::Int4(1)).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidState(_)));

        let mut response = msg(b'1', &[]);
        response.extend(parameter_description(&[23]));
        response.extend(msg(b'n', &[])); // NoData
        response.extend(ready_for_query(b'I'));
        server.write_all(&response).await.unwrap();

        query.prepare("INSERT INTO t VALUES ($1)").await.unwrap();
        query.bind_value(0, Value::Int4(1)).unwrap();

        // gaps are padded with NULL
        query.bind_value(2, Value::Int4(3)).unwrap();
        assert_eq!(
            query.bind_values(),
            [Value::Int4(1), Value::Null, Value::Int4(3)],
        );
    }

    #[tokio::test]
    async fn exec_prepared_requires_prepare() {
        let (conn, _server) = connected_pair().await;
        let query = Query::new(&conn);
        let err = query.exec_prepared().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidState(_)));
    }

    #[tokio::test]
    async fn resubmit_while_in_flight_is_refused() {
        let (conn, _server) = connected_pair().await;
        let query = Query::new(&conn);
        let _pending = query.exec("SELECT 1");
        let err = query.exec("SELECT 2").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidState(_)));
    }

    #[tokio::test]
    async fn unknown_message_tag_is_fatal() {
        let (conn, mut server) = connected_pair().await;
        server.write_all(&msg(b'?', &[])).await.unwrap();

        let query = Query::new(&conn);
        let err = query.exec("SELECT 1").await.unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::Protocol(ProtocolError::UnknownTag { tag: b'?' }),
        ));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn segmentation_after_completion_is_fatal() {
        let (conn, mut server) = connected_pair().await;

        let mut response = msg(b'1', &[]);
        response.extend(msg(b'2', &[]));
        response.extend(row_description(&[("?column?", 23)]));
        response.extend(data_row(&[Some(&1_i32.to_be_bytes())]));
        response.extend(command_complete("SELECT 1"));
        response.extend_from_slice(&[0xAA, 0xBB]); // not a frame
        server.write_all(&response).await.unwrap();

        let query = Query::new(&conn);
        let err = query.exec("SELECT 1").await.unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::Protocol(ProtocolError::Segmentation),
        ));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn empty_query_response() {
        let (conn, mut server) = connected_pair().await;
        let mut response = msg(b'1', &[]);
        response.extend(msg(b'2', &[]));
        response.extend(msg(b'I', &[])); // EmptyQueryResponse
        response.extend(ready_for_query(b'I'));
        server.write_all(&response).await.unwrap();

        let query = Query::new(&conn);
        query.exec("").await.unwrap();
        assert_eq!(query.row_count(), 0);
        assert_eq!(query.column_count(), 0);
    }

    #[tokio::test]
    async fn null_cells_decode_to_null() {
        let (conn, mut server) = connected_pair().await;
        let mut response = msg(b'1', &[]);
        response.extend(msg(b'2', &[]));
        response.extend(row_description(&[("a", 25), ("b", 23)]));
        response.extend(data_row(&[None, Some(&5_i32.to_be_bytes())]));
        response.extend(command_complete("SELECT 1"));
        response.extend(ready_for_query(b'I'));
        server.write_all(&response).await.unwrap();

        let query = Query::new(&conn);
        query.exec("SELECT NULL, 5").await.unwrap();
        assert_eq!(query.value(0, 0).unwrap(), Value::Null);
        assert_eq!(query.value(0, 1).unwrap(), Value::Int4(5));
    }

    #[tokio::test]
    async fn statement_names_are_per_connection() {
        let (conn, mut server) = connected_pair().await;

        for expected in ["stmt_1", "stmt_2"] {
            let mut response = msg(b'1', &[]);
            response.extend(parameter_description(&[]));
            response.extend(msg(b'n', &[]));
            response.extend(ready_for_query(b'I'));
            server.write_all(&response).await.unwrap();

            let query = Query::new(&conn);
            query.prepare("SELECT 1").await.unwrap();

            let frames = read_until_sync(&mut server).await;
            assert!(frames[0].1.starts_with(expected.as_bytes()));
        }
    }
}
