//! The per-connection state machine.
//!
//! An [`Engine`] owns one physical backend connection and runs as a single
//! task: transport bring-up (TCP or UNIX socket, optional TLS), the
//! startup/authentication exchange, and then the serve loop that drives
//! queries and dispatches backend messages. All connection state lives
//! inside the task; the cloneable [`EngineHandle`] communicates with it
//! over a command channel and observes it through watch channels.
//!
//! Dropping every handle (or cancelling a pending `connect` future)
//! removes the engine from the reactor: the task notices, runs the
//! ordered teardown, and exits without leaking the socket or any waiter.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, trace, warn};

use crate::auth::{AuthEvent, Authenticator};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::messages::backend::{self, BackendMessage, RowDescription};
use crate::messages::frontend::FrontendSink;
use crate::pool::{EngineId, PoolHook};
use crate::query::{Query, QueryHandle, QueryKind, Row};
use crate::transport::Transport;

/// Connection phase in the engine state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    TcpConnected,
    TlsReady,
    AwaitingAuth,
    AuthDone,
    Ready,
    InQuery,
    Closed,
}

enum Command {
    Connect {
        reply: oneshot::Sender<Result<()>>,
    },
    HandleQuery {
        query: Query,
        reply: oneshot::Sender<Result<()>>,
    },
    Parameter {
        name: String,
        reply: oneshot::Sender<Option<watch::Receiver<String>>>,
    },
    BackendKey {
        reply: oneshot::Sender<Option<(u32, u32)>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// The engine-side state of the query in flight.
struct ActiveQuery {
    row_sink: Option<mpsc::UnboundedSender<Row>>,
    description_tx: watch::Sender<Option<Arc<RowDescription>>>,
    description: Option<Arc<RowDescription>>,
    completed: Option<oneshot::Sender<Result<String>>>,
    ready_to_stream: Option<oneshot::Sender<()>>,
    input: Option<mpsc::Receiver<Bytes>>,
    flow_control: Option<mpsc::Receiver<bool>>,
}

impl ActiveQuery {
    fn new(query: Query) -> Self {
        ActiveQuery {
            row_sink: Some(query.row_sink),
            description_tx: query.description,
            description: None,
            completed: Some(query.completed),
            ready_to_stream: Some(query.ready_to_stream),
            input: query.input,
            flow_control: query.flow_control,
        }
    }

    fn attach_description(&mut self, description: RowDescription) {
        let description = Arc::new(description);
        self.description = Some(description.clone());
        self.description_tx.send_replace(Some(description));
    }

    fn deliver(&mut self, row: Row) {
        if let Some(sink) = &self.row_sink {
            // A dropped consumer is not an error; rows are discarded.
            let _ = sink.send(row);
        }
    }

    /// Finishes the row sink and resolves `completed` with the command
    /// tag. Idempotent.
    fn complete(&mut self, tag: String) {
        self.row_sink.take();
        if let Some(completed) = self.completed.take() {
            let _ = completed.send(Ok(tag));
        }
    }

    /// Finishes the row sink and fails `completed`. Idempotent.
    fn fail(&mut self, err: Error) {
        self.row_sink.take();
        if let Some(completed) = self.completed.take() {
            let _ = completed.send(Err(err));
        }
    }

    fn mark_ready_to_stream(&mut self) {
        if let Some(ready) = self.ready_to_stream.take() {
            let _ = ready.send(());
        }
    }
}

/// One physical backend connection, driven by [`Engine::run`].
pub struct Engine {
    id: EngineId,
    config: Config,
    pool: Weak<dyn PoolHook>,
    commands: mpsc::Receiver<Command>,
    transport: Option<Transport>,
    inbuf: BytesMut,
    sink: FrontendSink,
    phase: Phase,
    connected: Option<watch::Sender<bool>>,
    ready_for_query: Option<watch::Sender<String>>,
    authenticated: Option<watch::Sender<bool>>,
    parameters: HashMap<String, watch::Sender<String>>,
    backend_key: Option<(u32, u32)>,
    active: Option<ActiveQuery>,
    /// Lazy flow-control subscription, taken from the active query on the
    /// first data row.
    flow: Option<mpsc::Receiver<bool>>,
    /// COPY IN payload source, taken on CopyInResponse.
    copy_source: Option<mpsc::Receiver<Bytes>>,
    want_read: bool,
}

impl Engine {
    /// Creates an engine for `config` plus the handle that drives it.
    /// The engine does nothing until [`Engine::run`] is awaited and the
    /// handle requests `connect`.
    pub fn new(config: Config, pool: Weak<dyn PoolHook>) -> (Engine, EngineHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (connected_tx, connected_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = watch::channel(String::new());
        let (auth_tx, auth_rx) = watch::channel(false);
        let id = EngineId::next();

        let sink = FrontendSink::with_capacity(config.write_buffer_size);
        let engine = Engine {
            id,
            config,
            pool,
            commands: cmd_rx,
            transport: None,
            inbuf: BytesMut::new(),
            sink,
            phase: Phase::Init,
            connected: Some(connected_tx),
            ready_for_query: Some(ready_tx),
            authenticated: Some(auth_tx),
            parameters: HashMap::new(),
            backend_key: None,
            active: None,
            flow: None,
            copy_source: None,
            want_read: true,
        };
        let handle = EngineHandle {
            id,
            commands: cmd_tx,
            connected: connected_rx,
            ready_for_query: ready_rx,
            authenticated: auth_rx,
        };
        (engine, handle)
    }

    /// Convenience: creates the engine and spawns its task on the current
    /// tokio runtime.
    pub fn spawn(config: Config, pool: Weak<dyn PoolHook>) -> EngineHandle {
        let (engine, handle) = Engine::new(config, pool);
        tokio::spawn(engine.run());
        handle
    }

    /// Drives the connection to completion: phases through bring-up on
    /// request, serves queries, and always finishes with the ordered
    /// teardown.
    pub async fn run(mut self) {
        if let Err(e) = self.drive().await {
            error!(engine = %self.id, error = %e, "connection failed");
        }
        self.shutdown().await;
    }

    async fn drive(&mut self) -> Result<()> {
        // Init: nothing happens until the pool asks us to connect.
        loop {
            let Some(cmd) = self.commands.recv().await else {
                return Ok(());
            };
            match cmd {
                Command::Connect { mut reply } => {
                    let result = tokio::select! {
                        result = self.bring_up() => result,
                        // The caller cancelled the connect future (for
                        // example an outer timeout fired): tear down.
                        () = reply.closed() => {
                            debug!(engine = %self.id, "connect cancelled by caller");
                            return Ok(());
                        }
                    };
                    match result {
                        Ok(()) => {
                            if reply.send(Ok(())).is_err() {
                                return Ok(());
                            }
                            break;
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                            return Ok(());
                        }
                    }
                }
                Command::HandleQuery { query, reply } => {
                    drop(query);
                    let _ = reply.send(Err(Error::Disconnected));
                }
                Command::Parameter { reply, .. } => {
                    let _ = reply.send(None);
                }
                Command::BackendKey { reply } => {
                    let _ = reply.send(None);
                }
                Command::Close { reply } => {
                    let _ = reply.send(());
                    return Ok(());
                }
            }
        }

        self.serve().await
    }

    // ==================== Bring-up ====================

    async fn bring_up(&mut self) -> Result<()> {
        let transport = Transport::connect(&self.config).await?;
        self.phase = if transport.is_tls() {
            Phase::TlsReady
        } else {
            Phase::TcpConnected
        };
        self.transport = Some(transport);
        if let Some(connected) = &self.connected {
            connected.send_replace(true);
        }

        self.sink.put_startup(&self.config.startup_params());
        self.flush().await?;
        self.phase = Phase::AwaitingAuth;

        let mut authenticator = Authenticator::new(
            &self.config.user,
            self.config.password.as_deref(),
            self.config.encoding,
        );
        loop {
            match self.next_message().await? {
                BackendMessage::Authentication(request) => {
                    trace!(engine = %self.id, kind = request.mechanism_name(), "auth request");
                    match authenticator.respond(request, &mut self.sink)? {
                        AuthEvent::Done => break,
                        AuthEvent::Continue => self.flush().await?,
                    }
                }
                BackendMessage::ErrorResponse(e) => return Err(Error::Server(e)),
                BackendMessage::NoticeResponse(notice) => {
                    warn!(engine = %self.id, notice = %notice, "server notice");
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message during authentication: {other:?}"
                    )))
                }
            }
        }
        self.phase = Phase::AuthDone;
        if let Some(authenticated) = &self.authenticated {
            authenticated.send_replace(true);
        }

        loop {
            match self.next_message().await? {
                BackendMessage::ParameterStatus { name, value } => {
                    self.upsert_parameter(name, value);
                }
                BackendMessage::BackendKeyData { process_id, secret_key } => {
                    debug!(engine = %self.id, process_id, "backend key data");
                    self.backend_key = Some((process_id, secret_key));
                }
                BackendMessage::NoticeResponse(notice) => {
                    warn!(engine = %self.id, notice = %notice, "server notice");
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.publish_ready(status);
                    break;
                }
                BackendMessage::ErrorResponse(e) => return Err(Error::Server(e)),
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message during startup: {other:?}"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Reads whole messages during bring-up, where flow control does not
    /// yet apply.
    async fn next_message(&mut self) -> Result<BackendMessage> {
        loop {
            if let Some(msg) = backend::extract_message(&mut self.inbuf)? {
                return Ok(msg);
            }
            let transport = self.transport.as_mut().ok_or(Error::Disconnected)?;
            let n = transport.read_into(&mut self.inbuf).await?;
            if n == 0 {
                return Err(Error::Disconnected);
            }
        }
    }

    // ==================== Serve loop ====================

    async fn serve(&mut self) -> Result<()> {
        enum Event {
            Command(Option<Command>),
            Read(std::io::Result<usize>),
            Flow(Option<bool>),
            Copy(Option<Bytes>),
        }

        loop {
            let read_enabled = self.want_read && self.transport.is_some();
            let flow_enabled = self.flow.is_some();
            let copy_enabled = self.copy_source.is_some();

            let event = {
                let commands = &mut self.commands;
                let transport = self.transport.as_mut();
                let inbuf = &mut self.inbuf;
                let flow = self.flow.as_mut();
                let copy = self.copy_source.as_mut();

                tokio::select! {
                    cmd = commands.recv() => Event::Command(cmd),
                    result = async { transport.unwrap().read_into(inbuf).await }, if read_enabled => {
                        Event::Read(result)
                    }
                    signal = async { flow.unwrap().recv().await }, if flow_enabled => {
                        Event::Flow(signal)
                    }
                    chunk = async { copy.unwrap().recv().await }, if copy_enabled => {
                        Event::Copy(chunk)
                    }
                }
            };

            match event {
                // Every handle is gone: the engine was removed from the
                // reactor.
                Event::Command(None) => return Ok(()),
                Event::Command(Some(cmd)) => {
                    if self.handle_command(cmd).await? {
                        return Ok(());
                    }
                }
                Event::Read(Ok(0)) => {
                    debug!(engine = %self.id, "server closed the connection");
                    return Ok(());
                }
                Event::Read(Ok(_)) => {
                    while let Some(msg) = backend::extract_message(&mut self.inbuf)? {
                        self.dispatch(msg)?;
                    }
                    self.flush().await?;
                }
                Event::Read(Err(e)) => return Err(Error::Io(e)),
                Event::Flow(Some(resume)) => {
                    trace!(engine = %self.id, resume, "flow control signal");
                    self.want_read = resume;
                }
                Event::Flow(None) => {
                    // Signal source dropped: resume and unsubscribe.
                    self.flow = None;
                    self.want_read = true;
                }
                Event::Copy(Some(chunk)) => {
                    self.sink.put_copy_data(&chunk);
                    self.flush().await?;
                }
                Event::Copy(None) => {
                    // Input exhausted: finish the COPY and the pipeline.
                    self.copy_source = None;
                    self.sink.put_copy_done();
                    self.sink.put_close(b'S', b"");
                    self.sink.put_sync();
                    self.flush().await?;
                }
            }
        }
    }

    /// Handles one command; returns `true` when the engine should stop.
    async fn handle_command(&mut self, cmd: Command) -> Result<bool> {
        match cmd {
            Command::Connect { reply } => {
                let _ = reply.send(Err(Error::AlreadyConnected));
            }
            Command::HandleQuery { query, reply } => {
                if self.active.is_some() {
                    drop(query);
                    let _ = reply.send(Err(Error::Busy));
                } else if self.phase != Phase::Ready {
                    drop(query);
                    let _ = reply.send(Err(Error::Disconnected));
                } else {
                    match self.start_query(query) {
                        Ok(()) => {
                            let _ = reply.send(Ok(()));
                            self.flush().await?;
                        }
                        // A bad query (unencodable text) fails only the
                        // query; the connection is untouched.
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
            }
            Command::Parameter { name, reply } => {
                let receiver = self.parameters.get(&name).map(|tx| tx.subscribe());
                let _ = reply.send(receiver);
            }
            Command::BackendKey { reply } => {
                let _ = reply.send(self.backend_key);
            }
            Command::Close { reply } => {
                self.sink.put_terminate();
                let _ = self.flush().await;
                let _ = reply.send(());
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Enqueues the frontend messages for a query and marks it active.
    fn start_query(&mut self, query: Query) -> Result<()> {
        let encoding = self.config.encoding;
        let sql = encoding.encode(&query.sql)?;
        let mut params = Vec::with_capacity(query.params.len());
        for param in &query.params {
            params.push(match param {
                Some(text) => Some(encoding.encode(text)?),
                None => None,
            });
        }

        match query.kind {
            QueryKind::Simple => {
                self.sink.put_query(&sql);
            }
            QueryKind::Extended => {
                self.sink.put_parse(b"", &sql, &[]);
                self.sink.put_bind(b"", b"", &params);
                self.sink.put_describe(b'P', b"");
                self.sink.put_execute(b"", 0);
                // For COPY IN the Close/Sync are deferred until the input
                // source runs dry.
                if query.input.is_none() {
                    self.sink.put_close(b'S', b"");
                    self.sink.put_sync();
                }
            }
        }

        trace!(engine = %self.id, sql = query.sql.as_str(), "query started");
        self.active = Some(ActiveQuery::new(query));
        self.phase = Phase::InQuery;
        if let Some(ready) = &self.ready_for_query {
            ready.send_replace(String::new());
        }
        Ok(())
    }

    // ==================== Dispatch ====================

    /// Routes one backend message. Any error out of here is fatal for
    /// the connection: a partially-applied message leaves the protocol
    /// state untrustworthy, so the transport is closed rather than risk
    /// advancing a broken session.
    fn dispatch(&mut self, msg: BackendMessage) -> Result<()> {
        match msg {
            BackendMessage::Authentication(_) => {
                warn!(engine = %self.id, "ignoring authentication request after startup");
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.upsert_parameter(name, value);
            }
            BackendMessage::BackendKeyData { process_id, secret_key } => {
                debug!(engine = %self.id, process_id, "backend key data");
                self.backend_key = Some((process_id, secret_key));
            }
            BackendMessage::ReadyForQuery { status } => {
                if let Some(mut active) = self.active.take() {
                    // A query that reached ReadyForQuery without a
                    // CommandComplete (an empty query, say) still
                    // completes, with an empty tag.
                    active.complete(String::new());
                }
                self.flow = None;
                self.copy_source = None;
                self.want_read = true;
                self.publish_ready(status);
            }
            BackendMessage::RowDescription(description) => match &mut self.active {
                Some(active) => active.attach_description(description),
                None => warn!(engine = %self.id, "row description with no active query"),
            },
            BackendMessage::DataRow(values) => self.dispatch_data_row(values)?,
            BackendMessage::CommandComplete { tag } => {
                trace!(engine = %self.id, tag = tag.as_str(), "command complete");
                self.flow = None;
                self.want_read = true;
                match &mut self.active {
                    Some(active) => active.complete(tag),
                    None => warn!(engine = %self.id, "command complete with no active query"),
                }
            }
            BackendMessage::EmptyQueryResponse => {
                trace!(engine = %self.id, "empty query response");
            }
            BackendMessage::NoData
            | BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::PortalSuspended => {
                trace!(engine = %self.id, "pipeline acknowledgement");
            }
            BackendMessage::CloseComplete => {
                trace!(engine = %self.id, "close complete");
                self.flow = None;
                self.want_read = true;
            }
            BackendMessage::ErrorResponse(e) => {
                match &mut self.active {
                    Some(active) => {
                        debug!(engine = %self.id, error = %e, "query failed");
                        self.flow = None;
                        self.want_read = true;
                        active.fail(Error::Server(e));
                    }
                    None => warn!(engine = %self.id, error = %e, "server error outside any query"),
                }
            }
            BackendMessage::NoticeResponse(notice) => {
                warn!(engine = %self.id, notice = %notice, "server notice");
            }
            BackendMessage::NotificationResponse { channel, payload, .. } => {
                if let Some(pool) = self.pool.upgrade() {
                    pool.notification(self.id, &channel, &payload);
                }
            }
            BackendMessage::CopyInResponse => {
                let Some(active) = &mut self.active else {
                    warn!(engine = %self.id, "copy-in response with no active query");
                    return Ok(());
                };
                active.mark_ready_to_stream();
                match active.input.take() {
                    Some(source) => self.copy_source = Some(source),
                    None => {
                        active.fail(Error::Protocol(
                            "server requested COPY IN but the query has no input source".into(),
                        ));
                        self.sink.put_copy_fail("no input source");
                        self.sink.put_sync();
                    }
                }
            }
            BackendMessage::CopyOutResponse => {
                trace!(engine = %self.id, "copy out started");
            }
            BackendMessage::CopyData(bytes) => {
                let encoding = self.config.encoding;
                match &mut self.active {
                    Some(active) => {
                        let text = encoding.decode(&bytes)?;
                        active.deliver(Row::copy_chunk(text));
                    }
                    None => warn!(engine = %self.id, "discarding copy data with no active query"),
                }
            }
            BackendMessage::CopyDone => {
                trace!(engine = %self.id, "copy out finished");
            }
            BackendMessage::Unknown { code } => {
                warn!(engine = %self.id, %code, "ignoring unknown backend message");
            }
        }
        Ok(())
    }

    fn dispatch_data_row(&mut self, values: Vec<Option<Bytes>>) -> Result<()> {
        let encoding = self.config.encoding;
        let Some(active) = &mut self.active else {
            warn!(engine = %self.id, "discarding data row with no active query");
            return Ok(());
        };

        // The first row lazily subscribes to the query's flow-control
        // signal; from here on the consumer can pause socket reads.
        if self.flow.is_none() && active.flow_control.is_some() {
            self.flow = active.flow_control.take();
        }

        let description = active
            .description
            .clone()
            .unwrap_or_else(|| Arc::new(RowDescription::default()));
        let mut decoded = Vec::with_capacity(values.len());
        for value in values {
            decoded.push(match value {
                Some(bytes) => Some(encoding.decode(&bytes)?),
                None => None,
            });
        }
        active.deliver(Row::new(description, decoded));
        Ok(())
    }

    fn upsert_parameter(&mut self, name: String, value: String) {
        trace!(engine = %self.id, name = name.as_str(), value = value.as_str(), "parameter status");
        match self.parameters.get(&name) {
            Some(tx) => {
                tx.send_replace(value);
            }
            None => {
                let (tx, _) = watch::channel(value);
                self.parameters.insert(name, tx);
            }
        }
    }

    fn publish_ready(&mut self, status: u8) {
        self.phase = Phase::Ready;
        let state = (status as char).to_string();
        trace!(engine = %self.id, state = state.as_str(), "ready for query");
        if let Some(ready) = &self.ready_for_query {
            ready.send_replace(state);
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.engine_ready(self.id);
        }
    }

    async fn flush(&mut self) -> Result<()> {
        if self.sink.is_empty() {
            return Ok(());
        }
        let bytes = self.sink.take();
        let transport = self.transport.as_mut().ok_or(Error::Disconnected)?;
        transport.write_all(&bytes).await?;
        Ok(())
    }

    // ==================== Teardown ====================

    /// Ordered, idempotent teardown. Every step tolerates the resource
    /// being already absent.
    async fn shutdown(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        let was_connected = self
            .connected
            .as_ref()
            .map(|tx| *tx.borrow())
            .unwrap_or(false);
        self.phase = Phase::Closed;

        // 1. Fail the active query.
        if let Some(mut active) = self.active.take() {
            active.fail(Error::Disconnected);
        }
        // 2. Cancel idle waiters (they watch ready_for_query).
        self.ready_for_query.take();
        // 3. Cancel authentication waiters.
        self.authenticated.take();
        // 4. Finish the connected observable: publish 0, then close it.
        if let Some(connected) = self.connected.take() {
            connected.send_replace(false);
        }
        // 5. Finish the outgoing sink.
        let _ = self.sink.take();
        // 6. Finish the incoming source.
        self.inbuf.clear();
        // 7. Close the socket and detach.
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown().await;
        }
        // 8. An outstanding connect future holds the reply sender inside
        //    drive(); it was dropped with that scope.
        // 9. Finish every parameter observable.
        self.parameters.clear();
        // 10. Drop codec state.
        self.flow = None;
        self.copy_source = None;
        self.want_read = false;

        if was_connected {
            if let Some(pool) = self.pool.upgrade() {
                pool.engine_disconnected(self.id);
            }
        }
        debug!(engine = %self.id, "engine torn down");
    }
}

/// Cloneable handle to a running engine task.
///
/// Dropping the last handle removes the engine from the reactor and
/// triggers teardown.
#[derive(Clone)]
pub struct EngineHandle {
    id: EngineId,
    commands: mpsc::Sender<Command>,
    connected: watch::Receiver<bool>,
    ready_for_query: watch::Receiver<String>,
    authenticated: watch::Receiver<bool>,
}

impl EngineHandle {
    pub fn id(&self) -> EngineId {
        self.id
    }

    /// Runs the connection bring-up: socket, optional TLS, startup,
    /// authentication, first `ReadyForQuery`.
    ///
    /// Cancelling the returned future at any phase tears the engine
    /// down. A second call fails with [`Error::AlreadyConnected`].
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { reply: tx })
            .await
            .map_err(|_| Error::Disconnected)?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Submits a query built with [`Query::new`] or [`Query::simple`].
    /// Fails with [`Error::Busy`] while another query is in flight.
    pub async fn handle_query(&self, query: Query) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::HandleQuery { query, reply: tx })
            .await
            .map_err(|_| Error::Disconnected)?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Runs `sql` through the simple-query protocol and returns the
    /// consumer handle; rows stream through it and completion arrives on
    /// its `completed` future.
    pub async fn simple_query(&self, sql: impl Into<String>) -> Result<QueryHandle> {
        let (query, handle) = Query::simple(sql);
        self.handle_query(query).await?;
        Ok(handle)
    }

    /// Observable connection flag: `false` → `true` once on successful
    /// transport establishment, back to `false` at most once, never up
    /// again.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Observable transaction state: empty while busy, otherwise the
    /// `ReadyForQuery` letter (`I`, `T`, or `E`).
    pub fn ready_for_query(&self) -> watch::Receiver<String> {
        self.ready_for_query.clone()
    }

    /// Resolves once the server accepts authentication; fails with
    /// [`Error::Disconnected`] when the engine dies first.
    pub async fn authenticated(&self) -> Result<()> {
        let mut rx = self.authenticated.clone();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            rx.changed().await.map_err(|_| Error::Disconnected)?;
        }
    }

    /// Resolves with the transaction-status letter the next time the
    /// engine is idle.
    pub async fn idle(&self) -> Result<char> {
        let mut rx = self.ready_for_query.clone();
        loop {
            let state = rx.borrow_and_update().chars().next();
            if let Some(state) = state {
                return Ok(state);
            }
            rx.changed().await.map_err(|_| Error::Disconnected)?;
        }
    }

    /// Observable for one backend parameter (`server_version`,
    /// `client_encoding`, ...). `None` until the server has reported it.
    pub async fn parameter(&self, name: impl Into<String>) -> Option<watch::Receiver<String>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Parameter { name: name.into(), reply: tx })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// The backend process id and secret key, once known. Kept for
    /// out-of-band cancellation, which this engine does not itself send.
    pub async fn backend_key_data(&self) -> Option<(u32, u32)> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::BackendKey { reply: tx })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Graceful close: sends `Terminate` and tears the engine down.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Close { reply: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}
