//! Sessions: one connection to Mariadb/Mysql and the state machine driving it
//!
//! Example:
//! --------
//! ```no_run
//! use mywire::{ConnectionOptions, ConnectionResult, Session};
//!
//! async fn test() -> ConnectionResult<()> {
//!     let options = ConnectionOptions::new()
//!         .address("127.0.0.1:3306")?
//!         .user("user")
//!         .password("pw")
//!         .database("test");
//!     let mut session = Session::connect(&options).await?;
//!
//!     let mut rows = session.query("SELECT `id`, `name` FROM `users`").await?;
//!     while let Some(row) = rows.next().await? {
//!         println!("{:?}", row);
//!     }
//!
//!     let statement = session.prepare("UPDATE `users` SET `name`=? WHERE `id`=?").await?;
//!     let ok = session
//!         .execute_statement(&statement, &["bob".into(), 42.into()])
//!         .await?;
//!     println!("updated {} rows", ok.affected_rows);
//!     session.close().await;
//!     Ok(())
//! }
//! ```
//!
//! All methods taking `&mut self` are cancel safe: if the returned future is dropped
//! the session remembers where in the exchange it was, and the next command first
//! reads and discards the rest of the response (see [Session::drain]).
use std::{
    borrow::Cow,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    sync::Arc,
    time::Instant,
};

use tracing::{debug, trace, warn};

use crate::{
    auth::{AuthContext, AuthContinuation, AuthPlugin},
    cache::{Procedure, ProcedureCache},
    cancel::{CancelHandle, CommandId, CommandTracker},
    codec::MAX_FRAME_LEN,
    constants::{client, com, session_track, status, type_},
    error::{
        ConnectionErrorContent, ConnectionResult, WithLoc, parse_mysql_error, unexpected,
    },
    handshake::{
        Capabilities, Credentials, ServerVersion, compose_change_user,
        compose_handshake_response, compose_ssl_request, connection_attributes, negotiate,
        parse_greeting, requested_capabilities,
    },
    options::{ConnectionOptions, SslMode},
    package_parser::PackageParser,
    payload::PayloadHandler,
    row::{Column, Row, RowFormat, parse_column_definition},
    stream::{self, Connected, ResolvedHost},
    value::Param,
};

/// Lifecycle state of a [Session]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Not connected yet
    Created,
    /// Establishing the transport
    Connecting,
    /// Performing the handshake and authentication
    Authenticating,
    /// Authenticated, applying session settings
    Opening,
    /// Idle and ready for the next command
    Ready,
    /// A command was sent and its response is not fully read
    Querying,
    /// Rows of a result set are being read
    Streaming,
    /// A cancel was requested for the command in flight
    Canceling,
    /// The session is being closed
    Closing,
    /// The session has been closed
    Closed,
    /// A fatal error occurred, the session can not be used
    Failed,
}

/// Where in the response to the current command the session is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pending {
    /// Nothing is outstanding
    Idle,
    /// The result header (OK, ERR or column count) has not been read
    Header {
        /// Rows will be in binary format
        binary: bool,
    },
    /// Column definitions are being read
    Columns {
        /// Column definitions left to read
        remaining: u64,
        /// Rows will be in binary format
        binary: bool,
    },
    /// The EOF package after the column definitions has not been read
    ColumnsEof {
        /// Rows will be in binary format
        binary: bool,
    },
    /// Rows are being read
    Rows {
        /// Rows are in binary format
        binary: bool,
    },
    /// The response to `COM_STMT_PREPARE` has not been read
    Prepare,
    /// Parameter and column definitions of a prepared statement are being read
    PrepareMetadata {
        /// Packages left to read
        remaining: u32,
        /// Close this statement once the metadata is read
        close: Option<u32>,
    },
    /// A single OK or ERR package is outstanding
    Ok,
}

/// A command to send to the server
#[derive(Clone, Copy, Debug)]
pub enum Command<'a> {
    /// Execute sql text, rows are returned in text format
    Query(&'a str),
    /// Prepare a statement
    Prepare(&'a str),
    /// Execute a prepared statement, rows are returned in binary format
    Execute {
        /// The statement to execute
        statement: &'a Statement,
        /// One parameter per placeholder
        params: &'a [Param<'a>],
    },
    /// Deallocate a prepared statement, the server sends no response
    CloseStatement(u32),
    /// Check that the connection is alive
    Ping,
    /// Change the default database
    InitDb(&'a str),
    /// Reset session state without reauthenticating
    ResetConnection,
    /// Tell the server we are going away, the server sends no response
    Quit,
}

/// The OK package returned by statements without result set
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OkPacket {
    /// Number of rows changed, deleted or inserted
    pub affected_rows: u64,
    /// Id generated by the last insert
    pub last_insert_id: u64,
    /// Server status flags, see [crate::constants::status]
    pub status: u16,
    /// Number of warnings
    pub warnings: u16,
    /// Human readable information about the statement
    pub info: String,
    /// The default database, if the statement changed it
    pub schema: Option<String>,
    /// Character set the client switched to, if the statement changed it
    charset: Option<u8>,
}

/// The first response to a query or statement execution
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResultHeader {
    /// The statement returned no result set
    Ok(OkPacket),
    /// A result set with this many columns follows
    Columns(usize),
}

/// A prepared statement
///
/// Deallocate it with [Session::close_statement] when it is no longer needed.
#[derive(Debug)]
pub struct Statement {
    /// Server side id of the statement
    id: u32,
    /// Definitions of the placeholders
    params: Vec<Column>,
    /// Columns of the result set
    columns: Vec<Column>,
}

impl Statement {
    /// Server side id of the statement
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of placeholders in the statement
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Definitions of the placeholders
    pub fn params(&self) -> &[Column] {
        &self.params
    }

    /// Columns of the result set
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }
}

/// Map the character set name reported by session tracking to its id
fn charset_id(name: &str) -> Option<u8> {
    Some(match name {
        "utf8mb4" => 45,
        "utf8" | "utf8mb3" => 33,
        "latin1" => 8,
        "ascii" => 11,
        "binary" => 63,
        _ => return None,
    })
}

/// Parse an OK package, the header byte must have been read
fn parse_ok(p: &mut PackageParser<'_>, session_tracking: bool) -> ConnectionResult<OkPacket> {
    let affected_rows = p.get_lenenc().loc("affected_rows")?;
    let last_insert_id = p.get_lenenc().loc("last_insert_id")?;
    let status = p.get_u16().loc("status_flags")?;
    let warnings = p.get_u16().loc("warnings")?;
    let mut ok = OkPacket {
        affected_rows,
        last_insert_id,
        status,
        warnings,
        ..Default::default()
    };
    if !session_tracking {
        ok.info = String::from_utf8_lossy(p.get_eof_bytes()).into_owned();
        return Ok(ok);
    }
    if p.remaining() != 0 {
        ok.info = String::from_utf8_lossy(p.get_lenenc_blob().loc("info")?).into_owned();
    }
    if status & status::SESSION_STATE_CHANGED == 0 || p.remaining() == 0 {
        return Ok(ok);
    }
    let mut changes = PackageParser::new(p.get_lenenc_blob().loc("session_state")?);
    while changes.remaining() != 0 {
        let kind = changes.get_u8().loc("session_state_type")?;
        let mut data = PackageParser::new(changes.get_lenenc_blob().loc("session_state_data")?);
        match kind {
            session_track::SCHEMA => {
                ok.schema = Some(data.get_lenenc_str().loc("schema")?.to_string());
            }
            session_track::SYSTEM_VARIABLES => {
                let name = data.get_lenenc_str().loc("variable name")?;
                let value = data.get_lenenc_str().loc("variable value")?;
                if name == "character_set_client" {
                    ok.charset = charset_id(value);
                }
            }
            _ => (),
        }
    }
    Ok(ok)
}

/// Return true for the error sent when a kill interrupted the command
fn is_interrupted(e: &crate::error::ConnectionError) -> bool {
    matches!(e.content(), ConnectionErrorContent::QueryInterrupted(_))
}

/// Compute string to begin transaction
fn begin_transaction_query(depth: usize) -> Cow<'static, str> {
    match depth {
        0 => "BEGIN".into(),
        v => format!("SAVEPOINT mywire_sp_{v}").into(),
    }
}

/// Compute string to commit transaction
fn commit_transaction_query(depth: usize) -> Cow<'static, str> {
    match depth {
        0 => "COMMIT".into(),
        v => format!("RELEASE SAVEPOINT mywire_sp_{v}").into(),
    }
}

/// Compute string to rollback transaction
fn rollback_transaction_query(depth: usize) -> Cow<'static, str> {
    match depth {
        0 => "ROLLBACK".into(),
        v => format!("ROLLBACK TO SAVEPOINT mywire_sp_{v}").into(),
    }
}

/// A connection to Mariadb/Mysql
pub struct Session {
    /// Framing, compression and the transport
    io: PayloadHandler,
    /// The options the session was opened with
    options: Arc<ConnectionOptions>,
    /// Lifecycle state
    state: SessionState,
    /// What is left of the response to the current command
    pending: Pending,
    /// Server side id of the connection
    connection_id: u32,
    /// Version of the server
    server_version: ServerVersion,
    /// Negotiated capabilities
    capabilities: Capabilities,
    /// Last reported server status flags
    status: u16,
    /// Current character set
    charset: u8,
    /// Current default database
    database: Option<String>,
    /// Column definitions of the current result set
    columns: Vec<Column>,
    /// The current transaction depth
    transaction_depth: usize,
    /// The number of transactions to roll back during drain
    cleanup_rollbacks: usize,
    /// Id given to the next command
    next_command: u64,
    /// The command whose response is being read
    current: Option<CommandId>,
    /// Shared with cancel handles
    tracker: Arc<CommandTracker>,
    /// A kill may arrive after the last command finished
    absorb_kill: bool,
    /// Nonce of the last authentication exchange
    nonce: Vec<u8>,
    /// Authentication plugin of the last authentication exchange
    plugin: String,
    /// When the connection was established
    created: Instant,
    /// When the last command was sent
    last_used: Instant,
    /// Pool generation the session belongs to
    generation: u64,
    /// Addresses the host resolved to when connecting
    resolved: Option<ResolvedHost>,
    /// Cache of stored procedure metadata
    procedures: ProcedureCache,
    #[cfg(feature = "cancel_testing")]
    /// Return TestCancelled after this many awaits
    cancel_count: Option<usize>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection_id", &self.connection_id)
            .field("server_version", &self.server_version.raw)
            .field("state", &self.state)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Connect to Mariadb/Mysql
    pub async fn connect(options: &ConnectionOptions) -> ConnectionResult<Self> {
        Self::open(Arc::new(options.clone()), ProcedureCache::default()).await
    }

    /// Connect, authenticate and apply the session settings
    ///
    /// The returned future is cancel safe, it does not mutate shared state
    pub(crate) async fn open(
        options: Arc<ConnectionOptions>,
        procedures: ProcedureCache,
    ) -> ConnectionResult<Self> {
        let deadline = tokio::time::Instant::now() + options.connect_timeout;
        trace!(state = ?SessionState::Connecting, "Opening session");
        // The transport reports UnableToConnect with every address attempted on its own deadline
        let connected = stream::connect(&options).await?;
        match tokio::time::timeout_at(deadline, Self::open_inner(options, procedures, connected))
            .await
        {
            Ok(r) => r,
            Err(_) => Err(ConnectionErrorContent::Timeout("opening session").into()),
        }
    }

    /// Perform the work of [Self::open] once the transport is connected
    async fn open_inner(
        options: Arc<ConnectionOptions>,
        procedures: ProcedureCache,
        connected: Connected,
    ) -> ConnectionResult<Self> {
        let Connected { stream, resolved } = connected;
        let mut io = PayloadHandler::new(stream);

        let greeting = parse_greeting(io.read().await?)?;
        debug!(
            connection_id = greeting.connection_id,
            server_version = %greeting.server_version,
            plugin = %greeting.plugin,
            "Received greeting"
        );

        let server_ssl = greeting.capabilities & client::SSL != 0;
        let tls = match options.ssl_mode {
            SslMode::Disabled => false,
            SslMode::Preferred => server_ssl && io.is_tcp(),
            mode => {
                if io.is_tcp() && !server_ssl {
                    return Err(ConnectionErrorContent::Tls(format!(
                        "ssl mode {mode:?} requested but the server does not support TLS"
                    ))
                    .into());
                }
                io.is_tcp()
            }
        };
        let capabilities = negotiate(requested_capabilities(&options, tls), &greeting);

        if tls {
            compose_ssl_request(&mut io.compose(), &capabilities, options.charset);
            io.finalize()?;
            io.send().await?;
            let host = resolved
                .as_ref()
                .map(|r| r.host.as_str())
                .unwrap_or("localhost");
            io = io
                .upgrade_tls(stream::tls_connector(&options)?, stream::server_name(host)?)
                .await?;
            debug!(connection_id = greeting.connection_id, "Upgraded to TLS");
        }

        let now = Instant::now();
        let mut session = Session {
            io,
            state: SessionState::Authenticating,
            pending: Pending::Idle,
            connection_id: greeting.connection_id,
            server_version: greeting.server_version,
            capabilities,
            status: greeting.status,
            charset: options.charset,
            database: None,
            columns: Vec::new(),
            transaction_depth: 0,
            cleanup_rollbacks: 0,
            next_command: 1,
            current: None,
            tracker: Default::default(),
            absorb_kill: false,
            nonce: greeting.nonce,
            plugin: greeting.plugin,
            created: now,
            last_used: now,
            generation: 0,
            resolved,
            procedures,
            options,
            #[cfg(feature = "cancel_testing")]
            cancel_count: None,
        };

        // An unknown initial plugin is replaced by native password, the server
        // will ask us to switch if it insists
        let plugin = match session.options.auth_plugins.get(&session.plugin) {
            Some(p) => p,
            None => {
                session.plugin = "mysql_native_password".to_string();
                session.lookup_plugin()?
            }
        };
        let auth_response = plugin.initial_response(&session.auth_context())?;
        let attributes = connection_attributes(&session.options);
        compose_handshake_response(
            &mut session.io.compose(),
            &session.capabilities,
            session.charset,
            &Credentials {
                user: &session.options.user,
                auth_response: &auth_response,
                database: session.options.database.as_deref(),
                plugin: &session.plugin,
                attributes: &attributes,
            },
        );
        session.io.finalize()?;
        session.io.send().await?;
        session.authenticate(plugin).await?;
        if session.capabilities.connect_with_db() {
            session.database = session.options.database.clone();
        }

        session.state = SessionState::Opening;
        if session.capabilities.compression() {
            session.io.enable_compression();
        }
        session.apply_settings().await?;
        session.state = SessionState::Ready;
        debug!(
            connection_id = session.connection_id,
            compressed = session.io.is_compressed(),
            tls = session.capabilities.ssl(),
            "Session opened"
        );
        Ok(session)
    }

    /// Select the configured database and set the configured session variables
    async fn apply_settings(&mut self) -> ConnectionResult<()> {
        if let Some(db) = self.options.database.clone()
            && self.database.as_deref() != Some(db.as_str())
        {
            self.init_db(&db).await?;
        }
        if let Some(sql) = self.options.session_variables_statement() {
            self.execute(&sql).await?;
        }
        Ok(())
    }

    /// Find the plugin named self.plugin
    fn lookup_plugin(&self) -> ConnectionResult<Arc<dyn AuthPlugin>> {
        self.options.auth_plugins.get(&self.plugin).ok_or_else(|| {
            ConnectionErrorContent::Authentication(format!(
                "Unsupported authentication plugin {}",
                self.plugin
            ))
            .into()
        })
    }

    /// Input to the authentication plugins
    fn auth_context(&self) -> AuthContext<'_> {
        AuthContext {
            password: &self.options.password,
            nonce: &self.nonce,
            secure: self.io.is_secure(),
            server_public_key: self.options.server_rsa_public_key.as_deref(),
            allow_public_key_retrieval: self.options.allow_public_key_retrieval,
            allow_cleartext_password: self.options.allow_cleartext_password,
        }
    }

    /// Run the authentication exchange after the initial response has been sent
    async fn authenticate(&mut self, mut plugin: Arc<dyn AuthPlugin>) -> ConnectionResult<()> {
        let mut switched = false;
        loop {
            let session_tracking = self.capabilities.session_track();
            let package = self.read().await?;
            let mut p = PackageParser::new(package);
            match p.get_u8().loc("authentication response")? {
                0x00 => {
                    let ok = parse_ok(&mut p, session_tracking)?;
                    self.apply_ok(&ok);
                    debug!(connection_id = self.connection_id, plugin = %self.plugin, "Authenticated");
                    return Ok(());
                }
                0xFF => {
                    let e = parse_mysql_error(&mut p);
                    return Err(ConnectionErrorContent::Authentication(e.to_string()).into());
                }
                0xFE => {
                    if switched {
                        return Err(ConnectionErrorContent::Authentication(
                            "Server requested a second authentication switch".to_string(),
                        )
                        .into());
                    }
                    if p.remaining() == 0 {
                        return Err(ConnectionErrorContent::Authentication(
                            "Old password authentication is not supported".to_string(),
                        )
                        .into());
                    }
                    switched = true;
                    let name = p.get_null_str().loc("plugin name")?.to_string();
                    let data = p.get_eof_bytes();
                    self.nonce = data.strip_suffix(&[0]).unwrap_or(data).to_vec();
                    debug!(connection_id = self.connection_id, from = %self.plugin, to = %name, "Authentication switch");
                    self.plugin = name;
                    plugin = self.lookup_plugin()?;
                    let response = plugin.initial_response(&self.auth_context())?;
                    self.io.compose().put_bytes(&response);
                    self.io.finalize()?;
                    self.flush().await?;
                }
                0x01 => {
                    let data = p.get_eof_bytes().to_vec();
                    match plugin.continue_auth(&self.auth_context(), &data)? {
                        AuthContinuation::Wait => (),
                        AuthContinuation::Send(response) => {
                            self.io.compose().put_bytes(&response);
                            self.io.finalize()?;
                            self.flush().await?;
                        }
                    }
                }
                v => return Err(unexpected("authentication", v)),
            }
        }
    }

    /// Can be called self.cancel_count times
    /// before it returns Err(ConnectionError::TestCancelled)
    ///
    /// This is used to to test that that we can properly recover
    /// from dropped futures
    #[inline]
    fn test_cancel(&mut self) -> ConnectionResult<()> {
        #[cfg(feature = "cancel_testing")]
        if let Some(v) = &mut self.cancel_count {
            if *v == 0 {
                return Err(ConnectionErrorContent::TestCancelled.into());
            }
            *v -= 1;
        }
        Ok(())
    }

    /// Write queued bytes
    async fn flush(&mut self) -> ConnectionResult<()> {
        self.test_cancel()?;
        self.io.send().await
    }

    /// Read the next payload
    async fn read(&mut self) -> ConnectionResult<&[u8]> {
        self.test_cancel()?;
        self.io.read().await
    }

    /// Move to [SessionState::Failed] if the error is fatal
    fn check<T>(&mut self, r: ConnectionResult<T>) -> ConnectionResult<T> {
        if let Err(e) = &r
            && e.is_fatal()
            && self.state != SessionState::Failed
        {
            debug!(connection_id = self.connection_id, error = %e, "Session failed");
            self.state = SessionState::Failed;
            self.pending = Pending::Idle;
            if let Some(id) = self.current.take() {
                self.tracker.finish(id);
            }
        }
        r
    }

    /// Return an error if the session can not run commands
    fn ensure_usable(&self) -> ConnectionResult<()> {
        match self.state {
            SessionState::Failed => Err(ConnectionErrorContent::SessionFailed.into()),
            SessionState::Closing | SessionState::Closed => {
                Err(ConnectionErrorContent::InvalidState("session is closed").into())
            }
            SessionState::Created | SessionState::Connecting | SessionState::Authenticating => {
                Err(ConnectionErrorContent::InvalidState("session setup was interrupted").into())
            }
            _ => Ok(()),
        }
    }

    /// The response to the current command has been read completely
    fn complete(&mut self, interrupted: bool) {
        self.pending = Pending::Idle;
        if matches!(
            self.state,
            SessionState::Querying | SessionState::Streaming
        ) {
            self.state = SessionState::Ready;
        }
        if let Some(id) = self.current.take()
            && self.tracker.finish(id)
            && !interrupted
        {
            self.absorb_kill = true;
        }
    }

    /// Apply the session state reported in an OK package
    fn apply_ok(&mut self, ok: &OkPacket) {
        self.status = ok.status;
        if let Some(schema) = &ok.schema {
            self.database = Some(schema.clone());
        }
        if let Some(charset) = ok.charset {
            self.charset = charset;
        }
    }

    /// A result ended with the given status
    fn end_result(&mut self, status: u16, binary: bool) {
        self.status = status;
        if status & status::MORE_RESULTS_EXISTS != 0 {
            self.pending = Pending::Header { binary };
            self.state = SessionState::Querying;
        } else {
            self.complete(false);
        }
    }

    /// Compose and queue a command, the session must be idle
    fn start(&mut self, command: Command<'_>) -> ConnectionResult<CommandId> {
        if self.pending != Pending::Idle || self.io.has_unsent() {
            return Err(ConnectionErrorContent::InvalidState("a command is in progress").into());
        }
        if let Command::Execute { statement, params } = command
            && statement.param_count() != params.len()
        {
            return Err(ConnectionErrorContent::ParameterCount {
                expected: statement.param_count(),
                got: params.len(),
            }
            .into());
        }
        let query_attributes = self.capabilities.query_attributes();
        self.io.start_command();
        let mut w = self.io.compose();
        let pending = match command {
            Command::Query(sql) => {
                w.put_u8(com::QUERY);
                if query_attributes {
                    w.put_lenenc(0); // parameter count
                    w.put_lenenc(1); // parameter set count
                }
                w.put_bytes(sql.as_bytes());
                Pending::Header { binary: false }
            }
            Command::Prepare(sql) => {
                w.put_u8(com::STMT_PREPARE);
                w.put_bytes(sql.as_bytes());
                Pending::Prepare
            }
            Command::Execute { statement, params } => {
                w.put_u8(com::STMT_EXECUTE);
                w.put_u32(statement.id);
                w.put_u8(0); // flags
                w.put_u32(1); // iteration_count
                if !params.is_empty() {
                    if query_attributes {
                        w.put_lenenc(params.len() as u64); // parameter count
                    }
                    let mut nulls = vec![0u8; params.len().div_ceil(8)];
                    for (i, p) in params.iter().enumerate() {
                        if matches!(p, Param::Null) {
                            nulls[i / 8] |= 1 << (i % 8);
                        }
                    }
                    w.put_bytes(&nulls);
                    w.put_u8(1); // send types
                    for p in params {
                        let (t, unsigned) = match p {
                            Param::Null => (type_::NULL, false),
                            Param::Int(_) => (type_::LONG_LONG, false),
                            Param::UInt(_) => (type_::LONG_LONG, true),
                            Param::Double(_) => (type_::DOUBLE, false),
                            Param::Bytes(_) => (type_::BLOB, false),
                            Param::Str(_) => (type_::VAR_STRING, false),
                        };
                        w.put_u8(t);
                        w.put_u8(if unsigned { 0x80 } else { 0 });
                        if query_attributes {
                            w.put_lenenc(0); // empty parameter name
                        }
                    }
                    for p in params {
                        match *p {
                            Param::Null => (),
                            Param::Int(v) => w.put_u64(v as u64),
                            Param::UInt(v) => w.put_u64(v),
                            Param::Double(v) => w.put_f64(v),
                            Param::Bytes(v) => w.put_lenenc_bytes(v),
                            Param::Str(v) => w.put_lenenc_bytes(v.as_bytes()),
                        }
                    }
                }
                Pending::Header { binary: true }
            }
            Command::CloseStatement(id) => {
                w.put_u8(com::STMT_CLOSE);
                w.put_u32(id);
                Pending::Idle
            }
            Command::Ping => {
                w.put_u8(com::PING);
                Pending::Ok
            }
            Command::InitDb(db) => {
                w.put_u8(com::INIT_DB);
                w.put_bytes(db.as_bytes());
                Pending::Ok
            }
            Command::ResetConnection => {
                w.put_u8(com::RESET_CONNECTION);
                Pending::Ok
            }
            Command::Quit => {
                w.put_u8(com::QUIT);
                Pending::Idle
            }
        };
        self.io.finalize()?;

        let id = CommandId(self.next_command);
        self.next_command += 1;
        self.last_used = Instant::now();
        self.pending = pending;
        if pending != Pending::Idle {
            self.current = Some(id);
            self.tracker.begin(id);
            self.state = SessionState::Querying;
        }
        trace!(connection_id = self.connection_id, command = %id, ?command, "Send command");
        Ok(id)
    }

    /// Send a command to the server
    ///
    /// Whatever is left of the previous command is drained first.
    /// Read the response with [Self::read_result_header] and [Self::next_row].
    pub async fn send_command(&mut self, command: Command<'_>) -> ConnectionResult<CommandId> {
        self.drain().await?;
        let r = self.start(command);
        let id = self.check(r)?;
        let r = self.flush().await;
        self.check(r)?;
        Ok(id)
    }

    /// Read the result header of a query or statement execution
    pub async fn read_result_header(&mut self) -> ConnectionResult<ResultHeader> {
        let r = self.read_header_inner().await;
        self.check(r)
    }

    /// Read the result header and the column definitions following it
    async fn read_header_inner(&mut self) -> ConnectionResult<ResultHeader> {
        let Pending::Header { binary } = self.pending else {
            return Err(ConnectionErrorContent::InvalidState("no result header pending").into());
        };
        let session_tracking = self.capabilities.session_track();
        let package = self.read().await?;
        let mut p = PackageParser::new(package);
        match p.peek_u8().loc("first_byte")? {
            0x00 => {
                p.get_u8().loc("first_byte")?;
                let ok = parse_ok(&mut p, session_tracking)?;
                self.apply_ok(&ok);
                self.end_result(ok.status, binary);
                return Ok(ResultHeader::Ok(ok));
            }
            0xFF => {
                p.get_u8().loc("first_byte")?;
                let e = parse_mysql_error(&mut p);
                self.complete(is_interrupted(&e));
                return Err(e);
            }
            0xFB => {
                return Err(ConnectionErrorContent::ProtocolError(
                    "LOCAL INFILE requests are not supported".to_string(),
                )
                .into());
            }
            _ => (),
        }
        let count = p.get_lenenc().loc("column_count")?;
        self.columns.clear();
        self.pending = Pending::Columns {
            remaining: count,
            binary,
        };
        self.read_columns().await?;
        Ok(ResultHeader::Columns(count as usize))
    }

    /// Read column definitions until the rows start
    async fn read_columns(&mut self) -> ConnectionResult<()> {
        loop {
            match self.pending {
                Pending::Columns {
                    remaining: 0,
                    binary,
                } => {
                    if self.capabilities.deprecate_eof() {
                        self.pending = Pending::Rows { binary };
                        self.state = SessionState::Streaming;
                    } else {
                        self.pending = Pending::ColumnsEof { binary };
                    }
                }
                Pending::Columns { remaining, binary } => {
                    let package = self.read().await?;
                    let column = parse_column_definition(package)?;
                    self.columns.push(column);
                    self.pending = Pending::Columns {
                        remaining: remaining - 1,
                        binary,
                    };
                }
                Pending::ColumnsEof { binary } => {
                    let package = self.read().await?;
                    if package.first() != Some(&0xFE) {
                        return Err(ConnectionErrorContent::ProtocolError(
                            "Expected EOF after column definitions".to_string(),
                        )
                        .into());
                    }
                    self.pending = Pending::Rows { binary };
                    self.state = SessionState::Streaming;
                }
                _ => return Ok(()),
            }
        }
    }

    /// Read the next package of a result set
    ///
    /// Returns the format of the row if a row was read, it is then
    /// available as the last payload
    async fn advance_row(&mut self) -> ConnectionResult<Option<RowFormat>> {
        let Pending::Rows { binary } = self.pending else {
            return Ok(None);
        };
        let deprecate_eof = self.capabilities.deprecate_eof();
        let session_tracking = self.capabilities.session_track();
        let package = self.read().await?;
        let len = package.len();
        let mut p = PackageParser::new(package);
        match p.get_u8().loc("row header")? {
            0xFE if deprecate_eof && len < MAX_FRAME_LEN => {
                let ok = parse_ok(&mut p, session_tracking)?;
                self.apply_ok(&ok);
                self.end_result(ok.status, binary);
                Ok(None)
            }
            0xFE if !deprecate_eof && len < 9 => {
                p.get_u16().loc("warnings")?;
                let status = p.get_u16().loc("status_flags")?;
                self.end_result(status, binary);
                Ok(None)
            }
            0xFF => {
                let e = parse_mysql_error(&mut p);
                self.complete(is_interrupted(&e));
                Err(e)
            }
            _ if binary => Ok(Some(RowFormat::Binary)),
            _ => Ok(Some(RowFormat::Text)),
        }
    }

    /// Read the next row of the current result set
    ///
    /// Returns None when the result set has ended. An error package ends the result
    /// with a [ConnectionErrorContent::Mysql] error, the session stays usable.
    pub async fn next_row(&mut self) -> ConnectionResult<Option<Row<'_>>> {
        let r = self.advance_row().await;
        match self.check(r)? {
            Some(format) => Ok(Some(Row::new(
                &self.columns,
                self.io.last_payload(),
                format,
            ))),
            None => Ok(None),
        }
    }

    /// Skip the rest of the current result and read the header of the next one
    ///
    /// Returns None if the command produced no more results
    pub async fn next_result(&mut self) -> ConnectionResult<Option<ResultHeader>> {
        let r = self.read_columns().await;
        self.check(r)?;
        while self.next_row().await?.is_some() {}
        if matches!(self.pending, Pending::Header { .. }) {
            self.read_result_header().await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read the header of a prepare response
    ///
    /// Returns the statement id and the number of parameters and columns
    async fn read_prepare_header(&mut self) -> ConnectionResult<(u32, u16, u16)> {
        let deprecate_eof = self.capabilities.deprecate_eof();
        let package = self.read().await?;
        let mut p = PackageParser::new(package);
        match p.get_u8().loc("response type")? {
            0x00 => {
                let id = p.get_u32().loc("stmt_id")?;
                let columns = p.get_u16().loc("num_columns")?;
                let params = p.get_u16().loc("num_params")?;
                let eofs = if deprecate_eof {
                    0
                } else {
                    u32::from(columns != 0) + u32::from(params != 0)
                };
                self.pending = Pending::PrepareMetadata {
                    remaining: u32::from(columns) + u32::from(params) + eofs,
                    close: Some(id),
                };
                Ok((id, params, columns))
            }
            0xFF => {
                let e = parse_mysql_error(&mut p);
                self.complete(false);
                Err(e)
            }
            v => Err(unexpected("prepare statement", v)),
        }
    }

    /// Read the rest of a prepare response, collecting column definitions
    async fn read_prepare_metadata(&mut self, mut out: Option<&mut Vec<Column>>) -> ConnectionResult<()> {
        while let Pending::PrepareMetadata { remaining, close } = self.pending {
            if remaining == 0 {
                self.complete(false);
                if let (Some(id), None) = (close, &out) {
                    // The prepare was abandoned, deallocate the statement
                    self.start(Command::CloseStatement(id))?;
                    self.flush().await?;
                }
                break;
            }
            let package = self.read().await?;
            let is_eof = package.first() == Some(&0xFE) && package.len() < 9;
            if let Some(out) = &mut out
                && !is_eof
            {
                out.push(parse_column_definition(package)?);
            }
            self.pending = Pending::PrepareMetadata {
                remaining: remaining - 1,
                close,
            };
        }
        Ok(())
    }

    /// Read a response consisting of a single OK or ERR package
    async fn read_ok_inner(&mut self) -> ConnectionResult<OkPacket> {
        if self.pending != Pending::Ok {
            return Err(ConnectionErrorContent::InvalidState("no response pending").into());
        }
        let session_tracking = self.capabilities.session_track();
        let package = self.read().await?;
        let mut p = PackageParser::new(package);
        match p.get_u8().loc("response type")? {
            0x00 => {
                let ok = parse_ok(&mut p, session_tracking)?;
                self.apply_ok(&ok);
                self.complete(false);
                Ok(ok)
            }
            0xFF => {
                let e = parse_mysql_error(&mut p);
                self.complete(is_interrupted(&e));
                Err(e)
            }
            v => Err(unexpected("command", v)),
        }
    }

    /// Read whatever is left of the response to the current command
    ///
    /// Errors reported by the server are discarded
    async fn finish_pending(&mut self) -> ConnectionResult<()> {
        loop {
            let r = match self.pending {
                Pending::Idle => return Ok(()),
                Pending::Header { .. } => self.read_header_inner().await.map(|_| ()),
                Pending::Columns { .. } | Pending::ColumnsEof { .. } => self.read_columns().await,
                Pending::Rows { .. } => self.advance_row().await.map(|_| ()),
                Pending::Prepare => self.read_prepare_header().await.map(|_| ()),
                Pending::PrepareMetadata { .. } => self.read_prepare_metadata(None).await,
                Pending::Ok => self.read_ok_inner().await.map(|_| ()),
            };
            if let Err(e) = r
                && e.server_code().is_none()
            {
                return Err(e);
            }
        }
    }

    /// Send a statement and read its OK response, the session must be idle
    async fn run(&mut self, sql: &str) -> ConnectionResult<OkPacket> {
        self.start(Command::Query(sql))?;
        self.flush().await?;
        match self.read_header_inner().await? {
            ResultHeader::Ok(ok) => Ok(ok),
            ResultHeader::Columns(_) => Err(ConnectionErrorContent::UnexpectedRows.into()),
        }
    }

    /// Perform the work of [Self::drain]
    async fn drain_inner(&mut self) -> ConnectionResult<()> {
        self.ensure_usable()?;
        if self.io.has_unsent() {
            self.flush().await?;
        }
        self.finish_pending().await?;

        if self.absorb_kill {
            debug!(connection_id = self.connection_id, "Absorbing late kill");
            self.absorb_kill = false;
            match self.run("DO SLEEP(0)").await {
                Ok(_) => (),
                Err(e) if e.server_code().is_some() => (),
                Err(e) => return Err(e),
            }
            self.finish_pending().await?;
        }

        if self.cleanup_rollbacks != 0 {
            // Once run has been called we will have rolled back to this level once drain succeeds
            self.transaction_depth = self.transaction_depth.saturating_sub(self.cleanup_rollbacks);
            self.cleanup_rollbacks = 0;
            let sql = rollback_transaction_query(self.transaction_depth);
            self.run(&sql).await?;
            self.finish_pending().await?;
        }
        Ok(())
    }

    /// Finish up any partially executed command as quickly as possible
    ///
    /// Unsent bytes are written, the rest of any response is read and discarded,
    /// a late kill is absorbed and dropped transactions are rolled back.
    pub async fn drain(&mut self) -> ConnectionResult<()> {
        let r = self.drain_inner().await;
        self.check(r)
    }

    /// Execute sql returning a result set
    ///
    /// Returns [ConnectionErrorContent::ExpectedRows] if the statement returned no columns
    pub async fn query(&mut self, sql: &str) -> ConnectionResult<ResultSet<'_>> {
        self.send_command(Command::Query(sql)).await?;
        match self.read_result_header().await? {
            ResultHeader::Columns(_) => Ok(ResultSet { session: self }),
            ResultHeader::Ok(_) => Err(ConnectionErrorContent::ExpectedRows.into()),
        }
    }

    /// Execute sql not returning a result set
    ///
    /// Returns [ConnectionErrorContent::UnexpectedRows] if the statement returned columns
    pub async fn execute(&mut self, sql: &str) -> ConnectionResult<OkPacket> {
        self.send_command(Command::Query(sql)).await?;
        match self.read_result_header().await? {
            ResultHeader::Ok(ok) => Ok(ok),
            ResultHeader::Columns(_) => Err(ConnectionErrorContent::UnexpectedRows.into()),
        }
    }

    /// Prepare a statement
    pub async fn prepare(&mut self, sql: &str) -> ConnectionResult<Statement> {
        self.send_command(Command::Prepare(sql)).await?;
        let r = self.read_prepare().await;
        self.check(r)
    }

    /// Read the response to a prepare command
    async fn read_prepare(&mut self) -> ConnectionResult<Statement> {
        let (id, params, columns) = self.read_prepare_header().await?;
        let mut defs = Vec::with_capacity(usize::from(params) + usize::from(columns));
        self.read_prepare_metadata(Some(&mut defs)).await?;
        if defs.len() != usize::from(params) + usize::from(columns) {
            return Err(ConnectionErrorContent::ProtocolError(format!(
                "Expected {} statement metadata packages got {}",
                usize::from(params) + usize::from(columns),
                defs.len()
            ))
            .into());
        }
        let columns = defs.split_off(usize::from(params));
        Ok(Statement {
            id,
            params: defs,
            columns,
        })
    }

    /// Execute a prepared statement returning a result set
    ///
    /// Returns [ConnectionErrorContent::ExpectedRows] if the statement returned no columns
    pub async fn fetch_statement<'a>(
        &'a mut self,
        statement: &Statement,
        params: &[Param<'_>],
    ) -> ConnectionResult<ResultSet<'a>> {
        self.send_command(Command::Execute { statement, params })
            .await?;
        match self.read_result_header().await? {
            ResultHeader::Columns(_) => Ok(ResultSet { session: self }),
            ResultHeader::Ok(_) => Err(ConnectionErrorContent::ExpectedRows.into()),
        }
    }

    /// Execute a prepared statement not returning a result set
    ///
    /// Returns [ConnectionErrorContent::UnexpectedRows] if the statement returned columns
    pub async fn execute_statement(
        &mut self,
        statement: &Statement,
        params: &[Param<'_>],
    ) -> ConnectionResult<OkPacket> {
        self.send_command(Command::Execute { statement, params })
            .await?;
        match self.read_result_header().await? {
            ResultHeader::Ok(ok) => Ok(ok),
            ResultHeader::Columns(_) => Err(ConnectionErrorContent::UnexpectedRows.into()),
        }
    }

    /// Deallocate a prepared statement
    pub async fn close_statement(&mut self, statement: Statement) -> ConnectionResult<()> {
        self.send_command(Command::CloseStatement(statement.id))
            .await?;
        Ok(())
    }

    /// Check that the connection is alive
    pub async fn ping(&mut self) -> ConnectionResult<()> {
        self.send_command(Command::Ping).await?;
        let r = self.read_ok_inner().await;
        self.check(r)?;
        Ok(())
    }

    /// Change the default database
    pub async fn init_db(&mut self, database: &str) -> ConnectionResult<()> {
        self.send_command(Command::InitDb(database)).await?;
        let r = self.read_ok_inner().await;
        self.check(r)?;
        self.database = Some(database.to_string());
        Ok(())
    }

    /// Re-authenticate as the configured user with `COM_CHANGE_USER`
    async fn change_user(&mut self) -> ConnectionResult<()> {
        self.drain().await?;
        let plugin = self.lookup_plugin()?;
        let auth_response = plugin.initial_response(&self.auth_context())?;
        let attributes = connection_attributes(&self.options);
        self.io.start_command();
        compose_change_user(
            &mut self.io.compose(),
            &self.capabilities,
            self.charset,
            &Credentials {
                user: &self.options.user,
                auth_response: &auth_response,
                database: self.options.database.as_deref(),
                plugin: &self.plugin,
                attributes: &attributes,
            },
        );
        self.io.finalize()?;
        self.state = SessionState::Authenticating;
        self.flush().await?;
        self.authenticate(plugin).await?;
        self.database = self.options.database.clone();
        self.state = SessionState::Ready;
        Ok(())
    }

    /// Open a new connection with the same options and replace this one
    async fn reopen(&mut self) -> ConnectionResult<()> {
        let mut fresh = Session::open(self.options.clone(), self.procedures.clone()).await?;
        fresh.generation = self.generation;
        let old = std::mem::replace(self, fresh);
        old.close().await;
        Ok(())
    }

    /// Perform the work of [Self::reset]
    async fn reset_inner(&mut self) -> ConnectionResult<()> {
        if self.state != SessionState::Failed {
            self.drain().await?;
        }
        if self.capabilities.reset_connection && self.state != SessionState::Failed {
            self.send_command(Command::ResetConnection).await?;
            match self.read_ok_inner().await {
                Ok(_) => {
                    self.transaction_depth = 0;
                    return self.apply_settings().await;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!(connection_id = self.connection_id, error = %e, "Reset connection failed, changing user");
                }
            }
        }
        if self.state != SessionState::Failed {
            match self.change_user().await {
                Ok(()) => {
                    self.transaction_depth = 0;
                    return self.apply_settings().await;
                }
                Err(e) => {
                    debug!(connection_id = self.connection_id, error = %e, "Change user failed, reconnecting");
                }
            }
        }
        self.reopen().await
    }

    /// Reset the session state so the session can be reused by someone else
    ///
    /// Uses `COM_RESET_CONNECTION` when the server supports it, otherwise
    /// `COM_CHANGE_USER`, and as a last resort opens a new connection.
    /// The configured database and session variables are applied afterwards.
    /// If the reset fails the session moves to [SessionState::Failed].
    pub async fn reset(&mut self) -> ConnectionResult<()> {
        self.cleanup_rollbacks = 0;
        let r = self.reset_inner().await;
        if let Err(e) = &r {
            warn!(connection_id = self.connection_id, error = %e, "Unable to reset session");
            self.state = SessionState::Failed;
        }
        r
    }

    /// Close the session
    ///
    /// Sends `COM_QUIT` if the session is idle, errors are ignored
    pub async fn close(mut self) {
        if matches!(self.state, SessionState::Closed) {
            return;
        }
        if self.state != SessionState::Failed
            && self.pending == Pending::Idle
            && !self.io.has_unsent()
            && self.start(Command::Quit).is_ok()
        {
            self.state = SessionState::Closing;
            let _ = self.io.send().await;
        }
        self.state = SessionState::Closing;
        let _ = self.io.shutdown().await;
        self.state = SessionState::Closed;
        debug!(connection_id = self.connection_id, "Session closed");
    }

    /// Begin a new transaction or save-point
    ///
    /// The transaction is rolled back when dropped unless committed
    pub async fn begin(&mut self) -> ConnectionResult<Transaction<'_>> {
        self.drain().await?;
        debug_assert_eq!(self.cleanup_rollbacks, 0);

        // Once we call run the state will be such that once drain has been called
        // there will be one more transaction level
        let sql = begin_transaction_query(self.transaction_depth);
        self.transaction_depth += 1;
        self.cleanup_rollbacks = 1;
        let r = self.run(&sql).await;
        if let Err(e) = self.check(r) {
            self.transaction_depth -= 1;
            self.cleanup_rollbacks = 0;
            return Err(e);
        }
        // The statement has now succeeded so there is no need to roll back the transaction
        self.cleanup_rollbacks = 0;
        Ok(Transaction { session: self })
    }

    /// Commit the top most transaction or save point
    async fn commit_impl(&mut self) -> ConnectionResult<()> {
        self.drain().await?;
        self.transaction_depth = self.transaction_depth.saturating_sub(1);
        let r = self
            .run(&commit_transaction_query(self.transaction_depth))
            .await;
        self.check(r)?;
        Ok(())
    }

    /// Rollback the top most transaction or save point
    async fn rollback_impl(&mut self) -> ConnectionResult<()> {
        self.drain().await?;
        self.transaction_depth = self.transaction_depth.saturating_sub(1);
        let r = self
            .run(&rollback_transaction_query(self.transaction_depth))
            .await;
        self.check(r)?;
        Ok(())
    }

    /// Look up the metadata of a stored procedure or function
    ///
    /// The metadata is cached, shared with the pool the session belongs to
    pub async fn procedure(
        &mut self,
        schema: &str,
        name: &str,
    ) -> ConnectionResult<Option<Arc<Procedure>>> {
        let cache = self.procedures.clone();
        cache.get(self, schema, name).await
    }

    /// A handle that can cancel commands running on this session from another task
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(
            self.options.clone(),
            self.connection_id,
            self.tracker.clone(),
        )
    }

    /// The command whose response is being read
    pub fn current_command(&self) -> Option<CommandId> {
        self.current
    }

    /// Lifecycle state of the session
    pub fn state(&self) -> SessionState {
        match self.state {
            SessionState::Querying | SessionState::Streaming if self.tracker.is_cancelling() => {
                SessionState::Canceling
            }
            s => s,
        }
    }

    /// Return true if a fatal error occurred on the session
    pub fn is_failed(&self) -> bool {
        self.state == SessionState::Failed
    }

    /// Server side id of the connection
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Version of the server
    pub fn server_version(&self) -> &ServerVersion {
        &self.server_version
    }

    /// Negotiated capabilities
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Last reported server status flags
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Current character set id
    pub fn charset(&self) -> u8 {
        self.charset
    }

    /// Current default database
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Column definitions of the current result set
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Return true if a transaction is open
    pub fn in_transaction(&self) -> bool {
        self.transaction_depth > 0 || self.status & status::IN_TRANS != 0
    }

    /// Nesting depth of [Transaction]s
    pub fn transaction_depth(&self) -> usize {
        self.transaction_depth
    }

    /// When the connection was established
    pub fn created(&self) -> Instant {
        self.created
    }

    /// When the last command was sent
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// The options the session was opened with
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Host name and addresses used when connecting over TCP
    pub fn resolved_host(&self) -> Option<&ResolvedHost> {
        self.resolved.as_ref()
    }

    /// Return true if the session is idle with nothing left to drain
    pub(crate) fn is_clean(&self) -> bool {
        self.state == SessionState::Ready
            && self.pending == Pending::Idle
            && !self.io.has_unsent()
            && !self.absorb_kill
            && self.cleanup_rollbacks == 0
    }

    /// Pool generation the session belongs to
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Assign the session to a pool generation
    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    #[cfg(feature = "cancel_testing")]
    #[doc(hidden)]
    /// Set the cancel counts for testing
    pub fn set_cancel_count(&mut self, cnt: Option<usize>) {
        self.cancel_count = cnt;
    }
}

/// The rows of a result set, borrowing the session
pub struct ResultSet<'a> {
    /// The session the rows are read from
    session: &'a mut Session,
}

impl<'a> ResultSet<'a> {
    /// Columns of the result set
    pub fn columns(&self) -> &[Column] {
        &self.session.columns
    }

    /// Read the next row
    ///
    /// The returned future is cancel safe, remaining rows are discarded by the next command
    pub async fn next(&mut self) -> ConnectionResult<Option<Row<'_>>> {
        self.session.next_row().await
    }

    /// Skip to the next result of a multi statement query
    pub async fn next_result(&mut self) -> ConnectionResult<Option<ResultHeader>> {
        self.session.next_result().await
    }

    /// Map every remaining row of the result set
    pub async fn map_rows<T>(
        mut self,
        mut f: impl FnMut(Row<'_>) -> ConnectionResult<T>,
    ) -> ConnectionResult<Vec<T>> {
        let mut ans = Vec::new();
        while let Some(row) = self.next().await? {
            ans.push(f(row)?);
        }
        Ok(ans)
    }
}

/// Represents an ongoing transaction in the session
///
/// Note: Since rust does not support async drops. Dropping
/// a transaction object will not roll back the transaction
/// immediately. This will instead be deferred to next time
/// the session is used.
pub struct Transaction<'a> {
    /// The underlying session we have started a transaction on
    session: &'a mut Session,
}

impl<'a> Transaction<'a> {
    /// Commit this transaction to the database
    ///
    /// If the returned future is dropped. The transaction will
    /// be rolled back or committed the next time the underlying
    /// session is used
    pub async fn commit(self) -> ConnectionResult<()> {
        let mut this = ManuallyDrop::new(self);
        this.session.commit_impl().await
    }

    /// Roll back this transaction
    ///
    /// If the returned future is dropped. The transaction will
    /// be rolled back the next time the session is used
    pub async fn rollback(self) -> ConnectionResult<()> {
        let mut this = ManuallyDrop::new(self);
        this.session.rollback_impl().await
    }
}

impl Deref for Transaction<'_> {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        // Register in the session to roll back the transaction in drain
        self.session.cleanup_rollbacks += 1;
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::{begin_transaction_query, parse_ok, rollback_transaction_query};
    use crate::{
        constants::{session_track, status},
        package_parser::PackageParser,
        package_writer::PackageWriter,
    };

    #[test]
    fn ok_with_session_state() {
        let mut state = BytesMut::new();
        let mut w = PackageWriter::new(&mut state);
        w.put_u8(session_track::SCHEMA);
        w.put_lenenc(5);
        w.put_lenenc_bytes(b"shop");
        w.put_u8(session_track::SYSTEM_VARIABLES);
        let mut var = BytesMut::new();
        let mut vw = PackageWriter::new(&mut var);
        vw.put_lenenc_bytes(b"character_set_client");
        vw.put_lenenc_bytes(b"latin1");
        w.put_lenenc_bytes(&var);

        let mut buff = BytesMut::new();
        let mut w = PackageWriter::new(&mut buff);
        w.put_lenenc(3);
        w.put_lenenc(1000);
        w.put_u16(status::AUTOCOMMIT | status::SESSION_STATE_CHANGED);
        w.put_u16(1);
        w.put_lenenc_bytes(b"");
        w.put_lenenc_bytes(&state);

        let ok = parse_ok(&mut PackageParser::new(&buff), true).unwrap();
        assert_eq!(ok.affected_rows, 3);
        assert_eq!(ok.last_insert_id, 1000);
        assert_eq!(ok.warnings, 1);
        assert_eq!(ok.schema.as_deref(), Some("shop"));
        assert_eq!(ok.charset, Some(8));
    }

    #[test]
    fn ok_without_session_tracking() {
        let mut buff = BytesMut::new();
        let mut w = PackageWriter::new(&mut buff);
        w.put_lenenc(0);
        w.put_lenenc(0);
        w.put_u16(status::AUTOCOMMIT);
        w.put_u16(0);
        w.put_bytes(b"Rows matched: 0");
        let ok = parse_ok(&mut PackageParser::new(&buff), false).unwrap();
        assert_eq!(ok.info, "Rows matched: 0");
        assert_eq!(ok.schema, None);
    }

    #[test]
    fn savepoints() {
        assert_eq!(begin_transaction_query(0), "BEGIN");
        assert_eq!(begin_transaction_query(5), "SAVEPOINT mywire_sp_5");
        assert_eq!(rollback_transaction_query(7), "ROLLBACK TO SAVEPOINT mywire_sp_7");
    }
}
