//! A scripted Mariadb/Mysql server for scenario tests
//!
//! Understands just enough of the protocol to drive a session: the greeting,
//! native password authentication (optionally preceded by auth switches), and a
//! handful of canned queries:
//!
//! * `SELECT 1` one row with the value 1
//! * `SELECT BIG` one row holding a value that makes the row exactly 0x1000001 bytes
//! * `SELECT ROWS <n>` n rows numbered from 0
//! * `SELECT SLEEP(<ms>)` waits, can be interrupted by `KILL QUERY`
//! * `FAIL` a syntax error
//! * `KILL QUERY <id>` interrupts a query on connection id
//!
//! * `USE <db>` and `SET NAMES <charset>` report the change through session tracking
//! * queries on `information_schema`.`ROUTINES` and `PARAMETERS` describe `shop.add_item`
//!
//! Anything else returns an OK package. Prepared statements starting with
//! `SELECT` echo their first parameter as a binary row.
//!
//! Compression, query attributes and session tracking are offered when enabled
//! in [MockConfig], and used when the client asks for them.
use std::{
    collections::HashMap,
    io::{self, Read, Write},
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use mywire::{ConnectionOptions, constants::type_};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Notify,
    task::JoinHandle,
};

/// Largest body of a single frame
const MAX_FRAME: usize = 0xFF_FFFF;

/// CLIENT_COMPRESS
const COMPRESS: u32 = 1 << 5;
/// CLIENT_CONNECT_ATTRS
const CONNECT_ATTRS: u32 = 1 << 20;
/// CLIENT_DEPRECATE_EOF
const DEPRECATE_EOF: u32 = 1 << 24;
/// CLIENT_SESSION_TRACK
const SESSION_TRACK: u32 = 1 << 23;
/// CLIENT_QUERY_ATTRIBUTES
const QUERY_ATTRIBUTES: u32 = 1 << 27;

/// SERVER_SESSION_STATE_CHANGED
const SESSION_STATE_CHANGED: u16 = 1 << 14;

/// Bytes in the big value, with its 4 byte length prefix the row is 0x1000001 bytes
pub const BIG_VALUE_LEN: usize = 0x100_0001 - 4;

/// How the mock server behaves
#[derive(Clone, Debug)]
pub struct MockConfig {
    /// Server version announced in the greeting
    pub version: String,
    /// Number of auth switch requests sent before accepting the client
    pub auth_switches: usize,
    /// Announce CLIENT_DEPRECATE_EOF
    pub deprecate_eof: bool,
    /// Announce CLIENT_COMPRESS
    pub compress: bool,
    /// Announce CLIENT_QUERY_ATTRIBUTES
    pub query_attributes: bool,
    /// Announce CLIENT_SESSION_TRACK
    pub session_track: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            version: "8.0.36-mock".to_string(),
            auth_switches: 0,
            deprecate_eof: false,
            compress: false,
            query_attributes: false,
            session_track: false,
        }
    }
}

/// Per connection state visible to other connections
#[derive(Default)]
struct ConnState {
    /// A kill arrived that has not interrupted anything yet
    killed: AtomicBool,
    /// Signalled on kill
    notify: Notify,
}

/// State shared by all connections of the server
#[derive(Default)]
struct MockState {
    /// Commands received as (connection id, description)
    log: Mutex<Vec<(u32, String)>>,
    /// Id of the next connection
    next_id: AtomicU32,
    /// Connections accepted in total
    accepted: AtomicUsize,
    /// Connections currently open
    open: AtomicUsize,
    /// Most connections open at the same time
    peak: AtomicUsize,
    /// Open connections by id
    conns: Mutex<HashMap<u32, Arc<ConnState>>>,
}

impl MockState {
    /// Record a command
    fn record(&self, id: u32, what: String) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, what));
    }

    /// Look up an open connection
    fn conn(&self, id: u32) -> Option<Arc<ConnState>> {
        self.conns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

/// A running mock server, stopped when dropped
pub struct MockServer {
    /// Address the server listens on
    addr: SocketAddr,
    /// Shared state
    state: Arc<MockState>,
    /// How the server behaves
    config: Arc<MockConfig>,
    /// The accept loop
    task: JoinHandle<()>,
}

impl MockServer {
    /// Listen on a random local port
    pub async fn start(config: MockConfig) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(MockState {
            next_id: AtomicU32::new(100),
            ..Default::default()
        });
        let config = Arc::new(config);
        let task = tokio::spawn({
            let state = state.clone();
            let config = config.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let state = state.clone();
                    let config = config.clone();
                    tokio::spawn(async move {
                        let id = state.next_id.fetch_add(1, Ordering::SeqCst);
                        let conn_state = Arc::new(ConnState::default());
                        state
                            .conns
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(id, conn_state.clone());
                        state.accepted.fetch_add(1, Ordering::SeqCst);
                        let open = state.open.fetch_add(1, Ordering::SeqCst) + 1;
                        state.peak.fetch_max(open, Ordering::SeqCst);
                        let mut conn = Conn {
                            stream,
                            seq: 0,
                            comp_seq: 0,
                            compressed: false,
                            inflated: Vec::new(),
                            capabilities: 0,
                            id,
                            config,
                            state: state.clone(),
                            me: conn_state,
                            statements: HashMap::new(),
                        };
                        let _ = conn.run().await;
                        state.open.fetch_sub(1, Ordering::SeqCst);
                        state
                            .conns
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&id);
                    });
                }
            }
        });
        Ok(Self {
            addr,
            state,
            config,
            task,
        })
    }

    /// Options connecting to this server
    pub fn options(&self) -> ConnectionOptions {
        ConnectionOptions::new()
            .host("127.0.0.1")
            .port(self.addr.port())
            .user("mock")
            .password("secret")
            .ssl_mode(mywire::SslMode::Disabled)
            .compression(self.config.compress)
            .connect_timeout(Duration::from_secs(2))
    }

    /// Commands received so far, as `<connection id>: <command>`
    pub fn log(&self) -> Vec<String> {
        self.state
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, what)| format!("{id}: {what}"))
            .collect()
    }

    /// Commands received on one connection
    pub fn log_for(&self, id: u32) -> Vec<String> {
        self.state
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(i, _)| *i == id)
            .map(|(_, what)| what.clone())
            .collect()
    }

    /// Connections accepted in total
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Connections currently open
    pub fn open(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Most connections open at the same time
    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Read a 3 byte little endian integer
fn u24(b: &[u8]) -> usize {
    usize::from(b[0]) | usize::from(b[1]) << 8 | usize::from(b[2]) << 16
}

/// Append a length encoded integer
fn put_lenenc(out: &mut Vec<u8>, v: u64) {
    match v {
        0..251 => out.push(v as u8),
        251..0x1_0000 => {
            out.push(0xFC);
            out.extend_from_slice(&(v as u16).to_le_bytes());
        }
        0x1_0000..0x100_0000 => {
            out.push(0xFD);
            out.extend_from_slice(&(v as u32).to_le_bytes()[..3]);
        }
        _ => {
            out.push(0xFE);
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
}

/// Append a length encoded string
fn put_lenenc_bytes(out: &mut Vec<u8>, v: &[u8]) {
    put_lenenc(out, v.len() as u64);
    out.extend_from_slice(v);
}

/// Read a length encoded integer
fn get_lenenc(data: &[u8], pos: &mut usize) -> Option<u64> {
    let first = *data.get(*pos)?;
    *pos += 1;
    let n = match first {
        0xFC => 2,
        0xFD => 3,
        0xFE => 8,
        v => return Some(v.into()),
    };
    let bytes = data.get(*pos..*pos + n)?;
    *pos += n;
    let mut buf = [0u8; 8];
    buf[..n].copy_from_slice(bytes);
    Some(u64::from_le_bytes(buf))
}

/// A column definition package
fn column_def(name: &str, r#type: u8) -> Vec<u8> {
    let mut out = Vec::new();
    put_lenenc_bytes(&mut out, b"def");
    put_lenenc_bytes(&mut out, b"mock");
    put_lenenc_bytes(&mut out, b"t");
    put_lenenc_bytes(&mut out, b"t");
    put_lenenc_bytes(&mut out, name.as_bytes());
    put_lenenc_bytes(&mut out, name.as_bytes());
    out.push(0x0c);
    out.extend_from_slice(&45u16.to_le_bytes());
    out.extend_from_slice(&20u32.to_le_bytes());
    out.push(r#type);
    out.extend_from_slice(&0u16.to_le_bytes());
    out.push(0);
    out.extend_from_slice(&[0, 0]);
    out
}

/// The ok package
fn ok_package(affected_rows: u64) -> Vec<u8> {
    let mut out = vec![0x00];
    put_lenenc(&mut out, affected_rows);
    put_lenenc(&mut out, 0);
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

/// An error package
fn err_package(code: u16, state: &[u8; 5], message: &str) -> Vec<u8> {
    let mut out = vec![0xFF];
    out.extend_from_slice(&code.to_le_bytes());
    out.push(b'#');
    out.extend_from_slice(state);
    out.extend_from_slice(message.as_bytes());
    out
}

/// One client connection
struct Conn {
    /// The socket
    stream: TcpStream,
    /// Sequence id of the next frame we write
    seq: u8,
    /// Sequence id of the next compressed package we write
    comp_seq: u8,
    /// True once the compressed protocol is in use
    compressed: bool,
    /// Inflated bytes not yet consumed by read
    inflated: Vec<u8>,
    /// Capabilities in use on the connection
    capabilities: u32,
    /// Connection id
    id: u32,
    /// Server behaviour
    config: Arc<MockConfig>,
    /// Shared server state
    state: Arc<MockState>,
    /// Our entry in the shared state
    me: Arc<ConnState>,
    /// Prepared statements by id, with their parameter count
    statements: HashMap<u32, (String, usize)>,
}

impl Conn {
    /// Read one compressed package and append its inflated body to self.inflated
    async fn read_compressed(&mut self) -> io::Result<()> {
        let mut header = [0u8; 7];
        self.stream.read_exact(&mut header).await?;
        let len = u24(&header[..3]);
        let uncompressed_len = u24(&header[4..]);
        self.comp_seq = header[3].wrapping_add(1);
        let mut body = vec![0; len];
        self.stream.read_exact(&mut body).await?;
        if uncompressed_len == 0 {
            self.inflated.extend_from_slice(&body);
        } else {
            let mut out = Vec::with_capacity(uncompressed_len);
            ZlibDecoder::new(&body[..]).read_to_end(&mut out)?;
            if out.len() != uncompressed_len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "compressed package has the wrong length",
                ));
            }
            self.inflated.extend_from_slice(&out);
        }
        Ok(())
    }

    /// Fill buf from the stream, inflating if compression is on
    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if !self.compressed {
            self.stream.read_exact(buf).await?;
            return Ok(());
        }
        while self.inflated.len() < buf.len() {
            self.read_compressed().await?;
        }
        buf.copy_from_slice(&self.inflated[..buf.len()]);
        self.inflated.drain(..buf.len());
        Ok(())
    }

    /// Read one payload, None when the client went away
    async fn read(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; 4];
            match self.read_exact(&mut header).await {
                Ok(_) => (),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e),
            }
            let len = u24(&header);
            self.seq = header[3].wrapping_add(1);
            let start = payload.len();
            payload.resize(start + len, 0);
            self.read_exact(&mut payload[start..]).await?;
            if len < MAX_FRAME {
                return Ok(Some(payload));
            }
        }
    }

    /// Queue payload as one or more frames
    fn frame(&mut self, out: &mut Vec<u8>, payload: &[u8]) {
        let mut chunks = payload.chunks(MAX_FRAME);
        loop {
            let chunk = chunks.next().unwrap_or_default();
            out.extend_from_slice(&(chunk.len() as u32).to_le_bytes()[..3]);
            out.push(self.seq);
            self.seq = self.seq.wrapping_add(1);
            out.extend_from_slice(chunk);
            if chunk.len() < MAX_FRAME {
                return;
            }
        }
    }

    /// Send payloads
    async fn send(&mut self, payloads: &[Vec<u8>]) -> io::Result<()> {
        let mut out = Vec::new();
        for p in payloads {
            self.frame(&mut out, p);
        }
        if self.compressed {
            out = self.compress(&out)?;
        }
        self.stream.write_all(&out).await
    }

    /// Wrap framed bytes in compressed packages, small chunks are sent as is
    fn compress(&mut self, framed: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        for chunk in framed.chunks(MAX_FRAME) {
            let (body, uncompressed_len) = if chunk.len() >= 50 {
                let mut e = ZlibEncoder::new(Vec::new(), Compression::fast());
                e.write_all(chunk)?;
                (e.finish()?, chunk.len())
            } else {
                (chunk.to_vec(), 0)
            };
            out.extend_from_slice(&(body.len() as u32).to_le_bytes()[..3]);
            out.push(self.comp_seq);
            out.extend_from_slice(&(uncompressed_len as u32).to_le_bytes()[..3]);
            out.extend_from_slice(&body);
            self.comp_seq = self.comp_seq.wrapping_add(1);
        }
        Ok(out)
    }

    /// The package ending a result set
    fn end_of_rows(&self) -> Vec<u8> {
        if self.config.deprecate_eof {
            let mut ok = ok_package(0);
            ok[0] = 0xFE;
            ok
        } else {
            let mut eof = vec![0xFE];
            eof.extend_from_slice(&0u16.to_le_bytes());
            eof.extend_from_slice(&2u16.to_le_bytes());
            eof
        }
    }

    /// Send a text result set
    async fn send_rows(&mut self, columns: &[(&str, u8)], rows: Vec<Vec<u8>>) -> io::Result<()> {
        let mut count = Vec::new();
        put_lenenc(&mut count, columns.len() as u64);
        let mut packages = vec![count];
        for (name, t) in columns {
            packages.push(column_def(name, *t));
        }
        if !self.config.deprecate_eof {
            packages.push(self.end_of_rows());
        }
        packages.extend(rows);
        packages.push(self.end_of_rows());
        self.send(&packages).await
    }

    /// Send a result set of a single text row
    async fn send_row(&mut self, columns: &[(&str, u8)], values: &[&str]) -> io::Result<()> {
        let mut row = Vec::new();
        for v in values {
            put_lenenc_bytes(&mut row, v.as_bytes());
        }
        self.send_rows(columns, vec![row]).await
    }

    /// Handle the connection phase
    async fn handshake(&mut self) -> io::Result<bool> {
        let capabilities: u32 = 1 // LONG_PASSWORD
            | 4 // LONG_FLAG
            | 8 // CONNECT_WITH_DB
            | 512 // PROTOCOL_41
            | 8192 // TRANSACTIONS
            | 1 << 15 // SECURE_CONNECTION
            | 1 << 16 // MULTI_STATEMENTS
            | 1 << 17 // MULTI_RESULTS
            | 1 << 19 // PLUGIN_AUTH
            | CONNECT_ATTRS
            | if self.config.deprecate_eof { DEPRECATE_EOF } else { 0 }
            | if self.config.compress { COMPRESS } else { 0 }
            | if self.config.session_track { SESSION_TRACK } else { 0 }
            | if self.config.query_attributes { QUERY_ATTRIBUTES } else { 0 };
        let mut greeting = vec![10];
        greeting.extend_from_slice(self.config.version.as_bytes());
        greeting.push(0);
        greeting.extend_from_slice(&self.id.to_le_bytes());
        greeting.extend_from_slice(b"abcdefgh");
        greeting.push(0);
        greeting.extend_from_slice(&(capabilities as u16).to_le_bytes());
        greeting.push(45);
        greeting.extend_from_slice(&2u16.to_le_bytes());
        greeting.extend_from_slice(&((capabilities >> 16) as u16).to_le_bytes());
        greeting.push(21);
        greeting.extend_from_slice(&[0; 10]);
        greeting.extend_from_slice(b"ijklmnopqrst\0");
        greeting.extend_from_slice(b"mysql_native_password\0");
        self.seq = 0;
        self.send(&[greeting]).await?;

        let Some(response) = self.read().await? else {
            return Ok(false);
        };
        let requested = response
            .get(..4)
            .map(|v| u32::from_le_bytes([v[0], v[1], v[2], v[3]]))
            .unwrap_or_default();
        self.capabilities = capabilities & requested;
        for i in 0..self.config.auth_switches {
            let mut switch = vec![0xFE];
            switch.extend_from_slice(b"mysql_native_password\0");
            switch.extend_from_slice(format!("nonce{i:015}").as_bytes());
            switch.push(0);
            self.send(&[switch]).await?;
            if self.read().await?.is_none() {
                return Ok(false);
            }
        }
        self.send(&[ok_package(0)]).await?;
        self.compressed = self.capabilities & COMPRESS != 0;
        Ok(true)
    }

    /// Return true if the client uses capability
    fn uses(&self, capability: u32) -> bool {
        self.capabilities & capability != 0
    }

    /// An OK package reporting one session state change
    fn state_change(&self, kind: u8, data: &[u8]) -> Vec<u8> {
        if !self.uses(SESSION_TRACK) {
            return ok_package(0);
        }
        let mut out = vec![0x00, 0, 0];
        out.extend_from_slice(&(2 | SESSION_STATE_CHANGED).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        put_lenenc(&mut out, 0); // info
        let mut change = vec![kind];
        put_lenenc_bytes(&mut change, data);
        put_lenenc_bytes(&mut out, &change);
        out
    }

    /// Serve the connection until the client quits
    async fn run(&mut self) -> io::Result<()> {
        if !self.handshake().await? {
            return Ok(());
        }
        while let Some(command) = self.read().await? {
            let Some((&code, rest)) = command.split_first() else {
                return Ok(());
            };
            match code {
                0x01 => {
                    self.state.record(self.id, "QUIT".to_string());
                    return Ok(());
                }
                0x02 => {
                    let db = String::from_utf8_lossy(rest).into_owned();
                    self.state.record(self.id, format!("INIT_DB {db}"));
                    self.send(&[ok_package(0)]).await?;
                }
                0x03 => {
                    let mut rest = rest;
                    if self.uses(QUERY_ATTRIBUTES) {
                        let mut pos = 0;
                        let count = get_lenenc(rest, &mut pos);
                        let sets = get_lenenc(rest, &mut pos);
                        if count != Some(0) || sets != Some(1) {
                            self.send(&[err_package(1064, b"42000", "Bad query attributes")])
                                .await?;
                            continue;
                        }
                        rest = &rest[pos..];
                    }
                    let sql = String::from_utf8_lossy(rest).into_owned();
                    self.state.record(self.id, format!("QUERY {sql}"));
                    self.query(&sql).await?;
                }
                0x0E => {
                    self.state.record(self.id, "PING".to_string());
                    self.send(&[ok_package(0)]).await?;
                }
                0x11 => {
                    self.state.record(self.id, "CHANGE_USER".to_string());
                    self.send(&[ok_package(0)]).await?;
                }
                0x16 => {
                    let sql = String::from_utf8_lossy(rest).into_owned();
                    self.state.record(self.id, format!("PREPARE {sql}"));
                    self.prepare(sql).await?;
                }
                0x17 => {
                    self.state.record(self.id, "EXECUTE".to_string());
                    self.execute(rest).await?;
                }
                0x19 => {
                    self.state.record(self.id, "CLOSE_STMT".to_string());
                }
                0x1F => {
                    self.state.record(self.id, "RESET_CONNECTION".to_string());
                    self.send(&[ok_package(0)]).await?;
                }
                v => {
                    self.send(&[err_package(1047, b"08S01", &format!("Unknown command {v}"))])
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Answer a query
    async fn query(&mut self, sql: &str) -> io::Result<()> {
        let interrupted = || err_package(1317, b"70100", "Query execution was interrupted");
        if let Some(id) = sql.strip_prefix("KILL QUERY ") {
            let target = id.trim().parse().ok().and_then(|id| self.state.conn(id));
            return match target {
                Some(target) => {
                    target.killed.store(true, Ordering::SeqCst);
                    target.notify.notify_one();
                    self.send(&[ok_package(0)]).await
                }
                None => {
                    self.send(&[err_package(1094, b"HY000", &format!("Unknown thread id: {id}"))])
                        .await
                }
            };
        }
        if let Some(ms) = sql
            .strip_prefix("SELECT SLEEP(")
            .and_then(|v| v.strip_suffix(')'))
        {
            let deadline = tokio::time::Instant::now() + Duration::from_millis(ms.parse().unwrap_or(0));
            let me = self.me.clone();
            let killed = loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break false,
                    _ = me.notify.notified() => {
                        if me.killed.swap(false, Ordering::SeqCst) {
                            break true;
                        }
                    }
                }
            };
            if killed {
                return self.send(&[interrupted()]).await;
            }
            return self.send_row(&[("sleep", type_::LONG_LONG)], &["0"]).await;
        }
        if self.me.killed.swap(false, Ordering::SeqCst) {
            return self.send(&[interrupted()]).await;
        }
        if let Some(db) = sql.strip_prefix("USE ") {
            let mut data = Vec::new();
            put_lenenc_bytes(&mut data, db.trim_matches('`').as_bytes());
            let ok = self.state_change(1, &data);
            return self.send(&[ok]).await;
        }
        if let Some(charset) = sql.strip_prefix("SET NAMES ") {
            let mut data = Vec::new();
            put_lenenc_bytes(&mut data, b"character_set_client");
            put_lenenc_bytes(&mut data, charset.as_bytes());
            let ok = self.state_change(0, &data);
            return self.send(&[ok]).await;
        }
        if sql.contains("`information_schema`.`ROUTINES`") {
            // Slow enough for concurrent lookups to overlap
            tokio::time::sleep(Duration::from_millis(50)).await;
            let rows = if sql.contains("'add_item'") {
                let mut row = Vec::new();
                for v in ["shop", "add_item", "PROCEDURE"] {
                    put_lenenc_bytes(&mut row, v.as_bytes());
                }
                vec![row]
            } else {
                Vec::new()
            };
            let columns = [
                ("ROUTINE_SCHEMA", type_::VAR_STRING),
                ("ROUTINE_NAME", type_::VAR_STRING),
                ("ROUTINE_TYPE", type_::VAR_STRING),
            ];
            return self.send_rows(&columns, rows).await;
        }
        if sql.contains("`information_schema`.`PARAMETERS`") {
            let rows = [["1", "IN", "item", "int"], ["2", "OUT", "total", "decimal"]]
                .iter()
                .map(|values| {
                    let mut row = Vec::new();
                    for v in values {
                        put_lenenc_bytes(&mut row, v.as_bytes());
                    }
                    row
                })
                .collect();
            let columns = [
                ("ORDINAL_POSITION", type_::LONG_LONG),
                ("PARAMETER_MODE", type_::VAR_STRING),
                ("PARAMETER_NAME", type_::VAR_STRING),
                ("DATA_TYPE", type_::VAR_STRING),
            ];
            return self.send_rows(&columns, rows).await;
        }
        match sql {
            "SELECT 1" => self.send_row(&[("1", type_::LONG_LONG)], &["1"]).await,
            "SELECT BIG" => {
                let mut row = Vec::with_capacity(BIG_VALUE_LEN + 4);
                put_lenenc_bytes(&mut row, &vec![b'x'; BIG_VALUE_LEN]);
                self.send_rows(&[("big", type_::LONG_BLOB)], vec![row]).await
            }
            "FAIL" => {
                self.send(&[err_package(1064, b"42000", "You have an error in your SQL syntax")])
                    .await
            }
            sql if sql.starts_with("SELECT ROWS ") => {
                let n: usize = sql["SELECT ROWS ".len()..].trim().parse().unwrap_or(0);
                let rows = (0..n)
                    .map(|i| {
                        let mut row = Vec::new();
                        put_lenenc_bytes(&mut row, i.to_string().as_bytes());
                        row.push(0xFB);
                        row
                    })
                    .collect();
                self.send_rows(&[("n", type_::LONG_LONG), ("nothing", type_::VAR_STRING)], rows)
                    .await
            }
            _ => self.send(&[ok_package(1)]).await,
        }
    }

    /// Answer a prepare
    async fn prepare(&mut self, sql: String) -> io::Result<()> {
        let params = sql.matches('?').count();
        let columns = usize::from(sql.starts_with("SELECT"));
        let id = self.statements.len() as u32 + 1;
        let mut header = vec![0x00];
        header.extend_from_slice(&id.to_le_bytes());
        header.extend_from_slice(&(columns as u16).to_le_bytes());
        header.extend_from_slice(&(params as u16).to_le_bytes());
        header.push(0);
        header.extend_from_slice(&0u16.to_le_bytes());
        let mut packages = vec![header];
        for i in 0..params {
            packages.push(column_def(&format!("?{i}"), type_::VAR_STRING));
        }
        if params != 0 && !self.config.deprecate_eof {
            packages.push(self.end_of_rows());
        }
        for _ in 0..columns {
            packages.push(column_def("v", type_::LONG_LONG));
        }
        if columns != 0 && !self.config.deprecate_eof {
            packages.push(self.end_of_rows());
        }
        self.statements.insert(id, (sql, params));
        self.send(&packages).await
    }

    /// Answer a statement execution
    async fn execute(&mut self, data: &[u8]) -> io::Result<()> {
        let bad = || err_package(1210, b"HY000", "Incorrect arguments to mysqld_stmt_execute");
        let Some(id) = data.get(..4).map(|v| u32::from_le_bytes([v[0], v[1], v[2], v[3]])) else {
            return self.send(&[bad()]).await;
        };
        let Some((sql, params)) = self.statements.get(&id).cloned() else {
            return self.send(&[err_package(1243, b"HY000", "Unknown prepared statement")])
                .await;
        };
        let mut pos = 9;
        if params != 0 && self.uses(QUERY_ATTRIBUTES) {
            // The parameter count precedes the null bitmap
            if get_lenenc(data, &mut pos) != Some(params as u64) {
                return self.send(&[bad()]).await;
            }
        }
        if !sql.starts_with("SELECT") {
            return self.send(&[ok_package(params as u64)]).await;
        }
        // Echo the first parameter
        let null_len = params.div_ceil(8);
        let first_null = data.get(pos).is_some_and(|v| v & 1 != 0);
        pos += null_len + 1;
        let Some(&t) = data.get(pos) else {
            return self.send(&[bad()]).await;
        };
        for _ in 0..params {
            pos += 2;
            if self.uses(QUERY_ATTRIBUTES) {
                // Parameter name
                let Some(len) = get_lenenc(data, &mut pos) else {
                    return self.send(&[bad()]).await;
                };
                pos += len as usize;
            }
        }
        let value = match t {
            _ if first_null => None,
            0x08 | 0x05 => data.get(pos..pos + 8).map(|v| v.to_vec()),
            _ => {
                let start = pos;
                get_lenenc(data, &mut pos)
                    .and_then(|len| data.get(start..pos + len as usize))
                    .map(|v| v.to_vec())
            }
        };
        let mut row = vec![0x00];
        match value {
            Some(v) => {
                row.push(0);
                row.extend_from_slice(&v);
            }
            None => row.push(0x04),
        }
        let mut count = Vec::new();
        put_lenenc(&mut count, 1);
        let mut packages = vec![count, column_def("v", t)];
        if !self.config.deprecate_eof {
            packages.push(self.end_of_rows());
        }
        packages.push(row);
        packages.push(self.end_of_rows());
        self.send(&packages).await
    }
}
