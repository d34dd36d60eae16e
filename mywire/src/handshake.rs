//! The initial handshake: server greeting, capability negotiation and handshake response
//!
//! See <https://mariadb.com/docs/server/reference/clientserver-protocol/1-connecting/connection>
use bytes::BytesMut;

use crate::{
    constants::{MAX_PACKET_SIZE, client, com},
    error::{ConnectionErrorContent, ConnectionResult, Except, WithLoc, parse_mysql_error},
    options::ConnectionOptions,
    package_parser::PackageParser,
    package_writer::PackageWriter,
};

/// Name reported in the `_client_name` connection attribute
const CLIENT_NAME: &str = "mywire";

/// Prefix MariaDB puts in front of its version to keep old clients happy
const MARIADB_RPL_HACK: &str = "5.5.5-";

/// Version of the server we are connected to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerVersion {
    /// The version string as sent by the server, without the replication prefix
    pub raw: String,
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
    /// Patch version
    pub patch: u16,
    /// True if the server is MariaDB
    pub mariadb: bool,
}

impl ServerVersion {
    /// Parse a version string like `8.0.36` or `5.5.5-10.11.6-MariaDB-log`
    pub fn parse(version: &str) -> Self {
        let raw = version.strip_prefix(MARIADB_RPL_HACK).unwrap_or(version);
        let mut parts = raw
            .split(|c: char| !c.is_ascii_digit())
            .take(3)
            .map(|v| v.parse::<u16>().unwrap_or(0));
        let major = parts.next().unwrap_or(0);
        let minor = parts.next().unwrap_or(0);
        let patch = parts.next().unwrap_or(0);
        Self {
            raw: raw.to_string(),
            major,
            minor,
            patch,
            mariadb: raw.to_ascii_lowercase().contains("mariadb"),
        }
    }

    /// Return true if the version is at least major.minor.patch
    pub fn at_least(&self, major: u16, minor: u16, patch: u16) -> bool {
        (self.major, self.minor, self.patch) >= (major, minor, patch)
    }

    /// Return true if the server understands `COM_RESET_CONNECTION`
    pub fn supports_reset_connection(&self) -> bool {
        if self.mariadb {
            self.at_least(10, 2, 4)
        } else {
            self.at_least(5, 7, 3)
        }
    }
}

impl std::fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Capabilities negotiated between client and server
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Capability flags both sides agreed on, see [crate::constants::client]
    pub flags: u32,
    /// MariaDB extended capabilities both sides agreed on
    pub mariadb: u32,
    /// The server understands `COM_RESET_CONNECTION`
    pub reset_connection: bool,
}

impl Capabilities {
    /// Test a capability flag
    #[inline]
    fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// The compressed protocol is used
    pub fn compression(&self) -> bool {
        self.has(client::COMPRESS)
    }

    /// The connection was upgraded to TLS
    pub fn ssl(&self) -> bool {
        self.has(client::SSL)
    }

    /// Result sets end with an OK package instead of an EOF package
    pub fn deprecate_eof(&self) -> bool {
        self.has(client::DEPRECATE_EOF)
    }

    /// OK packages carry session state information
    pub fn session_track(&self) -> bool {
        self.has(client::SESSION_TRACK)
    }

    /// Queries and statement executions carry query attributes
    pub fn query_attributes(&self) -> bool {
        self.has(client::QUERY_ATTRIBUTES)
    }

    /// The server accepts several commands before reading their responses
    pub fn pipelining(&self) -> bool {
        self.mariadb & crate::constants::mariadb_client::COM_MULTI != 0
    }

    /// The server may skip column definitions it sent before
    pub fn cached_metadata(&self) -> bool {
        self.mariadb & crate::constants::mariadb_client::CACHE_METADATA != 0
    }

    /// Connection attributes are sent with the handshake response
    pub fn connect_attrs(&self) -> bool {
        self.has(client::CONNECT_ATTRS)
    }

    /// Authentication plugins are negotiated by name
    pub fn plugin_auth(&self) -> bool {
        self.has(client::PLUGIN_AUTH)
    }

    /// The default database was selected by the handshake response
    pub fn connect_with_db(&self) -> bool {
        self.has(client::CONNECT_WITH_DB)
    }
}

/// The initial handshake package sent by the server
#[derive(Debug)]
pub(crate) struct Greeting {
    /// Version of the server
    pub(crate) server_version: ServerVersion,
    /// Id of the connection (the thread id used by `KILL`)
    pub(crate) connection_id: u32,
    /// Nonce used by the authentication plugins
    pub(crate) nonce: Vec<u8>,
    /// Capability flags of the server
    pub(crate) capabilities: u32,
    /// MariaDB extended capabilities of the server
    pub(crate) mariadb_capabilities: u32,
    /// Default character set of the server
    pub(crate) charset: u8,
    /// Server status flags
    pub(crate) status: u16,
    /// Authentication plugin the server expects
    pub(crate) plugin: String,
}

/// Parse the handshake package sent by the server when we connect
pub(crate) fn parse_greeting(package: &[u8]) -> ConnectionResult<Greeting> {
    let mut p = PackageParser::new(package);
    if p.peek_u8().loc("protocol version")? == 0xFF {
        p.get_u8().loc("error")?;
        let e = parse_mysql_error(&mut p);
        return Err(ConnectionErrorContent::Authentication(format!(
            "Server refused connection: {e}"
        ))
        .into());
    }
    p.get_u8().ev("protocol version", 10)?;
    let server_version = ServerVersion::parse(p.get_null_str().loc("server version")?);
    let connection_id = p.get_u32().loc("connection_id")?;
    let mut nonce = p.get_bytes(8).loc("nonce1")?.to_vec();
    p.get_u8().loc("filler")?;
    let mut capabilities = u32::from(p.get_u16().loc("capability_flags_1")?);
    let mut charset = 0;
    let mut status = 0;
    let mut mariadb_capabilities = 0;
    let mut plugin = "mysql_native_password".to_string();
    if p.remaining() != 0 {
        charset = p.get_u8().loc("character_set")?;
        status = p.get_u16().loc("status_flags")?;
        capabilities |= u32::from(p.get_u16().loc("capability_flags_2")?) << 16;
        let auth_data_len = p.get_u8().loc("auth_plugin_data_len")?;
        p.get_bytes(6).loc("reserved")?;
        let extended = p.get_u32().loc("mariadb capabilities")?;
        if capabilities & client::LONG_PASSWORD == 0 {
            mariadb_capabilities = extended;
        }
        if capabilities & client::SECURE_CONNECTION != 0 {
            let len = usize::from(auth_data_len).saturating_sub(8).max(13);
            let nonce2 = p.get_bytes(len.min(p.remaining())).loc("nonce2")?;
            nonce.extend_from_slice(nonce2.strip_suffix(&[0]).unwrap_or(nonce2));
        }
        if capabilities & client::PLUGIN_AUTH != 0 && p.remaining() != 0 {
            // Some servers omit the terminating zero
            let name = match p.get_null_str() {
                Ok(v) => v,
                Err(_) => p.get_eof_str().loc("auth plugin name")?,
            };
            plugin = name.to_string();
        }
    }
    Ok(Greeting {
        server_version,
        connection_id,
        nonce,
        capabilities,
        mariadb_capabilities,
        charset,
        status,
        plugin,
    })
}

/// Compute the capabilities we ask the server for
pub(crate) fn requested_capabilities(options: &ConnectionOptions, tls: bool) -> u32 {
    let mut caps = client::LONG_PASSWORD
        | client::LONG_FLAG
        | client::PROTOCOL_41
        | client::TRANSACTIONS
        | client::SECURE_CONNECTION
        | client::MULTI_STATEMENTS
        | client::MULTI_RESULTS
        | client::PS_MULTI_RESULTS
        | client::PLUGIN_AUTH
        | client::CONNECT_ATTRS
        | client::PLUGIN_AUTH_LENENC_CLIENT_DATA
        | client::SESSION_TRACK
        | client::DEPRECATE_EOF
        | client::QUERY_ATTRIBUTES;
    if options.database.is_some() {
        caps |= client::CONNECT_WITH_DB;
    }
    if tls {
        caps |= client::SSL;
    }
    if options.compression {
        caps |= client::COMPRESS;
    }
    caps
}

/// Negotiate the capabilities used on the connection
pub(crate) fn negotiate(requested: u32, greeting: &Greeting) -> Capabilities {
    Capabilities {
        flags: requested & greeting.capabilities,
        // We do not ask for any MariaDB extensions yet
        mariadb: 0,
        reset_connection: greeting.server_version.supports_reset_connection(),
    }
}

/// The connection attributes sent to the server
pub(crate) fn connection_attributes(options: &ConnectionOptions) -> Vec<(String, String)> {
    let mut attrs = vec![
        ("_client_name".to_string(), CLIENT_NAME.to_string()),
        (
            "_client_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
        ("_os".to_string(), std::env::consts::OS.to_string()),
        ("_pid".to_string(), std::process::id().to_string()),
    ];
    attrs.extend(options.connection_attributes.iter().cloned());
    attrs
}

/// Write the fixed 32 byte prefix shared by the SSLRequest and the handshake response
fn put_response_prefix(w: &mut PackageWriter<'_>, caps: &Capabilities, charset: u8) {
    w.put_u32(caps.flags);
    w.put_u32(MAX_PACKET_SIZE);
    w.put_u8(charset);
    w.put_zeros(19);
    w.put_u32(caps.mariadb);
}

/// Compose the SSLRequest package sent before upgrading to TLS
pub(crate) fn compose_ssl_request(w: &mut PackageWriter<'_>, caps: &Capabilities, charset: u8) {
    put_response_prefix(w, caps, charset);
}

/// Write connection attributes as a length encoded block of key value pairs
fn put_attributes(w: &mut PackageWriter<'_>, attrs: &[(String, String)]) {
    let mut block = BytesMut::new();
    let mut bw = PackageWriter::new(&mut block);
    for (k, v) in attrs {
        bw.put_lenenc_bytes(k.as_bytes());
        bw.put_lenenc_bytes(v.as_bytes());
    }
    w.put_lenenc_bytes(&block);
}

/// Everything sent in a handshake response or a change user command
pub(crate) struct Credentials<'a> {
    /// User to log in as
    pub(crate) user: &'a str,
    /// Response computed by the authentication plugin
    pub(crate) auth_response: &'a [u8],
    /// Default database
    pub(crate) database: Option<&'a str>,
    /// Name of the authentication plugin used
    pub(crate) plugin: &'a str,
    /// Connection attributes
    pub(crate) attributes: &'a [(String, String)],
}

/// Compose the handshake response
pub(crate) fn compose_handshake_response(
    w: &mut PackageWriter<'_>,
    caps: &Capabilities,
    charset: u8,
    credentials: &Credentials<'_>,
) {
    put_response_prefix(w, caps, charset);
    w.put_str_null(credentials.user);
    if caps.has(client::PLUGIN_AUTH_LENENC_CLIENT_DATA) {
        w.put_lenenc_bytes(credentials.auth_response);
    } else {
        w.put_u8(credentials.auth_response.len() as u8);
        w.put_bytes(credentials.auth_response);
    }
    if caps.has(client::CONNECT_WITH_DB) {
        w.put_str_null(credentials.database.unwrap_or_default());
    }
    if caps.plugin_auth() {
        w.put_str_null(credentials.plugin);
    }
    if caps.connect_attrs() {
        put_attributes(w, credentials.attributes);
    }
}

/// Compose a `COM_CHANGE_USER` command
pub(crate) fn compose_change_user(
    w: &mut PackageWriter<'_>,
    caps: &Capabilities,
    charset: u8,
    credentials: &Credentials<'_>,
) {
    w.put_u8(com::CHANGE_USER);
    w.put_str_null(credentials.user);
    w.put_u8(credentials.auth_response.len() as u8);
    w.put_bytes(credentials.auth_response);
    w.put_str_null(credentials.database.unwrap_or_default());
    w.put_u16(charset.into());
    if caps.plugin_auth() {
        w.put_str_null(credentials.plugin);
    }
    if caps.connect_attrs() {
        put_attributes(w, credentials.attributes);
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::{
        Capabilities, Credentials, ServerVersion, compose_handshake_response, compose_ssl_request,
        parse_greeting,
    };
    use crate::{constants::client, package_parser::PackageParser, package_writer::PackageWriter};

    /// Build a greeting package
    fn greeting(version: &str, caps: u32, extended: u32, plugin: &str) -> Vec<u8> {
        let mut buff = BytesMut::new();
        let mut w = PackageWriter::new(&mut buff);
        w.put_u8(10);
        w.put_str_null(version);
        w.put_u32(77);
        w.put_bytes(b"abcdefgh");
        w.put_u8(0);
        w.put_u16(caps as u16);
        w.put_u8(45);
        w.put_u16(2);
        w.put_u16((caps >> 16) as u16);
        w.put_u8(21);
        w.put_zeros(6);
        w.put_u32(extended);
        w.put_bytes(b"ijklmnopqrst");
        w.put_u8(0);
        w.put_str_null(plugin);
        buff.to_vec()
    }

    #[test]
    fn mysql_greeting() {
        let caps = client::LONG_PASSWORD
            | client::PROTOCOL_41
            | client::SECURE_CONNECTION
            | client::PLUGIN_AUTH;
        let g = parse_greeting(&greeting("8.0.36", caps, 0xFFFF, "caching_sha2_password")).unwrap();
        assert_eq!(g.connection_id, 77);
        assert_eq!(g.nonce, b"abcdefghijklmnopqrst");
        assert_eq!(g.plugin, "caching_sha2_password");
        assert_eq!(g.mariadb_capabilities, 0);
        assert_eq!(g.capabilities, caps);
        assert!(!g.server_version.mariadb);
        assert!(g.server_version.supports_reset_connection());
    }

    #[test]
    fn mariadb_greeting() {
        let caps = client::PROTOCOL_41 | client::SECURE_CONNECTION | client::PLUGIN_AUTH;
        let g = parse_greeting(&greeting(
            "5.5.5-10.1.48-MariaDB",
            caps,
            16,
            "mysql_native_password",
        ))
        .unwrap();
        assert_eq!(g.server_version.raw, "10.1.48-MariaDB");
        assert!(g.server_version.mariadb);
        assert_eq!(g.mariadb_capabilities, 16);
        assert!(!g.server_version.supports_reset_connection());
    }

    #[test]
    fn error_greeting_is_authentication_error() {
        let mut package = vec![0xFF, 0x69, 0x04];
        package.extend_from_slice(b"Host is blocked");
        let e = parse_greeting(&package).unwrap_err();
        assert!(matches!(
            e.content(),
            crate::error::ConnectionErrorContent::Authentication(_)
        ));
    }

    #[test]
    fn versions() {
        let v = ServerVersion::parse("5.7.3-log");
        assert_eq!((v.major, v.minor, v.patch), (5, 7, 3));
        assert!(v.supports_reset_connection());
        assert!(!ServerVersion::parse("5.7.2").supports_reset_connection());
        assert!(ServerVersion::parse("10.2.4-MariaDB").supports_reset_connection());
    }

    #[test]
    fn ssl_request_is_response_prefix() {
        let caps = Capabilities {
            flags: client::PROTOCOL_41
                | client::SSL
                | client::PLUGIN_AUTH
                | client::CONNECT_WITH_DB
                | client::PLUGIN_AUTH_LENENC_CLIENT_DATA,
            mariadb: 0,
            reset_connection: true,
        };
        let mut ssl = BytesMut::new();
        compose_ssl_request(&mut PackageWriter::new(&mut ssl), &caps, 45);
        assert_eq!(ssl.len(), 32);

        let mut response = BytesMut::new();
        compose_handshake_response(
            &mut PackageWriter::new(&mut response),
            &caps,
            45,
            &Credentials {
                user: "app",
                auth_response: &[1, 2, 3],
                database: Some("shop"),
                plugin: "mysql_native_password",
                attributes: &[],
            },
        );
        assert_eq!(&response[..32], &ssl[..]);
        let mut p = PackageParser::new(&response[32..]);
        assert_eq!(p.get_null_str().unwrap(), "app");
        assert_eq!(p.get_lenenc_blob().unwrap(), &[1, 2, 3]);
        assert_eq!(p.get_null_str().unwrap(), "shop");
        assert_eq!(p.get_null_str().unwrap(), "mysql_native_password");
        assert_eq!(p.remaining(), 0);
    }
}
