//! Options used to establish sessions to Mariadb/Mysql
use std::{
    borrow::Cow,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};

use crate::{
    auth::AuthPluginRegistry,
    constants::DEFAULT_CHARACTER_SET,
    error::{ConnectionErrorContent, ConnectionResult},
};

/// How to secure the connection with TLS
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum SslMode {
    /// Never use TLS
    Disabled,
    /// Use TLS if the server supports it, without verifying the certificate
    #[default]
    Preferred,
    /// Require TLS, without verifying the certificate
    Required,
    /// Require TLS and verify that the certificate is signed by a trusted authority
    VerifyCa,
    /// Require TLS, verify the certificate and that it matches the host name
    VerifyFull,
}

impl SslMode {
    /// Return true if the session must fail when TLS is not available
    pub fn is_required(self) -> bool {
        !matches!(self, SslMode::Disabled | SslMode::Preferred)
    }
}

/// The order in which configured hosts are tried
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum LoadBalance {
    /// Always try the hosts in the order they were given
    #[default]
    FailOver,
    /// Start at the next host for every new session
    RoundRobin,
    /// Try the hosts in random order
    Random,
}

/// Options used to establish a session to Mariadb/Mysql
///
/// ```
/// use mywire::ConnectionOptions;
///
/// let options = ConnectionOptions::new()
///     .host("db1.example.com")
///     .host("db2.example.com")
///     .port(3307)
///     .user("app")
///     .password("secret")
///     .database("shop")
///     .session_variable("time_zone", "'+00:00'");
/// assert_eq!(options.hosts(), ["db1.example.com", "db2.example.com"]);
/// ```
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// Host names or ip addresses to connect to
    pub(crate) hosts: Vec<String>,
    /// The TCP port to connect to
    pub(crate) port: u16,
    /// Connect to this unix socket instead of using TCP
    pub(crate) socket: Option<PathBuf>,
    /// Connect to this named pipe instead of using TCP
    pub(crate) pipe: Option<String>,
    /// The user to connect as
    pub(crate) user: String,
    /// The password for the user
    pub(crate) password: String,
    /// The database to use
    pub(crate) database: Option<String>,
    /// How to use TLS
    pub(crate) ssl_mode: SslMode,
    /// Pem file with the certificate authorities to trust
    pub(crate) ssl_ca: Option<PathBuf>,
    /// Request compression of the protocol
    pub(crate) compression: bool,
    /// Give up connecting after this long
    pub(crate) connect_timeout: Duration,
    /// Order in which to try the hosts
    pub(crate) load_balance: LoadBalance,
    /// Extra connection attributes sent to the server
    pub(crate) connection_attributes: Vec<(String, String)>,
    /// Session variables set when the session is opened or reset
    pub(crate) session_variables: Vec<(String, String)>,
    /// Character set id used for the session
    pub(crate) charset: u8,
    /// Pem encoded RSA public key of the server, used for sha256 based authentication
    pub(crate) server_rsa_public_key: Option<Arc<[u8]>>,
    /// Allow asking the server for its RSA public key
    pub(crate) allow_public_key_retrieval: bool,
    /// Allow sending the password in clear text over unencrypted connections
    pub(crate) allow_cleartext_password: bool,
    /// Authentication plugins available to the session
    pub(crate) auth_plugins: AuthPluginRegistry,
    /// Position of the next host to start at in [LoadBalance::RoundRobin]
    pub(crate) next_host: Arc<AtomicUsize>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            port: 3306,
            socket: None,
            pipe: None,
            user: "root".to_string(),
            password: String::new(),
            database: None,
            ssl_mode: SslMode::default(),
            ssl_ca: None,
            compression: false,
            connect_timeout: Duration::from_secs(15),
            load_balance: LoadBalance::default(),
            connection_attributes: Vec::new(),
            session_variables: Vec::new(),
            charset: DEFAULT_CHARACTER_SET,
            server_rsa_public_key: None,
            allow_public_key_retrieval: false,
            allow_cleartext_password: false,
            auth_plugins: AuthPluginRegistry::default(),
            next_host: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ConnectionOptions {
    /// New default connection options
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host to connect to
    ///
    /// Hosts are tried in the order given by [Self::load_balance]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.hosts.push(host.into());
        self
    }

    /// Add a host and set the port from a `host:port` string
    ///
    /// Ipv6 addresses must be enclosed in brackets, as in `[::1]:3306`
    pub fn address(self, address: &str) -> ConnectionResult<Self> {
        if let Ok(addr) = address.parse::<SocketAddr>() {
            return Ok(self.host(addr.ip().to_string()).port(addr.port()));
        }
        let invalid = || ConnectionErrorContent::InvalidOption(format!("Invalid address {address:?}"));
        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse().map_err(|_| invalid())?;
        if host.is_empty() {
            return Err(invalid().into());
        }
        Ok(self.host(host).port(port))
    }

    /// The TCP port to connect to
    pub fn port(self, port: u16) -> Self {
        Self { port, ..self }
    }

    /// Connect through a unix domain socket instead of TCP
    pub fn socket(self, path: impl Into<PathBuf>) -> Self {
        Self {
            socket: Some(path.into()),
            ..self
        }
    }

    /// Connect through a named pipe instead of TCP (windows only)
    pub fn pipe(self, name: impl Into<String>) -> Self {
        Self {
            pipe: Some(name.into()),
            ..self
        }
    }

    /// The user to connect as
    pub fn user(self, user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..self
        }
    }

    /// The password for the user
    pub fn password(self, password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            ..self
        }
    }

    /// The database to use
    pub fn database(self, database: impl Into<String>) -> Self {
        Self {
            database: Some(database.into()),
            ..self
        }
    }

    /// How to secure the connection with TLS
    pub fn ssl_mode(self, ssl_mode: SslMode) -> Self {
        Self { ssl_mode, ..self }
    }

    /// Pem file with the certificate authorities to trust instead of the system roots
    pub fn ssl_ca(self, path: impl Into<PathBuf>) -> Self {
        Self {
            ssl_ca: Some(path.into()),
            ..self
        }
    }

    /// Request compression of the protocol if the server supports it
    pub fn compression(self, compression: bool) -> Self {
        Self {
            compression,
            ..self
        }
    }

    /// Give up connecting after this long, covering all hosts and addresses
    pub fn connect_timeout(self, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..self
        }
    }

    /// The order in which to try the hosts
    pub fn load_balance(self, load_balance: LoadBalance) -> Self {
        Self {
            load_balance,
            ..self
        }
    }

    /// Send an extra connection attribute to the server
    pub fn connection_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.connection_attributes.push((key.into(), value.into()));
        self
    }

    /// Set a session variable when the session is opened or reset
    ///
    /// The value is inserted into the `SET` statement as is, so strings must be quoted
    pub fn session_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.session_variables.push((name.into(), value.into()));
        self
    }

    /// Character set id used for the session, defaults to utf8mb4_general_ci
    pub fn charset(self, charset: u8) -> Self {
        Self { charset, ..self }
    }

    /// Pem encoded RSA public key of the server, used for sha256 based authentication
    /// over connections without TLS
    pub fn server_rsa_public_key(self, pem: impl Into<Vec<u8>>) -> Self {
        Self {
            server_rsa_public_key: Some(pem.into().into()),
            ..self
        }
    }

    /// Allow asking the server for its RSA public key
    ///
    /// This allows a man in the middle to see the password
    pub fn allow_public_key_retrieval(self, allow_public_key_retrieval: bool) -> Self {
        Self {
            allow_public_key_retrieval,
            ..self
        }
    }

    /// Allow sending the password in clear text over connections without TLS
    pub fn allow_cleartext_password(self, allow_cleartext_password: bool) -> Self {
        Self {
            allow_cleartext_password,
            ..self
        }
    }

    /// Authentication plugins available to the session
    pub fn auth_plugins(self, auth_plugins: AuthPluginRegistry) -> Self {
        Self {
            auth_plugins,
            ..self
        }
    }

    /// The configured hosts, `localhost` if none was given
    pub fn hosts(&self) -> Vec<&str> {
        if self.hosts.is_empty() {
            vec!["localhost"]
        } else {
            self.hosts.iter().map(String::as_str).collect()
        }
    }

    /// The configured user
    pub fn get_user(&self) -> &str {
        &self.user
    }

    /// The configured database
    pub fn get_database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// The hosts in the order the next session should try them
    pub(crate) fn ordered_hosts(&self) -> Vec<&str> {
        let mut hosts = self.hosts();
        match self.load_balance {
            LoadBalance::FailOver => (),
            LoadBalance::RoundRobin => {
                let start = self.next_host.fetch_add(1, Ordering::Relaxed) % hosts.len();
                hosts.rotate_left(start);
            }
            LoadBalance::Random => hosts.shuffle(&mut rand::thread_rng()),
        }
        hosts
    }

    /// The `SET` statement applying the configured session variables
    pub(crate) fn session_variables_statement(&self) -> Option<String> {
        if self.session_variables.is_empty() {
            return None;
        }
        let mut q = "SET ".to_string();
        for (i, (name, value)) in self.session_variables.iter().enumerate() {
            if i != 0 {
                q.push_str(", ");
            }
            q.push_str(name);
            q.push('=');
            q.push_str(value);
        }
        Some(q)
    }

    /// Key identifying options that may share a pool
    ///
    /// Options with equal keys connect to the same servers with the same
    /// credentials and session setup. The password is included as a hash.
    pub fn pool_key(&self) -> String {
        let mut hosts: Vec<Cow<str>> = self
            .hosts()
            .into_iter()
            .map(|h| Cow::Owned(h.to_ascii_lowercase()))
            .collect();
        if self.load_balance != LoadBalance::FailOver {
            hosts.sort();
        }
        let password: String = Sha1::digest(self.password.as_bytes())
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        let mut key = format!(
            "hosts={};port={};socket={:?};pipe={:?};user={};password={};database={};ssl={:?};ca={:?};compress={};balance={:?};charset={}",
            hosts.join(","),
            self.port,
            self.socket,
            self.pipe,
            self.user,
            password,
            self.database.as_deref().unwrap_or_default(),
            self.ssl_mode,
            self.ssl_ca,
            self.compression,
            self.load_balance,
            self.charset,
        );
        for (name, value) in &self.session_variables {
            key.push_str(&format!(";var:{name}={value}"));
        }
        key
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionOptions, LoadBalance};

    #[test]
    fn parse_address() {
        let o = ConnectionOptions::new().address("127.0.0.1:3307").unwrap();
        assert_eq!(o.hosts(), ["127.0.0.1"]);
        assert_eq!(o.port, 3307);
        let o = ConnectionOptions::new().address("[::1]:3308").unwrap();
        assert_eq!(o.hosts(), ["::1"]);
        assert_eq!(o.port, 3308);
        let o = ConnectionOptions::new().address("db.local:3309").unwrap();
        assert_eq!(o.hosts(), ["db.local"]);
        assert!(ConnectionOptions::new().address("db.local").is_err());
        assert!(ConnectionOptions::new().address(":3306").is_err());
    }

    #[test]
    fn round_robin_rotates() {
        let o = ConnectionOptions::new()
            .host("a")
            .host("b")
            .host("c")
            .load_balance(LoadBalance::RoundRobin);
        assert_eq!(o.ordered_hosts(), ["a", "b", "c"]);
        assert_eq!(o.ordered_hosts(), ["b", "c", "a"]);
        assert_eq!(o.clone().ordered_hosts(), ["c", "a", "b"]);
    }

    #[test]
    fn pool_key_normalizes() {
        let a = ConnectionOptions::new().host("DB").user("u").password("p");
        let b = ConnectionOptions::new().host("db").user("u").password("p");
        let c = ConnectionOptions::new().host("db").user("u").password("q");
        assert_eq!(a.pool_key(), b.pool_key());
        assert_ne!(a.pool_key(), c.pool_key());
        assert!(!a.pool_key().contains("=p;"));
    }

    #[test]
    fn session_variables() {
        let o = ConnectionOptions::new();
        assert_eq!(o.session_variables_statement(), None);
        let o = o
            .session_variable("time_zone", "'+00:00'")
            .session_variable("sql_mode", "'STRICT_ALL_TABLES'");
        assert_eq!(
            o.session_variables_statement().unwrap(),
            "SET time_zone='+00:00', sql_mode='STRICT_ALL_TABLES'"
        );
    }
}
