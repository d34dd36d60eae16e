//! Errors returned by sessions and pools
use std::{fmt::Display, time::Duration};

use thiserror::Error;

use crate::{
    constants::error_code,
    package_parser::{DecodeError, DecodeResult, PackageParser},
};

/// Error handling connection
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectionErrorContent {
    /// An error returned by Mariadb/Mysql
    #[error("mysql error {code} ({}): {message}", String::from_utf8_lossy(.status))]
    Mysql {
        /// 2-byte mysql error code
        code: u16,
        /// 5-byte sql state
        status: [u8; 5],
        /// Error message
        message: String,
    },
    /// The running query was interrupted, usually by a cancel request
    #[error("query interrupted: {0}")]
    QueryInterrupted(String),
    /// Network error from tokio
    #[error(transparent)]
    Io(#[from] tokio::io::Error),
    /// An operation did not finish in time
    #[error("timeout while {0}")]
    Timeout(&'static str),
    /// No address of any of the configured hosts accepted a connection
    #[error("unable to connect to any of the specified hosts (attempted: {attempted}): {source}")]
    UnableToConnect {
        /// Comma separated list of the addresses attempted
        attempted: String,
        /// The last failure
        source: Box<ConnectionError>,
    },
    /// Setting up TLS failed
    #[error("tls error: {0}")]
    Tls(String),
    /// Authentication was rejected or could not be performed
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// A package arrived with an unexpected sequence id
    #[error("package out of order, expected sequence id {expected} got {got}")]
    OutOfOrder {
        /// The sequence id we expected
        expected: u8,
        /// The sequence id we got
        got: u8,
    },
    /// Error decoding package
    #[error("error reading {0}: {1}")]
    Decode(&'static str, DecodeError),
    /// Mariadb/Mysql did not speak the protocol correctly
    #[error("protocol error {0}")]
    ProtocolError(String),
    /// The connection options are not valid
    #[error("invalid option: {0}")]
    InvalidOption(String),
    /// A prepared statement was executed with the wrong number of parameters
    #[error("statement takes {expected} parameters but {got} were given")]
    ParameterCount {
        /// Number of parameters the statement takes
        expected: usize,
        /// Number of parameters given
        got: usize,
    },
    /// The session failed previously and can not be used
    #[error("session has failed and can not be used")]
    SessionFailed,
    /// An operation was attempted in a state where it is not allowed
    #[error("invalid session state: {0}")]
    InvalidState(&'static str),
    /// You executed a mysql statement that does not return any columns
    #[error("fetch return no columns")]
    ExpectedRows,
    /// You executed a mysql statement that does return columns, so you need to read the rows
    #[error("rows return for execute")]
    UnexpectedRows,
    /// Waiting for a connection from the pool took too long
    #[error("timeout after {0:?} waiting for a connection from the pool")]
    PoolTimeout(Duration),
    /// The pool has been closed
    #[error("pool closed")]
    PoolClosed,
    #[cfg(feature = "cancel_testing")]
    /// For testing cancel safety
    #[doc(hidden)]
    #[error("await threshold reached")]
    TestCancelled,
}

/// Error handling connection
///
/// This types is a Box around ErrorContent, to make sure
/// that the error type is as small as possible
pub struct ConnectionError(Box<ConnectionErrorContent>);

const _: () = {
    assert!(size_of::<ConnectionError>() == size_of::<usize>());
};

impl ConnectionError {
    /// Return the content of the error
    pub fn content(&self) -> &ConnectionErrorContent {
        &self.0
    }

    /// Return true if the session this error occurred on can not be used afterwards
    ///
    /// Transport, framing and authentication errors are fatal, errors reported
    /// by the server are not unless the server closed the connection.
    pub fn is_fatal(&self) -> bool {
        match self.content() {
            ConnectionErrorContent::Mysql { code, .. } => matches!(
                *code,
                error_code::SERVER_SHUTDOWN
                    | error_code::CONNECTION_KILLED
                    | error_code::CLIENT_INTERACTION_TIMEOUT
            ),
            ConnectionErrorContent::QueryInterrupted(_)
            | ConnectionErrorContent::InvalidState(_)
            | ConnectionErrorContent::InvalidOption(_)
            | ConnectionErrorContent::ParameterCount { .. }
            | ConnectionErrorContent::ExpectedRows
            | ConnectionErrorContent::UnexpectedRows
            | ConnectionErrorContent::PoolTimeout(_)
            | ConnectionErrorContent::PoolClosed => false,
            #[cfg(feature = "cancel_testing")]
            ConnectionErrorContent::TestCancelled => false,
            _ => true,
        }
    }

    /// Return the server error code if this error was reported by the server
    pub fn server_code(&self) -> Option<u16> {
        match self.content() {
            ConnectionErrorContent::Mysql { code, .. } => Some(*code),
            ConnectionErrorContent::QueryInterrupted(_) => Some(error_code::QUERY_INTERRUPTED),
            _ => None,
        }
    }
}

impl std::ops::Deref for ConnectionError {
    type Target = ConnectionErrorContent;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<E: Into<ConnectionErrorContent>> From<E> for ConnectionError {
    fn from(value: E) -> Self {
        ConnectionError(Box::new(value.into()))
    }
}

impl std::fmt::Debug for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for ConnectionError {}

/// Result return by the connection
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Convert [crate::package_parser::DecodeError] into [ConnectionErrorContent::Decode] with an attached location
pub trait WithLoc<T> {
    /// Convert [crate::package_parser::DecodeError] into [ConnectionErrorContent::Decode] with an attached location
    fn loc(self, loc: &'static str) -> ConnectionResult<T>;
}

impl From<DecodeError> for ConnectionErrorContent {
    fn from(value: DecodeError) -> Self {
        ConnectionErrorContent::Decode("value", value)
    }
}

impl<T> WithLoc<T> for DecodeResult<T> {
    fn loc(self, loc: &'static str) -> ConnectionResult<T> {
        self.map_err(|v| ConnectionErrorContent::Decode(loc, v).into())
    }
}

/// Trait used to check expected values
pub(crate) trait Except {
    /// The values to expect
    type Value;

    /// Check that I have the expected value
    fn ev(self, loc: &'static str, expected: Self::Value) -> ConnectionResult<()>;
}

impl<T: Eq + Display> Except for DecodeResult<T> {
    type Value = T;

    fn ev(self, loc: &'static str, expected: T) -> ConnectionResult<()> {
        let v = self.loc(loc)?;
        if v != expected {
            Err(ConnectionErrorContent::ProtocolError(format!(
                "Expected {expected} for {loc} got {v}"
            ))
            .into())
        } else {
            Ok(())
        }
    }
}

/// Construct a protocol error for an unexpected first byte of a package
pub(crate) fn unexpected(what: &str, v: u8) -> ConnectionError {
    ConnectionErrorContent::ProtocolError(format!("Unexpected response type {v:#x} to {what}"))
        .into()
}

/// Parse an error package into the matching error
///
/// We assume the 0xFF has been read
pub(crate) fn parse_mysql_error(pp: &mut PackageParser) -> ConnectionError {
    match parse_mysql_error_inner(pp) {
        Ok(e) | Err(e) => e,
    }
}

/// Parse an error package, see [parse_mysql_error]
fn parse_mysql_error_inner(pp: &mut PackageParser) -> ConnectionResult<ConnectionError> {
    let code = pp.get_u16().loc("code")?;
    // Errors sent before the handshake completes carry no sql state
    let mut status = *b"HY000";
    if pp.peek_u8() == Ok(b'#') {
        pp.get_u8().loc("sharp")?;
        status.copy_from_slice(pp.get_bytes(5).loc("status")?);
    }
    let message = String::from_utf8_lossy(pp.get_eof_bytes()).into_owned();
    if code == error_code::QUERY_INTERRUPTED {
        return Ok(ConnectionErrorContent::QueryInterrupted(message).into());
    }
    Ok(ConnectionErrorContent::Mysql {
        code,
        status,
        message,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::{ConnectionErrorContent, parse_mysql_error};
    use crate::package_parser::PackageParser;

    #[test]
    fn parse_error_package() {
        let mut package = vec![0x15, 0x04, b'#'];
        package.extend_from_slice(b"28000Access denied");
        let e = parse_mysql_error(&mut PackageParser::new(&package));
        match e.content() {
            ConnectionErrorContent::Mysql {
                code,
                status,
                message,
            } => {
                assert_eq!(*code, 1045);
                assert_eq!(status, b"28000");
                assert_eq!(message, "Access denied");
            }
            v => panic!("Unexpected error {v:?}"),
        }
        assert!(!e.is_fatal());
    }

    #[test]
    fn interrupted_is_distinguishable() {
        let mut package = vec![0x25, 0x05, b'#'];
        package.extend_from_slice(b"70100Query execution was interrupted");
        let e = parse_mysql_error(&mut PackageParser::new(&package));
        assert!(matches!(
            e.content(),
            ConnectionErrorContent::QueryInterrupted(_)
        ));
        assert_eq!(e.server_code(), Some(1317));
    }

    #[test]
    fn server_closed_is_fatal() {
        let package = [0x87, 0x07, b'b', b'y', b'e'];
        let e = parse_mysql_error(&mut PackageParser::new(&package));
        assert!(e.is_fatal());
    }
}
