//! Constants used in the mysql/mariadb protocol

/// Bit flags used for fields as described in
/// <https://mariadb.com/docs/server/reference/clientserver-protocol/4-server-response-packets/result-set-packets#field-details-flag>
pub mod column_flag {
    /// Field can't be `NULL`.
    pub const NOT_NULL: u16 = 1;
    /// Field is part of a primary key.
    pub const PRIMARY_KEY: u16 = 2;
    /// Field is unsigned.
    pub const UNSIGNED: u16 = 32;
    /// Field is binary.
    pub const BINARY: u16 = 128;
}

/// Field types as described in
/// <https://mariadb.com/docs/server/reference/clientserver-protocol/4-server-response-packets/result-set-packets#field-types>
pub mod type_ {
    #![allow(missing_docs)]
    pub const DECIMAL: u8 = 0x00;
    pub const TINY: u8 = 0x01;
    pub const SHORT: u8 = 0x02;
    pub const LONG: u8 = 0x03;
    pub const FLOAT: u8 = 0x04;
    pub const DOUBLE: u8 = 0x05;
    pub const NULL: u8 = 0x06;
    pub const TIMESTAMP: u8 = 0x07;
    pub const LONG_LONG: u8 = 0x08;
    pub const INT24: u8 = 0x09;
    pub const DATE: u8 = 0x0a;
    pub const TIME: u8 = 0x0b;
    pub const DATETIME: u8 = 0x0c;
    pub const YEAR: u8 = 0x0d;
    pub const VAR_CHAR: u8 = 0x0f;
    pub const BIT: u8 = 0x10;
    pub const JSON: u8 = 0xf5;
    pub const NEW_DECIMAL: u8 = 0xf6;
    pub const ENUM: u8 = 0xf7;
    pub const SET: u8 = 0xf8;
    pub const TINY_BLOB: u8 = 0xf9;
    pub const MEDIUM_BLOB: u8 = 0xfa;
    pub const LONG_BLOB: u8 = 0xfb;
    pub const BLOB: u8 = 0xfc;
    pub const VAR_STRING: u8 = 0xfd;
    pub const STRING: u8 = 0xfe;
    pub const GEOMETRY: u8 = 0xff;
}

/// Client capability flags
///
/// See <https://mariadb.com/docs/server/reference/clientserver-protocol/1-connecting/connection#capabilities>
pub mod client {
    #![allow(missing_docs)]
    pub const LONG_PASSWORD: u32 = 1;
    pub const FOUND_ROWS: u32 = 2;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const COMPRESS: u32 = 32;
    pub const LOCAL_FILES: u32 = 128;
    pub const PROTOCOL_41: u32 = 512;
    pub const INTERACTIVE: u32 = 1024;
    pub const SSL: u32 = 2048;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 1 << 15;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
    pub const CONNECT_ATTRS: u32 = 1 << 20;
    pub const PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const SESSION_TRACK: u32 = 1 << 23;
    pub const DEPRECATE_EOF: u32 = 1 << 24;
    pub const QUERY_ATTRIBUTES: u32 = 1 << 27;
}

/// Mariadb extended capability flags, sent in the otherwise reserved
/// bytes of the handshake when the server does not set [client::LONG_PASSWORD]
pub mod mariadb_client {
    #![allow(missing_docs)]
    pub const PROGRESS: u32 = 1;
    pub const COM_MULTI: u32 = 2;
    pub const STMT_BULK_OPERATIONS: u32 = 4;
    pub const EXTENDED_TYPE_INFO: u32 = 8;
    pub const CACHE_METADATA: u32 = 16;
}

/// Server status flags as found in OK and EOF packages
pub mod status {
    #![allow(missing_docs)]
    pub const IN_TRANS: u16 = 1;
    pub const AUTOCOMMIT: u16 = 2;
    pub const MORE_RESULTS_EXISTS: u16 = 8;
    pub const CURSOR_EXISTS: u16 = 64;
    pub const SESSION_STATE_CHANGED: u16 = 1 << 14;
}

/// Session state change types, see
/// <https://mariadb.com/docs/server/reference/clientserver-protocol/4-server-response-packets/ok_packet#session-change-type>
pub(crate) mod session_track {
    /// A system variable changed
    pub const SYSTEM_VARIABLES: u8 = 0;
    /// The current schema changed
    pub const SCHEMA: u8 = 1;
}

/// Package types
pub(crate) mod com {
    /// Close the connection, see <https://mariadb.com/docs/server/reference/clientserver-protocol/2-text-protocol/com_quit>
    pub const QUIT: u8 = 0x01;
    /// Change default database, see <https://mariadb.com/docs/server/reference/clientserver-protocol/2-text-protocol/com_init_db>
    pub const INIT_DB: u8 = 0x02;
    /// Query, see <https://mariadb.com/docs/server/reference/clientserver-protocol/2-text-protocol/com_query>
    pub const QUERY: u8 = 0x03;
    /// Ping, see <https://mariadb.com/docs/server/reference/clientserver-protocol/2-text-protocol/com_ping>
    pub const PING: u8 = 0x0E;
    /// Re-authenticate, see <https://mariadb.com/docs/server/reference/clientserver-protocol/2-text-protocol/com_change_user>
    pub const CHANGE_USER: u8 = 0x11;
    /// Prepare statement, see <https://mariadb.com/docs/server/reference/clientserver-protocol/3-binary-protocol-prepared-statements/com_stmt_prepare>
    pub const STMT_PREPARE: u8 = 0x16;
    /// Execute statement, see <https://mariadb.com/docs/server/reference/clientserver-protocol/3-binary-protocol-prepared-statements/com_stmt_execute>
    pub const STMT_EXECUTE: u8 = 0x17;
    /// Close statement, see <https://mariadb.com/docs/server/reference/clientserver-protocol/3-binary-protocol-prepared-statements/3-binary-protocol-prepared-statements-com_stmt_close>
    pub const STMT_CLOSE: u8 = 0x19;
    /// Reset session state, see <https://mariadb.com/docs/server/reference/clientserver-protocol/2-text-protocol/com_reset_connection>
    pub const RESET_CONNECTION: u8 = 0x1F;
}

/// Server error codes the client reacts to
pub mod error_code {
    /// The query was interrupted by `KILL QUERY`
    pub const QUERY_INTERRUPTED: u16 = 1317;
    /// `KILL` referenced a thread that does not exist
    pub const NO_SUCH_THREAD: u16 = 1094;
    /// The server is shutting down
    pub const SERVER_SHUTDOWN: u16 = 1053;
    /// The connection was killed
    pub const CONNECTION_KILLED: u16 = 1927;
    /// The client was disconnected for being idle too long
    pub const CLIENT_INTERACTION_TIMEOUT: u16 = 4031;
}

/// utf8mb4_general_ci
pub const DEFAULT_CHARACTER_SET: u8 = 45;

/// Largest payload we tell the server we accept
pub(crate) const MAX_PACKET_SIZE: u32 = 0x4000_0000;
