//! This crate allows efficient async communication with mysql/mariadb
//!
//! It implements the client side of the wire protocol: framing and compression,
//! the handshake with TLS and pluggable authentication, a cancel safe session state
//! machine, and a pool of reusable sessions.
//!
//! ```no_run
//! use mywire::{ConnectionOptions, ConnectionResult, Pool, PoolOptions};
//!
//! async fn test() -> ConnectionResult<()> {
//!     let pool = Pool::connect(
//!         ConnectionOptions::new().address("127.0.0.1:3306")?.user("user").database("test"),
//!         PoolOptions::new(),
//!     )
//!     .await?;
//!     let mut session = pool.acquire().await?;
//!     let ok = session.execute("DELETE FROM `sessions` WHERE `expired`").await?;
//!     println!("removed {}", ok.affected_rows);
//!     session.release().await;
//!     Ok(())
//! }
//! ```
pub mod auth;
pub mod blocking;
pub mod cache;
pub mod cancel;
pub mod codec;
pub mod constants;
pub mod error;
mod handle_drop;
pub mod handshake;
pub mod options;
pub mod package_parser;
pub mod package_writer;
mod payload;
pub mod pool;
pub mod row;
pub mod session;
mod stream;
pub mod value;

pub use auth::{AuthContext, AuthContinuation, AuthPlugin, AuthPluginRegistry};
pub use cache::{Procedure, ProcedureCache, ProcedureParameter};
pub use cancel::{CancelHandle, CancelOutcome, CommandId};
pub use error::{ConnectionError, ConnectionErrorContent, ConnectionResult};
pub use handshake::{Capabilities, ServerVersion};
pub use options::{ConnectionOptions, LoadBalance, SslMode};
pub use pool::{Pool, PoolConnection, PoolOptions, PoolRegistry, PoolStats};
pub use row::{Column, Row, RowFormat};
pub use session::{
    Command, OkPacket, ResultHeader, ResultSet, Session, SessionState, Statement, Transaction,
};
pub use stream::ResolvedHost;
pub use value::{Param, Value};
