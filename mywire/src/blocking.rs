//! Blocking wrappers around sessions and pools
//!
//! Every wrapper owns a handle to a small tokio runtime, and every call is bounded
//! by a timeout. Do not use these from within an async context.
//!
//! ```no_run
//! use std::time::Duration;
//! use mywire::{ConnectionOptions, ConnectionResult, blocking::BlockingSession};
//!
//! fn test() -> ConnectionResult<()> {
//!     let options = ConnectionOptions::new().address("127.0.0.1:3306")?.user("user");
//!     let mut session = BlockingSession::connect(&options, Duration::from_secs(10))?;
//!     let names = session.query_map("SELECT `name` FROM `users`", |row| {
//!         Ok(row.get(0).ok().and_then(|v| v.as_str().map(str::to_string)))
//!     })?;
//!     println!("{:?}", names);
//!     session.close();
//!     Ok(())
//! }
//! ```
use std::{future::Future, sync::Arc, time::Duration};

use tokio::runtime::Runtime;

use crate::{
    cancel::CancelHandle,
    error::{ConnectionErrorContent, ConnectionResult},
    options::ConnectionOptions,
    pool::{Pool, PoolConnection, PoolOptions, PoolStats},
    row::Row,
    session::{OkPacket, Session, Statement},
    value::Param,
};

/// Create the runtime blocking calls are executed on
fn runtime() -> ConnectionResult<Arc<Runtime>> {
    Ok(Arc::new(
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?,
    ))
}

/// Run fut to completion, failing with [ConnectionErrorContent::Timeout] after timeout
fn block_on<T>(
    runtime: &Runtime,
    timeout: Duration,
    what: &'static str,
    fut: impl Future<Output = ConnectionResult<T>>,
) -> ConnectionResult<T> {
    runtime.block_on(async {
        match tokio::time::timeout(timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(ConnectionErrorContent::Timeout(what).into()),
        }
    })
}

impl AsMut<Session> for Session {
    fn as_mut(&mut self) -> &mut Session {
        self
    }
}

impl AsMut<Session> for PoolConnection {
    fn as_mut(&mut self) -> &mut Session {
        self
    }
}

/// A session usable from synchronous code
pub struct BlockingSession<S: AsMut<Session> = Session> {
    /// Runtime the session is driven on
    runtime: Arc<Runtime>,
    /// The session, or a pool lease of one
    inner: S,
    /// Bound on every call
    timeout: Duration,
}

/// A session leased from a [BlockingPool]
pub type BlockingPoolConnection = BlockingSession<PoolConnection>;

impl BlockingSession<Session> {
    /// Connect on a new runtime, every call is bounded by timeout
    pub fn connect(options: &ConnectionOptions, timeout: Duration) -> ConnectionResult<Self> {
        let runtime = runtime()?;
        let session = block_on(&runtime, timeout, "connecting", Session::connect(options))?;
        Ok(Self {
            runtime,
            inner: session,
            timeout,
        })
    }

    /// Close the session, errors are ignored
    pub fn close(self) {
        let BlockingSession {
            runtime,
            inner,
            timeout,
        } = self;
        let _ = block_on(&runtime, timeout, "closing", async {
            inner.close().await;
            Ok(())
        });
    }
}

impl BlockingSession<PoolConnection> {
    /// Give the session back to the pool
    pub fn release(self) {
        let BlockingSession {
            runtime,
            inner,
            timeout,
        } = self;
        let _ = block_on(&runtime, timeout, "releasing", async {
            inner.release().await;
            Ok(())
        });
    }
}

impl<S: AsMut<Session>> BlockingSession<S> {
    /// The underlying session
    pub fn session(&mut self) -> &mut Session {
        self.inner.as_mut()
    }

    /// Execute sql not returning a result set
    pub fn execute(&mut self, sql: &str) -> ConnectionResult<OkPacket> {
        block_on(&self.runtime, self.timeout, "executing", self.inner.as_mut().execute(sql))
    }

    /// Execute sql and map every row of the result set
    pub fn query_map<T>(
        &mut self,
        sql: &str,
        f: impl FnMut(Row<'_>) -> ConnectionResult<T>,
    ) -> ConnectionResult<Vec<T>> {
        let session = self.inner.as_mut();
        block_on(&self.runtime, self.timeout, "querying", async move {
            session.query(sql).await?.map_rows(f).await
        })
    }

    /// Prepare a statement
    pub fn prepare(&mut self, sql: &str) -> ConnectionResult<Statement> {
        block_on(&self.runtime, self.timeout, "preparing", self.inner.as_mut().prepare(sql))
    }

    /// Execute a prepared statement not returning a result set
    pub fn execute_statement(
        &mut self,
        statement: &Statement,
        params: &[Param<'_>],
    ) -> ConnectionResult<OkPacket> {
        block_on(
            &self.runtime,
            self.timeout,
            "executing statement",
            self.inner.as_mut().execute_statement(statement, params),
        )
    }

    /// Execute a prepared statement and map every row of the result set
    pub fn fetch_statement_map<T>(
        &mut self,
        statement: &Statement,
        params: &[Param<'_>],
        f: impl FnMut(Row<'_>) -> ConnectionResult<T>,
    ) -> ConnectionResult<Vec<T>> {
        let session = self.inner.as_mut();
        block_on(&self.runtime, self.timeout, "fetching statement", async move {
            session
                .fetch_statement(statement, params)
                .await?
                .map_rows(f)
                .await
        })
    }

    /// Deallocate a prepared statement
    pub fn close_statement(&mut self, statement: Statement) -> ConnectionResult<()> {
        block_on(
            &self.runtime,
            self.timeout,
            "closing statement",
            self.inner.as_mut().close_statement(statement),
        )
    }

    /// Check that the connection is alive
    pub fn ping(&mut self) -> ConnectionResult<()> {
        block_on(&self.runtime, self.timeout, "pinging", self.inner.as_mut().ping())
    }

    /// Reset the session state, see [Session::reset]
    pub fn reset(&mut self) -> ConnectionResult<()> {
        block_on(&self.runtime, self.timeout, "resetting", self.inner.as_mut().reset())
    }

    /// A handle that can cancel commands from another thread, see [BlockingCancel]
    pub fn cancel_handle(&mut self) -> BlockingCancel {
        BlockingCancel {
            runtime: self.runtime.clone(),
            handle: self.inner.as_mut().cancel_handle(),
            timeout: self.timeout,
        }
    }
}

/// Cancels the command running on a [BlockingSession] from another thread
#[derive(Clone)]
pub struct BlockingCancel {
    /// Runtime the kill is sent from
    runtime: Arc<Runtime>,
    /// The async handle
    handle: CancelHandle,
    /// Bound on the cancel
    timeout: Duration,
}

impl BlockingCancel {
    /// Cancel whatever command is currently running, if any
    pub fn cancel_current(&self) -> ConnectionResult<crate::cancel::CancelOutcome> {
        let Some(command) = self.handle.current() else {
            return Ok(crate::cancel::CancelOutcome::NotRunning);
        };
        block_on(&self.runtime, self.timeout, "cancelling", self.handle.cancel(command))
    }
}

/// A pool usable from synchronous code
pub struct BlockingPool {
    /// Runtime the pool and its background work run on
    runtime: Arc<Runtime>,
    /// The async pool
    pool: Pool,
    /// Bound on every call
    timeout: Duration,
}

impl BlockingPool {
    /// Create a pool on a new runtime and check that a session can be opened
    pub fn connect(
        options: ConnectionOptions,
        pool_options: PoolOptions,
        timeout: Duration,
    ) -> ConnectionResult<Self> {
        let runtime = runtime()?;
        let pool = block_on(
            &runtime,
            timeout,
            "connecting",
            Pool::connect(options, pool_options),
        )?;
        Ok(Self {
            runtime,
            pool,
            timeout,
        })
    }

    /// Acquire a session, see [Pool::acquire]
    pub fn acquire(&self) -> ConnectionResult<BlockingPoolConnection> {
        let connection = block_on(&self.runtime, self.timeout, "acquiring", self.pool.acquire())?;
        Ok(BlockingSession {
            runtime: self.runtime.clone(),
            inner: connection,
            timeout: self.timeout,
        })
    }

    /// Counters describing the pool
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Invalidate all sessions, see [Pool::clear]
    pub fn clear(&self) {
        self.pool.clear()
    }

    /// The async pool
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Close the pool
    pub fn close(self) {
        let _ = block_on(&self.runtime, self.timeout, "closing pool", async {
            self.pool.close().await;
            Ok(())
        });
    }
}
