//! Implements a pool of sessions to Mariadb/Mysql
//!
//! Example:
//! --------
//! ```no_run
//! use mywire::{ConnectionOptions, ConnectionResult, Pool, PoolOptions};
//!
//! async fn test() -> ConnectionResult<()> {
//!     let pool = Pool::connect(
//!         ConnectionOptions::new()
//!             .address("127.0.0.1:3307")?
//!             .user("user")
//!             .password("pw")
//!             .database("test"),
//!         PoolOptions::new().max_connections(10)
//!     ).await?;
//!
//!     let mut conn = pool.acquire().await?;
//!     let ids = conn
//!         .query("SELECT `id` FROM `table`")
//!         .await?
//!         .map_rows(|row| Ok(row.get(0).ok().and_then(|v| v.as_i64())))
//!         .await?;
//!     println!("Found ids {:?}", ids);
//!     conn.release().await;
//!     Ok(())
//! }
//! ```
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    mem::ManuallyDrop,
    net::IpAddr,
    ops::{Deref, DerefMut},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::{runtime::Handle, sync::oneshot};
use tracing::{debug, info, warn};

use crate::{
    cache::ProcedureCache,
    cancel::{CancelHandle, CancelOutcome, CommandId},
    error::{ConnectionErrorContent, ConnectionResult},
    handle_drop::HandleDrop,
    options::ConnectionOptions,
    session::Session,
    stream,
};

/// Options used for connection pool
#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// The pool keeps at least this many sessions open
    min_connections: usize,
    /// The maximum number of concurrent sessions allowed
    max_connections: usize,
    /// Give up acquiring a session after this long
    acquire_timeout: Duration,
    /// Close sessions that have been idle this long, while keeping min_connections
    idle_timeout: Option<Duration>,
    /// Close sessions older than this
    max_lifetime: Option<Duration>,
    /// Wait this long when a session is returned while it is performing a query.
    ///
    /// After timeout the session is closed. And a new session may then be opened
    clean_timeout: Duration,
    /// Wait this long to attempt to connect again if we fail to connect
    reconnect_time: Duration,
    /// When acquiring a session from the pool that is older than this, ping it first
    /// to ensure that it is still good
    stale_connection_time: Duration,
    /// When pinging a stale session only wait this long
    ping_timeout: Duration,
    /// Reset the session state when a session is returned
    reset_on_release: bool,
    /// Report sessions leased longer than this
    leak_detection_threshold: Option<Duration>,
    /// Re-resolve host names this often, clear the pool when they changed
    dns_check_interval: Option<Duration>,
    /// Run the background maintenance this often
    maintenance_interval: Duration,
}

impl PoolOptions {
    /// New default pool options
    pub fn new() -> Self {
        PoolOptions::default()
    }

    /// The pool keeps at least this many sessions open
    pub fn min_connections(self, connections: usize) -> Self {
        PoolOptions {
            min_connections: connections,
            ..self
        }
    }

    /// The maximum number of concurrent sessions allowed
    pub fn max_connections(self, connections: usize) -> Self {
        PoolOptions {
            max_connections: connections,
            ..self
        }
    }

    /// Give up acquiring a session after this long
    pub fn acquire_timeout(self, duration: Duration) -> Self {
        PoolOptions {
            acquire_timeout: duration,
            ..self
        }
    }

    /// Close sessions that have been idle this long, while keeping min_connections
    pub fn idle_timeout(self, duration: Option<Duration>) -> Self {
        PoolOptions {
            idle_timeout: duration,
            ..self
        }
    }

    /// Close sessions older than this
    pub fn max_lifetime(self, duration: Option<Duration>) -> Self {
        PoolOptions {
            max_lifetime: duration,
            ..self
        }
    }

    /// Wait this long when a session is returned while it is performing a query.
    ///
    /// After timeout the session is closed. And a new session may then be opened
    pub fn clean_timeout(self, duration: Duration) -> Self {
        PoolOptions {
            clean_timeout: duration,
            ..self
        }
    }

    /// Wait this long to attempt to connect again if we fail to connect
    pub fn reconnect_time(self, duration: Duration) -> Self {
        PoolOptions {
            reconnect_time: duration,
            ..self
        }
    }

    /// Ping sessions idle longer than this before handing them out
    pub fn stale_connection_time(self, duration: Duration) -> Self {
        PoolOptions {
            stale_connection_time: duration,
            ..self
        }
    }

    /// When pinging a stale session only wait this long
    pub fn ping_timeout(self, duration: Duration) -> Self {
        PoolOptions {
            ping_timeout: duration,
            ..self
        }
    }

    /// Reset the session state with [Session::reset] when a session is returned
    pub fn reset_on_release(self, reset_on_release: bool) -> Self {
        PoolOptions {
            reset_on_release,
            ..self
        }
    }

    /// Report sessions leased longer than this
    pub fn leak_detection_threshold(self, duration: Option<Duration>) -> Self {
        PoolOptions {
            leak_detection_threshold: duration,
            ..self
        }
    }

    /// Re-resolve host names this often, clear the pool when they changed
    pub fn dns_check_interval(self, duration: Option<Duration>) -> Self {
        PoolOptions {
            dns_check_interval: duration,
            ..self
        }
    }

    /// Run the background maintenance this often
    pub fn maintenance_interval(self, duration: Duration) -> Self {
        PoolOptions {
            maintenance_interval: duration,
            ..self
        }
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(10 * 60)),
            max_lifetime: Some(Duration::from_secs(30 * 60)),
            clean_timeout: Duration::from_millis(200),
            reconnect_time: Duration::from_secs(2),
            stale_connection_time: Duration::from_secs(10 * 60),
            ping_timeout: Duration::from_millis(200),
            reset_on_release: false,
            leak_detection_threshold: None,
            dns_check_interval: None,
            maintenance_interval: Duration::from_secs(30),
        }
    }
}

/// Counters describing the pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Sessions leased out or being opened
    pub leased: usize,
    /// Sessions waiting in the pool
    pub idle: usize,
    /// Callers waiting for a session
    pub waiting: usize,
    /// Incremented by [Pool::clear]
    pub generation: u64,
    /// The maximum number of sessions
    pub max: usize,
}

/// What a waiter is handed
enum Grant {
    /// A returned session
    Session(Session),
    /// Permission to open a new session
    Slot,
}

/// A grant in flight to a waiter, given back to the pool if the waiter went away
type Handover = HandleDrop<(Grant, Pool), fn((Grant, Pool))>;

/// Give back a grant whose waiter went away
fn return_grant((grant, pool): (Grant, Pool)) {
    match grant {
        Grant::Session(session) => pool.put_back(session),
        Grant::Slot => pool.release_slot(),
    }
}

/// Book keeping of a leased session
struct LeaseInfo {
    /// When the session was leased
    since: Instant,
    /// Server side id of the session
    connection_id: u32,
}

/// Part of pool state protected by a mutex
struct PoolProtected {
    /// Sessions ready to be leased, and when they were returned
    idle: VecDeque<(Session, Instant)>,
    /// Number of sessions that exist or are being opened, idle ones included
    slots: usize,
    /// Callers waiting for a session or a slot, in order of arrival
    waiters: VecDeque<oneshot::Sender<Handover>>,
    /// Sessions currently leased
    leases: HashMap<u64, LeaseInfo>,
    /// Id of the next lease
    next_lease: u64,
    /// Addresses host names resolved to when sessions were opened
    dns: HashMap<String, BTreeSet<IpAddr>>,
    /// The pool has been closed
    closed: bool,
}

/// Inner state of a pool
struct PoolInner {
    /// Part of state protected by a mutex
    protected: Mutex<PoolProtected>,
    /// Sessions from older generations are not reused
    generation: AtomicU64,
    /// The pool options given at creation time
    pool_options: PoolOptions,
    /// The connection options given at creation time
    connection_options: Arc<ConnectionOptions>,
    /// Routine metadata shared by all sessions
    procedures: ProcedureCache,
    /// Runtime background work is spawned on
    handle: Handle,
}

/// A pool of shared sessions that can be acquired
#[derive(Clone)]
pub struct Pool(Arc<PoolInner>);

/// What acquire should do next
enum Step {
    /// Use an idle session returned at the given time
    Reuse(Session, Instant),
    /// Open a session in the slot we reserved
    Open,
    /// Wait for a grant
    Wait(oneshot::Receiver<Handover>),
    /// Every slot is taken and the caller does not want to wait
    Busy,
}

impl Pool {
    /// Create a pool without opening any sessions
    ///
    /// Must be called within a tokio runtime, background work is spawned on it
    pub fn new(
        connection_options: ConnectionOptions,
        pool_options: PoolOptions,
    ) -> ConnectionResult<Self> {
        if pool_options.max_connections == 0
            || pool_options.min_connections > pool_options.max_connections
        {
            return Err(ConnectionErrorContent::InvalidOption(format!(
                "invalid pool size min {} max {}",
                pool_options.min_connections, pool_options.max_connections
            ))
            .into());
        }
        let handle = Handle::try_current().map_err(|_| {
            ConnectionErrorContent::InvalidOption(
                "a pool must be created within a tokio runtime".to_string(),
            )
        })?;
        let pool = Pool(Arc::new(PoolInner {
            protected: Mutex::new(PoolProtected {
                idle: VecDeque::new(),
                slots: 0,
                waiters: VecDeque::new(),
                leases: HashMap::new(),
                next_lease: 0,
                dns: HashMap::new(),
                closed: false,
            }),
            generation: AtomicU64::new(0),
            pool_options,
            connection_options: Arc::new(connection_options),
            procedures: ProcedureCache::default(),
            handle,
        }));
        pool.0
            .handle
            .spawn(maintain(Arc::downgrade(&pool.0)));
        Ok(pool)
    }

    /// Establish a new pool, checking that a session can be opened
    pub async fn connect(
        connection_options: ConnectionOptions,
        pool_options: PoolOptions,
    ) -> ConnectionResult<Self> {
        let pool = Self::new(connection_options, pool_options)?;
        let connection = pool.acquire().await?;
        connection.release().await;
        Ok(pool)
    }

    /// Lock the protected state
    fn lock(&self) -> MutexGuard<'_, PoolProtected> {
        self.0
            .protected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The current generation
    fn generation(&self) -> u64 {
        self.0.generation.load(Ordering::SeqCst)
    }

    /// Acquire a free session from the pool.
    ///
    /// If there is no free session wait for one to become available, at most
    /// acquire_timeout after which [ConnectionErrorContent::PoolTimeout] is returned
    ///
    /// The returned future is drop safe
    pub async fn acquire(&self) -> ConnectionResult<PoolConnection> {
        let timeout = self.0.pool_options.acquire_timeout;
        match tokio::time::timeout(timeout, self.acquire_inner()).await {
            Ok(r) => r,
            Err(_) => Err(ConnectionErrorContent::PoolTimeout(timeout).into()),
        }
    }

    /// Perform the work of [Self::acquire]
    async fn acquire_inner(&self) -> ConnectionResult<PoolConnection> {
        loop {
            let (step, expired) = self.next_step(true)?;
            for session in expired {
                self.spawn_close(session);
            }
            match step {
                Step::Reuse(session, since) => {
                    if let Some(connection) = self.checkout(session, since).await {
                        return Ok(connection);
                    }
                }
                Step::Open => return self.open_in_slot().await,
                Step::Busy => {
                    return Err(ConnectionErrorContent::PoolTimeout(Duration::ZERO).into());
                }
                Step::Wait(rx) => {
                    // Safety cancel: A grant that arrives after we are gone is given back by the handover
                    let Ok(handover) = rx.await else {
                        // The pool was closed
                        continue;
                    };
                    let (grant, _) = handover.release();
                    match grant {
                        Grant::Session(session) => {
                            if let Some(connection) = self.checkout(session, Instant::now()).await {
                                return Ok(connection);
                            }
                        }
                        Grant::Slot => return self.open_in_slot().await,
                    }
                }
            }
        }
    }

    /// Acquire a session only if one is idle or a slot is free
    async fn try_acquire(&self) -> ConnectionResult<Option<PoolConnection>> {
        loop {
            let (step, expired) = self.next_step(false)?;
            for session in expired {
                self.spawn_close(session);
            }
            match step {
                Step::Reuse(session, since) => {
                    if let Some(connection) = self.checkout(session, since).await {
                        return Ok(Some(connection));
                    }
                }
                Step::Open => return self.open_in_slot().await.map(Some),
                Step::Busy | Step::Wait(_) => return Ok(None),
            }
        }
    }

    /// Decide what acquire should do, also returns expired idle sessions to close
    ///
    /// When every slot is taken a waiter is queued if wait is true
    fn next_step(&self, wait: bool) -> ConnectionResult<(Step, Vec<Session>)> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ConnectionErrorContent::PoolClosed.into());
        }
        let mut expired = Vec::new();
        while let Some((session, since)) = inner.idle.pop_back() {
            if self.is_expired(&session, since) {
                self.free_slot(&mut inner);
                expired.push(session);
                continue;
            }
            return Ok((Step::Reuse(session, since), expired));
        }
        if inner.slots < self.0.pool_options.max_connections {
            inner.slots += 1;
            return Ok((Step::Open, expired));
        }
        if !wait {
            return Ok((Step::Busy, expired));
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.push_back(tx);
        Ok((Step::Wait(rx), expired))
    }

    /// Return true if an idle session should not be handed out
    fn is_expired(&self, session: &Session, idle_since: Instant) -> bool {
        !self.reusable(session)
            || self
                .0
                .pool_options
                .idle_timeout
                .is_some_and(|t| idle_since.elapsed() > t)
    }

    /// Return true if the session may go back into the pool
    fn reusable(&self, session: &Session) -> bool {
        !session.is_failed()
            && session.generation() == self.generation()
            && self
                .0
                .pool_options
                .max_lifetime
                .is_none_or(|t| session.created().elapsed() <= t)
    }

    /// Lease out session, pinging it first if it has been idle for long
    ///
    /// Returns None if the ping failed
    async fn checkout(&self, session: Session, idle_since: Instant) -> Option<PoolConnection> {
        let mut guard = HandleDrop::new((session, self.clone()), |(session, pool): (Session, Pool)| {
            pool.put_back(session)
        });
        if idle_since.elapsed() > self.0.pool_options.stale_connection_time {
            let (session, _) = &mut *guard;
            // Safety cancel: This is cancel safe since the handle will put the session back into the pool
            let r = tokio::time::timeout(self.0.pool_options.ping_timeout, session.ping()).await;
            if !matches!(r, Ok(Ok(()))) {
                // Ping failed or timed out. Lets drop the session and create a new one
                let (session, pool) = guard.release();
                debug!(connection_id = session.connection_id(), "Stale session failed ping");
                pool.discard(session);
                return None;
            }
        }
        let (session, pool) = guard.release();
        Some(pool.lease(session))
    }

    /// Open a session in a slot reserved by the caller
    async fn open_in_slot(&self) -> ConnectionResult<PoolConnection> {
        let generation = self.generation();
        let slot = HandleDrop::new(self.clone(), |pool: Pool| pool.release_slot());
        // Safety cancel: The handle releases the slot if we are dropped
        let r = Session::open(
            self.0.connection_options.clone(),
            self.0.procedures.clone(),
        )
        .await;
        let pool = slot.release();
        match r {
            Ok(mut session) => {
                session.set_generation(generation);
                pool.record_dns(&session);
                Ok(pool.lease(session))
            }
            Err(e) => {
                warn!(error = %e, "Unable to open pooled session");
                // Wait a bit with releasing the slot, since the next acquire will probably run into the same failure
                let delay = pool.0.pool_options.reconnect_time;
                self.0.handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    pool.release_slot();
                });
                Err(e)
            }
        }
    }

    /// Remember the addresses the host of session resolved to
    fn record_dns(&self, session: &Session) {
        let Some(resolved) = session.resolved_host() else {
            return;
        };
        if resolved.host.parse::<IpAddr>().is_ok() {
            return;
        }
        self.lock()
            .dns
            .entry(resolved.host.clone())
            .or_insert_with(|| resolved.addresses.clone());
    }

    /// Register a lease of session
    fn lease(&self, session: Session) -> PoolConnection {
        let id = {
            let mut inner = self.lock();
            let id = inner.next_lease;
            inner.next_lease += 1;
            inner.leases.insert(
                id,
                LeaseInfo {
                    since: Instant::now(),
                    connection_id: session.connection_id(),
                },
            );
            id
        };
        PoolConnection {
            lease: ManuallyDrop::new(Lease {
                session,
                pool: self.clone(),
                id,
            }),
        }
    }

    /// A lease has ended
    fn end_lease(&self, id: u64) {
        self.lock().leases.remove(&id);
    }

    /// Give grant to the first waiter still waiting
    ///
    /// Returns the grant if nobody is waiting
    fn hand_over(&self, inner: &mut PoolProtected, mut grant: Grant) -> Option<Grant> {
        while let Some(tx) = inner.waiters.pop_front() {
            match tx.send(HandleDrop::new(
                (grant, self.clone()),
                return_grant as fn((Grant, Pool)),
            )) {
                Ok(()) => return None,
                // The waiter went away, must not run the drop handler while locked
                Err(handover) => grant = handover.release().0,
            }
        }
        Some(grant)
    }

    /// A slot is no longer used, give it to a waiter or forget it
    fn free_slot(&self, inner: &mut PoolProtected) {
        if self.hand_over(inner, Grant::Slot).is_some() {
            inner.slots = inner.slots.saturating_sub(1);
        }
    }

    /// A reserved slot was not used
    fn release_slot(&self) {
        let mut inner = self.lock();
        self.free_slot(&mut inner);
    }

    /// Put a clean session back into the pool, or close it if it may not be reused
    fn put_back(&self, session: Session) {
        let discard = {
            let mut inner = self.lock();
            if inner.closed || !self.reusable(&session) {
                self.free_slot(&mut inner);
                Some(session)
            } else {
                if let Some(Grant::Session(session)) =
                    self.hand_over(&mut inner, Grant::Session(session))
                {
                    inner.idle.push_back((session, Instant::now()));
                }
                None
            }
        };
        if let Some(session) = discard {
            self.spawn_close(session);
        }
    }

    /// Close session and release its slot
    fn discard(&self, session: Session) {
        self.release_slot();
        self.spawn_close(session);
    }

    /// Close session in the background
    fn spawn_close(&self, session: Session) {
        self.0.handle.spawn(session.close());
    }

    /// Invalidate all sessions
    ///
    /// Idle sessions are closed now, leased sessions are closed when returned
    pub fn clear(&self) {
        let closing: Vec<Session> = {
            let mut inner = self.lock();
            let generation = self.0.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let closing: Vec<Session> = inner.idle.drain(..).map(|(s, _)| s).collect();
            for _ in &closing {
                self.free_slot(&mut inner);
            }
            info!(generation, closed = closing.len(), "Pool cleared");
            closing
        };
        for session in closing {
            self.spawn_close(session);
        }
    }

    /// Close the pool
    ///
    /// Idle sessions are closed, waiters fail with [ConnectionErrorContent::PoolClosed]
    /// and leased sessions are closed when returned
    pub async fn close(&self) {
        let closing: Vec<Session> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.waiters.clear();
            let closing: Vec<Session> = inner.idle.drain(..).map(|(s, _)| s).collect();
            inner.slots = inner.slots.saturating_sub(closing.len());
            closing
        };
        for session in closing {
            session.close().await;
        }
        debug!("Pool closed");
    }

    /// Return true if the pool has been closed
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Counters describing the pool
    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        PoolStats {
            leased: inner.slots.saturating_sub(inner.idle.len()),
            idle: inner.idle.len(),
            waiting: inner.waiters.iter().filter(|w| !w.is_closed()).count(),
            generation: self.generation(),
            max: self.0.pool_options.max_connections,
        }
    }

    /// The options sessions are opened with
    pub fn connection_options(&self) -> &ConnectionOptions {
        &self.0.connection_options
    }

    /// The options of the pool
    pub fn pool_options(&self) -> &PoolOptions {
        &self.0.pool_options
    }

    /// Routine metadata shared by the sessions of the pool
    pub fn procedures(&self) -> &ProcedureCache {
        &self.0.procedures
    }

    /// Cancel a command, sending the kill on a session from the pool
    ///
    /// If no session is idle and every slot is taken the kill is sent on a
    /// short lived session outside the pool instead of waiting.
    pub async fn cancel(
        &self,
        handle: &CancelHandle,
        command: CommandId,
    ) -> ConnectionResult<CancelOutcome> {
        if !handle.mark(command) {
            return Ok(CancelOutcome::NotRunning);
        }
        match self.try_acquire().await? {
            Some(mut connection) => {
                let r = handle.kill_on(&mut connection).await;
                connection.release().await;
                r
            }
            None => {
                debug!(
                    connection_id = handle.connection_id(),
                    "Pool exhausted, cancelling on an auxiliary session"
                );
                let mut aux = Session::open(
                    self.0.connection_options.clone(),
                    self.0.procedures.clone(),
                )
                .await?;
                let r = handle.kill_on(&mut aux).await;
                aux.close().await;
                r
            }
        }
    }

    /// Close idle sessions past their idle timeout or lifetime, keeping min_connections
    fn prune(&self) {
        let opts = &self.0.pool_options;
        let closing = {
            let mut inner = self.lock();
            let mut closing = Vec::new();
            let mut keep = VecDeque::with_capacity(inner.idle.len());
            while let Some((session, since)) = inner.idle.pop_front() {
                let idle_expired = opts.idle_timeout.is_some_and(|t| since.elapsed() > t)
                    && inner.slots > opts.min_connections;
                if !self.reusable(&session) || idle_expired {
                    inner.slots -= 1;
                    closing.push(session);
                } else {
                    keep.push_back((session, since));
                }
            }
            inner.idle = keep;
            closing
        };
        if !closing.is_empty() {
            debug!(closed = closing.len(), "Pruned idle sessions");
        }
        for session in closing {
            self.spawn_close(session);
        }
    }

    /// Warn about sessions that have been leased for long
    fn report_leaks(&self) {
        let Some(threshold) = self.0.pool_options.leak_detection_threshold else {
            return;
        };
        let inner = self.lock();
        for (lease, info) in &inner.leases {
            let held = info.since.elapsed();
            if held > threshold {
                warn!(
                    lease,
                    connection_id = info.connection_id,
                    held_ms = held.as_millis() as u64,
                    "Session leased for longer than the leak detection threshold"
                );
            }
        }
    }

    /// Re-resolve the recorded host names, clear the pool if any changed
    ///
    /// Returns true if the pool was cleared
    pub async fn check_dns(&self) -> ConnectionResult<bool> {
        let recorded: Vec<(String, BTreeSet<IpAddr>)> = self
            .lock()
            .dns
            .iter()
            .map(|(h, a)| (h.clone(), a.clone()))
            .collect();
        let mut changed = false;
        for (host, old) in recorded {
            let new = stream::resolve(&host, self.0.connection_options.port).await?;
            if new != old {
                info!(host = %host, ?old, ?new, "Host addresses changed");
                self.lock().dns.insert(host, new);
                changed = true;
            }
        }
        if changed {
            self.clear();
        }
        Ok(changed)
    }

    /// Open sessions until min_connections exist
    async fn refill(&self) {
        loop {
            {
                let mut inner = self.lock();
                if inner.closed || inner.slots >= self.0.pool_options.min_connections {
                    return;
                }
                inner.slots += 1;
            }
            let generation = self.generation();
            match Session::open(
                self.0.connection_options.clone(),
                self.0.procedures.clone(),
            )
            .await
            {
                Ok(mut session) => {
                    session.set_generation(generation);
                    self.record_dns(&session);
                    self.put_back(session);
                }
                Err(e) => {
                    warn!(error = %e, "Unable to open session while refilling pool");
                    self.release_slot();
                    return;
                }
            }
        }
    }
}

/// Periodic upkeep of a pool, stops when the pool is dropped or closed
async fn maintain(weak: Weak<PoolInner>) {
    let mut last_dns_check = Instant::now();
    loop {
        let interval = match weak.upgrade() {
            Some(inner) => inner.pool_options.maintenance_interval,
            None => return,
        };
        tokio::time::sleep(interval).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let pool = Pool(inner);
        if pool.is_closed() {
            return;
        }
        pool.prune();
        pool.report_leaks();
        if let Some(dns_interval) = pool.0.pool_options.dns_check_interval
            && last_dns_check.elapsed() >= dns_interval
        {
            last_dns_check = Instant::now();
            if let Err(e) = pool.check_dns().await {
                warn!(error = %e, "Unable to check dns");
            }
        }
        pool.refill().await;
    }
}

/// A leased session, see [PoolConnection]
struct Lease {
    /// The leased session
    session: Session,
    /// The pool the session is leased from
    pool: Pool,
    /// Lease id for leak detection
    id: u64,
}

impl Lease {
    /// Give the session back to the pool, draining and resetting it first
    async fn finish(self) {
        let Lease { session, pool, id } = self;
        pool.end_lease(id);
        let mut guard = HandleDrop::new((session, pool), |(session, pool): (Session, Pool)| {
            pool.discard(session)
        });
        let (session, pool) = &mut *guard;
        if !pool.reusable(session) || pool.is_closed() {
            return;
        }
        let opts = &pool.0.pool_options;
        let r = tokio::time::timeout(opts.clean_timeout, async {
            session.drain().await?;
            if opts.reset_on_release {
                session.reset().await?;
            }
            ConnectionResult::Ok(())
        })
        .await;
        match r {
            Ok(Ok(())) => {
                let (session, pool) = guard.release();
                pool.put_back(session);
            }
            Ok(Err(e)) => {
                debug!(connection_id = session.connection_id(), error = %e, "Unable to clean returned session");
            }
            Err(_) => {
                debug!(connection_id = session.connection_id(), "Timeout cleaning returned session");
            }
        }
    }
}

/// A session leased from the pool
///
/// Give it back with [PoolConnection::release]. If it is dropped instead the
/// session is cleaned up and returned by a background task
pub struct PoolConnection {
    /// The lease, taken on release or drop
    lease: ManuallyDrop<Lease>,
}

impl PoolConnection {
    /// Give the session back to the pool
    ///
    /// Any unfinished command is drained and the session reset if the pool is
    /// configured to. If the returned future is dropped the session is closed.
    pub async fn release(self) {
        let mut this = ManuallyDrop::new(self);
        // Safety: this is never dropped and lease is not accessed again
        let lease = unsafe { ManuallyDrop::take(&mut this.lease) };
        lease.finish().await
    }

    /// The pool the session is leased from
    pub fn pool(&self) -> &Pool {
        &self.lease.pool
    }
}

impl Deref for PoolConnection {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        &self.lease.session
    }
}

impl DerefMut for PoolConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.lease.session
    }
}

impl Drop for PoolConnection {
    /// Return the session, if we are in the middle of a request clean up in the background
    fn drop(&mut self) {
        // Safety: I will not access self.lease after this
        let lease = unsafe { ManuallyDrop::take(&mut self.lease) };
        if lease.session.is_clean() && !lease.pool.0.pool_options.reset_on_release {
            lease.pool.end_lease(lease.id);
            lease.pool.put_back(lease.session);
        } else {
            let handle = lease.pool.0.handle.clone();
            handle.spawn(lease.finish());
        }
    }
}

/// Pools by the connection options they were created with
///
/// Create one registry and pass it where pools are needed, there is no global registry
#[derive(Clone, Default)]
pub struct PoolRegistry {
    /// Pools by [ConnectionOptions::pool_key]
    pools: Arc<Mutex<HashMap<String, Pool>>>,
}

impl PoolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the pools
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Pool>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the pool for options, creating it if it does not exist
    pub fn get_or_create(
        &self,
        options: &ConnectionOptions,
        pool_options: PoolOptions,
    ) -> ConnectionResult<Pool> {
        let mut pools = self.lock();
        let key = options.pool_key();
        if let Some(pool) = pools.get(&key)
            && !pool.is_closed()
        {
            return Ok(pool.clone());
        }
        let pool = Pool::new(options.clone(), pool_options)?;
        pools.insert(key, pool.clone());
        Ok(pool)
    }

    /// Return the pool for options if it exists
    pub fn get(&self, options: &ConnectionOptions) -> Option<Pool> {
        self.lock().get(&options.pool_key()).cloned()
    }

    /// Remove the pool for options from the registry without closing it
    pub fn remove(&self, options: &ConnectionOptions) -> Option<Pool> {
        self.lock().remove(&options.pool_key())
    }

    /// Clear every pool, see [Pool::clear]
    pub fn clear_all(&self) {
        let pools: Vec<Pool> = self.lock().values().cloned().collect();
        for pool in pools {
            pool.clear();
        }
    }

    /// Close and remove every pool
    pub async fn close_all(&self) {
        let pools: Vec<Pool> = self.lock().drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.close().await;
        }
    }

    /// Number of pools in the registry
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Return true if the registry holds no pools
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, net::IpAddr, time::Duration};

    use super::{Pool, PoolOptions, PoolRegistry};
    use crate::{error::ConnectionErrorContent, options::ConnectionOptions};

    #[tokio::test]
    async fn dns_change_clears_pool() {
        let pool = Pool::new(ConnectionOptions::new(), PoolOptions::new()).unwrap();
        let stale: IpAddr = "192.0.2.1".parse().unwrap();
        pool.lock()
            .dns
            .insert("localhost".to_string(), BTreeSet::from([stale]));

        assert!(pool.check_dns().await.unwrap());
        assert_eq!(pool.stats().generation, 1);
        assert!(!pool.lock().dns["localhost"].contains(&stale));

        assert!(!pool.check_dns().await.unwrap());
        assert_eq!(pool.stats().generation, 1);
    }

    #[tokio::test]
    async fn invalid_sizes_rejected() {
        let r = Pool::new(
            ConnectionOptions::new(),
            PoolOptions::new().min_connections(3).max_connections(2),
        );
        assert!(matches!(
            r.map(|_| ()).unwrap_err().content(),
            ConnectionErrorContent::InvalidOption(_)
        ));
    }

    #[tokio::test]
    async fn closed_pool_refuses_acquire() {
        let pool = Pool::new(
            ConnectionOptions::new(),
            PoolOptions::new().acquire_timeout(Duration::from_millis(50)),
        )
        .unwrap();
        pool.close().await;
        let e = pool.acquire().await.map(|_| ()).unwrap_err();
        assert!(matches!(e.content(), ConnectionErrorContent::PoolClosed));
        assert_eq!(pool.stats().leased, 0);
    }

    #[tokio::test]
    async fn registry_reuses_pools() {
        let registry = PoolRegistry::new();
        let options = ConnectionOptions::new().database("a");
        let a = registry.get_or_create(&options, PoolOptions::new()).unwrap();
        let b = registry.get_or_create(&options, PoolOptions::new()).unwrap();
        assert!(std::sync::Arc::ptr_eq(&a.0, &b.0));
        let other = registry
            .get_or_create(&ConnectionOptions::new().database("b"), PoolOptions::new())
            .unwrap();
        assert!(!std::sync::Arc::ptr_eq(&a.0, &other.0));
        assert_eq!(registry.len(), 2);
        assert!(registry.remove(&options).is_some());
        assert!(registry.get(&options).is_none());
        registry.close_all().await;
        assert!(registry.is_empty());
        assert!(other.is_closed());
    }
}
