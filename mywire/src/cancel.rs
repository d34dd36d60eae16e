//! Cancellation of running commands
//!
//! A command is cancelled by sending `KILL QUERY <connection id>` on a second
//! connection. Every command sent on a [Session] gets a [CommandId], and a
//! [CancelHandle] only sends the kill while that exact command is in flight.
//!
//! The kill may still arrive after the command finished. The session detects
//! this and absorbs the stray kill with a `DO SLEEP(0)` before its next command.
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tracing::debug;

use crate::{
    constants::error_code,
    error::ConnectionResult,
    options::ConnectionOptions,
    session::Session,
};

/// Identifies one command sent on a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub(crate) u64);

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The command in flight on a session and the latest cancel request
///
/// Zero means no command.
#[derive(Debug, Default)]
pub(crate) struct CommandTracker {
    /// The command currently in flight
    current: AtomicU64,
    /// The command most recently asked to be cancelled
    cancelled: AtomicU64,
}

impl CommandTracker {
    /// A command was sent
    pub(crate) fn begin(&self, id: CommandId) {
        self.current.store(id.0, Ordering::SeqCst);
    }

    /// The response to a command has been read
    ///
    /// Returns true if a kill for the command may still arrive
    pub(crate) fn finish(&self, id: CommandId) -> bool {
        self.current.swap(0, Ordering::SeqCst);
        self.cancelled.load(Ordering::SeqCst) == id.0
    }

    /// Record a cancel request, return true if the command is in flight
    fn request(&self, id: CommandId) -> bool {
        self.cancelled.store(id.0, Ordering::SeqCst);
        self.current.load(Ordering::SeqCst) == id.0
    }

    /// Return true if the command in flight has been asked to cancel
    pub(crate) fn is_cancelling(&self) -> bool {
        let current = self.current.load(Ordering::SeqCst);
        current != 0 && self.cancelled.load(Ordering::SeqCst) == current
    }

    /// The command in flight
    pub(crate) fn current(&self) -> Option<CommandId> {
        match self.current.load(Ordering::SeqCst) {
            0 => None,
            v => Some(CommandId(v)),
        }
    }
}

/// What came of a cancel request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The kill was delivered while the command was running
    Cancelled,
    /// The command was not running, nothing was done
    NotRunning,
}

/// Cancels commands running on one session
///
/// Obtained from [Session::cancel_handle], may be cloned and sent to other tasks
#[derive(Clone, Debug)]
pub struct CancelHandle {
    /// Options used to open the auxiliary connection
    options: Arc<ConnectionOptions>,
    /// Server side id of the target connection
    connection_id: u32,
    /// Shared with the target session
    tracker: Arc<CommandTracker>,
}

impl CancelHandle {
    /// Construct a new handle
    pub(crate) fn new(
        options: Arc<ConnectionOptions>,
        connection_id: u32,
        tracker: Arc<CommandTracker>,
    ) -> Self {
        Self {
            options,
            connection_id,
            tracker,
        }
    }

    /// Server side id of the connection the handle cancels commands on
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// The command currently in flight on the session
    pub fn current(&self) -> Option<CommandId> {
        self.tracker.current()
    }

    /// Cancel the command if it is still running
    ///
    /// Opens a short lived connection to send the kill on. Cancelling is
    /// advisory, the command may complete normally anyway.
    pub async fn cancel(&self, command: CommandId) -> ConnectionResult<CancelOutcome> {
        if !self.mark(command) {
            return Ok(CancelOutcome::NotRunning);
        }
        let mut aux = Session::connect(&self.options).await?;
        let r = self.kill_on(&mut aux).await;
        aux.close().await;
        r
    }

    /// Record that command should be cancelled, return true if a kill must be sent
    pub(crate) fn mark(&self, command: CommandId) -> bool {
        let running = self.tracker.request(command);
        debug!(
            connection_id = self.connection_id,
            command = %command,
            running,
            "Cancel requested"
        );
        running
    }

    /// Send the kill on an already open session
    pub(crate) async fn kill_on(&self, session: &mut Session) -> ConnectionResult<CancelOutcome> {
        match session
            .execute(&format!("KILL QUERY {}", self.connection_id))
            .await
        {
            Ok(_) => Ok(CancelOutcome::Cancelled),
            Err(e) if e.server_code() == Some(error_code::NO_SUCH_THREAD) => {
                Ok(CancelOutcome::NotRunning)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandId, CommandTracker};

    #[test]
    fn cancel_before_finish_is_absorbed() {
        let t = CommandTracker::default();
        t.begin(CommandId(1));
        assert!(t.request(CommandId(1)));
        assert!(t.is_cancelling());
        assert!(t.finish(CommandId(1)));
        assert!(!t.is_cancelling());
    }

    #[test]
    fn stale_cancel_is_ignored() {
        let t = CommandTracker::default();
        t.begin(CommandId(1));
        assert!(!t.finish(CommandId(1)));
        t.begin(CommandId(2));
        assert!(!t.request(CommandId(1)));
        assert!(!t.is_cancelling());
        assert!(!t.finish(CommandId(2)));
        assert_eq!(t.current(), None);
    }
}
