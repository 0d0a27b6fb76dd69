//! Shared write transaction broker.
//!
//! Writers take numbered tickets and are served strictly in ticket order. The shared write
//! transaction is handed from one holder to the next without committing as long as someone
//! is already waiting and the transaction is younger than `max_txn_age`; otherwise releasing
//! it commits. Many small writes from several threads thus batch into few commits.
//!
//! Holders write through [`SharedWriteGuard::child`], so one holder aborting never undoes
//! what an earlier holder wrote into the same shared transaction.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use snafu::ResultExt;
use tracing::{debug, warn};

use crate::{
    db::DatabaseInner,
    error::{Result, TransactionSnafu},
    transaction::{ChildTxn, WriteTxn},
};

/// Broker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Shared transactions committed.
    pub commits: u64,
    /// Guards handed out.
    pub acquisitions: u64,
}

struct BrokerState {
    next_ticket: u64,
    now_serving: u64,
    held: bool,
    parked: Option<(WriteTxn, Instant)>,
    stats: BrokerStats,
}

/// Per-database broker for the shared write transaction.
pub struct WriteBroker {
    inner: Arc<DatabaseInner>,
    max_txn_age: Duration,
    state: Mutex<BrokerState>,
    served: Condvar,
}

impl WriteBroker {
    pub(crate) fn new(inner: Arc<DatabaseInner>) -> Self {
        let max_txn_age = inner.config.broker.max_txn_age;
        Self {
            inner,
            max_txn_age,
            state: Mutex::new(BrokerState {
                next_ticket: 0,
                now_serving: 0,
                held: false,
                parked: None,
                stats: BrokerStats::default(),
            }),
            served: Condvar::new(),
        }
    }

    /// Blocks until this caller's ticket is served, then hands out the shared transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transaction`](crate::Error::Transaction) if a new transaction cannot
    /// begin. The ticket is given up in that case.
    pub fn acquire(&self) -> Result<SharedWriteGuard<'_>> {
        let parked = {
            let mut state = self.state.lock();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            while state.now_serving != ticket {
                self.served.wait(&mut state);
            }
            state.held = true;
            state.stats.acquisitions += 1;
            state.parked.take()
        };

        let (txn, started) = match parked {
            Some(parked) => parked,
            None => match self.inner.db.begin_write().context(TransactionSnafu) {
                Ok(txn) => (WriteTxn::new(Arc::clone(&self.inner), txn), Instant::now()),
                Err(e) => {
                    self.advance();
                    return Err(e);
                },
            },
        };
        Ok(SharedWriteGuard { broker: self, txn: Some(txn), started })
    }

    /// Number of callers queued behind the current holder.
    pub fn waiting(&self) -> u64 {
        let state = self.state.lock();
        state.next_ticket - state.now_serving - u64::from(state.held)
    }

    /// Broker counters.
    pub fn stats(&self) -> BrokerStats {
        self.state.lock().stats
    }

    /// Commits the parked transaction, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Commit`](crate::Error::Commit) if the commit fails.
    pub fn flush(&self) -> Result<()> {
        let parked = self.state.lock().parked.take();
        if let Some((txn, started)) = parked {
            self.commit(txn, started)?;
        }
        Ok(())
    }

    fn commit(&self, txn: WriteTxn, started: Instant) -> Result<()> {
        txn.commit()?;
        let commits = {
            let mut state = self.state.lock();
            state.stats.commits += 1;
            state.stats.commits
        };
        debug!(
            db = %self.inner.name,
            age_ms = started.elapsed().as_millis() as u64,
            commits,
            "Committed shared write transaction"
        );
        Ok(())
    }

    fn advance(&self) {
        let mut state = self.state.lock();
        state.held = false;
        state.now_serving += 1;
        self.served.notify_all();
    }

    fn release(&self, txn: WriteTxn, started: Instant, force_commit: bool) -> Result<()> {
        let result = {
            let mut state = self.state.lock();
            let others_waiting = state.next_ticket - state.now_serving > 1;
            if !force_commit && others_waiting && started.elapsed() < self.max_txn_age {
                state.parked = Some((txn, started));
                None
            } else {
                Some(txn)
            }
        }
        .map_or(Ok(()), |txn| self.commit(txn, started));
        self.advance();
        result
    }
}

impl Drop for WriteBroker {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(db = %self.inner.name, error = %e, "Failed to commit parked write transaction");
        }
    }
}

/// Exclusive access to the shared write transaction.
///
/// Dropping the guard releases it, see [`release`](SharedWriteGuard::release).
pub struct SharedWriteGuard<'b> {
    broker: &'b WriteBroker,
    txn: Option<WriteTxn>,
    started: Instant,
}

impl SharedWriteGuard<'_> {
    /// The shared transaction.
    pub fn txn(&self) -> &WriteTxn {
        match &self.txn {
            Some(txn) => txn,
            None => unreachable!("shared write transaction is present until the guard is consumed"),
        }
    }

    /// Starts a child transaction in the shared one.
    pub fn child(&self) -> ChildTxn<'_> {
        self.txn().child()
    }

    /// Time since the shared transaction began.
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Hands the transaction to the next waiter, or commits it when nobody waits or it has
    /// reached `max_txn_age`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Commit`](crate::Error::Commit) if committing fails.
    pub fn release(mut self) -> Result<()> {
        self.finish(false)
    }

    /// Commits the shared transaction now, regardless of waiters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Commit`](crate::Error::Commit) if committing fails.
    pub fn commit(mut self) -> Result<()> {
        self.finish(true)
    }

    fn finish(&mut self, force_commit: bool) -> Result<()> {
        match self.txn.take() {
            Some(txn) => self.broker.release(txn, self.started, force_commit),
            None => Ok(()),
        }
    }
}

impl Drop for SharedWriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish(false) {
            warn!(db = %self.broker.inner.name, error = %e, "Failed to release shared write transaction");
        }
    }
}
