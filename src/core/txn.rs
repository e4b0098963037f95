//! Transaction unwrapping for change streams.
//!
//! Logical replication frames every statement in BEGIN/COMMIT markers. For event
//! delivery the markers are noise when a transaction holds a single statement, so
//! [`TxnUnwrapper`] buffers a BEGIN and the first statement after it: if the next
//! record is the COMMIT, only the statement is released. Transactions with more
//! than one statement, or whose first record is not a row change, pass through
//! untouched.

use tracing::trace;

use super::changeset::{Changeset, Operation};

#[derive(Debug, Default)]
enum State {
    /// Outside any transaction.
    #[default]
    Idle,
    /// Holding a BEGIN.
    Began(Changeset),
    /// Holding a BEGIN and the first statement.
    First(Changeset, Changeset),
    /// Inside a multi-statement transaction; records flow straight through.
    PassThrough,
}

/// Stateful filter collapsing single-statement transactions.
#[derive(Debug, Default)]
pub struct TxnUnwrapper {
    state: State,
}

impl TxnUnwrapper {
    /// Create an unwrapper outside any transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one record; returns the records ready to be forwarded, in order.
    pub fn process(&mut self, changeset: Changeset) -> Vec<Changeset> {
        let state = std::mem::take(&mut self.state);
        let (next, out) = match (state, changeset.operation.clone()) {
            (State::Idle, Operation::Begin) => (State::Began(changeset), Vec::new()),
            (State::Idle, _) => (State::Idle, vec![changeset]),

            // A BEGIN while one is open means the previous transaction was cut short.
            (held @ (State::Began(_) | State::First(..) | State::PassThrough), Operation::Begin) => {
                (State::Began(changeset), Self::release(held))
            }

            (State::Began(begin), Operation::Commit) => {
                trace!(lsn = begin.watermark.lsn, "dropping empty transaction");
                (State::Idle, Vec::new())
            }
            (State::Began(begin), op) if op.is_dml() => (State::First(begin, changeset), Vec::new()),
            (State::Began(begin), _) => (State::PassThrough, vec![begin, changeset]),

            (State::First(_, statement), Operation::Commit) => (State::Idle, vec![statement]),
            (State::First(begin, statement), _) => {
                (State::PassThrough, vec![begin, statement, changeset])
            }

            (State::PassThrough, Operation::Commit) => (State::Idle, vec![changeset]),
            (State::PassThrough, _) => (State::PassThrough, vec![changeset]),
        };
        self.state = next;
        out
    }

    /// Release everything held, e.g. on shutdown.
    pub fn flush(&mut self) -> Vec<Changeset> {
        Self::release(std::mem::take(&mut self.state))
    }

    /// Whether records are currently held back.
    #[must_use]
    pub const fn is_holding(&self) -> bool {
        matches!(self.state, State::Began(_) | State::First(..))
    }

    fn release(state: State) -> Vec<Changeset> {
        match state {
            State::Idle | State::PassThrough => Vec::new(),
            State::Began(begin) => vec![begin],
            State::First(begin, statement) => vec![begin, statement],
        }
    }
}
