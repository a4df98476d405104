use std::panic::Location;

use parking_lot::Mutex;
use thiserror::Error;

// === Fault === //

/// Everything a library entry can report. Worker closures may also return a
/// `Fault`, which travels through the pipe's verdict slot and surfaces from
/// the eventual `read`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Fault {
    #[error("operation requires a managed context")]
    Unmanaged,

    #[error("caller is not the drain of this pipe")]
    NotDrain,

    #[error("pipe failed its identity check")]
    InvalidPipe,

    #[error("caller's pipe was killed")]
    Killed,

    #[error("scope exited with no matching entry")]
    ScopeUnderflow,

    #[error("worker yielded with scopes still open")]
    ScopeNotExited,

    #[error("worker panicked")]
    Panicked,

    #[error("internal inconsistency at {site}")]
    Internal { site: &'static Location<'static> },

    #[error("thread resources exhausted (errno {errno})")]
    Exhausted { errno: i32 },
}

impl Fault {
    /// An invariant break, stamped with the code site that detected it.
    #[track_caller]
    pub(crate) fn internal() -> Self {
        Fault::Internal {
            site: Location::caller(),
        }
    }
}

// === Ledger === //

/// Faults raised in thread contexts with no caller to hand them to. Bounded:
/// the first records are kept, the rest are only counted.
const LEDGER_LIMIT: usize = 16;

#[derive(Default)]
pub(crate) struct Ledger {
    state: Mutex<LedgerState>,
}

#[derive(Default)]
struct LedgerState {
    records: Vec<Fault>,
    overflow: usize,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, fault: Fault) {
        let mut state = self.state.lock();
        if state.records.len() < LEDGER_LIMIT {
            state.records.push(fault);
        } else {
            state.overflow += 1;
        }
    }

    /// Drains the ledger into the log. Called once, at final teardown.
    pub fn flush(&self) {
        let (records, overflow) = {
            let mut state = self.state.lock();
            (std::mem::take(&mut state.records), std::mem::take(&mut state.overflow))
        };
        for fault in records {
            tracing::error!("unreported runtime fault: {fault}");
        }
        if overflow > 0 {
            tracing::error!("{overflow} further faults were dropped from the ledger");
        }
    }
}

// === Tests === //

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_is_bounded() {
        let ledger = Ledger::new();
        for _ in 0..LEDGER_LIMIT + 3 {
            ledger.push(Fault::Panicked);
        }
        let state = ledger.state.lock();
        assert_eq!(state.records.len(), LEDGER_LIMIT);
        assert_eq!(state.overflow, 3);
    }

    #[test]
    fn internal_faults_carry_their_site() {
        let fault = Fault::internal();
        match fault {
            Fault::Internal { site } => assert!(site.file().ends_with("fault.rs")),
            other => panic!("unexpected fault: {other:?}"),
        }
    }

    #[test]
    fn faults_render() {
        assert!(!Fault::NotDrain.to_string().is_empty());
        assert!(!Fault::Exhausted { errno: 11 }.to_string().is_empty());
    }
}
