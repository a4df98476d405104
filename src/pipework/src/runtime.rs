use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::Lazy;

use crate::{
    fault::Ledger,
    pool::RootPool,
    sync::{Board, StarterGate},
};

// === Runtime === //

/// Process-lifetime state, created on first use. Installs the one exit
/// handler the library owns.
pub(crate) struct Runtime {
    pub pool: RootPool,
    pub ledger: Ledger,
    pub board: Board,
    pub gate: StarterGate,
    deadlocked: AtomicBool,
}

impl Runtime {
    fn new() -> Self {
        Self {
            pool: RootPool::new(),
            ledger: Ledger::new(),
            board: Board::new(),
            gate: StarterGate::new(),
            deadlocked: AtomicBool::new(false),
        }
    }

    /// Coordination has failed irrecoverably; stop coordinating rather than
    /// hang the process. Wakes anyone parked on the board.
    pub fn poison(&self) {
        self.deadlocked.store(true, Ordering::Relaxed);
        self.board.finished.notify_all();
    }

    pub fn is_deadlocked(&self) -> bool {
        self.deadlocked.load(Ordering::Relaxed)
    }
}

static RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    unsafe {
        libc::atexit(at_process_exit);
    }
    Runtime::new()
});

pub(crate) fn runtime() -> &'static Runtime {
    &RUNTIME
}

extern "C" fn at_process_exit() {
    // Must not unwind across the FFI boundary.
    let _ = std::panic::catch_unwind(|| crate::sync::shutdown(runtime()));
}
