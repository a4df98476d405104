use std::{
    collections::HashMap,
    thread::{self, JoinHandle, ThreadId},
};

use parking_lot::{Condvar, Mutex};

use crate::{context, fault::Fault, runtime::Runtime};

// === Starter gate === //

/// The spawn handshake. A spawner parks in `started` until the thread it
/// created has registered, so a worker can never be lost to a process exit
/// that lands between thread creation and its start routine running.
pub(crate) struct StarterGate {
    count: Mutex<usize>,
    started: Condvar,
}

impl StarterGate {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            started: Condvar::new(),
        }
    }
}

/// Spawner side: waits until some new thread has registered, then claims it.
pub(crate) fn started(rt: &Runtime) {
    let mut count = rt.gate.count.lock();
    while *count == 0 {
        rt.gate.started.wait(&mut count);
    }
    *count -= 1;
}

/// Spawnee side: announces arrival. Broadcast, not signal: several spawners
/// may be parked, and any of them may claim any registration.
pub(crate) fn registered(rt: &Runtime) {
    let mut count = rt.gate.count.lock();
    *count += 1;
    if *count == 1 {
        rt.gate.started.notify_all();
    }
}

// === Runner board === //

/// Bookkeeping for every thread the library has created. `running` maps a
/// live thread to its join handle; `finishing` is the baton of the relay
/// race: the one handle whose thread has announced it is exiting and awaits
/// a join from whoever comes through next.
pub(crate) struct Board {
    pub state: Mutex<BoardState>,
    /// Notified when the last runner leaves (and on shutdown poisoning).
    pub finished: Condvar,
}

#[derive(Default)]
pub(crate) struct BoardState {
    pub runners: usize,
    pub finishers: usize,
    pub running: HashMap<ThreadId, JoinHandle<()>>,
    pub finishing: Option<JoinHandle<()>>,
}

impl Board {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BoardState::default()),
            finished: Condvar::new(),
        }
    }
}

/// The exit protocol of every manager. Joins whatever previous finishers
/// have left in the baton slot (releasing the lock across each join), then
/// deposits its own handle and steps off the runner count. The chain
/// guarantees that by the time the board empties, every exited thread has
/// been joined by a successor or is the single baton the final synchronize
/// picks up.
pub(crate) fn relay_race(rt: &Runtime) {
    if rt.is_deadlocked() {
        return;
    }
    let mut board = rt.board.state.lock();
    loop {
        let Some(previous) = board.finishing.take() else {
            break;
        };
        drop(board);
        if previous.join().is_err() {
            rt.ledger.push(Fault::internal());
            rt.poison();
            return;
        }
        board = rt.board.state.lock();
    }
    let own = board.running.remove(&thread::current().id());
    board.finishing = own;
    board.finishers += 1;
    board.runners = board.runners.saturating_sub(1);
    if board.runners == 0 {
        rt.board.finished.notify_all();
    }
}

/// Waits for the runner count to reach zero, then joins the baton and any
/// straggler handles. On return, no library-created thread remains.
pub(crate) fn quiesce(rt: &Runtime) {
    let mut board = rt.board.state.lock();
    while board.runners > 0 && !rt.is_deadlocked() {
        rt.board.finished.wait(&mut board);
    }
    loop {
        let Some(previous) = board.finishing.take() else {
            break;
        };
        drop(board);
        if previous.join().is_err() {
            rt.ledger.push(Fault::internal());
            rt.poison();
        }
        board = rt.board.state.lock();
    }
    let strays: Vec<JoinHandle<()>> = board.running.drain().map(|(_, handle)| handle).collect();
    drop(board);
    if rt.is_deadlocked() {
        return;
    }
    for handle in strays {
        if handle.join().is_err() {
            rt.ledger.push(Fault::internal());
            rt.poison();
        }
    }
}

/// Blocks until every thread the library created has been joined.
///
/// Refused from inside a managed worker, which would otherwise wait on
/// itself.
pub fn sync() -> Result<(), Fault> {
    if let Some(pipe) = context::current() {
        if !pipe.state.lock().placeholder {
            return Err(Fault::Unmanaged);
        }
    }
    quiesce(crate::runtime::runtime());
    Ok(())
}

/// Process-exit teardown: join everything, reclaim the root pool, and flush
/// the ledger.
pub(crate) fn shutdown(rt: &Runtime) {
    quiesce(rt);
    rt.pool.eradicate();
    rt.ledger.flush();
}

// === Tests === //
