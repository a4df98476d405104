use std::{
    any::Any,
    fmt,
    panic::Location,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use generational_arena::Index;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{fault::Fault, runtime::runtime, scope::ScopeStack};

// === Payloads === //

/// What a worker closure produces and a `read` delivers.
pub type Payload = Box<dyn Any + Send>;

/// Boxes a value for return from a worker closure.
pub fn payload<T: Any + Send>(value: T) -> Payload {
    Box::new(value)
}

// === Audit === //

static LIVE_PIPES: AtomicUsize = AtomicUsize::new(0);

/// Number of pipes currently allocated, placeholders included.
pub fn live_pipes() -> usize {
    LIVE_PIPES.load(Ordering::Relaxed)
}

// === Identity === //

/// A live pipe carries `Live`; retirement stamps the code site that did it,
/// so a stale handle can name the culprit instead of touching freed state.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Tag {
    Live,
    Retired(&'static Location<'static>),
}

impl Tag {
    pub fn is_live(self) -> bool {
        matches!(self, Tag::Live)
    }
}

// === Pipe state === //

pub(crate) struct PipeInner {
    pub state: Mutex<PipeState>,
    /// Notified on untethered yield; an untethered reader waits here.
    pub termination: Condvar,
    /// Notified when a tethered source yields into this pipe's finishers,
    /// and when this pipe is killed; reads and selects wait here.
    pub progress: Condvar,
}

pub(crate) struct PipeState {
    pub tag: Tag,
    pub killed: bool,
    pub yielded: bool,
    pub zombie: bool,
    pub placeholder: bool,
    pub truncated: bool,
    /// Back-reference to the drain. Non-owning; cleared on untether.
    pub reader: Option<Weak<PipeInner>>,
    /// Root-pool membership, if any.
    pub pool: Option<Index>,
    pub scopes: ScopeStack,
    /// The drain's scope level at the moment of tethering.
    pub depth: usize,
    pub payload: Option<Payload>,
    pub verdict: Option<Fault>,
}

impl PipeInner {
    pub fn new(placeholder: bool) -> Arc<Self> {
        LIVE_PIPES.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            state: Mutex::new(PipeState {
                tag: Tag::Live,
                killed: false,
                yielded: false,
                zombie: false,
                placeholder,
                truncated: false,
                reader: None,
                pool: None,
                scopes: ScopeStack::new(),
                depth: 0,
                payload: None,
                verdict: None,
            }),
            termination: Condvar::new(),
            progress: Condvar::new(),
        })
    }
}

impl Drop for PipeInner {
    fn drop(&mut self) {
        LIVE_PIPES.fetch_sub(1, Ordering::Relaxed);
    }
}

pub(crate) fn ensure_live(state: &PipeState) -> Result<(), Fault> {
    if state.tag.is_live() {
        Ok(())
    } else {
        Err(Fault::InvalidPipe)
    }
}

/// A pipe may be torn down once nothing refers to it and nothing will: no
/// reader, no members in any frame, no nested frames, and it is either a
/// placeholder or a worker that has yielded with no prospect of a read.
pub(crate) fn retirable(state: &PipeState) -> bool {
    state.reader.is_none()
        && state.scopes.sentinel_only()
        && state.scopes.childless()
        && (state.placeholder || (state.yielded && (state.killed || state.zombie)))
}

#[track_caller]
pub(crate) fn retire_locked(state: &mut PipeState) {
    debug_assert!(retirable(state));
    retire_forced(state);
}

/// Retirement without the eligibility check, for final teardown where
/// whatever is left goes regardless of how it got there.
#[track_caller]
pub(crate) fn retire_forced(state: &mut PipeState) {
    state.tag = Tag::Retired(Location::caller());
    state.payload = None;
    state.verdict = None;
}

// === Heritable flags === //

/// Walks the tether chain from `start` toward the root, hand over hand: the
/// next pipe's lock is acquired before the current one is released, and no
/// more than two are ever held. `visit` sees each pipe's state, with the
/// depth of the link just climbed for every pipe after the first; a `true`
/// verdict stops the walk.
pub(crate) fn climb(
    start: &Arc<PipeInner>,
    visit: &mut dyn FnMut(&PipeState, Option<usize>) -> bool,
) -> bool {
    ascend(start.state.lock(), None, visit)
}

fn ascend(
    guard: MutexGuard<'_, PipeState>,
    link: Option<usize>,
    visit: &mut dyn FnMut(&PipeState, Option<usize>) -> bool,
) -> bool {
    if visit(&guard, link) {
        return true;
    }
    let Some(drain) = guard.reader.as_ref().and_then(Weak::upgrade) else {
        return false;
    };
    let depth = guard.depth;
    let drain_guard = drain.state.lock();
    drop(guard);
    ascend(drain_guard, Some(depth), visit)
}

/// True if `pipe` or any ancestor drain is killed or has yielded.
pub(crate) fn heritably_defunct(pipe: &Arc<PipeInner>) -> bool {
    climb(pipe, &mut |state, _| state.killed || state.yielded)
}

/// True if `pipe` sits under a truncation: its own mark, an ancestor's mark,
/// or a nonzero counter on the ancestor frame that owns the climbed link.
/// Counters propagate only down the frame that owns the source, never across
/// sibling scopes.
pub(crate) fn heritably_truncated(pipe: &Arc<PipeInner>) -> bool {
    climb(pipe, &mut |state, link| {
        state.truncated
            || link
                .and_then(|depth| state.scopes.frame_at(depth))
                .map_or(false, |frame| frame.truncations > 0)
    })
}

// === Handle === //

/// A single-use handle on one worker's result.
///
/// Obtained from `open` or `select`; spent by `read` or `kill`. Dropping a
/// handle unread marks the pipe zombie so the runtime can reclaim it once
/// the worker is done.
pub struct Pipe {
    inner: Option<Arc<PipeInner>>,
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe").finish_non_exhaustive()
    }
}

impl Pipe {
    pub(crate) fn from_inner(inner: Arc<PipeInner>) -> Self {
        Self { inner: Some(inner) }
    }

    pub(crate) fn inner(&self) -> Result<&Arc<PipeInner>, Fault> {
        self.inner.as_ref().ok_or(Fault::InvalidPipe)
    }

    pub(crate) fn consume(mut self) -> Result<Arc<PipeInner>, Fault> {
        self.inner.take().ok_or(Fault::InvalidPipe)
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            abandon(inner);
        }
    }
}

/// The last external reference is gone. Mark the pipe zombie, and retire it
/// on the spot when it is already finished and loose.
pub(crate) fn abandon(inner: Arc<PipeInner>) {
    {
        let mut state = inner.state.lock();
        if !state.tag.is_live() {
            return;
        }
        state.zombie = true;
        if !(state.yielded && state.reader.is_none()) {
            return;
        }
    }
    runtime().pool.unpool(&inner);
}

// === Tests === //
