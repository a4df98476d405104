use std::sync::{Arc, Weak};

use parking_lot::MutexGuard;
use tracing::trace;

use crate::{
    context,
    fault::Fault,
    pipe::{abandon, ensure_live, Payload, Pipe, PipeInner, PipeState},
    plumbing,
    runtime::runtime,
};

// === Reading === //

/// Blocks until `pipe`'s worker yields, delivers its result, and retires the
/// pipe. The handle is spent either way.
///
/// A tethered pipe may only be read by its drain; a pipe with no reader may
/// be read from any thread, managed or not.
pub fn read(pipe: Pipe) -> Result<Payload, Fault> {
    let source = pipe.consume()?;
    let sstate = source.state.lock();
    ensure_live(&sstate)?;
    let drain = sstate.reader.as_ref().and_then(Weak::upgrade);
    match drain {
        None => untethered_read(&source, sstate),
        Some(drain) => {
            let caller = context::current();
            if !caller.is_some_and(|c| Arc::ptr_eq(&c, &drain)) {
                drop(sstate);
                abandon(source);
                return Err(Fault::NotDrain);
            }
            let depth = sstate.depth;
            drop(sstate);
            tethered_read(&source, &drain, depth)
        }
    }
}

fn untethered_read(
    source: &Arc<PipeInner>,
    mut sstate: MutexGuard<'_, PipeState>,
) -> Result<Payload, Fault> {
    while !sstate.yielded {
        source.termination.wait(&mut sstate);
    }
    let payload = sstate.payload.take();
    let verdict = sstate.verdict.take();
    drop(sstate);
    plumbing::kill_one(source, None, true)?;
    match verdict {
        Some(fault) => Err(fault),
        None => payload.ok_or_else(|| Fault::internal()),
    }
}

fn tethered_read(
    source: &Arc<PipeInner>,
    drain: &Arc<PipeInner>,
    depth: usize,
) -> Result<Payload, Fault> {
    // The wait predicate is the source's arrival in the drain's finishers,
    // which the yielding worker updates under this same lock.
    let mut dstate = drain.state.lock();
    loop {
        if dstate.killed {
            drop(dstate);
            plumbing::kill_one(source, None, true)?;
            return Err(Fault::Killed);
        }
        let arrived = dstate
            .scopes
            .frame_at(depth)
            .map_or(false, |frame| frame.finishers.contains(source));
        if arrived {
            break;
        }
        drain.progress.wait(&mut dstate);
    }
    drop(dstate);
    let (payload, verdict) = {
        let mut sstate = source.state.lock();
        (sstate.payload.take(), sstate.verdict.take())
    };
    plumbing::kill_one(source, None, true)?;
    match verdict {
        Some(fault) => Err(fault),
        None => payload.ok_or_else(|| Fault::internal()),
    }
}

// === Yielding === //

/// Manager-side delivery of a finished worker's outcome. Descendants are
/// killed first; then the result is published through whichever of the two
/// yield paths applies.
pub(crate) fn yield_outcome(
    pipe: &Arc<PipeInner>,
    outcome: Result<Payload, Fault>,
) -> Result<(), Fault> {
    plumbing::kill_members(pipe)?;
    let mut sstate = pipe.state.lock();
    sstate.yielded = true;
    match outcome {
        Ok(payload) => sstate.payload = Some(payload),
        Err(fault) => sstate.verdict = Some(fault),
    }
    let drain = sstate.reader.as_ref().and_then(Weak::upgrade);
    match drain {
        Some(drain) => {
            trace!("worker yielded to its drain");
            let depth = sstate.depth;
            let mut dstate = drain.state.lock();
            let frame = dstate
                .scopes
                .frame_at_mut(depth)
                .ok_or_else(|| Fault::internal())?;
            if !frame.blockers.sever(pipe) {
                return Err(Fault::internal());
            }
            frame.finishers.enqueue(pipe.clone());
            drain.progress.notify_all();
        }
        None => {
            trace!("worker yielded untethered");
            sstate.reader = None;
            pipe.termination.notify_all();
            let retire_now = sstate.killed || sstate.zombie;
            drop(sstate);
            if retire_now {
                runtime().pool.unpool(pipe);
            }
        }
    }
    Ok(())
}

// === Selection === //

/// The next finisher in the caller's current scope, in yield order. Blocks
/// while there are still blocked members to wait for; `None` once the scope
/// is childless.
pub fn select() -> Result<Option<Pipe>, Fault> {
    let Some(drain) = context::current() else {
        return Ok(None);
    };
    let mut dstate = drain.state.lock();
    loop {
        if dstate.killed {
            return Err(Fault::Killed);
        }
        if let Some(source) = dstate.scopes.top_mut().finishers.dequeue() {
            drop(dstate);
            let mut sstate = source.state.lock();
            sstate.reader = None;
            sstate.zombie = false;
            drop(sstate);
            return Ok(Some(Pipe::from_inner(source)));
        }
        if dstate.scopes.top().blockers.is_empty() {
            return Ok(None);
        }
        drain.progress.wait(&mut dstate);
    }
}

/// True iff `select` would wait: members are still running and none has
/// yielded yet in the caller's current scope.
pub fn blocked() -> bool {
    let Some(drain) = context::current() else {
        return false;
    };
    let dstate = drain.state.lock();
    !dstate.killed
        && dstate.scopes.top().finishers.is_empty()
        && !dstate.scopes.top().blockers.is_empty()
}

/// Non-blocking: is the worker behind `pipe` still running?
pub fn busy(pipe: &Pipe) -> Result<bool, Fault> {
    let source = pipe.inner()?;
    let sstate = source.state.lock();
    ensure_live(&sstate)?;
    Ok(!sstate.yielded)
}

// === Tests === //
