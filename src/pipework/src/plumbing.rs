use std::sync::{Arc, Weak};

use tracing::trace;

use crate::{
    context,
    fault::Fault,
    pipe::{ensure_live, heritably_defunct, heritably_truncated, retire_locked, Pipe, PipeInner},
    runtime::runtime,
};

// === Tethering === //

/// Attaches `source` to `drain` at the drain's current scope. Idempotent for
/// an attachment that already holds; an attachment to anyone else is refused.
///
/// Lock order: source first, drain second.
pub(crate) fn tether_to(source: &Arc<PipeInner>, drain: &Arc<PipeInner>) -> Result<(), Fault> {
    if Arc::ptr_eq(source, drain) {
        return Err(Fault::NotDrain);
    }
    let mut sstate = source.state.lock();
    ensure_live(&sstate)?;
    if sstate.killed {
        return Err(Fault::InvalidPipe);
    }
    let current = sstate.reader.as_ref().and_then(Weak::upgrade);
    if let Some(cur) = current {
        let dstate = drain.state.lock();
        if Arc::ptr_eq(&cur, drain) && sstate.depth == dstate.scopes.level() {
            return Ok(());
        }
        return Err(Fault::NotDrain);
    }
    let mut dstate = drain.state.lock();
    ensure_live(&dstate)?;
    sstate.reader = Some(Arc::downgrade(drain));
    sstate.depth = dstate.scopes.level();
    if sstate.yielded {
        dstate.scopes.top_mut().finishers.enqueue(source.clone());
    } else {
        dstate.scopes.top_mut().blockers.push(source.clone());
    }
    let was_pooled = sstate.pool.is_some();
    drop(dstate);
    drop(sstate);
    if was_pooled {
        runtime().pool.displace(source);
    }
    Ok(())
}

/// Severs `source` from its drain, which must be the caller's context with
/// the attachment at its current scope. An already-untethered pipe just goes
/// (back) to the root pool.
pub(crate) fn untether_inner(source: &Arc<PipeInner>) -> Result<(), Fault> {
    let mut sstate = source.state.lock();
    ensure_live(&sstate)?;
    let drain = sstate.reader.as_ref().and_then(Weak::upgrade);
    let Some(drain) = drain else {
        sstate.reader = None;
        drop(sstate);
        runtime().pool.pooled(source);
        return Ok(());
    };
    let caller = context::current();
    if !caller.is_some_and(|c| Arc::ptr_eq(&c, &drain)) {
        return Err(Fault::NotDrain);
    }
    let mut dstate = drain.state.lock();
    if sstate.depth != dstate.scopes.level() {
        return Err(Fault::NotDrain);
    }
    if !dstate.scopes.top_mut().sever_either(source) {
        return Err(Fault::internal());
    }
    sstate.reader = None;
    let reclaim = dstate.placeholder && dstate.scopes.childless();
    drop(dstate);
    drop(sstate);
    runtime().pool.pooled(source);
    if reclaim {
        runtime().pool.unpool(&drain);
    }
    Ok(())
}

/// Untethers a member known to belong to `drain` (scope-exit and manager
/// teardown paths, where the caller already owns the relationship).
pub(crate) fn untether_member(source: &Arc<PipeInner>, drain: &Arc<PipeInner>) -> Result<(), Fault> {
    let mut sstate = source.state.lock();
    let attached = sstate
        .reader
        .as_ref()
        .and_then(Weak::upgrade)
        .is_some_and(|r| Arc::ptr_eq(&r, drain));
    if !attached {
        return Err(Fault::internal());
    }
    let mut dstate = drain.state.lock();
    let depth = sstate.depth;
    let severed = dstate
        .scopes
        .frame_at_mut(depth)
        .map_or(false, |frame| frame.sever_either(source));
    if !severed {
        return Err(Fault::internal());
    }
    sstate.reader = None;
    drop(dstate);
    drop(sstate);
    runtime().pool.pooled(source);
    Ok(())
}

/// Empties the top frame of `drain`, one member at a time, turning residual
/// children into untethered roots.
pub(crate) fn vacate_members(drain: &Arc<PipeInner>) -> Result<(), Fault> {
    loop {
        let member = drain.state.lock().scopes.top().any_member();
        match member {
            Some(source) => untether_member(&source, drain)?,
            None => return Ok(()),
        }
    }
}

// === Killing === //

/// Kills one pipe: flag it, wake anything it is blocked on, sever it from
/// its drain (even if it already yielded there), and pool it — which retires
/// it on the spot once it can no longer run.
///
/// `expected` asserts who the drain must be; the cascade uses it to guarantee
/// progress. `reclaim_drain` permits reclamation of a drain that this kill
/// leaves a childless placeholder; cascades suppress it so the caller's own
/// context cannot vanish mid-walk.
pub(crate) fn kill_one(
    source: &Arc<PipeInner>,
    expected: Option<&Arc<PipeInner>>,
    reclaim_drain: bool,
) -> Result<(), Fault> {
    let mut sstate = source.state.lock();
    if !sstate.tag.is_live() {
        return Ok(());
    }
    sstate.killed = true;
    source.progress.notify_all();
    let drain = sstate.reader.as_ref().and_then(Weak::upgrade);
    let mut reclaim = None;
    match drain {
        Some(drain) => {
            if expected.is_some_and(|exp| !Arc::ptr_eq(&drain, exp)) {
                return Err(Fault::internal());
            }
            let mut dstate = drain.state.lock();
            let depth = sstate.depth;
            let severed = dstate
                .scopes
                .frame_at_mut(depth)
                .map_or(false, |frame| frame.sever_either(source));
            if !severed {
                return Err(Fault::internal());
            }
            sstate.reader = None;
            if reclaim_drain && dstate.placeholder && dstate.scopes.childless() {
                reclaim = Some(drain.clone());
            }
        }
        None => {
            sstate.reader = None;
            if expected.is_some() {
                return Err(Fault::internal());
            }
        }
    }
    drop(sstate);
    runtime().pool.pooled(source);
    if let Some(drain) = reclaim {
        runtime().pool.unpool(&drain);
    }
    Ok(())
}

/// Kills every blocker in the drain's current scope, then retires every
/// finisher there. The drain lock is released across each kill so the dying
/// member can lock its own drain; finishers' descendants are, by induction,
/// already killed.
pub(crate) fn kill_members(drain: &Arc<PipeInner>) -> Result<(), Fault> {
    loop {
        let blocker = drain.state.lock().scopes.top().blockers.first().cloned();
        match blocker {
            Some(source) => {
                trace!("killing blocked member");
                kill_one(&source, Some(drain), false)?;
            }
            None => break,
        }
    }
    loop {
        let finisher = drain.state.lock().scopes.top_mut().finishers.dequeue();
        let Some(source) = finisher else { break };
        let mut sstate = source.state.lock();
        sstate.reader = None;
        sstate.killed = true;
        if sstate.tag.is_live() {
            retire_locked(&mut sstate);
        }
    }
    Ok(())
}

// === Entries === //

/// Reassigns ownership of `pipe` to the caller's context.
pub fn tether(pipe: &Pipe) -> Result<(), Fault> {
    let source = pipe.inner()?;
    let drain = context::adopt();
    tether_to(source, &drain)
}

/// Releases `pipe` from the caller into the root pool. The worker keeps
/// running; anyone may pick the pipe up again with `tether` or read it
/// untethered.
pub fn untether(pipe: &Pipe) -> Result<(), Fault> {
    untether_inner(pipe.inner()?)
}

/// Kills `pipe`, consuming the handle. Cooperative: the worker observes the
/// kill through `killed()` or a failing select, and the runtime reclaims the
/// pipe once it yields.
pub fn kill(pipe: Pipe) -> Result<(), Fault> {
    let source = pipe.consume()?;
    {
        let sstate = source.state.lock();
        ensure_live(&sstate)?;
        let drain = sstate.reader.as_ref().and_then(Weak::upgrade);
        if let Some(drain) = drain {
            let caller = context::current();
            if !caller.is_some_and(|c| Arc::ptr_eq(&c, &drain)) {
                drop(sstate);
                crate::pipe::abandon(source);
                return Err(Fault::NotDrain);
            }
        }
    }
    kill_one(&source, None, true)
}

/// Kills every descendant in the caller's current scope.
pub fn kill_all() -> Result<(), Fault> {
    match context::current() {
        Some(context) => kill_members(&context),
        None => Ok(()),
    }
}

/// Cooperative-cancellation poll: has the caller, or any drain above it,
/// been killed or yielded out from under it?
pub fn killed() -> bool {
    context::current().map_or(false, |c| heritably_defunct(&c))
}

/// Asks `pipe`'s worker (and its whole subtree) to wind down early. The
/// worker sees it through `truncated()`; nothing is interrupted.
pub fn truncate(pipe: &Pipe) -> Result<(), Fault> {
    let source = pipe.inner()?;
    let mut sstate = source.state.lock();
    ensure_live(&sstate)?;
    let drain = sstate.reader.as_ref().and_then(Weak::upgrade);
    if let Some(drain) = drain {
        let caller = context::current();
        if !caller.is_some_and(|c| Arc::ptr_eq(&c, &drain)) {
            return Err(Fault::NotDrain);
        }
    }
    sstate.truncated = true;
    Ok(())
}

/// Asks every worker in the caller's current scope to wind down early.
pub fn truncate_all() -> Result<(), Fault> {
    if let Some(context) = context::current() {
        let mut state = context.state.lock();
        let top = state.scopes.top_mut();
        top.truncations = top.truncations.saturating_add(1);
    }
    Ok(())
}

/// Cooperative-truncation poll for the caller's context.
pub fn truncated() -> bool {
    context::current().map_or(false, |c| heritably_truncated(&c))
}

// === Tests === //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::PipeInner;

    fn fresh_pair() -> (Arc<PipeInner>, Arc<PipeInner>) {
        (PipeInner::new(false), PipeInner::new(true))
    }

    #[test]
    fn tethering_is_reciprocal() {
        let (source, drain) = fresh_pair();
        tether_to(&source, &drain).unwrap();

        let sstate = source.state.lock();
        let back = sstate.reader.as_ref().and_then(Weak::upgrade).unwrap();
        assert!(Arc::ptr_eq(&back, &drain));
        assert_eq!(sstate.depth, 0);
        drop(sstate);

        let dstate = drain.state.lock();
        assert!(dstate.scopes.top().blockers.contains(&source));
        assert!(dstate.scopes.top().finishers.is_empty());
    }

    #[test]
    fn retether_to_same_drain_is_idempotent() {
        let (source, drain) = fresh_pair();
        tether_to(&source, &drain).unwrap();
        tether_to(&source, &drain).unwrap();
        assert_eq!(drain.state.lock().scopes.top().blockers.len(), 1);
    }

    #[test]
    fn second_drain_is_refused() {
        let (source, drain) = fresh_pair();
        let interloper = PipeInner::new(true);
        tether_to(&source, &drain).unwrap();
        assert_eq!(tether_to(&source, &interloper), Err(Fault::NotDrain));
    }

    #[test]
    fn yielded_sources_tether_straight_into_finishers() {
        let (source, drain) = fresh_pair();
        source.state.lock().yielded = true;
        tether_to(&source, &drain).unwrap();
        let dstate = drain.state.lock();
        assert!(dstate.scopes.top().finishers.contains(&source));
        assert!(dstate.scopes.top().blockers.is_empty());
    }

    #[test]
    fn kill_unthethers_and_flags() {
        let (source, drain) = fresh_pair();
        tether_to(&source, &drain).unwrap();
        kill_one(&source, Some(&drain), false).unwrap();

        let sstate = source.state.lock();
        assert!(sstate.killed);
        assert!(sstate.reader.is_none());
        drop(sstate);
        assert!(drain.state.lock().scopes.childless());
    }

    #[test]
    fn cascade_clears_the_current_scope() {
        let drain = PipeInner::new(true);
        let running = PipeInner::new(false);
        let finished = PipeInner::new(false);
        finished.state.lock().yielded = true;
        tether_to(&running, &drain).unwrap();
        tether_to(&finished, &drain).unwrap();

        kill_members(&drain).unwrap();
        assert!(drain.state.lock().scopes.childless());
        assert!(running.state.lock().killed);
        // the finisher is gone for good
        assert!(!finished.state.lock().tag.is_live());

        // a second cascade over the emptied scope changes nothing
        kill_members(&drain).unwrap();
        assert!(drain.state.lock().scopes.childless());
    }

    #[test]
    fn heritable_kill_is_seen_through_the_chain() {
        let root = PipeInner::new(true);
        let mid = PipeInner::new(false);
        let leaf = PipeInner::new(false);
        tether_to(&mid, &root).unwrap();
        tether_to(&leaf, &mid).unwrap();

        assert!(!heritably_defunct(&leaf));
        mid.state.lock().killed = true;
        assert!(heritably_defunct(&leaf));
        assert!(!heritably_defunct(&root));
    }

    #[test]
    fn truncation_respects_frame_boundaries() {
        let root = PipeInner::new(true);
        let inner = PipeInner::new(false);
        let outer = PipeInner::new(false);

        tether_to(&outer, &root).unwrap();
        root.state.lock().scopes.enter();
        tether_to(&inner, &root).unwrap();

        // truncate only the current (inner) frame
        {
            let mut rstate = root.state.lock();
            let top = rstate.scopes.top_mut();
            top.truncations = top.truncations.saturating_add(1);
        }
        assert!(heritably_truncated(&inner));
        assert!(!heritably_truncated(&outer));
    }
}
