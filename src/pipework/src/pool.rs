use std::sync::Arc;

use generational_arena::Arena;
use parking_lot::Mutex;

use crate::{
    context,
    pipe::{retirable, retire_forced, retire_locked, PipeInner},
};

// === Root pool === //

/// The process-wide list of untethered pipes and placeholders. Entries keep
/// their arena index in their own `pool` field, which is the list cell.
///
/// The pool lock is always taken before any pipe lock.
pub(crate) struct RootPool {
    slots: Mutex<Arena<Arc<PipeInner>>>,
}

impl RootPool {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Arena::new()),
        }
    }

    /// Inserts unconditionally (placeholder creation).
    pub fn placed(&self, pipe: &Arc<PipeInner>) {
        let mut slots = self.slots.lock();
        let mut state = pipe.state.lock();
        if state.tag.is_live() && state.pool.is_none() {
            state.pool = Some(slots.insert(pipe.clone()));
        }
    }

    /// Inserts an untethered pipe, or retires it outright when it is already
    /// beyond use.
    pub fn pooled(&self, pipe: &Arc<PipeInner>) {
        let mut slots = self.slots.lock();
        let mut state = pipe.state.lock();
        if !state.tag.is_live() {
            return;
        }
        if retirable(&state) {
            if let Some(index) = state.pool.take() {
                slots.remove(index);
            }
            let was_placeholder = state.placeholder;
            retire_locked(&mut state);
            drop(state);
            drop(slots);
            if was_placeholder {
                context::clear_if(pipe);
            }
        } else if state.pool.is_none() {
            state.pool = Some(slots.insert(pipe.clone()));
        }
    }

    /// Removes unconditionally (the pipe is being tethered).
    pub fn displace(&self, pipe: &Arc<PipeInner>) {
        let mut slots = self.slots.lock();
        let mut state = pipe.state.lock();
        if let Some(index) = state.pool.take() {
            slots.remove(index);
        }
    }

    /// Retires the pipe if it has become retirable, removing it from the pool
    /// first. Clears the calling thread's context binding when the retiree was
    /// its placeholder.
    pub fn unpool(&self, pipe: &Arc<PipeInner>) {
        let mut slots = self.slots.lock();
        let mut state = pipe.state.lock();
        if !state.tag.is_live() || !retirable(&state) {
            return;
        }
        if let Some(index) = state.pool.take() {
            slots.remove(index);
        }
        let was_placeholder = state.placeholder;
        retire_locked(&mut state);
        drop(state);
        drop(slots);
        if was_placeholder {
            context::clear_if(pipe);
        }
    }

    /// Final reclamation at process exit. Every library thread has been
    /// joined by now, so anything still pooled is either a placeholder or a
    /// yielded orphan; both go, members first.
    pub fn eradicate(&self) {
        let pipes: Vec<Arc<PipeInner>> = {
            let mut slots = self.slots.lock();
            let indices: Vec<_> = slots.iter().map(|(index, _)| index).collect();
            indices.into_iter().filter_map(|i| slots.remove(i)).collect()
        };
        for pipe in &pipes {
            loop {
                let member = {
                    let mut state = pipe.state.lock();
                    if !state.tag.is_live() {
                        break;
                    }
                    state.scopes.take_any_member()
                };
                let Some(member) = member else { break };
                let mut mstate = member.state.lock();
                mstate.reader = None;
                mstate.zombie = true;
                if mstate.tag.is_live() {
                    retire_forced(&mut mstate);
                }
            }
            let mut state = pipe.state.lock();
            if !state.tag.is_live() {
                continue;
            }
            state.scopes.collapse();
            state.pool = None;
            state.zombie = true;
            retire_forced(&mut state);
        }
    }
}
