use std::sync::Arc;

use tracing::warn;

use crate::{
    context,
    fault::Fault,
    pipe::{ensure_live, PipeInner},
    plumbing,
    roster::Roster,
    runtime::runtime,
};

// === Frames === //

/// One level of a drain's attention stack. Sources tethered while this frame
/// was on top live here until they are read, untethered, or killed.
#[derive(Default)]
pub(crate) struct ScopeFrame {
    pub blockers: Roster,
    pub finishers: Roster,
    pub truncations: u32,
}

impl ScopeFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_childless(&self) -> bool {
        self.blockers.is_empty() && self.finishers.is_empty()
    }

    /// Removes a member from whichever roster holds it.
    pub fn sever_either(&mut self, member: &Arc<PipeInner>) -> bool {
        self.blockers.sever(member) || self.finishers.sever(member)
    }

    pub fn any_member(&self) -> Option<Arc<PipeInner>> {
        self.blockers
            .first()
            .or_else(|| self.finishers.first())
            .cloned()
    }
}

// === Stack === //

/// A pipe's scope frames. The sentinel frame at the bottom is never popped;
/// `level` counts only the frames above it. A source tethered at level `n`
/// is owned by the frame reachable as `frame_at(n)` for as long as the tether
/// lasts, however much deeper the drain nests in the meantime.
pub(crate) struct ScopeStack {
    base: ScopeFrame,
    nested: Vec<ScopeFrame>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self {
            base: ScopeFrame::new(),
            nested: Vec::new(),
        }
    }

    pub fn level(&self) -> usize {
        self.nested.len()
    }

    pub fn top(&self) -> &ScopeFrame {
        self.nested.last().unwrap_or(&self.base)
    }

    pub fn top_mut(&mut self) -> &mut ScopeFrame {
        self.nested.last_mut().unwrap_or(&mut self.base)
    }

    pub fn frame_at(&self, depth: usize) -> Option<&ScopeFrame> {
        if depth == 0 {
            Some(&self.base)
        } else {
            self.nested.get(depth - 1)
        }
    }

    pub fn frame_at_mut(&mut self, depth: usize) -> Option<&mut ScopeFrame> {
        if depth == 0 {
            Some(&mut self.base)
        } else {
            self.nested.get_mut(depth - 1)
        }
    }

    pub fn enter(&mut self) {
        self.nested.push(ScopeFrame::new());
    }

    pub fn exit(&mut self) -> Option<ScopeFrame> {
        self.nested.pop()
    }

    pub fn sentinel_only(&self) -> bool {
        self.nested.is_empty()
    }

    pub fn childless(&self) -> bool {
        self.base.is_childless() && self.nested.iter().all(ScopeFrame::is_childless)
    }

    /// Pulls one member out of any frame, head first. Exit-time teardown only.
    pub fn take_any_member(&mut self) -> Option<Arc<PipeInner>> {
        if let Some(member) = self.base.blockers.dequeue() {
            return Some(member);
        }
        if let Some(member) = self.base.finishers.dequeue() {
            return Some(member);
        }
        for frame in &mut self.nested {
            if let Some(member) = frame.blockers.dequeue() {
                return Some(member);
            }
            if let Some(member) = frame.finishers.dequeue() {
                return Some(member);
            }
        }
        None
    }

    /// Drops all nested frames. They must already be childless.
    pub fn collapse(&mut self) {
        self.nested.clear();
    }
}

// === Entries === //

/// Pushes a fresh scope frame onto the caller's context, adopting a
/// placeholder context first if the thread is unmanaged.
pub fn enter_scope() -> Result<(), Fault> {
    let context = context::adopt();
    let mut state = context.state.lock();
    ensure_live(&state)?;
    state.scopes.enter();
    Ok(())
}

/// Pops the caller's current scope frame. Sources still tethered in the frame
/// are untethered into the root pool first, so the frame always pops cleanly.
pub fn exit_scope() -> Result<(), Fault> {
    let Some(context) = context::current() else {
        return Err(Fault::Unmanaged);
    };
    {
        let state = context.state.lock();
        ensure_live(&state)?;
        if state.scopes.level() == 0 {
            return Err(Fault::ScopeUnderflow);
        }
    }
    plumbing::vacate_members(&context)?;
    let mut state = context.state.lock();
    state.scopes.exit().ok_or(Fault::ScopeUnderflow)?;
    Ok(())
}

/// Runs `work` inside its own scope frame. The frame is popped on the way
/// out even if `work` panics.
pub fn scoped<R>(work: impl FnOnce() -> R) -> Result<R, Fault> {
    enter_scope()?;
    let unwind = scopeguard::guard((), |()| {
        let _ = exit_scope();
    });
    let out = work();
    scopeguard::ScopeGuard::into_inner(unwind);
    exit_scope()?;
    Ok(out)
}

/// Manager-side cleanup before a yield: anything the user closure left in
/// unexited frames becomes an untethered root, and the frames come off.
pub(crate) fn vacate(pipe: &Arc<PipeInner>) -> Result<(), Fault> {
    let open_frames = pipe.state.lock().scopes.level();
    if open_frames == 0 {
        return Ok(());
    }
    warn!(open_frames, "worker yielded with scopes still open");
    runtime().ledger.push(Fault::ScopeNotExited);
    while pipe.state.lock().scopes.level() > 0 {
        plumbing::vacate_members(pipe)?;
        pipe.state.lock().scopes.exit();
    }
    Ok(())
}

// === Tests === //
