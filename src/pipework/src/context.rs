use std::{cell::RefCell, sync::Arc};

use crate::{pipe::PipeInner, runtime::runtime};

// === Context slot === //

thread_local! {
    static CONTEXT: RefCell<ContextSlot> = RefCell::new(ContextSlot(None));
}

struct ContextSlot(Option<Arc<PipeInner>>);

impl Drop for ContextSlot {
    // Thread exit. An unmanaged thread that adopted a placeholder gives it
    // back; the pool retires it once its descendants are gone.
    fn drop(&mut self) {
        if let Some(pipe) = self.0.take() {
            let placeholder = pipe.state.lock().placeholder;
            if placeholder {
                runtime().pool.unpool(&pipe);
            }
        }
    }
}

pub(crate) fn current() -> Option<Arc<PipeInner>> {
    CONTEXT.with(|slot| slot.borrow().0.clone())
}

/// The caller's context, adopting a fresh placeholder when the thread is
/// unmanaged. Placeholders live in the root pool from birth.
pub(crate) fn adopt() -> Arc<PipeInner> {
    if let Some(pipe) = current() {
        return pipe;
    }
    let pipe = PipeInner::new(true);
    runtime().pool.placed(&pipe);
    CONTEXT.with(|slot| slot.borrow_mut().0 = Some(pipe.clone()));
    pipe
}

/// Binds a worker's pipe as its thread's context (manager startup).
pub(crate) fn bind(pipe: Arc<PipeInner>) {
    CONTEXT.with(|slot| slot.borrow_mut().0 = Some(pipe));
}

pub(crate) fn clear() {
    CONTEXT.with(|slot| slot.borrow_mut().0 = None);
}

/// Clears the binding iff it refers to `pipe`. Tolerates being called while
/// the thread's locals are already tearing down.
pub(crate) fn clear_if(pipe: &Arc<PipeInner>) {
    let _ = CONTEXT.try_with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.0.as_ref().map_or(false, |c| Arc::ptr_eq(c, pipe)) {
            slot.0 = None;
        }
    });
}
