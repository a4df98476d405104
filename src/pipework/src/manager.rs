use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread,
};

use tracing::trace;

use crate::{
    context,
    fault::Fault,
    pipe::{heritably_defunct, Payload, Pipe, PipeInner},
    plumbing, protocol, scope,
    runtime::runtime,
    sync,
};

type Job = Box<dyn FnOnce() -> Result<Payload, Fault> + Send>;

#[derive(Clone, Copy)]
enum Form {
    /// The caller keeps a handle and will read the result.
    Open,
    /// Fire and forget: no handle, no reader, reclaimed on yield.
    Send,
}

// === Entries === //

/// Spawns a worker tethered to the caller's current context and returns its
/// pipe. The call does not return before the worker's thread is running.
pub fn open<F>(worker: F) -> Result<Pipe, Fault>
where
    F: FnOnce() -> Result<Payload, Fault> + Send + 'static,
{
    launch(Box::new(worker), Form::Open).map(Pipe::from_inner)
}

/// Spawns a fire-and-forget worker. Its pipe stays hidden; `sync` is the way
/// to wait for it.
pub fn send<F>(mutator: F) -> Result<(), Fault>
where
    F: FnOnce() + Send + 'static,
{
    let job: Job = Box::new(move || {
        mutator();
        Ok(Box::new(()) as Payload)
    });
    launch(job, Form::Send).map(drop)
}

fn launch(job: Job, form: Form) -> Result<Arc<PipeInner>, Fault> {
    let ctx = context::adopt();
    if heritably_defunct(&ctx) {
        return Err(Fault::Killed);
    }
    let pipe = PipeInner::new(false);
    match form {
        Form::Open => plumbing::tether_to(&pipe, &ctx)?,
        Form::Send => {
            pipe.state.lock().zombie = true;
            runtime().pool.placed(&pipe);
        }
    }

    let rt = runtime();
    rt.board.state.lock().runners += 1;
    let worker_pipe = pipe.clone();
    let spawned = thread::Builder::new()
        .name("pipework-worker".into())
        .spawn(move || manage(worker_pipe, job));
    match spawned {
        Ok(handle) => {
            rt.board
                .state
                .lock()
                .running
                .insert(handle.thread().id(), handle);
            sync::started(rt);
            Ok(pipe)
        }
        Err(err) => {
            rt.board.state.lock().runners -= 1;
            discard_unlaunched(&pipe, &ctx, form);
            Err(Fault::Exhausted {
                errno: err.raw_os_error().unwrap_or(libc::EAGAIN),
            })
        }
    }
}

/// Thread creation failed after the pipe was wired up; unwind that.
fn discard_unlaunched(pipe: &Arc<PipeInner>, ctx: &Arc<PipeInner>, form: Form) {
    {
        let mut state = pipe.state.lock();
        state.killed = true;
        state.yielded = true;
    }
    match form {
        Form::Open => {
            let _ = plumbing::untether_member(pipe, ctx);
        }
        Form::Send => runtime().pool.unpool(pipe),
    }
}

// === Manager === //

/// Every worker thread's start routine: brackets the user closure with
/// context setup, registration, yield, and the relay race.
fn manage(pipe: Arc<PipeInner>, job: Job) {
    context::bind(pipe.clone());
    let rt = runtime();
    sync::registered(rt);
    trace!("worker running");

    let outcome = match catch_unwind(AssertUnwindSafe(job)) {
        Ok(outcome) => outcome,
        Err(_) => Err(Fault::Panicked),
    };

    if let Err(fault) = scope::vacate(&pipe) {
        rt.ledger.push(fault);
    }
    if let Err(fault) = protocol::yield_outcome(&pipe, outcome) {
        rt.ledger.push(fault);
    }
    drop(pipe);
    context::clear();
    sync::relay_race(rt);
}
