//! A runtime that organizes worker threads into a dynamic hierarchy of
//! single-use result pipes: spawn with [`open`] or [`send`], collect with
//! [`read`] and [`select`], scope attention with [`enter_scope`] /
//! [`exit_scope`], and cancel cooperatively with [`kill`] and [`truncate`].

mod context;
mod fault;
mod manager;
mod pipe;
mod plumbing;
mod pool;
mod protocol;
mod roster;
mod runtime;
mod scope;
mod sync;

pub use fault::Fault;
pub use manager::{open, send};
pub use pipe::{live_pipes, payload, Payload, Pipe};
pub use plumbing::{
    kill, kill_all, killed, tether, truncate, truncate_all, truncated, untether,
};
pub use protocol::{blocked, busy, read, select};
pub use scope::{enter_scope, exit_scope, scoped};
pub use sync::sync;
