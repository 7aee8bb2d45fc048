//! Pluggable readiness drivers.
//!
//! Each backend models one OS multiplexing style on top of the tokio
//! reactor: `SweepBackend` scans its whole socket set per iteration
//! (select), `ReadinessBackend` runs one watcher per socket (epoll,
//! and the iocp/kqueue aliases), `CompletionBackend` performs the
//! socket I/O itself through a submission/completion queue pair
//! (io_uring). All of them feed the same manager executor and all
//! guarantee at most one concurrent work pass per connection.

pub use completion::CompletionBackend;
pub use readiness::ReadinessBackend;
pub use sweep::SweepBackend;

use std::sync::Arc;

use crate::engine::MuxMode;

use super::connection::Connection;
use super::manager::Manager;

mod completion;
mod readiness;
mod sweep;

/// Connections accepted per driver iteration before yielding.
pub(crate) const ACCEPT_BATCH: usize = 16;

/// Readiness driver behind a manager. `start` spawns the driver tasks,
/// `wake` asks the backend to re-examine its poll or arm state, and a
/// `sock_remove` for an id with events still in flight must be safe.
pub trait MuxBackend: Send + Sync {
    fn start(&self, manager: Arc<Manager>);
    fn sock_add(&self, conn: &Arc<Connection>);
    fn sock_remove(&self, conn_id: u64);
    fn wake(&self) {}
    fn shutdown(&self);
}

pub fn make_backend(mode: MuxMode) -> Box<dyn MuxBackend> {
    match mode {
        MuxMode::Select => Box::new(SweepBackend::new()),
        MuxMode::IoUring => Box::new(CompletionBackend::new()),
        MuxMode::Epoll | MuxMode::Iocp | MuxMode::Kqueue => Box::new(ReadinessBackend::new()),
    }
}
