use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::io::Interest;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::engine::Shutdown;
use crate::network::connection::{work_flag, Connection};
use crate::network::manager::Manager;

use super::MuxBackend;

/// Epoll-style driver: a watcher task per socket, so a readiness event
/// costs O(1) regardless of how many connections are registered. Write
/// interest is armed only while the connection has output pending,
/// re-armed through the connection's output notify.
pub struct ReadinessBackend {
    manager: RwLock<Weak<Manager>>,
    cancels: DashMap<u64, Arc<Notify>>,
}

impl ReadinessBackend {
    pub fn new() -> ReadinessBackend {
        ReadinessBackend {
            manager: RwLock::new(Weak::new()),
            cancels: DashMap::new(),
        }
    }
}

impl Default for ReadinessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MuxBackend for ReadinessBackend {
    fn start(&self, manager: Arc<Manager>) {
        *self.manager.write() = Arc::downgrade(&manager);

        let Some(listener) = manager.listener() else {
            return;
        };
        let _shutdown_complete = manager.shutdown_complete();
        let mut shutdown = Shutdown::new(manager.subscribe_shutdown());
        tokio::spawn(async move {
            let _shutdown_complete = _shutdown_complete;
            debug!("readiness accept loop started");
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let _ = manager.accept_stream(stream);
                        }
                        Err(e) => warn!("accept failed: {}", e),
                    },
                    _ = shutdown.recv() => break,
                }
            }
            debug!("readiness accept loop exiting");
        });
    }

    fn sock_add(&self, conn: &Arc<Connection>) {
        let Some(manager) = self.manager.read().upgrade() else {
            return;
        };
        let cancel = Arc::new(Notify::new());
        self.cancels.insert(conn.id(), cancel.clone());

        let weak = Arc::downgrade(&manager);
        let mut shutdown = Shutdown::new(manager.subscribe_shutdown());
        let conn = conn.clone();
        tokio::spawn(async move {
            loop {
                let interest = if conn.wants_output() {
                    Interest::READABLE.add(Interest::WRITABLE)
                } else {
                    Interest::READABLE
                };
                tokio::select! {
                    ready = conn.socket().ready(interest) => {
                        let Some(manager) = weak.upgrade() else { break };
                        if !manager.contains(conn.id()) {
                            break;
                        }
                        match ready {
                            Ok(ready) => {
                                if ready.is_readable()
                                    || ready.is_read_closed()
                                    || ready.is_error()
                                {
                                    conn.set_work_flag(work_flag::INPUT);
                                }
                                manager.enqueue(&conn);
                                // the socket is level triggered; hold
                                // off until the pass has consumed this
                                // readiness or we spin here
                                tokio::select! {
                                    _ = conn.idle_wakeup() => {}
                                    _ = cancel.notified() => break,
                                    _ = shutdown.recv() => break,
                                }
                            }
                            Err(e) => {
                                warn!("connection {} poll failed: {}", conn.id(), e);
                                conn.mark_except();
                                manager.enqueue(&conn);
                                break;
                            }
                        }
                    }
                    // output appeared or drained, re-arm with the new
                    // interest set
                    _ = conn.output_wakeup() => {}
                    _ = cancel.notified() => break,
                    _ = shutdown.recv() => break,
                }
            }
            debug!("watcher for connection {} exiting", conn.id());
        });
    }

    fn sock_remove(&self, conn_id: u64) {
        if let Some((_, cancel)) = self.cancels.remove(&conn_id) {
            cancel.notify_one();
        }
    }

    fn shutdown(&self) {
        for entry in self.cancels.iter() {
            entry.value().notify_one();
        }
        self.cancels.clear();
    }
}
