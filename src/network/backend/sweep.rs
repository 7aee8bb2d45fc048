use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::select_all;
use futures::FutureExt;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::engine::Shutdown;
use crate::network::connection::{work_flag, Connection};
use crate::network::manager::Manager;

use super::{MuxBackend, ACCEPT_BATCH};

enum SweepCmd {
    Add(Arc<Connection>),
    Remove(u64),
    Poke,
    Shutdown,
}

enum SweepEvent {
    Cmd(Result<SweepCmd, async_channel::RecvError>),
    Accepted(std::io::Result<TcpStream>),
    Ready(u64, std::io::Result<Ready>),
    ShutdownSignal,
}

/// Select-style driver: one task that rebuilds its wait set from every
/// registered connection each iteration and sleeps until the first
/// becomes ready. O(n) per wakeup, which is exactly the model's cost.
pub struct SweepBackend {
    cmd_tx: async_channel::Sender<SweepCmd>,
    cmd_rx: async_channel::Receiver<SweepCmd>,
    poke_pending: Arc<AtomicBool>,
}

impl SweepBackend {
    pub fn new() -> SweepBackend {
        let (cmd_tx, cmd_rx) = async_channel::unbounded();
        SweepBackend {
            cmd_tx,
            cmd_rx,
            poke_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    fn send_cmd(&self, cmd: SweepCmd) {
        // unbounded channel, fails only after shutdown
        let _ = self.cmd_tx.try_send(cmd);
    }
}

impl Default for SweepBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MuxBackend for SweepBackend {
    fn start(&self, manager: Arc<Manager>) {
        let cmd_rx = self.cmd_rx.clone();
        let poke_pending = self.poke_pending.clone();
        let _shutdown_complete = manager.shutdown_complete();
        let mut shutdown = Shutdown::new(manager.subscribe_shutdown());

        tokio::spawn(async move {
            let _shutdown_complete = _shutdown_complete;
            let listener = manager.listener();
            let mut conns: Vec<Arc<Connection>> = Vec::new();
            debug!("sweep driver started");

            loop {
                let mut waits: Vec<Pin<Box<dyn Future<Output = SweepEvent> + Send + '_>>> =
                    Vec::with_capacity(conns.len() + 2);
                waits.push(Box::pin(async {
                    SweepEvent::Cmd(cmd_rx.recv().await)
                }));
                waits.push(Box::pin(async {
                    shutdown.recv().await;
                    SweepEvent::ShutdownSignal
                }));
                if let Some(listener) = &listener {
                    waits.push(Box::pin(async {
                        SweepEvent::Accepted(listener.accept().await.map(|(s, _)| s))
                    }));
                }
                for conn in &conns {
                    // a working or already-flagged connection gets its
                    // next scan after the pass finishes (the worker
                    // pokes us), polling it now would only spin
                    if conn.is_working() {
                        continue;
                    }
                    let flags = conn.work_flags();
                    if flags & work_flag::INPUT != 0 {
                        continue;
                    }
                    let interest = if conn.wants_output() {
                        Interest::READABLE.add(Interest::WRITABLE)
                    } else {
                        Interest::READABLE
                    };
                    let id = conn.id();
                    waits.push(Box::pin(async move {
                        SweepEvent::Ready(id, conn.socket().ready(interest).await)
                    }));
                }

                let (event, _, rest) = select_all(waits).await;
                drop(rest);

                match event {
                    SweepEvent::Cmd(Ok(SweepCmd::Add(conn))) => conns.push(conn),
                    SweepEvent::Cmd(Ok(SweepCmd::Remove(id))) => {
                        conns.retain(|c| c.id() != id);
                    }
                    SweepEvent::Cmd(Ok(SweepCmd::Poke)) => {
                        poke_pending.store(false, Ordering::Release);
                    }
                    SweepEvent::Cmd(Ok(SweepCmd::Shutdown))
                    | SweepEvent::Cmd(Err(_))
                    | SweepEvent::ShutdownSignal => break,
                    SweepEvent::Accepted(Ok(stream)) => {
                        let _ = manager.accept_stream(stream);
                        // drain whatever else is already queued
                        if let Some(listener) = &listener {
                            for _ in 1..ACCEPT_BATCH {
                                match listener.accept().now_or_never() {
                                    Some(Ok((stream, _))) => {
                                        let _ = manager.accept_stream(stream);
                                    }
                                    _ => break,
                                }
                            }
                        }
                    }
                    SweepEvent::Accepted(Err(e)) => {
                        warn!("accept failed: {}", e);
                    }
                    SweepEvent::Ready(id, result) => {
                        if !manager.contains(id) {
                            conns.retain(|c| c.id() != id);
                            continue;
                        }
                        if let Some(conn) = conns.iter().find(|c| c.id() == id).cloned() {
                            match result {
                                Ok(ready) => {
                                    if ready.is_readable()
                                        || ready.is_read_closed()
                                        || ready.is_error()
                                    {
                                        conn.set_work_flag(work_flag::INPUT);
                                    }
                                    manager.enqueue(&conn);
                                }
                                Err(e) => {
                                    warn!("connection {} poll failed: {}", id, e);
                                    conn.mark_except();
                                    manager.enqueue(&conn);
                                }
                            }
                        }
                    }
                }
            }
            debug!("sweep driver exiting");
        });
    }

    fn sock_add(&self, conn: &Arc<Connection>) {
        self.send_cmd(SweepCmd::Add(conn.clone()));
    }

    fn sock_remove(&self, conn_id: u64) {
        self.send_cmd(SweepCmd::Remove(conn_id));
    }

    /// Collapse bursts of wakes into one queued poke; the driver
    /// clears the flag when it processes it.
    fn wake(&self) {
        if !self.poke_pending.swap(true, Ordering::AcqRel) {
            self.send_cmd(SweepCmd::Poke);
        }
    }

    fn shutdown(&self) {
        self.send_cmd(SweepCmd::Shutdown);
    }
}
