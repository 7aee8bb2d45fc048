use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::io::Interest;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::engine::Shutdown;
use crate::network::connection::Connection;
use crate::network::manager::Manager;
use crate::network::socket::IoOutcome;

use super::MuxBackend;

/// Tasks draining the submission queue. Each drives all of its
/// in-flight operations concurrently, so an operation parked on socket
/// readiness never blocks the queue.
const WORKER_COUNT: usize = 4;
/// Bytes moved per recv/send operation.
const OP_CHUNK: usize = 16 * 1024;

/// One submitted operation. Lives in the token slab keyed by an opaque
/// `u64`; the submission queue carries only the key, never a pointer.
enum CompletionToken {
    Accept(Arc<TcpListener>),
    Recv(Arc<Connection>),
    Send(Arc<Connection>),
}

/// Result of a finished operation, drained by the driver.
enum CqEntry {
    Accepted(std::io::Result<TcpStream>),
    /// Bytes received; empty means a spurious wakeup, re-arm only.
    Received(Arc<Connection>, Vec<u8>),
    Sent(Arc<Connection>, usize),
    Closed(Arc<Connection>),
}

/// Whether a recv / send operation is currently in flight for a
/// connection. At most one of each kind ever is.
#[derive(Default)]
struct ArmState {
    send: AtomicBool,
}

/// io_uring-style driver: callers submit typed operations, worker
/// tasks execute the socket I/O and post completions, the driver
/// drains the completion queue, moves the bytes through the
/// connection's streams and schedules work passes. Connections under
/// this backend never touch their socket from `work()`.
pub struct CompletionBackend {
    sq_tx: async_channel::Sender<u64>,
    sq_rx: async_channel::Receiver<u64>,
    cq_tx: async_channel::Sender<CqEntry>,
    cq_rx: async_channel::Receiver<CqEntry>,
    tokens: Arc<DashMap<u64, CompletionToken>>,
    token_seq: Arc<AtomicU64>,
    arm: Arc<DashMap<u64, ArmState>>,
    manager: RwLock<Weak<Manager>>,
}

impl CompletionBackend {
    pub fn new() -> CompletionBackend {
        let (sq_tx, sq_rx) = async_channel::unbounded();
        let (cq_tx, cq_rx) = async_channel::unbounded();
        CompletionBackend {
            sq_tx,
            sq_rx,
            cq_tx,
            cq_rx,
            tokens: Arc::new(DashMap::new()),
            token_seq: Arc::new(AtomicU64::new(1)),
            arm: Arc::new(DashMap::new()),
            manager: RwLock::new(Weak::new()),
        }
    }

    fn submit(&self, token: CompletionToken) {
        let key = self.token_seq.fetch_add(1, Ordering::Relaxed);
        self.tokens.insert(key, token);
        let _ = self.sq_tx.try_send(key);
    }

    fn submit_send(&self, conn: &Arc<Connection>) {
        let Some(state) = self.arm.get(&conn.id()) else {
            return;
        };
        if state
            .send
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.submit(CompletionToken::Send(conn.clone()));
        }
    }

    async fn perform(token: CompletionToken) -> CqEntry {
        match token {
            CompletionToken::Accept(listener) => {
                CqEntry::Accepted(listener.accept().await.map(|(s, _)| s))
            }
            CompletionToken::Recv(conn) => {
                if conn.socket().ready(Interest::READABLE).await.is_err() {
                    return CqEntry::Closed(conn);
                }
                let mut buf = vec![0u8; OP_CHUNK];
                match conn.socket().try_recv(&mut buf) {
                    Ok(IoOutcome::Done(n)) => {
                        buf.truncate(n);
                        CqEntry::Received(conn, buf)
                    }
                    Ok(IoOutcome::WouldBlock) => CqEntry::Received(conn, Vec::new()),
                    Ok(IoOutcome::Closed) | Err(_) => CqEntry::Closed(conn),
                }
            }
            CompletionToken::Send(conn) => {
                let mut buf = vec![0u8; OP_CHUNK];
                let pending = conn.peek_outbound(&mut buf);
                if pending == 0 {
                    return CqEntry::Sent(conn, 0);
                }
                if conn.socket().ready(Interest::WRITABLE).await.is_err() {
                    return CqEntry::Closed(conn);
                }
                match conn.socket().try_send(&buf[..pending]) {
                    Ok(IoOutcome::Done(n)) => {
                        // sole consumer of the outbound stream, the
                        // peeked bytes are still at the front
                        conn.consume_outbound(n);
                        CqEntry::Sent(conn, n)
                    }
                    Ok(IoOutcome::WouldBlock) => CqEntry::Sent(conn, 0),
                    Ok(IoOutcome::Closed) | Err(_) => CqEntry::Closed(conn),
                }
            }
        }
    }
}

impl Default for CompletionBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MuxBackend for CompletionBackend {
    fn start(&self, manager: Arc<Manager>) {
        *self.manager.write() = Arc::downgrade(&manager);

        for worker_id in 0..WORKER_COUNT {
            let sq_rx = self.sq_rx.clone();
            let cq_tx = self.cq_tx.clone();
            let tokens = self.tokens.clone();
            let mut shutdown = Shutdown::new(manager.subscribe_shutdown());
            let _shutdown_complete = manager.shutdown_complete();
            tokio::spawn(async move {
                let _shutdown_complete = _shutdown_complete;
                debug!("completion worker {} started", worker_id);
                let mut ops = FuturesUnordered::new();
                loop {
                    tokio::select! {
                        key = sq_rx.recv() => {
                            let Ok(key) = key else { break };
                            if let Some((_, token)) = tokens.remove(&key) {
                                ops.push(Self::perform(token));
                            }
                        }
                        Some(entry) = ops.next(), if !ops.is_empty() => {
                            if cq_tx.send(entry).await.is_err() {
                                break;
                            }
                        }
                        _ = shutdown.recv() => break,
                    }
                }
                debug!("completion worker {} exiting", worker_id);
            });
        }

        if let Some(listener) = manager.listener() {
            self.submit(CompletionToken::Accept(listener));
        }

        let cq_rx = self.cq_rx.clone();
        let sq_tx = self.sq_tx.clone();
        let tokens = self.tokens.clone();
        let token_seq = self.token_seq.clone();
        let arm = self.arm.clone();
        let mut shutdown = Shutdown::new(manager.subscribe_shutdown());
        let _shutdown_complete = manager.shutdown_complete();

        // local resubmit closure state for the driver
        let resubmit = move |tokens: &DashMap<u64, CompletionToken>,
                             sq_tx: &async_channel::Sender<u64>,
                             token_seq: &AtomicU64,
                             token: CompletionToken| {
            let key = token_seq.fetch_add(1, Ordering::Relaxed);
            tokens.insert(key, token);
            let _ = sq_tx.try_send(key);
        };

        tokio::spawn(async move {
            let _shutdown_complete = _shutdown_complete;
            debug!("completion driver started");
            loop {
                let entry = tokio::select! {
                    entry = cq_rx.recv() => {
                        let Ok(entry) = entry else { break };
                        entry
                    }
                    _ = shutdown.recv() => break,
                };
                match entry {
                    CqEntry::Accepted(Ok(stream)) => {
                        let _ = manager.accept_stream(stream);
                        if let Some(listener) = manager.listener() {
                            resubmit(
                                &tokens,
                                &sq_tx,
                                &token_seq,
                                CompletionToken::Accept(listener),
                            );
                        }
                    }
                    CqEntry::Accepted(Err(e)) => {
                        warn!("accept failed: {}", e);
                        if let Some(listener) = manager.listener() {
                            resubmit(
                                &tokens,
                                &sq_tx,
                                &token_seq,
                                CompletionToken::Accept(listener),
                            );
                        }
                    }
                    CqEntry::Received(conn, bytes) => {
                        if !manager.contains(conn.id()) {
                            continue;
                        }
                        if !bytes.is_empty() {
                            if !conn.push_inbound(&bytes) {
                                conn.mark_except();
                                manager.enqueue(&conn);
                                continue;
                            }
                            manager.add_recv_bytes(bytes.len() as u64);
                            manager.enqueue(&conn);
                        }
                        resubmit(&tokens, &sq_tx, &token_seq, CompletionToken::Recv(conn));
                    }
                    CqEntry::Sent(conn, n) => {
                        if !manager.contains(conn.id()) {
                            continue;
                        }
                        if n > 0 {
                            manager.add_sent_bytes(n as u64);
                        }
                        if conn.outbound_is_empty() {
                            conn.clear_output_flag();
                            if let Some(state) = arm.get(&conn.id()) {
                                state.send.store(false, Ordering::Release);
                            }
                            if conn.is_closing() {
                                conn.mark_except();
                                manager.enqueue(&conn);
                                continue;
                            }
                            // a send may have slipped in between the
                            // drain check and the disarm
                            if !conn.outbound_is_empty() {
                                if let Some(state) = arm.get(&conn.id()) {
                                    if state
                                        .send
                                        .compare_exchange(
                                            false,
                                            true,
                                            Ordering::AcqRel,
                                            Ordering::Acquire,
                                        )
                                        .is_ok()
                                    {
                                        resubmit(
                                            &tokens,
                                            &sq_tx,
                                            &token_seq,
                                            CompletionToken::Send(conn),
                                        );
                                    }
                                }
                            }
                        } else {
                            resubmit(&tokens, &sq_tx, &token_seq, CompletionToken::Send(conn));
                        }
                    }
                    CqEntry::Closed(conn) => {
                        if manager.contains(conn.id()) {
                            conn.mark_except();
                            manager.enqueue(&conn);
                        }
                    }
                }
            }
            debug!("completion driver exiting");
        });
    }

    fn sock_add(&self, conn: &Arc<Connection>) {
        conn.set_external_io(true);
        self.arm.insert(conn.id(), ArmState::default());
        self.submit(CompletionToken::Recv(conn.clone()));
    }

    fn sock_remove(&self, conn_id: u64) {
        self.arm.remove(&conn_id);
    }

    /// Arm a send operation for every connection with output pending.
    fn wake(&self) {
        let Some(manager) = self.manager.read().upgrade() else {
            return;
        };
        manager.for_each_connection(|conn| {
            if conn.wants_output() {
                self.submit_send(conn);
            }
        });
    }

    fn shutdown(&self) {
        self.sq_tx.close();
        self.cq_tx.close();
        self.arm.clear();
        self.tokens.clear();
    }
}
