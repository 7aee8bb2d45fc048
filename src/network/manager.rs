// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, trace, warn};

use crate::engine::{
    EngineConfig, EngineError, EngineResult, Executor, SocketType, TaskHandler, Timer, TimerQueue,
};
use crate::packet::{FrameCodec, Packet, PacketCodec};
use crate::rpc::RpcRegistry;

use super::backend::{make_backend, MuxBackend};
use super::connection::{work_flag, Connection, PacketDispatcher};
use super::socket::Socket;

/// Fired on connect and disconnect.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// One unit handed to the executor: either a connection work pass or an
/// arbitrary closure posted onto an engine worker.
pub enum WorkItem {
    Work(Arc<Connection>),
    Post(Box<dyn FnOnce() + Send>),
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkItem::Work(conn) => f.debug_tuple("Work").field(&conn.id()).finish(),
            WorkItem::Post(_) => f.write_str("Post"),
        }
    }
}

/// Point-in-time traffic snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ManagerStats {
    pub connections: usize,
    pub recv_bytes: u64,
    pub sent_bytes: u64,
}

/// Dense connection-id allocator: released slots are reused before the
/// sequence grows.
#[derive(Debug, Default)]
struct IdPool {
    next: u64,
    free: Vec<u64>,
}

impl IdPool {
    fn allocate(&mut self) -> u64 {
        if let Some(id) = self.free.pop() {
            return id;
        }
        self.next += 1;
        self.next
    }

    fn release(&mut self, id: u64) {
        self.free.push(id);
    }
}

/// Owns every connection of one endpoint: the optional listener, the
/// connection and name tables, the executor that runs work passes, the
/// rpc registry, and the mux backend picked by `MuxMode`.
///
/// The manager holds the authoritative strong reference to each
/// `Connection`; backends and in-flight work items hold temporary ones,
/// so dropping the table entry is what ends a connection's life.
pub struct Manager {
    config: EngineConfig,
    codec: RwLock<Arc<dyn PacketCodec>>,
    registry: Arc<RpcRegistry>,

    connections: DashMap<u64, Arc<Connection>>,
    names: DashMap<String, u64>,
    ids: Mutex<IdPool>,

    recv_bytes: AtomicU64,
    sent_bytes: AtomicU64,

    executor: RwLock<Option<Arc<Executor<WorkItem>>>>,
    backend: Box<dyn MuxBackend>,
    listener: RwLock<Option<Arc<TcpListener>>>,

    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: Mutex<Option<mpsc::Sender<()>>>,
    shutdown_complete_rx: AsyncMutex<mpsc::Receiver<()>>,

    on_connect: RwLock<Option<ConnectionCallback>>,
    on_disconnect: RwLock<Option<ConnectionCallback>>,
    dispatcher: RwLock<Option<PacketDispatcher>>,

    stats_timer: Mutex<Option<Timer>>,
    started: AtomicBool,
}

impl Manager {
    pub fn new(config: EngineConfig) -> Arc<Manager> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        let backend = make_backend(config.mode);
        let connections = DashMap::with_capacity(config.default_count);
        Arc::new(Manager {
            config,
            codec: RwLock::new(Arc::new(FrameCodec)),
            registry: Arc::new(RpcRegistry::new()),
            connections,
            names: DashMap::new(),
            ids: Mutex::new(IdPool::default()),
            recv_bytes: AtomicU64::new(0),
            sent_bytes: AtomicU64::new(0),
            executor: RwLock::new(None),
            backend,
            listener: RwLock::new(None),
            notify_shutdown,
            shutdown_complete_tx: Mutex::new(Some(shutdown_complete_tx)),
            shutdown_complete_rx: AsyncMutex::new(shutdown_complete_rx),
            on_connect: RwLock::new(None),
            on_disconnect: RwLock::new(None),
            dispatcher: RwLock::new(None),
            stats_timer: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bound listener address, useful when configured with port 0.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.read().as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn registry(&self) -> &Arc<RpcRegistry> {
        &self.registry
    }

    /// Default codec for new connections; existing connections keep the
    /// one they were created with.
    pub fn set_codec(&self, codec: Arc<dyn PacketCodec>) {
        *self.codec.write() = codec;
    }

    pub fn set_on_connect(&self, callback: ConnectionCallback) {
        *self.on_connect.write() = Some(callback);
    }

    pub fn set_on_disconnect(&self, callback: ConnectionCallback) {
        *self.on_disconnect.write() = Some(callback);
    }

    /// Manager-wide handler for packets no connection dispatcher claims.
    pub fn set_dispatcher(&self, dispatcher: PacketDispatcher) {
        *self.dispatcher.write() = Some(dispatcher);
    }

    /// Bind the listener (when configured with an address), spin up the
    /// executor and the backend driver.
    pub async fn start(self: &Arc<Self>) -> EngineResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(EngineError::IllegalState(format!(
                "manager {} already started",
                self.config.name
            )));
        }

        let shutdown_complete_tx = self
            .shutdown_complete_tx
            .lock()
            .clone()
            .ok_or_else(|| EngineError::IllegalState("manager already stopped".into()))?;
        let executor = Arc::new(Executor::new(
            self.notify_shutdown.clone(),
            shutdown_complete_tx,
            WorkHandler {
                manager: Arc::downgrade(self),
            },
            &self.config.executor,
        ));
        *self.executor.write() = Some(executor);

        if !self.config.address.is_empty() {
            if self.config.socket_type != SocketType::Tcp {
                return Err(EngineError::InvalidValue(
                    "listening is tcp only, udp managers are client pools".into(),
                ));
            }
            let listener = TcpListener::bind(&self.config.address).await?;
            info!(
                "manager {} listening on {}",
                self.config.name, self.config.address
            );
            *self.listener.write() = Some(Arc::new(listener));
        }

        let weak = Arc::downgrade(self);
        *self.stats_timer.lock() = Some(TimerQueue::make_timer(
            Duration::from_secs(60),
            Some(Duration::from_secs(60)),
            move || {
                if let Some(manager) = weak.upgrade() {
                    let stats = manager.stats();
                    trace!(
                        "manager {}: {} connections, {} bytes in, {} bytes out",
                        manager.config.name,
                        stats.connections,
                        stats.recv_bytes,
                        stats.sent_bytes
                    );
                }
            },
        ));

        self.backend.start(self.clone());
        Ok(())
    }

    /// Graceful shutdown: stop the backend, fail and drop every
    /// connection, then wait for the executor workers to drain.
    pub async fn stop(self: &Arc<Self>) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("manager {} shutting down", self.config.name);

        self.backend.shutdown();
        let _ = self.notify_shutdown.send(());
        *self.stats_timer.lock() = None;
        *self.listener.write() = None;

        let ids: Vec<u64> = self.connections.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.remove(id);
        }

        *self.executor.write() = None;
        *self.shutdown_complete_tx.lock() = None;
        let _ = self.shutdown_complete_rx.lock().await.recv().await;
        info!("manager {} stopped", self.config.name);
    }

    /// Register an accepted stream as a new connection.
    pub(crate) fn accept_stream(self: &Arc<Self>, stream: TcpStream) -> EngineResult<Arc<Connection>> {
        let _ = stream.set_nodelay(true);
        self.register(Socket::from_tcp(stream))
    }

    /// Outbound connection, registered through the same path accepted
    /// ones take.
    pub async fn connect(self: &Arc<Self>, addr: &str) -> EngineResult<Arc<Connection>> {
        let socket = Socket::connect(self.config.socket_type, addr).await?;
        self.register(socket)
    }

    fn register(self: &Arc<Self>, socket: Socket) -> EngineResult<Arc<Connection>> {
        if self.connections.len() >= self.config.max_count {
            warn!(
                "manager {} refused a connection, limit {} reached",
                self.config.name, self.config.max_count
            );
            return Err(EngineError::IllegalState(format!(
                "connection limit {} reached",
                self.config.max_count
            )));
        }

        let id = self.ids.lock().allocate();
        let call_timeout = (self.config.call_timeout_ms > 0)
            .then(|| Duration::from_millis(self.config.call_timeout_ms));
        let conn = Connection::new(
            id,
            socket,
            Arc::downgrade(self),
            self.codec.read().clone(),
            self.config.packet_limit,
            call_timeout,
        );

        self.connections.insert(id, conn.clone());
        self.backend.sock_add(&conn);
        if let Ok(peer) = conn.socket().peer_addr() {
            debug!("manager {} connection {} from {}", self.config.name, id, peer);
        }
        if let Some(callback) = self.on_connect.read().clone() {
            callback(&conn);
        }
        Ok(conn)
    }

    /// Tear a connection down from any task. The socket closes when the
    /// last strong reference drops; the `working` flag keeps an
    /// in-flight work pass from racing the teardown.
    pub fn remove(&self, id: u64) -> bool {
        let Some((_, conn)) = self.connections.remove(&id) else {
            return false;
        };
        self.backend.sock_remove(id);
        conn.fail_pending("connection removed");
        if let Some(name) = conn.name() {
            // only drop the index entry if this connection still owns it
            self.names.remove_if(&name, |_, holder| *holder == id);
            conn.set_name_slot(None);
        }
        self.ids.lock().release(id);
        debug!("manager {} removed connection {}", self.config.name, id);
        if let Some(callback) = self.on_disconnect.read().clone() {
            callback(&conn);
        }
        true
    }

    pub fn get(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|e| e.value().clone())
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.connections.contains_key(&id)
    }

    pub(crate) fn for_each_connection(&self, mut f: impl FnMut(&Arc<Connection>)) {
        for entry in self.connections.iter() {
            f(entry.value());
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Schedule a work pass for `conn` unless one is already queued or
    /// running. Routing by `id % channels` keeps passes for the same
    /// connection on one worker.
    pub(crate) fn enqueue(&self, conn: &Arc<Connection>) {
        if !conn.try_begin_work() {
            return;
        }
        let Some(executor) = self.executor.read().clone() else {
            conn.abandon_work();
            return;
        };
        let channel = (conn.id() % executor.channel_count() as u64) as i8;
        match executor.try_dispatch(WorkItem::Work(conn.clone()), channel) {
            Ok(None) => {}
            Ok(Some(item)) => {
                // channel full, fall back to the waiting send
                let executor = executor.clone();
                tokio::spawn(async move {
                    if let Err(e) = executor.dispatch(item, channel).await {
                        warn!("work item dropped on a closed channel: {}", e);
                    }
                });
            }
            Err(e) => {
                conn.abandon_work();
                warn!("enqueue failed: {}", e);
            }
        }
    }

    pub(crate) fn enqueue_id(&self, id: u64) {
        if let Some(conn) = self.get(id) {
            self.enqueue(&conn);
        }
    }

    /// Run a closure on an engine worker.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(executor) = self.executor.read().clone() else {
            warn!("post on a manager that is not running");
            return;
        };
        match executor.try_dispatch(WorkItem::Post(Box::new(f)), 0) {
            Ok(None) => {}
            Ok(Some(item)) => {
                let executor = executor.clone();
                tokio::spawn(async move {
                    if let Err(e) = executor.dispatch(item, 0).await {
                        warn!("posted closure dropped on a closed channel: {}", e);
                    }
                });
            }
            Err(e) => warn!("post failed: {}", e),
        }
    }

    /// Like `post`, but the caller can await the closure's result.
    pub fn submit<F, R>(&self, f: F) -> oneshot::Receiver<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.post(move || {
            let _ = tx.send(f());
        });
        rx
    }

    // the name index

    pub fn set_name(&self, id: u64, name: &str) -> EngineResult<()> {
        let conn = self
            .get(id)
            .ok_or_else(|| EngineError::InvalidValue(format!("no connection {}", id)))?;
        // the entry claim is atomic, two racing claimants can never
        // both see the name as free
        match self.names.entry(name.to_string()) {
            Entry::Occupied(holder) => {
                if *holder.get() != id {
                    return Err(EngineError::InvalidValue(format!(
                        "name {} already taken by connection {}",
                        name,
                        holder.get()
                    )));
                }
                return Ok(());
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }
        if let Some(old) = conn.name() {
            if old != name {
                self.names.remove_if(&old, |_, holder| *holder == id);
            }
        }
        conn.set_name_slot(Some(name.to_string()));
        Ok(())
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Connection>> {
        let id = *self.names.get(name)?.value();
        self.get(id)
    }

    // traffic accounting

    pub(crate) fn add_recv_bytes(&self, n: u64) {
        self.recv_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_sent_bytes(&self, n: u64) {
        self.sent_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            connections: self.connections.len(),
            recv_bytes: self.recv_bytes.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
        }
    }

    // backend plumbing

    pub(crate) fn backend_wake(&self) {
        self.backend.wake();
    }

    pub(crate) fn listener(&self) -> Option<Arc<TcpListener>> {
        self.listener.read().clone()
    }

    pub(crate) fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.notify_shutdown.subscribe()
    }

    pub(crate) fn shutdown_complete(&self) -> Option<mpsc::Sender<()>> {
        self.shutdown_complete_tx.lock().clone()
    }

    pub(crate) fn dispatch_packet(&self, conn: &Arc<Connection>, packet: Packet) -> bool {
        if let Some(dispatcher) = self.dispatcher.read().clone() {
            return dispatcher(conn, packet);
        }
        trace!(
            "manager {} dropped unhandled packet id {} from connection {}",
            self.config.name,
            packet.id(),
            conn.id()
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_pool_reuses_released_slots() {
        let mut pool = IdPool::default();
        assert_eq!(pool.allocate(), 1);
        assert_eq!(pool.allocate(), 2);
        assert_eq!(pool.allocate(), 3);
        pool.release(2);
        assert_eq!(pool.allocate(), 2);
        assert_eq!(pool.allocate(), 4);
    }
}

/// Executor handler that runs work passes and posted closures.
#[derive(Clone)]
struct WorkHandler {
    manager: Weak<Manager>,
}

impl TaskHandler<WorkItem> for WorkHandler {
    fn handle(&self, task: WorkItem) -> impl Future<Output = ()> + Send {
        let manager = self.manager.clone();
        async move {
            match task {
                WorkItem::Post(f) => f(),
                WorkItem::Work(conn) => {
                    let alive = conn.work();
                    conn.finish_work();
                    let Some(manager) = manager.upgrade() else {
                        return;
                    };
                    if !alive {
                        manager.remove(conn.id());
                        return;
                    }
                    // trailing re-check: flags set after the pass read
                    // them would otherwise be lost. OUTPUT alone waits
                    // for the backend's writable wake instead of
                    // spinning here.
                    let flags = conn.work_flags();
                    if flags & (work_flag::INPUT | work_flag::COMMAND | work_flag::EXCEPT) != 0 {
                        manager.enqueue(&conn);
                    }
                    // the backend re-examines its poll/arm state after
                    // every pass
                    manager.backend_wake();
                }
            }
        }
    }
}
