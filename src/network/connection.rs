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

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::engine::{EngineError, EngineResult};
use crate::packet::{
    Packet, PacketCodec, PacketLimits, HANDSHAKE_ID, RPC_NOTIFY_ID, RPC_REQUEST_ID,
    RPC_RESPONSE_ID,
};
use crate::rpc::{rpc_code, CallResult, CallTable, RpcPacker, RpcUnpacker};
use crate::stream::ByteStream;

use super::manager::Manager;
use super::socket::{IoOutcome, Socket};

/// Pending-work bits, executed in the fixed order
/// Except, Input, Output, Command.
pub mod work_flag {
    pub const INPUT: u32 = 1;
    pub const OUTPUT: u32 = 1 << 1;
    pub const COMMAND: u32 = 1 << 2;
    pub const EXCEPT: u32 = 1 << 3;
}

/// Packets decoded per work pass before yielding the worker.
const COMMAND_BATCH: usize = 16;
/// Consecutive passes that buffered bytes without completing a frame
/// before the peer is treated as hostile.
const MAX_DECODE_STALLS: u32 = 100;
/// Stack buffer for one `try_recv` / `try_send` round.
const IO_CHUNK: usize = 16 * 1024;

/// Handles packets that are not rpc traffic. Return `false` to kill the
/// connection.
pub type PacketDispatcher = Arc<dyn Fn(&Arc<Connection>, Packet) -> bool + Send + Sync>;

/// One live peer: a socket, its buffered byte streams, and the
/// work-flag state machine the manager's executor drives.
///
/// All mutation happens either inside `work()` (serialized by the
/// `working` flag) or under the per-stream mutexes, so a connection is
/// safe to touch from any task holding an `Arc` to it.
pub struct Connection {
    id: u64,
    socket: Socket,
    manager: Weak<Manager>,

    inbound: Mutex<ByteStream>,
    outbound: Mutex<ByteStream>,
    codec: Mutex<Arc<dyn PacketCodec>>,
    limits: PacketLimits,
    dispatcher: Mutex<Option<PacketDispatcher>>,

    work_flags: AtomicU32,
    working: AtomicBool,
    error_times: AtomicU32,
    closing: AtomicBool,
    keep_alive: AtomicBool,
    /// Set by completion-style backends that perform the raw socket
    /// I/O themselves; `work()` then only runs Command and Except.
    external_io: AtomicBool,

    call_index: AtomicU32,
    calls: CallTable,
    call_timeout: Mutex<Option<Duration>>,

    /// Pokes the readiness watcher when write interest appears.
    output_notify: Notify,
    /// Fired after every work pass so pollers can re-arm without
    /// spinning on a level-triggered socket.
    idle_notify: Notify,

    name: Mutex<Option<String>>,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        socket: Socket,
        manager: Weak<Manager>,
        codec: Arc<dyn PacketCodec>,
        limits: PacketLimits,
        call_timeout: Option<Duration>,
    ) -> Arc<Connection> {
        Arc::new(Connection {
            id,
            socket,
            manager,
            inbound: Mutex::new(ByteStream::new()),
            outbound: Mutex::new(ByteStream::new()),
            codec: Mutex::new(codec),
            limits,
            dispatcher: Mutex::new(None),
            work_flags: AtomicU32::new(0),
            working: AtomicBool::new(false),
            error_times: AtomicU32::new(0),
            closing: AtomicBool::new(false),
            keep_alive: AtomicBool::new(true),
            external_io: AtomicBool::new(false),
            call_index: AtomicU32::new(1),
            calls: CallTable::new(),
            call_timeout: Mutex::new(call_timeout),
            output_notify: Notify::new(),
            idle_notify: Notify::new(),
            name: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    pub(crate) fn set_name_slot(&self, name: Option<String>) {
        *self.name.lock() = name;
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive.load(Ordering::Relaxed)
    }

    pub fn set_keep_alive(&self, keep_alive: bool) {
        self.keep_alive.store(keep_alive, Ordering::Relaxed);
    }

    /// Replace the wire codec for this connection only, used for
    /// handshake phases that speak a different framing.
    pub fn set_codec(&self, codec: Arc<dyn PacketCodec>) {
        *self.codec.lock() = codec;
    }

    pub fn set_dispatcher(&self, dispatcher: PacketDispatcher) {
        *self.dispatcher.lock() = Some(dispatcher);
    }

    pub fn set_call_timeout(&self, timeout: Option<Duration>) {
        *self.call_timeout.lock() = timeout;
    }

    /// Reset every piece of per-session state. Idempotent; called
    /// before a pooled connection slot is reused.
    pub fn init(&self) {
        self.calls.drain("connection recycled");
        self.inbound.lock().clear();
        self.outbound.lock().clear();
        self.work_flags.store(0, Ordering::Release);
        self.working.store(false, Ordering::Release);
        self.error_times.store(0, Ordering::Relaxed);
        self.closing.store(false, Ordering::Relaxed);
        self.call_index.store(1, Ordering::Relaxed);
        *self.name.lock() = None;
    }

    // flag plumbing, shared with the manager and the backends

    pub(crate) fn work_flags(&self) -> u32 {
        self.work_flags.load(Ordering::Acquire)
    }

    pub(crate) fn set_work_flag(&self, flag: u32) {
        self.work_flags.fetch_or(flag, Ordering::AcqRel);
    }

    fn clear_work_flag(&self, flag: u32) {
        self.work_flags.fetch_and(!flag, Ordering::AcqRel);
    }

    pub(crate) fn is_working(&self) -> bool {
        self.working.load(Ordering::Acquire)
    }

    /// Claim the exclusive right to run `work()`. At most one claimant
    /// wins until `finish_work` releases it.
    pub(crate) fn try_begin_work(&self) -> bool {
        self.working
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn finish_work(&self) {
        self.working.store(false, Ordering::Release);
        self.idle_notify.notify_one();
    }

    /// Release the work claim without a pass having run, used when a
    /// queued work item can no longer be delivered.
    pub(crate) fn abandon_work(&self) {
        self.working.store(false, Ordering::Release);
    }

    pub(crate) fn wants_output(&self) -> bool {
        self.work_flags.load(Ordering::Acquire) & work_flag::OUTPUT != 0
    }

    pub(crate) async fn output_wakeup(&self) {
        self.output_notify.notified().await;
    }

    pub(crate) async fn idle_wakeup(&self) {
        self.idle_notify.notified().await;
    }

    /// Mark the connection failed; the next work pass tears it down.
    pub fn mark_except(&self) {
        self.set_work_flag(work_flag::EXCEPT);
    }

    /// Flush what is buffered, then let the next work pass close the
    /// connection. `work()` reports it dead once the outbound stream
    /// drains.
    pub fn close(self: &Arc<Self>) {
        self.closing.store(true, Ordering::Relaxed);
        if self.outbound.lock().is_empty() {
            self.mark_except();
        } else {
            self.set_work_flag(work_flag::OUTPUT);
        }
        self.signal_ready();
    }

    fn signal_ready(self: &Arc<Self>) {
        self.output_notify.notify_one();
        if let Some(manager) = self.manager.upgrade() {
            manager.enqueue(self);
            manager.backend_wake();
        }
    }

    // sending

    /// Encode `packet` into the outbound stream and schedule a flush.
    pub fn send(self: &Arc<Self>, packet: &Packet) -> EngineResult<()> {
        if self.closing.load(Ordering::Relaxed) {
            return Err(EngineError::ConnectionClosed(format!(
                "connection {} is closing",
                self.id
            )));
        }
        {
            let codec = self.codec.lock().clone();
            let mut outbound = self.outbound.lock();
            codec.encode(packet, &mut outbound)?;
        }
        self.set_work_flag(work_flag::OUTPUT);
        self.signal_ready();
        Ok(())
    }

    fn next_call_index(&self) -> u32 {
        // index 0 belongs to notifies
        loop {
            let index = self.call_index.fetch_add(1, Ordering::Relaxed);
            if index != 0 {
                return index;
            }
        }
    }

    fn encode_call(index: u32, function: &str, arguments: &RpcPacker, id: u16) -> Packet {
        let mut payload = RpcPacker::new();
        payload
            .pack_u32(index)
            .pack_str(function)
            .append_raw(arguments.as_bytes());
        Packet::from_payload(id, payload.into_bytes())
    }

    fn send_call_indexed(
        self: &Arc<Self>,
        function: &str,
        arguments: &RpcPacker,
    ) -> EngineResult<(u32, oneshot::Receiver<CallResult>)> {
        if self.closing.load(Ordering::Relaxed) {
            return Err(EngineError::ConnectionClosed(format!(
                "connection {} is closing",
                self.id
            )));
        }
        let index = self.next_call_index();
        let packet = Self::encode_call(index, function, arguments, RPC_REQUEST_ID);
        let (tx, rx) = oneshot::channel();
        {
            // registering under the outbound lock keeps the entry
            // visible before the request can reach the wire, and a
            // failed encode never leaks a promise
            let codec = self.codec.lock().clone();
            let mut outbound = self.outbound.lock();
            codec.encode(&packet, &mut outbound)?;
            self.calls.register(index, function, tx);
        }
        self.set_work_flag(work_flag::OUTPUT);
        self.signal_ready();
        Ok((index, rx))
    }

    /// Issue an rpc request; the receiver resolves with the packed
    /// results or the failure that ended the call.
    pub fn send_call(
        self: &Arc<Self>,
        function: &str,
        arguments: &RpcPacker,
    ) -> EngineResult<oneshot::Receiver<CallResult>> {
        let (_, rx) = self.send_call_indexed(function, arguments)?;
        Ok(rx)
    }

    /// Fire-and-forget rpc: index 0, nothing registered, no response.
    pub fn send_call_notify(
        self: &Arc<Self>,
        function: &str,
        arguments: &RpcPacker,
    ) -> EngineResult<()> {
        let packet = Self::encode_call(0, function, arguments, RPC_NOTIFY_ID);
        self.send(&packet)
    }

    /// Drop a pending call out of band, e.g. after a caller-side
    /// deadline. Safe against the response racing in.
    pub fn abort_call(&self, index: u32) -> bool {
        self.calls.abort(index)
    }

    pub(crate) fn fail_pending(&self, reason: &str) {
        self.calls.drain(reason);
    }

    // hooks for backends that own the raw socket I/O

    pub(crate) fn set_external_io(&self, on: bool) {
        self.external_io.store(on, Ordering::Release);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    /// Append received bytes and flag Command. `false` means the
    /// inbound stream is full at its cap.
    pub(crate) fn push_inbound(&self, data: &[u8]) -> bool {
        if self.inbound.lock().write(data) == 0 {
            error!(
                "connection {} inbound stream rejected {} bytes, peer is flooding",
                self.id,
                data.len()
            );
            return false;
        }
        self.set_work_flag(work_flag::COMMAND);
        true
    }

    pub(crate) fn peek_outbound(&self, buf: &mut [u8]) -> usize {
        self.outbound.lock().peek(buf)
    }

    pub(crate) fn consume_outbound(&self, n: usize) {
        self.outbound.lock().remove(n);
    }

    pub(crate) fn outbound_is_empty(&self) -> bool {
        self.outbound.lock().is_empty()
    }

    pub(crate) fn clear_output_flag(&self) {
        self.clear_work_flag(work_flag::OUTPUT);
    }

    /// Request/response round trip with the connection's call timeout
    /// applied.
    pub async fn call(
        self: &Arc<Self>,
        function: &str,
        arguments: &RpcPacker,
    ) -> EngineResult<RpcUnpacker> {
        let (index, rx) = self.send_call_indexed(function, arguments)?;
        let timeout = *self.call_timeout.lock();
        let reply = match timeout {
            Some(deadline) => match time::timeout(deadline, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.abort_call(index);
                    return Err(EngineError::CallTimeout(format!(
                        "{} after {:?}",
                        function, deadline
                    )));
                }
            },
            None => rx.await,
        };
        match reply {
            Ok(result) => result,
            Err(_) => Err(EngineError::ConnectionClosed(format!(
                "connection {} dropped while {} was pending",
                self.id, function
            ))),
        }
    }

    // the work pass

    /// Execute the pending work flags. Returns `false` when the
    /// connection is dead and must be removed.
    ///
    /// Flags are re-read between phases: bytes pulled in by Input set
    /// COMMAND, and that command work runs in the same pass instead of
    /// waiting for a re-enqueue.
    pub fn work(self: &Arc<Self>) -> bool {
        if self.work_flags() & work_flag::EXCEPT != 0 {
            self.calls.drain("connection failed");
            return false;
        }
        let external_io = self.external_io.load(Ordering::Acquire);
        if !external_io && self.work_flags() & work_flag::INPUT != 0 && !self.do_input() {
            self.calls.drain("connection closed by peer");
            return false;
        }
        if !external_io && self.work_flags() & work_flag::OUTPUT != 0 && !self.do_output() {
            self.calls.drain("connection closed");
            return false;
        }
        if self.work_flags() & work_flag::COMMAND != 0 && !self.do_command() {
            self.calls.drain("protocol error");
            return false;
        }
        true
    }

    /// Drain the socket into the inbound stream.
    fn do_input(self: &Arc<Self>) -> bool {
        let mut buf = [0u8; IO_CHUNK];
        let mut received = 0usize;
        let alive = loop {
            match self.socket.try_recv(&mut buf) {
                Ok(IoOutcome::Done(n)) => {
                    let written = self.inbound.lock().write(&buf[..n]);
                    if written == 0 {
                        error!(
                            "connection {} inbound stream rejected {} bytes, peer is flooding",
                            self.id, n
                        );
                        break false;
                    }
                    received += n;
                }
                Ok(IoOutcome::WouldBlock) => {
                    self.clear_work_flag(work_flag::INPUT);
                    break true;
                }
                Ok(IoOutcome::Closed) => {
                    debug!("connection {} closed by peer", self.id);
                    break false;
                }
                Err(e) => {
                    warn!("connection {} recv failed: {}", self.id, e);
                    break false;
                }
            }
        };
        if received > 0 {
            self.set_work_flag(work_flag::COMMAND);
            if let Some(manager) = self.manager.upgrade() {
                manager.add_recv_bytes(received as u64);
            }
        }
        alive
    }

    /// Flush the outbound stream to the socket.
    fn do_output(self: &Arc<Self>) -> bool {
        let mut buf = [0u8; IO_CHUNK];
        let mut sent = 0usize;
        let mut outbound = self.outbound.lock();
        let alive = loop {
            let pending = outbound.peek(&mut buf);
            if pending == 0 {
                self.clear_work_flag(work_flag::OUTPUT);
                // a closing connection dies once its last byte is out
                break !self.closing.load(Ordering::Relaxed);
            }
            match self.socket.try_send(&buf[..pending]) {
                Ok(IoOutcome::Done(n)) => {
                    outbound.remove(n);
                    sent += n;
                }
                Ok(IoOutcome::WouldBlock) => break true,
                Ok(IoOutcome::Closed) => {
                    debug!("connection {} peer went away mid-send", self.id);
                    break false;
                }
                Err(e) => {
                    warn!("connection {} send failed: {}", self.id, e);
                    break false;
                }
            }
        };
        drop(outbound);
        if sent > 0 {
            if let Some(manager) = self.manager.upgrade() {
                manager.add_sent_bytes(sent as u64);
            }
        }
        alive
    }

    /// Decode and dispatch up to `COMMAND_BATCH` packets.
    fn do_command(self: &Arc<Self>) -> bool {
        let codec = self.codec.lock().clone();
        for _ in 0..COMMAND_BATCH {
            let decoded = {
                let mut inbound = self.inbound.lock();
                codec.decode(&mut inbound, &self.limits)
            };
            match decoded {
                Ok(packet) => {
                    self.error_times.store(0, Ordering::Relaxed);
                    if !self.dispatch_packet(packet) {
                        return false;
                    }
                }
                Err(EngineError::NeedRecv) => {
                    self.clear_work_flag(work_flag::COMMAND);
                    if self.inbound.lock().is_empty() {
                        self.error_times.store(0, Ordering::Relaxed);
                    } else {
                        // bytes keep trickling in without ever
                        // completing a frame
                        let stalls = self.error_times.fetch_add(1, Ordering::Relaxed) + 1;
                        if stalls > MAX_DECODE_STALLS {
                            warn!(
                                "connection {} stalled {} passes mid-frame, dropping it",
                                self.id, stalls
                            );
                            return false;
                        }
                    }
                    return true;
                }
                Err(e) => {
                    warn!("connection {} protocol error: {}", self.id, e);
                    return false;
                }
            }
        }
        // batch exhausted with frames possibly still buffered, the
        // COMMAND flag stays set and the pass re-enqueues
        true
    }

    fn dispatch_packet(self: &Arc<Self>, packet: Packet) -> bool {
        match packet.id() {
            RPC_RESPONSE_ID => self.handle_call_response(packet),
            RPC_REQUEST_ID | RPC_NOTIFY_ID => self.handle_call(packet),
            HANDSHAKE_ID => {
                trace!("connection {} handshake frame ignored", self.id);
                true
            }
            _ => {
                let dispatcher = self.dispatcher.lock().clone();
                if let Some(dispatcher) = dispatcher {
                    return dispatcher(self, packet);
                }
                if let Some(manager) = self.manager.upgrade() {
                    return manager.dispatch_packet(self, packet);
                }
                false
            }
        }
    }

    fn handle_call(self: &Arc<Self>, packet: Packet) -> bool {
        let is_request = packet.is_call_request();
        let mut args = RpcUnpacker::new(packet.take_payload());
        let index = args.unpack_u32();
        let function = args.unpack_str();
        if args.error().is_some() {
            warn!("connection {} sent an undecodable call header", self.id);
            if is_request {
                return self.send_call_response(index, rpc_code::BAD_ARGUMENTS, None);
            }
            return true;
        }

        let manager = match self.manager.upgrade() {
            Some(manager) => manager,
            None => return false,
        };
        let (code, result) = manager.registry().dispatch(&function, &mut args);
        if is_request {
            return self.send_call_response(index, code, result);
        }
        if code != rpc_code::OK {
            debug!(
                "connection {} notify {} failed with code {}",
                self.id, function, code
            );
        }
        true
    }

    fn send_call_response(
        self: &Arc<Self>,
        index: u32,
        code: i32,
        result: Option<RpcPacker>,
    ) -> bool {
        let mut payload = RpcPacker::new();
        payload.pack_u32(index).pack_i32(code);
        if let Some(result) = result {
            payload.append_raw(result.as_bytes());
        }
        let packet = Packet::from_payload(RPC_RESPONSE_ID, payload.into_bytes());
        match self.send(&packet) {
            Ok(()) => {
                // one-shot peers get flushed and hung up on
                if !self.keep_alive() {
                    self.close();
                }
                true
            }
            Err(e) => {
                warn!(
                    "connection {} could not answer call {}: {}",
                    self.id, index, e
                );
                !e.is_fatal_for_connection()
            }
        }
    }

    fn handle_call_response(self: &Arc<Self>, packet: Packet) -> bool {
        let mut reply = RpcUnpacker::new(packet.take_payload());
        let index = reply.unpack_u32();
        let code = reply.unpack_i32();
        if reply.error().is_some() {
            warn!("connection {} sent an undecodable call response", self.id);
            return true;
        }
        let result: CallResult = if code == rpc_code::OK {
            Ok(reply)
        } else {
            Err(EngineError::Rpc {
                code,
                message: format!("call {} failed", index),
            })
        };
        if self.calls.complete(index, result).is_none() {
            // late response after a timeout abort, nothing to resolve
            debug!("connection {} response for unknown call {}", self.id, index);
        }
        true
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("work_flags", &self.work_flags.load(Ordering::Relaxed))
            .field("working", &self.working.load(Ordering::Relaxed))
            .field("closing", &self.closing.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use tokio::io::{AsyncWriteExt, Interest};
    use tokio::net::TcpListener;

    use crate::engine::SocketType;
    use crate::packet::FrameCodec;

    use super::*;

    async fn loopback_connection() -> (Arc<Connection>, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = Socket::connect(SocketType::Tcp, &addr.to_string())
            .await
            .unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        let conn = Connection::new(
            7,
            socket,
            Weak::new(),
            Arc::new(FrameCodec),
            PacketLimits::default(),
            None,
        );
        (conn, peer)
    }

    #[tokio::test]
    async fn test_work_claim_is_exclusive() {
        let (conn, _peer) = loopback_connection().await;
        assert!(conn.try_begin_work());
        assert!(!conn.try_begin_work());
        conn.finish_work();
        assert!(conn.try_begin_work());
        conn.finish_work();
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_overlap() {
        let (conn, _peer) = loopback_connection().await;
        let inside = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let conn = conn.clone();
            let inside = inside.clone();
            let overlaps = overlaps.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    if conn.try_begin_work() {
                        if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        inside.fetch_sub(1, Ordering::SeqCst);
                        conn.finish_work();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_input_feeds_command_in_the_same_pass() {
        let (conn, mut peer) = loopback_connection().await;
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        conn.set_dispatcher(Arc::new(move |_conn: &Arc<Connection>, packet: Packet| {
            sink.lock().push(packet.payload().to_vec());
            true
        }));

        // one frame: id 10, length 2, payload "ok"
        let mut frame = vec![0u8, 10, 0, 0, 0, 2];
        frame.extend_from_slice(b"ok");
        peer.write_all(&frame).await.unwrap();
        peer.flush().await.unwrap();
        conn.socket().ready(Interest::READABLE).await.unwrap();

        conn.set_work_flag(work_flag::INPUT);
        assert!(conn.work());
        // the bytes pulled in by the Input phase were decoded and
        // dispatched by the Command phase of the very same pass
        assert_eq!(received.lock().as_slice(), &[b"ok".to_vec()]);
    }

    #[tokio::test]
    async fn test_send_sets_output_flag() {
        let (conn, _peer) = loopback_connection().await;
        assert!(!conn.wants_output());

        let mut packet = Packet::new(10);
        packet.write_bytes(b"payload").unwrap();
        packet.seal();
        conn.send(&packet).unwrap();

        assert!(conn.wants_output());
        assert!(!conn.outbound_is_empty());
    }

    #[tokio::test]
    async fn test_send_refused_while_closing() {
        let (conn, _peer) = loopback_connection().await;
        conn.close();

        let mut packet = Packet::new(10);
        packet.write_bytes(b"late").unwrap();
        packet.seal();
        assert!(matches!(
            conn.send(&packet),
            Err(EngineError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_init_resets_session_state() {
        let (conn, _peer) = loopback_connection().await;
        let mut packet = Packet::new(10);
        packet.write_bytes(b"stale").unwrap();
        packet.seal();
        conn.send(&packet).unwrap();
        conn.mark_except();
        assert!(conn.try_begin_work());

        conn.init();

        assert_eq!(conn.work_flags(), 0);
        assert!(conn.outbound_is_empty());
        assert!(conn.try_begin_work());
        conn.finish_work();
    }

    #[tokio::test]
    async fn test_abort_beats_late_response() {
        let (conn, _peer) = loopback_connection().await;
        let args = RpcPacker::new();
        let (index, rx) = conn.send_call_indexed("probe", &args).unwrap();

        assert!(conn.abort_call(index));
        // a response arriving after the abort resolves nothing
        let late = RpcUnpacker::new(bytes::BytesMut::new());
        assert!(conn.calls.complete(index, Ok(late)).is_none());
        assert!(rx.await.is_err());
    }
}
