mod engine;
mod network;
mod packet;
mod rpc;
mod stream;

pub use engine::{
    setup_file_tracing, setup_local_tracing, EngineConfig, EngineError, EngineResult,
    ExecutorConfig, LogGuard, MuxMode, Shutdown, SocketType, Timer, TimerQueue,
};
pub use network::{
    Connection, ConnectionCallback, IoOutcome, Manager, ManagerStats, MuxBackend,
    PacketDispatcher, Socket,
};
pub use packet::{
    FrameCodec, LineCodec, Packet, PacketCodec, PacketLimits, HANDSHAKE_ID, LINE_ID,
    RPC_NOTIFY_ID, RPC_REQUEST_ID, RPC_RESPONSE_ID,
};
pub use rpc::{rpc_code, CallResult, Packable, RpcPacker, RpcRegistry, RpcUnpackError, RpcUnpacker};
pub use stream::ByteStream;
