//! Binary rpc layer.
//!
//! `RpcPacker` / `RpcUnpacker` implement the type-tagged value format
//! used for call arguments and results. `CallTable` correlates call
//! indexes with pending callers, and `RpcRegistry` holds the callable
//! functions on the serving side.
//!
//! On the wire a call request payload is the packed `u32` call index,
//! the packed function name, then the packed arguments; a response is
//! the packed index, a packed `i32` error code, then the packed result
//! values when the code is zero. A notify reuses the request layout
//! with index 0 and never receives a response.

pub use correlation::{CallResult, CallTable};
pub use packer::{Packable, RpcPacker};
pub use registry::{rpc_code, RpcHandler, RpcRegistry};
pub use unpacker::{RpcUnpackError, RpcUnpacker};

mod correlation;
mod packer;
mod registry;
mod unpacker;
