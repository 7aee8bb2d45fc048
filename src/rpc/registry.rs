use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use super::{RpcPacker, RpcUnpacker};

/// Error codes carried in the `error_code` field of a call response.
pub mod rpc_code {
    pub const OK: i32 = 0;
    pub const FUNCTION_NOT_FOUND: i32 = 1;
    pub const BAD_ARGUMENTS: i32 = 2;
    pub const EXECUTION_FAILED: i32 = 3;
}

/// A registered rpc function: packed arguments in, packed result out,
/// or a nonzero error code.
pub type RpcHandler = Arc<dyn Fn(&mut RpcUnpacker) -> Result<RpcPacker, i32> + Send + Sync>;

/// Name-keyed registry of rpc functions, shared by every connection of
/// a manager.
#[derive(Default)]
pub struct RpcRegistry {
    handlers: DashMap<String, RpcHandler>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: &str, handler: F)
    where
        F: Fn(&mut RpcUnpacker) -> Result<RpcPacker, i32> + Send + Sync + 'static,
    {
        if self
            .handlers
            .insert(name.to_string(), Arc::new(handler))
            .is_some()
        {
            warn!("rpc function {} re-registered", name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Invoke `name` with the packed arguments. Returns the response
    /// error code and, on success, the packed result.
    pub fn dispatch(&self, name: &str, arguments: &mut RpcUnpacker) -> (i32, Option<RpcPacker>) {
        let handler = match self.handlers.get(name) {
            Some(entry) => entry.value().clone(),
            None => return (rpc_code::FUNCTION_NOT_FOUND, None),
        };
        let result = handler(arguments);
        if arguments.error().is_some() {
            return (rpc_code::BAD_ARGUMENTS, None);
        }
        match result {
            Ok(packer) => (rpc_code::OK, Some(packer)),
            Err(code) => (code, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_registry() -> RpcRegistry {
        let registry = RpcRegistry::new();
        registry.register("add", |args| {
            let a = args.unpack_i64();
            let b = args.unpack_i64();
            let mut result = RpcPacker::new();
            result.pack_int(a + b);
            Ok(result)
        });
        registry
    }

    #[test]
    fn test_dispatch_success() {
        let registry = add_registry();
        let mut args_packer = RpcPacker::new();
        args_packer.pack_int(2).pack_int(40);
        let mut args = RpcUnpacker::from_slice(args_packer.as_bytes());

        let (code, result) = registry.dispatch("add", &mut args);
        assert_eq!(code, rpc_code::OK);
        let mut result = RpcUnpacker::from_slice(result.unwrap().as_bytes());
        assert_eq!(result.unpack_i64(), 42);
    }

    #[test]
    fn test_dispatch_unknown_function() {
        let registry = add_registry();
        let mut args = RpcUnpacker::from_slice(&[]);
        let (code, result) = registry.dispatch("missing", &mut args);
        assert_eq!(code, rpc_code::FUNCTION_NOT_FOUND);
        assert!(result.is_none());
    }

    #[test]
    fn test_dispatch_bad_arguments() {
        let registry = add_registry();
        // "add" wants two integers, feed it a string
        let mut args_packer = RpcPacker::new();
        args_packer.pack_str("oops");
        let mut args = RpcUnpacker::from_slice(args_packer.as_bytes());

        let (code, result) = registry.dispatch("add", &mut args);
        assert_eq!(code, rpc_code::BAD_ARGUMENTS);
        assert!(result.is_none());
    }

    #[test]
    fn test_handler_error_code_passes_through() {
        let registry = RpcRegistry::new();
        registry.register("always_fails", |_| Err(rpc_code::EXECUTION_FAILED));
        let mut args = RpcUnpacker::from_slice(&[]);
        let (code, _) = registry.dispatch("always_fails", &mut args);
        assert_eq!(code, rpc_code::EXECUTION_FAILED);
    }
}
