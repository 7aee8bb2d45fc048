use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::engine::EngineError;

use super::RpcUnpacker;

/// Outcome delivered to a pending call: the unpacker positioned at the
/// packed result values, or the failure that ended the call.
pub type CallResult = Result<RpcUnpacker, EngineError>;

#[derive(Debug)]
struct PendingCall {
    function: String,
    tx: oneshot::Sender<CallResult>,
}

/// Maps in-flight call indexes to the callers awaiting their response.
///
/// Every entry leaves the table exactly once: through a matching
/// response, a caller-side timeout (`abort`), or a disconnect
/// (`drain`). The caller may remove a timed-out entry while a response
/// for the same index is in flight; the loser of that race finds the
/// slot empty and gives up quietly.
#[derive(Debug, Default)]
pub struct CallTable {
    inner: Mutex<HashMap<u32, PendingCall>>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn register(&self, index: u32, function: &str, tx: oneshot::Sender<CallResult>) {
        let stale = self.inner.lock().insert(
            index,
            PendingCall {
                function: function.to_string(),
                tx,
            },
        );
        if let Some(stale) = stale {
            // an index wrapped all the way around with a call still
            // pending; resolve the old one rather than dropping it
            debug!("call index {} reused while {} pending", index, stale.function);
            let _ = stale.tx.send(Err(EngineError::IllegalState(format!(
                "call index {} reused",
                index
            ))));
        }
    }

    /// Resolve the pending call for `index`. Returns the function name
    /// on a hit, `None` for a late or duplicate response.
    pub fn complete(&self, index: u32, result: CallResult) -> Option<String> {
        let entry = self.inner.lock().remove(&index)?;
        // the caller may have stopped waiting; that is not an error
        let _ = entry.tx.send(result);
        Some(entry.function)
    }

    /// Drop a pending call out of band, used by callers on timeout.
    pub fn abort(&self, index: u32) -> bool {
        self.inner.lock().remove(&index).is_some()
    }

    /// Fail every pending call, used on disconnect and `init`.
    pub fn drain(&self, reason: &str) {
        let drained: Vec<(u32, PendingCall)> = self.inner.lock().drain().collect();
        for (index, entry) in drained {
            debug!("failing pending call {} ({}): {}", index, entry.function, reason);
            let _ = entry
                .tx
                .send(Err(EngineError::ConnectionClosed(reason.to_string())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_matching_response_resolves_exactly_one_call() {
        let table = CallTable::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        table.register(1, "echo", tx1);
        table.register(2, "add", tx2);

        let hit = table.complete(1, Ok(RpcUnpacker::from_slice(&[0x07])));
        assert_eq!(hit.as_deref(), Some("echo"));

        let mut unpacker = rx1.await.unwrap().unwrap();
        assert_eq!(unpacker.unpack_u64(), 7);

        // the other call is untouched
        assert!(rx2.try_recv().is_err());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_index_resolves_nothing() {
        let table = CallTable::new();
        let (tx, mut rx) = oneshot::channel();
        table.register(5, "echo", tx);

        assert!(table.complete(99, Ok(RpcUnpacker::from_slice(&[]))).is_none());
        assert!(rx.try_recv().is_err());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_abort_then_late_response_is_ignored() {
        let table = CallTable::new();
        let (tx, mut rx) = oneshot::channel();
        table.register(3, "slow", tx);

        assert!(table.abort(3));
        // the caller's receiver observes the dropped sender
        assert!(rx.try_recv().is_err());
        // the late response finds the slot empty
        assert!(table.complete(3, Ok(RpcUnpacker::from_slice(&[]))).is_none());
    }

    #[tokio::test]
    async fn test_drain_fails_all_pending() {
        let table = CallTable::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        table.register(1, "a", tx1);
        table.register(2, "b", tx2);

        table.drain("socket error");
        assert!(table.is_empty());
        assert!(matches!(
            rx1.await.unwrap(),
            Err(EngineError::ConnectionClosed(_))
        ));
        assert!(matches!(
            rx2.await.unwrap(),
            Err(EngineError::ConnectionClosed(_))
        ));
    }
}
