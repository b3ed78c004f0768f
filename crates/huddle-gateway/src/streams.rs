//! In-flight AI streams, one per (room, thread), each with a cancellation token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::GatewayError;

type StreamKey = (String, Option<Uuid>);

#[derive(Clone, Default)]
pub struct StreamRegistry {
    inner: Arc<Mutex<HashMap<StreamKey, (Uuid, CancellationToken)>>>,
}

/// Held by the task relaying a stream. Dropping it frees the thread for the
/// next stream.
pub struct StreamGuard {
    pub stream_id: Uuid,
    pub token: CancellationToken,
    key: StreamKey,
    registry: StreamRegistry,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the thread for a new stream. Fails if one is already running.
    pub fn begin(&self, share_code: &str, thread_id: Option<Uuid>) -> Result<StreamGuard, GatewayError> {
        let key = (share_code.to_string(), thread_id);
        let mut streams = self.lock();
        if streams.contains_key(&key) {
            return Err(GatewayError::StreamInProgress);
        }

        let stream_id = Uuid::new_v4();
        let token = CancellationToken::new();
        streams.insert(key.clone(), (stream_id, token.clone()));
        debug!("AI stream {} started in {}/{:?}", stream_id, key.0, key.1);

        Ok(StreamGuard {
            stream_id,
            token,
            key,
            registry: self.clone(),
        })
    }

    /// Cancel the stream running in a thread. Returns `false` if there was none.
    pub fn cancel(&self, share_code: &str, thread_id: Option<Uuid>) -> bool {
        let streams = self.lock();
        match streams.get(&(share_code.to_string(), thread_id)) {
            Some((stream_id, token)) => {
                debug!("AI stream {} cancelled", stream_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every stream in a room, e.g. when it is deleted.
    pub fn cancel_room(&self, share_code: &str) -> usize {
        let streams = self.lock();
        let mut n = 0;
        for ((code, _), (_, token)) in streams.iter() {
            if code == share_code {
                token.cancel();
                n += 1;
            }
        }
        n
    }

    pub fn is_streaming(&self, share_code: &str, thread_id: Option<Uuid>) -> bool {
        self.lock().contains_key(&(share_code.to_string(), thread_id))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<StreamKey, (Uuid, CancellationToken)>> {
        // The map holds no invariants a panicking holder could break
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let mut streams = self.registry.lock();
        if streams.get(&self.key).is_some_and(|(id, _)| *id == self.stream_id) {
            streams.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_stream_per_thread() {
        let registry = StreamRegistry::new();
        let thread = Some(Uuid::new_v4());

        let guard = registry.begin("ROOM2345", thread).unwrap();
        assert!(matches!(
            registry.begin("ROOM2345", thread),
            Err(GatewayError::StreamInProgress)
        ));
        // Other threads are independent
        let _main = registry.begin("ROOM2345", None).unwrap();

        drop(guard);
        assert!(!registry.is_streaming("ROOM2345", thread));
        assert!(registry.begin("ROOM2345", thread).is_ok());
    }

    #[test]
    fn cancel_trips_the_token() {
        let registry = StreamRegistry::new();
        let guard = registry.begin("ROOM2345", None).unwrap();

        assert!(registry.cancel("ROOM2345", None));
        assert!(guard.token.is_cancelled());
        assert!(!registry.cancel("ROOM2345", Some(Uuid::new_v4())));
    }

    #[test]
    fn cancel_room_only_touches_that_room() {
        let registry = StreamRegistry::new();
        let a = registry.begin("ROOM2345", None).unwrap();
        let b = registry.begin("OTHER234", None).unwrap();

        assert_eq!(registry.cancel_room("ROOM2345"), 1);
        assert!(a.token.is_cancelled());
        assert!(!b.token.is_cancelled());
    }
}
