//! Runtime events for monitoring streams.
//!
//! Events are non-fatal notifications emitted by [`Engine::tick`]. They are
//! always delivered after internal locks are released, so a handler may call
//! back into the engine.
//!
//! [`Engine::tick`]: crate::Engine::tick

use std::sync::Arc;

use crate::source::StreamId;

/// Runtime events emitted while servicing streams.
///
/// # Example
///
/// ```
/// use pcm_engine::EngineEvent;
///
/// fn handle_event(event: EngineEvent) {
///     match event {
///         EngineEvent::SourceDrained { id } => {
///             eprintln!("source {id} ran out of buffers");
///         }
///         EngineEvent::StaticCompleted { id } => {
///             eprintln!("source {id} finished its buffer");
///         }
///         EngineEvent::StreamReleased { id } => {
///             eprintln!("stream {id} released");
///         }
///         EngineEvent::RecorderOverrun { id, dropped_blocks } => {
///             eprintln!("recorder {id} dropped {dropped_blocks} blocks");
///         }
///         EngineEvent::BackendError { id, error } => {
///             eprintln!("backend error on {id:?}: {error}");
///         }
///     }
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A playing stream source consumed its last queued buffer.
    ///
    /// The source stays playing; queueing another buffer resumes output.
    SourceDrained {
        /// The drained source.
        id: StreamId,
    },

    /// A non-repeating static source reached the end of its buffer and was
    /// paused with its position rewound.
    StaticCompleted {
        /// The completed source.
        id: StreamId,
    },

    /// A freed or orphaned stream was fully stopped by the backend and torn
    /// down.
    StreamReleased {
        /// The released stream.
        id: StreamId,
    },

    /// A recorder received input while every buffer was awaiting delivery.
    RecorderOverrun {
        /// The recorder that dropped input.
        id: StreamId,
        /// Input blocks dropped in this tick.
        dropped_blocks: usize,
    },

    /// The backend rejected an operation issued during servicing.
    BackendError {
        /// The stream involved, if any.
        id: Option<StreamId>,
        /// Description of the error.
        error: String,
    },
}

/// Callback type for receiving runtime events.
///
/// Register one with [`Engine::on_event`](crate::Engine::on_event).
pub type EventCallback = Arc<dyn Fn(EngineEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use pcm_engine::{event_callback, EngineEvent};
///
/// let callback = event_callback(|event: EngineEvent| {
///     tracing::warn!(?event, "engine event");
/// });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(EngineEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_event_debug() {
        let event = EngineEvent::RecorderOverrun {
            id: StreamId::new(3),
            dropped_blocks: 512,
        };
        let debug = format!("{event:?}");
        assert!(debug.contains("RecorderOverrun"));
        assert!(debug.contains("512"));
    }

    #[test]
    fn test_event_callback_helper() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let callback = event_callback(move |_| {
            called_clone.store(true, Ordering::SeqCst);
        });

        callback(EngineEvent::SourceDrained {
            id: StreamId::new(1),
        });
        assert!(called.load(Ordering::SeqCst));
    }
}
