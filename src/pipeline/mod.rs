//! Buffer bookkeeping shared by sources and recorders.
//!
//! ```text
//! queue_buffer → pend ──(backend consumed)──→ notify ──(tick, unlocked)──→ callback
//!                  ↑                                                          │
//!                  └───────────────────────── reuse ←─────────────────────────┘
//! ```
//!
//! - **Queues**: `pend`, `reuse` and `notify`, all pre-reserved so the
//!   real-time path never grows them
//! - **Notify batch**: consumed buffers moved out from under the stream lock
//!   before callbacks run

mod notify;
mod queue;

pub use notify::NotifyBatch;
pub use queue::{BufferQueue, QueuePair, StreamQueues};
