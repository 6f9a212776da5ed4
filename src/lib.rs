//! # pcm-engine
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Backend-agnostic PCM buffer queues with deferred notifications and
//! sample-format conversion.
//!
//! `pcm-engine` sits between an application and a native audio backend. Sources
//! accept buffers in any supported integer or float format, convert them to
//! what the backend voice wants, and hand every consumed buffer back to a
//! callback on the next [`Engine::tick`]. Recorders do the reverse: captured
//! audio is converted into user-sized buffers and delivered the same way.
//!
//! ## Quick Start
//!
//! ```rust
//! use pcm_engine::backend::MockBackend;
//! use pcm_engine::{AudioFormat, Engine, EngineConfig, EngineEvent};
//!
//! let backend = MockBackend::new();
//! let engine = Engine::new(Box::new(backend.clone()), EngineConfig::default());
//! engine.on_event(|event| {
//!     if let EngineEvent::SourceDrained { id } = event {
//!         tracing::debug!("source {} ran dry", id);
//!     }
//! });
//!
//! let format = AudioFormat::i16(1, 22050);
//! let source = engine.alloc_source()?;
//! source.set_callback(|_, done| {
//!     // Refill and requeue `done` here.
//!     let _ = done.len();
//! });
//! for _ in 0..4 {
//!     source.queue_buffer(engine.alloc_buffer(format, 2205)?)?;
//! }
//! source.play()?;
//!
//! backend.voice(0).unwrap().complete_buffers(2);
//! engine.tick();
//! assert_eq!(source.get_buffers_count(), 2);
//! # Ok::<(), pcm_engine::EngineError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Backend**: the [`backend::Backend`] trait abstracts the native library.
//!   A scriptable mock ships with the crate; the `cpal` feature adds a real one.
//! - **Streams**: [`Source`] and [`Recorder`] keep their buffers in bounded
//!   queues sized outside the audio path, so steady-state ticks never allocate.
//! - **Tick**: [`Engine::tick`] services every stream and runs callbacks with
//!   no lock held. [`Engine::spawn_ticker`] drives it from a tokio task.

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

pub mod backend;
mod buffer;
mod config;
mod engine;
mod error;
mod event;
pub mod format;
mod group;
pub mod pipeline;
mod recorder;
pub mod source;

pub use buffer::{PcmBuffer, SharedBuffer};
pub use config::{EngineConfig, FormatPreset};
pub use engine::Engine;
pub use error::EngineError;
pub use event::{event_callback, EngineEvent, EventCallback};
pub use format::{
    blocks_for_new_frequency, AudioFormat, Conversion, Converter, SampleEncoding, SampleKind,
    PRECISION,
};
pub use group::{AudioGroups, GroupSettings};
pub use recorder::{Recorder, RecorderCallback, RecorderHandle, RecorderStats};
pub use source::{
    OffsetUnit, Source, SourceCallback, SourceFlags, SourceHandle, SourceMode, SourceStats,
    StreamId,
};
