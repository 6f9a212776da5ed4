//! The engine: backend ownership, stream registry and servicing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::backend::Backend;
use crate::buffer::{PcmBuffer, SharedBuffer};
use crate::config::EngineConfig;
use crate::event::{EngineEvent, EventCallback};
use crate::format::AudioFormat;
use crate::group::{AudioGroups, GroupSettings};
use crate::recorder::{Recorder, RecorderHandle};
use crate::source::{Source, SourceHandle, StreamId};
use crate::EngineError;

#[derive(Default)]
struct Registry {
    sources: Vec<Arc<Source>>,
    recorders: Vec<Arc<Recorder>>,
}

/// Lists reused by every tick so steady-state servicing does not allocate.
#[derive(Default)]
struct TickScratch {
    sources: Vec<Arc<Source>>,
    recorders: Vec<Arc<Recorder>>,
    released: Vec<StreamId>,
}

/// Owns a backend and every live source and recorder created through it.
///
/// [`tick`](Self::tick) must be called periodically (or driven by
/// [`spawn_ticker`](Self::spawn_ticker)): it collects consumed and filled
/// buffers, runs user callbacks, emits events and tears down released
/// streams. Callbacks and event handlers run with no engine or stream lock
/// held, so they may call back into the engine.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use pcm_engine::backend::MockBackend;
/// use pcm_engine::{Engine, EngineConfig, FormatPreset};
///
/// let backend = MockBackend::new();
/// let engine = Engine::new(Box::new(backend.clone()), EngineConfig::default());
/// engine.activate()?;
///
/// let format = FormatPreset::Voice.format();
/// let source = engine.alloc_source()?;
/// source.set_callback(|source, buffers| {
///     println!("source {} finished {} buffers", source.id(), buffers.len());
/// });
/// source.queue_buffer(engine.alloc_buffer(format, 160)?)?;
/// source.play()?;
///
/// backend.voice(0).unwrap().finish();
/// engine.tick();
/// # Ok::<(), pcm_engine::EngineError>(())
/// ```
pub struct Engine {
    backend: Box<dyn Backend>,
    config: EngineConfig,
    groups: Arc<AudioGroups>,
    registry: Mutex<Registry>,
    scratch: Mutex<TickScratch>,
    event_callback: RwLock<Option<EventCallback>>,
    active: AtomicBool,
    ticking: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine driving `backend`.
    pub fn new(backend: Box<dyn Backend>, config: EngineConfig) -> Arc<Self> {
        let groups = Arc::new(AudioGroups::new(config.audio_groups));
        Arc::new(Self {
            backend,
            config,
            groups,
            registry: Mutex::new(Registry::default()),
            scratch: Mutex::new(TickScratch::default()),
            event_callback: RwLock::new(None),
            active: AtomicBool::new(false),
            ticking: AtomicBool::new(false),
        })
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Name of the backend in use.
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Registers the handler for runtime events, replacing any previous one.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(EngineEvent) + Send + Sync + 'static,
    {
        *self.event_callback.write() = Some(Arc::new(handler));
    }

    /// Opens the backend's output context.
    ///
    /// # Errors
    ///
    /// Returns the backend's error; the engine stays inactive.
    pub fn activate(&self) -> Result<(), EngineError> {
        if self.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.backend.activate().inspect_err(|err| {
            tracing::error!("activating {} backend failed: {}", self.backend.name(), err);
        })?;
        self.active.store(true, Ordering::SeqCst);
        tracing::info!("{} backend activated", self.backend.name());
        Ok(())
    }

    /// Closes the backend's output context. Streams stay allocated.
    ///
    /// # Errors
    ///
    /// Returns the backend's error; the engine stays active.
    pub fn deactivate(&self) -> Result<(), EngineError> {
        if !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.backend.deactivate().inspect_err(|err| {
            tracing::error!("deactivating {} backend failed: {}", self.backend.name(), err);
        })?;
        self.active.store(false, Ordering::SeqCst);
        tracing::info!("{} backend deactivated", self.backend.name());
        Ok(())
    }

    /// Returns `true` between `activate` and `deactivate`.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Creates a playback source.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if it cannot create a voice, or
    /// [`EngineError::AllocationFailure`] if the registry cannot grow.
    pub fn alloc_source(&self) -> Result<SourceHandle, EngineError> {
        let voice = self.backend.create_voice()?;
        let id = StreamId::next();
        let source = Arc::new(Source::new(
            id,
            voice,
            Arc::clone(&self.groups),
            self.config.notify_batch_capacity,
        ));
        source.refresh_gain();

        {
            let mut registry = self.registry.lock();
            registry.sources.try_reserve(1)?;
            registry.sources.push(Arc::clone(&source));
        }
        tracing::info!("allocated source {}", id);
        Ok(SourceHandle::new(source))
    }

    /// Creates a buffer of `blocks` blocks of silence in `format`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AllocationFailure`] if storage cannot be obtained.
    pub fn alloc_buffer(&self, format: AudioFormat, blocks: usize) -> Result<SharedBuffer, EngineError> {
        let mut buffer = PcmBuffer::new(format, blocks)?;
        buffer.fill_with_zeroes();
        Ok(Arc::new(buffer))
    }

    /// Creates a buffer holding a copy of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AllocationFailure`] if storage cannot be obtained.
    pub fn alloc_buffer_with_data(
        &self,
        format: AudioFormat,
        data: &[u8],
    ) -> Result<SharedBuffer, EngineError> {
        Ok(Arc::new(PcmBuffer::with_data(format, data)?))
    }

    /// Creates a recorder delivering `buffer_count` buffers of
    /// `blocks_per_buffer` blocks in `format`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnsupportedFormat`] for unsupported formats,
    /// [`EngineError::AllocationFailure`] if buffers cannot be allocated, or
    /// the backend's error if it cannot open a capture device.
    pub fn alloc_recorder(
        &self,
        format: AudioFormat,
        buffer_count: usize,
        blocks_per_buffer: usize,
    ) -> Result<RecorderHandle, EngineError> {
        if !format.is_supported() {
            return Err(EngineError::unsupported(&format));
        }
        let device = self.backend.create_capture(&format)?;
        let id = StreamId::next();
        let recorder = Arc::new(Recorder::new(
            id,
            device,
            format,
            buffer_count,
            blocks_per_buffer,
        )?);

        {
            let mut registry = self.registry.lock();
            registry.recorders.try_reserve(1)?;
            registry.recorders.push(Arc::clone(&recorder));
        }
        tracing::info!(
            "allocated recorder {} ({} x {} blocks, {})",
            id,
            buffer_count,
            blocks_per_buffer,
            format
        );
        Ok(RecorderHandle::new(recorder))
    }

    /// Number of sources not yet torn down (released ones included until
    /// their final tick).
    pub fn source_count(&self) -> usize {
        self.registry.lock().sources.len()
    }

    /// Number of recorders not yet torn down.
    pub fn recorder_count(&self) -> usize {
        self.registry.lock().recorders.len()
    }

    /// Settings of audio group `index`.
    pub fn group(&self, index: usize) -> Option<GroupSettings> {
        self.groups.get(index)
    }

    /// Enables or mutes a group. Returns `false` for an unknown index.
    pub fn set_group_enabled(&self, index: usize, enabled: bool) -> bool {
        let known = self.groups.set_enabled(index, enabled);
        if known {
            self.refresh_group(index);
        }
        known
    }

    /// Sets a group's volume. Returns `false` for an unknown index.
    pub fn set_group_volume(&self, index: usize, volume: f32) -> bool {
        let known = self.groups.set_volume(index, volume);
        if known {
            self.refresh_group(index);
        }
        known
    }

    fn refresh_group(&self, index: usize) {
        let members: Vec<Arc<Source>> = self
            .registry
            .lock()
            .sources
            .iter()
            .filter(|source| source.group() == index)
            .cloned()
            .collect();
        for source in members {
            source.refresh_gain();
        }
    }

    /// Services every stream once.
    ///
    /// Collects buffers the backend consumed or filled, runs the stream
    /// callbacks, emits events, and drops streams whose release completed.
    pub fn tick(&self) {
        self.backend.tick();

        let mut scratch = std::mem::take(&mut *self.scratch.lock());
        {
            let registry = self.registry.lock();
            scratch.sources.extend(registry.sources.iter().cloned());
            scratch.recorders.extend(registry.recorders.iter().cloned());
        }

        for source in &scratch.sources {
            let report = source.service();
            let id = source.id();
            if let Some(err) = report.backend_error {
                self.emit(EngineEvent::BackendError {
                    id: Some(id),
                    error: err.to_string(),
                });
            }
            if report.drained {
                self.emit(EngineEvent::SourceDrained { id });
            }
            if report.static_completed {
                self.emit(EngineEvent::StaticCompleted { id });
            }
            if report.released {
                scratch.released.push(id);
            }
        }

        for recorder in &scratch.recorders {
            let report = recorder.service();
            let id = recorder.id();
            if let Some(err) = report.backend_error {
                self.emit(EngineEvent::BackendError {
                    id: Some(id),
                    error: err.to_string(),
                });
            }
            if report.dropped_blocks > 0 {
                self.emit(EngineEvent::RecorderOverrun {
                    id,
                    dropped_blocks: report.dropped_blocks,
                });
            }
            if report.released {
                scratch.released.push(id);
            }
        }

        if !scratch.released.is_empty() {
            {
                let released = &scratch.released;
                let mut registry = self.registry.lock();
                registry
                    .sources
                    .retain(|source| !released.contains(&source.id()));
                registry
                    .recorders
                    .retain(|recorder| !released.contains(&recorder.id()));
            }
            for &id in &scratch.released {
                tracing::info!("released stream {}", id);
                self.emit(EngineEvent::StreamReleased { id });
            }
        }

        scratch.sources.clear();
        scratch.recorders.clear();
        scratch.released.clear();
        *self.scratch.lock() = scratch;
    }

    /// Runs [`tick`](Self::tick) every `tick_interval` on a tokio task until
    /// [`shutdown`](Self::shutdown) is called or the engine is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        self.ticking.store(true, Ordering::SeqCst);
        let engine: Weak<Self> = Arc::downgrade(self);
        let period = self.config.tick_interval;
        tracing::debug!("starting ticker every {:?}", period);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                if !engine.ticking.load(Ordering::SeqCst) {
                    break;
                }
                engine.tick();
            }
        })
    }

    /// Stops the ticker started by [`spawn_ticker`](Self::spawn_ticker).
    pub fn shutdown(&self) {
        if self.ticking.swap(false, Ordering::SeqCst) {
            tracing::debug!("ticker stopping");
        }
    }

    fn emit(&self, event: EngineEvent) {
        let callback = self.event_callback.read().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }
}
