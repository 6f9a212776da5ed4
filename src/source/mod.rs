//! Playback sources.
//!
//! A [`Source`] feeds one backend [`Voice`]. It is either *static* (one
//! buffer, attached with [`Source::set_buffer`]) or *stream* (a FIFO of
//! buffers, appended with [`Source::queue_buffer`]); the first buffer decides
//! which, and also locks in the format every later buffer must match.
//!
//! Buffers the backend has finished with are collected by the engine's tick
//! and handed to the source callback after the source lock is released, so
//! the callback may queue the next buffer directly.

mod flags;
mod stream_id;

pub use flags::{OffsetUnit, SourceFlags, SourceMode};
pub use stream_id::StreamId;

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::backend::{NativeBuffer, Voice, VoiceState};
use crate::buffer::{PcmBuffer, SharedBuffer};
use crate::format::{blocks_for_new_frequency, AudioFormat, Converter};
use crate::group::AudioGroups;
use crate::pipeline::{NotifyBatch, QueuePair, StreamQueues};
use crate::EngineError;

/// Callback receiving the buffers a source finished with, oldest first.
pub type SourceCallback = Arc<dyn Fn(&Source, &[SharedBuffer]) + Send + Sync>;

/// Counters describing a source's buffer traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Buffers accepted by `set_buffer` or `queue_buffer`.
    pub buffers_queued: u64,
    /// Buffers handed to the callback (static completions included).
    pub buffers_notified: u64,
    /// Deepest the pending queue has been.
    pub max_pend_depth: usize,
    /// Native handles currently pooled for reuse.
    pub reuse_pool_size: usize,
}

/// What one service pass observed, for the engine to turn into events.
#[derive(Debug, Default)]
pub(crate) struct ServiceReport {
    pub drained: bool,
    pub static_completed: bool,
    pub released: bool,
    pub backend_error: Option<EngineError>,
}

struct SourceInner {
    voice: Box<dyn Voice>,
    flags: SourceFlags,
    mode: SourceMode,
    format: Option<AudioFormat>,
    native_format: Option<AudioFormat>,
    queues: StreamQueues,
    batch: NotifyBatch<SharedBuffer>,
    batch_capacity: usize,
    batch_lent: bool,
    converter: Converter,
    scratch: Vec<u8>,
    drained: bool,
    static_returned: bool,
    volume: f32,
    group: usize,
    stats: SourceStats,
}

/// A playback stream.
///
/// Obtained from [`Engine::alloc_source`](crate::Engine::alloc_source) as a
/// [`SourceHandle`].
pub struct Source {
    id: StreamId,
    groups: Arc<AudioGroups>,
    callback: RwLock<Option<SourceCallback>>,
    inner: Mutex<SourceInner>,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Source")
            .field("id", &self.id)
            .field("flags", &inner.flags)
            .field("mode", &inner.mode)
            .field("format", &inner.format)
            .field("pending", &inner.queues.pend.len())
            .finish_non_exhaustive()
    }
}

impl Source {
    pub(crate) fn new(
        id: StreamId,
        voice: Box<dyn Voice>,
        groups: Arc<AudioGroups>,
        batch_capacity: usize,
    ) -> Self {
        Self {
            id,
            groups,
            callback: RwLock::new(None),
            inner: Mutex::new(SourceInner {
                voice,
                flags: SourceFlags::default(),
                mode: SourceMode::Undetermined,
                format: None,
                native_format: None,
                queues: StreamQueues::new(),
                batch: NotifyBatch::with_capacity(batch_capacity),
                batch_capacity,
                batch_lent: false,
                converter: Converter::new(),
                scratch: Vec::new(),
                drained: false,
                static_returned: false,
                volume: 1.0,
                group: 0,
                stats: SourceStats::default(),
            }),
        }
    }

    /// Returns the source's id.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Installs the callback receiving consumed buffers.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&Source, &[SharedBuffer]) + Send + Sync + 'static,
    {
        *self.callback.write() = Some(Arc::new(callback));
    }

    /// Removes the callback. Consumed buffers are then released silently.
    pub fn clear_callback(&self) {
        *self.callback.write() = None;
    }

    /// Attaches the single buffer of a static source.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidState`] if a buffer is already attached, the
    ///   source is streaming, or it is being released
    /// - [`EngineError::UnsupportedFormat`] for formats the converter rejects
    /// - [`EngineError::BackendError`] if the voice refuses the data
    pub fn set_buffer(&self, buffer: SharedBuffer) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        match inner.mode {
            SourceMode::Static => {
                return Err(EngineError::invalid_state("static buffer already attached"))
            }
            SourceMode::Stream => return Err(EngineError::invalid_state("source is streaming")),
            SourceMode::Undetermined => {}
        }
        let format = *buffer.format();
        let native = inner.admit(self.id, &format)?;

        inner.converter.reset();
        let handle = inner.stage(&buffer, &native)?;
        if let Err(err) = inner.voice.set_static_buffer(Some(handle)) {
            inner.park(handle);
            tracing::error!("source {}: static attach failed: {}", self.id, err);
            return Err(err);
        }
        let repeat = inner.flags.repeat;
        inner.voice.set_looping(repeat);

        inner.push_pending(QueuePair::new(buffer, handle))?;
        inner.mode = SourceMode::Static;
        inner.lock_format(format, native);
        Ok(())
    }

    /// Appends a buffer to a stream source.
    ///
    /// If the source is playing but the backend ran dry, playback restarts.
    ///
    /// # Errors
    ///
    /// - [`EngineError::FormatMismatch`] if the format differs from the first
    ///   buffer's
    /// - [`EngineError::InvalidState`] for static or releasing sources
    /// - [`EngineError::AllocationFailure`] if the queues cannot grow
    /// - [`EngineError::BackendError`] if the voice refuses the data
    ///
    /// The source is unchanged on error.
    pub fn queue_buffer(&self, buffer: SharedBuffer) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        if inner.mode == SourceMode::Static {
            return Err(EngineError::invalid_state("source holds a static buffer"));
        }
        let format = *buffer.format();
        let native = inner.admit(self.id, &format)?;

        let handle = inner.stage(&buffer, &native)?;
        if let Err(err) = inner.voice.enqueue(handle) {
            inner.park(handle);
            tracing::error!("source {}: enqueue failed: {}", self.id, err);
            return Err(err);
        }

        inner.push_pending(QueuePair::new(buffer, handle))?;
        inner.mode = SourceMode::Stream;
        inner.lock_format(format, native);
        inner.drained = false;

        if inner.flags.is_playing() && inner.voice.state() == VoiceState::Stopped {
            tracing::trace!("source {}: restarting drained stream", self.id);
            if let Err(err) = inner.voice.play() {
                tracing::error!("source {}: restart failed: {}", self.id, err);
            }
        }
        Ok(())
    }

    /// Seeks within the first pending buffer.
    ///
    /// The position is clamped to that buffer's length.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] if no buffer is attached, or the
    /// backend's error if it refuses the seek.
    pub fn set_buffer_offset(&self, unit: OffsetUnit, value: usize) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let (Some(format), Some(native)) = (inner.format, inner.native_format) else {
            return Err(EngineError::invalid_state("no buffer attached"));
        };
        let Some(available) = inner
            .queues
            .pend
            .front()
            .and_then(|pair| pair.original.as_ref())
            .map(|buffer| buffer.blocks_used())
        else {
            return Err(EngineError::invalid_state("no buffer pending"));
        };

        let blocks = match unit {
            OffsetUnit::Blocks => value,
            OffsetUnit::Millis => format.ms_to_blocks(value as u64),
            OffsetUnit::Bytes => format.bytes_to_blocks(value),
        }
        .min(available);
        let native_blocks = rescale(blocks, format.sample_rate(), native.sample_rate());
        inner.voice.set_offset_bytes(native.blocks_to_bytes(native_blocks))
    }

    /// Play position within the first pending buffer, in blocks of the
    /// source format.
    pub fn get_blocks_offset(&self) -> usize {
        let inner = self.inner.lock();
        let (Some(format), Some(native)) = (inner.format, inner.native_format) else {
            return 0;
        };
        let native_blocks = native.bytes_to_blocks(inner.voice.offset_bytes());
        rescale(native_blocks, native.sample_rate(), format.sample_rate())
    }

    /// Number of buffers handed over and not yet consumed.
    pub fn get_buffers_count(&self) -> usize {
        self.inner.lock().queues.pend.len()
    }

    /// Starts or resumes playback.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] for a releasing source, or the
    /// backend's error. Flags are unchanged on error.
    pub fn play(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        if inner.flags.is_playing() {
            return Ok(());
        }
        inner.voice.play().inspect_err(|err| {
            tracing::error!("source {}: play failed: {}", self.id, err);
        })?;
        inner.flags.playing = true;
        inner.flags.paused = false;
        inner.flags.changing = true;
        inner.drained = false;
        inner.static_returned = false;
        Ok(())
    }

    /// Holds playback at the current position. No-op unless playing.
    ///
    /// # Errors
    ///
    /// Returns the backend's error; flags are unchanged on error.
    pub fn pause(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if !inner.flags.is_playing() {
            return Ok(());
        }
        inner.voice.pause().inspect_err(|err| {
            tracing::error!("source {}: pause failed: {}", self.id, err);
        })?;
        inner.flags.paused = true;
        inner.flags.changing = true;
        Ok(())
    }

    /// Stops playback.
    ///
    /// Every pending stream buffer is moved to the notification queue, so
    /// the callback sees all of them on the next tick. A static buffer stays
    /// attached and rewinds.
    ///
    /// # Errors
    ///
    /// Returns the backend's error; flags are unchanged on error.
    pub fn stop(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        inner.voice.stop().inspect_err(|err| {
            tracing::error!("source {}: stop failed: {}", self.id, err);
        })?;
        inner.flags.playing = false;
        inner.flags.paused = false;
        inner.flags.changing = true;
        inner.drained = false;
        inner.collect_processed(self.id);
        if inner.mode == SourceMode::Stream {
            inner.force_drain(self.id);
        }
        Ok(())
    }

    /// Sets the source's own volume (clamped to be non-negative).
    pub fn set_volume(&self, volume: f32) {
        let mut inner = self.inner.lock();
        inner.volume = volume.max(0.0);
        inner.apply_gain(&self.groups);
    }

    /// Returns the source's own volume.
    pub fn volume(&self) -> f32 {
        self.inner.lock().volume
    }

    /// Moves the source to audio group `group`.
    pub fn set_group(&self, group: usize) {
        let mut inner = self.inner.lock();
        inner.group = group;
        inner.apply_gain(&self.groups);
    }

    /// Returns the source's audio group.
    pub fn group(&self) -> usize {
        self.inner.lock().group
    }

    /// Loops a static buffer instead of completing it.
    pub fn set_repeat(&self, repeat: bool) {
        let mut inner = self.inner.lock();
        inner.flags.repeat = repeat;
        inner.voice.set_looping(repeat);
    }

    /// Returns `true` while playing and not paused.
    pub fn is_playing(&self) -> bool {
        self.inner.lock().flags.is_playing()
    }

    /// Returns `true` while armed but paused.
    pub fn is_paused(&self) -> bool {
        self.inner.lock().flags.is_paused()
    }

    /// Returns `true` if a static buffer loops.
    pub fn is_repeat(&self) -> bool {
        self.inner.lock().flags.repeat
    }

    /// Returns `true` until the backend confirms the last transport change.
    pub fn is_changing(&self) -> bool {
        self.inner.lock().flags.changing
    }

    /// Returns a snapshot of all state flags.
    pub fn flags(&self) -> SourceFlags {
        self.inner.lock().flags
    }

    /// Returns whether the source is static, streaming, or not yet decided.
    pub fn mode(&self) -> SourceMode {
        self.inner.lock().mode
    }

    /// The format locked in by the first buffer.
    pub fn format(&self) -> Option<AudioFormat> {
        self.inner.lock().format
    }

    /// Returns a snapshot of the traffic counters.
    pub fn stats(&self) -> SourceStats {
        let inner = self.inner.lock();
        SourceStats {
            reuse_pool_size: inner.queues.reuse.len(),
            ..inner.stats
        }
    }

    /// Re-applies volume after the source's group changed.
    pub(crate) fn refresh_gain(&self) {
        self.inner.lock().apply_gain(&self.groups);
    }

    /// Marks the source for teardown and stops the backend.
    pub(crate) fn release(&self, closing: bool) {
        let mut inner = self.inner.lock();
        if closing {
            inner.flags.closing = true;
        } else {
            inner.flags.orphan = true;
        }
        if inner.flags.playing || inner.voice.state() != VoiceState::Stopped {
            if let Err(err) = inner.voice.stop() {
                tracing::error!("source {}: stop on release failed: {}", self.id, err);
            }
            inner.flags.playing = false;
            inner.flags.paused = false;
            inner.flags.changing = true;
        }
    }

    /// Collects consumed buffers, updates state from the backend, and runs
    /// the callback with everything consumed since the last pass.
    pub(crate) fn service(&self) -> ServiceReport {
        let mut report = ServiceReport::default();
        let batch = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            inner.collect_processed(self.id);
            let state = inner.voice.state();
            if inner.flags.changing
                && confirms(inner.flags.target(), state, inner.queues.pend.is_empty())
            {
                inner.flags.changing = false;
            }

            if inner.flags.is_releasing() {
                if state == VoiceState::Stopped {
                    if inner.mode == SourceMode::Stream {
                        inner.force_drain(self.id);
                    }
                    report.released = true;
                }
            } else if !inner.flags.changing
                && inner.flags.is_playing()
                && state == VoiceState::Stopped
            {
                inner.on_backend_stopped(self.id, &mut report);
            }

            let delivered = inner.stage_notifications();
            inner.stats.buffers_notified += delivered as u64;
            if report.released {
                inner.return_static();
                inner.release_native();
            }
            inner.batch_lent = true;
            inner.batch.take()
        };

        if !batch.is_empty() {
            let callback = self.callback.read().clone();
            if let Some(callback) = callback {
                callback(self, batch.as_slice());
            }
        }

        let mut inner = self.inner.lock();
        inner.batch.restore(batch);
        inner.batch_lent = false;
        let capacity = inner.batch_capacity;
        if let Err(err) = inner.batch.reserve(capacity) {
            tracing::warn!("source {}: notify batch cannot grow: {}", self.id, err);
        }
        report
    }
}

impl SourceInner {
    fn check_open(&self) -> Result<(), EngineError> {
        if self.flags.is_releasing() {
            return Err(EngineError::invalid_state("source is being released"));
        }
        Ok(())
    }

    /// Validates `format` against the locked-in one and returns the format
    /// the voice wants. Mutates nothing.
    fn admit(&self, id: StreamId, format: &AudioFormat) -> Result<AudioFormat, EngineError> {
        match self.format {
            Some(expected) if expected != *format => {
                tracing::warn!(
                    "source {}: rejected buffer in {} (stream format is {})",
                    id,
                    format,
                    expected
                );
                return Err(EngineError::FormatMismatch {
                    expected,
                    actual: *format,
                });
            }
            Some(_) => {}
            None if !format.is_supported() => return Err(EngineError::unsupported(format)),
            None => {}
        }
        Ok(self.native_format.unwrap_or_else(|| self.voice.native_format(format)))
    }

    fn lock_format(&mut self, format: AudioFormat, native: AudioFormat) {
        if self.format.is_none() {
            self.format = Some(format);
            self.native_format = Some(native);
        }
    }

    /// Reserves queue room, takes a native handle and uploads `buffer` into
    /// it (converted to `native` if needed). On error the handle, if any,
    /// goes to the reuse pool.
    fn stage(&mut self, buffer: &PcmBuffer, native: &AudioFormat) -> Result<NativeBuffer, EngineError> {
        let needed = self.queues.total() + usize::from(self.queues.reuse.is_empty());
        self.queues.prepare_for_sz(needed)?;
        // While the batch is out with the callback, growth waits for its return.
        self.batch_capacity = self.batch_capacity.max(self.queues.high_water());
        if !self.batch_lent {
            self.batch.reserve(self.batch_capacity)?;
        }

        let handle = match self.queues.reuse.pop_orphaning().and_then(|pair| pair.native) {
            Some(handle) => handle,
            None => {
                let handle = self.voice.alloc_buffer()?;
                tracing::debug!("allocated native buffer {:?}", handle);
                handle
            }
        };

        if let Err(err) = self.upload(buffer, native, handle) {
            self.park(handle);
            tracing::error!("upload to {:?} failed: {}", handle, err);
            return Err(err);
        }
        Ok(handle)
    }

    fn upload(
        &mut self,
        buffer: &PcmBuffer,
        native: &AudioFormat,
        handle: NativeBuffer,
    ) -> Result<(), EngineError> {
        let format = buffer.format();
        if native == format {
            return self.voice.upload(handle, native, buffer.bytes());
        }

        self.converter.prepare(format, native)?;
        let blocks = blocks_for_new_frequency(
            buffer.blocks_used(),
            format.sample_rate(),
            native.sample_rate(),
        );
        let bytes = native.blocks_to_bytes(blocks);
        if self.scratch.len() < bytes {
            self.scratch.try_reserve_exact(bytes - self.scratch.len())?;
            self.scratch.resize(bytes, 0);
        }
        let done = self
            .converter
            .convert_all(buffer.bytes(), &mut self.scratch[..bytes]);
        let written = native.blocks_to_bytes(done.blocks_written);
        self.voice.upload(handle, native, &self.scratch[..written])
    }

    /// Returns an unbound handle to the reuse pool, freeing it if the pool
    /// has no room.
    fn park(&mut self, handle: NativeBuffer) {
        if let Err(pair) = self.queues.reuse.push_owning(QueuePair::unbound(handle)) {
            debug_assert!(false, "reuse pool smaller than handle count");
            if let Some(handle) = pair.native {
                self.voice.free_buffer(handle);
            }
        }
    }

    fn push_pending(&mut self, pair: QueuePair) -> Result<(), EngineError> {
        self.queues
            .pend
            .push_owning(pair)
            .map_err(|_| EngineError::invalid_state("pending queue not reserved"))?;
        self.stats.buffers_queued += 1;
        self.stats.max_pend_depth = self.stats.max_pend_depth.max(self.queues.pend.len());
        Ok(())
    }

    /// Moves every buffer the backend finished with from `pend` to `notify`.
    fn collect_processed(&mut self, id: StreamId) {
        while let Some(handle) = self.voice.unqueue_processed() {
            let expected = self
                .queues
                .pend
                .front()
                .is_some_and(|pair| pair.native == Some(handle));
            if !expected || !self.retire_front(id) {
                tracing::warn!("source {}: backend returned unexpected {:?}", id, handle);
            }
        }
    }

    fn force_drain(&mut self, id: StreamId) {
        while self.retire_front(id) {}
    }

    /// Moves the oldest pending buffer to `notify`, returning its native
    /// handle to the reuse pool at once so a buffer queued before the next
    /// tick never needs a fresh handle.
    fn retire_front(&mut self, id: StreamId) -> bool {
        let Some(mut pair) = self.queues.pend.pop_orphaning() else {
            return false;
        };
        if let Some(handle) = pair.native.take() {
            self.park(handle);
        }
        if self.queues.notify.push_owning(pair).is_err() {
            debug_assert!(false, "notify queue smaller than buffer count");
            tracing::warn!("source {}: notify queue full, buffer dropped", id);
        }
        true
    }

    /// Hands a static buffer back on release unless completion already did.
    fn return_static(&mut self) {
        if self.mode != SourceMode::Static || self.static_returned {
            return;
        }
        let buffer = self
            .queues
            .pend
            .front()
            .and_then(|pair| pair.original.clone());
        if let Some(buffer) = buffer {
            if self.batch.push(buffer).is_ok() {
                self.stats.buffers_notified += 1;
                self.static_returned = true;
            }
        }
    }

    /// The backend stopped while the source is meant to be playing.
    fn on_backend_stopped(&mut self, id: StreamId, report: &mut ServiceReport) {
        match self.mode {
            SourceMode::Static if !self.flags.repeat => {
                let buffer = self
                    .queues
                    .pend
                    .front()
                    .and_then(|pair| pair.original.clone());
                if let Some(buffer) = buffer {
                    if self.batch.push(buffer).is_ok() {
                        self.stats.buffers_notified += 1;
                        self.static_returned = true;
                    }
                }
                self.flags.paused = true;
                if let Err(err) = self.voice.set_offset_bytes(0) {
                    report.backend_error = Some(err);
                }
                report.static_completed = true;
            }
            SourceMode::Stream if self.queues.pend.is_empty() => {
                if !self.drained {
                    self.drained = true;
                    report.drained = true;
                }
            }
            SourceMode::Stream => {
                tracing::debug!("source {}: backend underran, restarting", id);
                if let Err(err) = self.voice.play() {
                    tracing::error!("source {}: restart failed: {}", id, err);
                    report.backend_error = Some(err);
                }
            }
            _ => {}
        }
    }

    /// Moves consumed buffers into the batch. Stops early if the batch is
    /// full; the rest waits for the next pass.
    fn stage_notifications(&mut self) -> usize {
        let mut delivered = 0;
        while !self.queues.notify.is_empty() && !self.batch.is_full() {
            let Some(mut pair) = self.queues.notify.pop_orphaning() else {
                break;
            };
            if let Some(original) = pair.original.take() {
                if self.batch.push(original).is_ok() {
                    delivered += 1;
                }
            }
            if let Some(handle) = pair.native {
                self.park(handle);
            }
        }
        delivered
    }

    fn release_native(&mut self) {
        if let Err(err) = self.voice.set_static_buffer(None) {
            tracing::warn!("detaching static buffer failed: {}", err);
        }
        let queues = &mut self.queues;
        for queue in [&mut queues.pend, &mut queues.notify, &mut queues.reuse] {
            while let Some(pair) = queue.pop_orphaning() {
                if let Some(handle) = pair.native {
                    self.voice.free_buffer(handle);
                }
            }
        }
    }

    fn apply_gain(&mut self, groups: &AudioGroups) {
        let gain = groups.effective_gain(self.group, self.volume);
        self.voice.set_volume(gain);
    }
}

/// Returns `true` if backend `state` satisfies a request for `target`.
fn confirms(target: VoiceState, state: VoiceState, nothing_pending: bool) -> bool {
    match target {
        VoiceState::Playing => {
            state == VoiceState::Playing || (state == VoiceState::Stopped && nothing_pending)
        }
        VoiceState::Paused => state != VoiceState::Playing,
        VoiceState::Stopped => state == VoiceState::Stopped,
    }
}

fn rescale(blocks: usize, from_rate: u32, to_rate: u32) -> usize {
    if from_rate == to_rate || from_rate == 0 {
        return blocks;
    }
    let scaled = blocks as u64 * u64::from(to_rate) / u64::from(from_rate);
    usize::try_from(scaled).unwrap_or(usize::MAX)
}

/// The user's reference to a [`Source`].
///
/// Dropping the handle orphans the source: the engine stops it, keeps it
/// until the backend confirms it has stopped, delivers the last
/// notifications and then releases it. A static buffer that has not already
/// come back through completion is among them. [`free`](Self::free) does the
/// same explicitly.
pub struct SourceHandle {
    source: Arc<Source>,
}

impl SourceHandle {
    pub(crate) fn new(source: Arc<Source>) -> Self {
        Self { source }
    }

    /// Stops the source and hands it to the engine for teardown.
    pub fn free(self) {
        self.source.release(true);
    }
}

impl Deref for SourceHandle {
    type Target = Source;

    fn deref(&self) -> &Source {
        &self.source
    }
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.source, f)
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.source.release(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MockBackend, MockVoice};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn source_with(backend: &MockBackend) -> (Arc<Source>, MockVoice) {
        let voice = backend.create_voice().unwrap();
        let source = Arc::new(Source::new(
            StreamId::new(1),
            voice,
            Arc::new(AudioGroups::new(2)),
            4,
        ));
        let control = backend.voice(backend.voice_count() - 1).unwrap();
        (source, control)
    }

    fn buffer(format: AudioFormat, blocks: usize) -> SharedBuffer {
        let bytes = vec![0u8; format.blocks_to_bytes(blocks)];
        Arc::new(PcmBuffer::with_data(format, &bytes).unwrap())
    }

    fn counting(source: &Source) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        source.set_callback(move |_, buffers| {
            seen.fetch_add(buffers.len(), Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn test_first_buffer_locks_format() {
        let backend = MockBackend::new();
        let (source, _) = source_with(&backend);
        let format = AudioFormat::i16(1, 22050);
        source.queue_buffer(buffer(format, 10)).unwrap();
        assert_eq!(source.format(), Some(format));
        assert_eq!(source.mode(), SourceMode::Stream);

        let other = AudioFormat::i16(1, 22051);
        let err = source.queue_buffer(buffer(other, 10)).unwrap_err();
        assert!(matches!(err, EngineError::FormatMismatch { .. }));
        assert_eq!(source.get_buffers_count(), 1);
        assert_eq!(source.stats().buffers_queued, 1);
    }

    #[test]
    fn test_unsupported_first_buffer_is_rejected() {
        let backend = MockBackend::new();
        let (source, _) = source_with(&backend);
        let format = AudioFormat::i16(3, 8000);
        let err = source.queue_buffer(buffer(format, 4)).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedFormat { .. }));
        assert_eq!(source.mode(), SourceMode::Undetermined);
        assert_eq!(source.format(), None);
    }

    #[test]
    fn test_static_and_stream_exclusive() {
        let backend = MockBackend::new();
        let (source, _) = source_with(&backend);
        let format = AudioFormat::u8(1, 8000);
        source.queue_buffer(buffer(format, 4)).unwrap();
        assert!(source.set_buffer(buffer(format, 4)).is_err());

        let (source, _) = source_with(&backend);
        source.set_buffer(buffer(format, 4)).unwrap();
        assert!(matches!(
            source.queue_buffer(buffer(format, 4)),
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_consumed_buffers_reach_callback_in_order() {
        let backend = MockBackend::new();
        let (source, voice) = source_with(&backend);
        let format = AudioFormat::i16(1, 8000);
        let queued: Vec<_> = (0..3).map(|_| buffer(format, 8)).collect();
        for b in &queued {
            source.queue_buffer(b.clone()).unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        source.set_callback(move |_, buffers| {
            sink.lock().extend(buffers.iter().cloned());
        });

        source.play().unwrap();
        voice.complete_buffers(2);
        source.service();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(Arc::ptr_eq(&seen[0], &queued[0]));
        assert!(Arc::ptr_eq(&seen[1], &queued[1]));
        assert_eq!(source.get_buffers_count(), 1);
    }

    #[test]
    fn test_handles_are_reused() {
        let backend = MockBackend::new();
        let (source, voice) = source_with(&backend);
        let format = AudioFormat::i16(1, 8000);
        source.play().unwrap();
        for _ in 0..10 {
            source.queue_buffer(buffer(format, 8)).unwrap();
            source.queue_buffer(buffer(format, 8)).unwrap();
            voice.complete_buffers(2);
            source.service();
        }
        assert_eq!(voice.live_buffers(), 2);
        let stats = source.stats();
        assert_eq!(stats.max_pend_depth, 2);
        assert_eq!(stats.reuse_pool_size, 2);
        assert_eq!(stats.buffers_notified, 20);
    }

    #[test]
    fn test_stop_notifies_everything_pending() {
        let backend = MockBackend::new();
        let (source, _) = source_with(&backend);
        let count = counting(&source);
        let format = AudioFormat::i16(2, 48000);
        for _ in 0..4 {
            source.queue_buffer(buffer(format, 16)).unwrap();
        }
        source.play().unwrap();
        source.stop().unwrap();
        assert_eq!(source.get_buffers_count(), 0);
        assert!(!source.is_playing());

        source.service();
        assert_eq!(count.load(Ordering::SeqCst), 4);
        assert!(!source.is_changing());
    }

    #[test]
    fn test_drained_stream_restarts_on_queue() {
        let backend = MockBackend::new();
        let (source, voice) = source_with(&backend);
        let format = AudioFormat::i16(1, 8000);
        source.queue_buffer(buffer(format, 8)).unwrap();
        source.play().unwrap();
        voice.complete_buffers(1);

        let report = source.service();
        assert!(report.drained);
        assert!(source.is_playing());
        assert_eq!(voice.voice_state(), VoiceState::Stopped);
        assert!(!source.service().drained);

        source.queue_buffer(buffer(format, 8)).unwrap();
        assert_eq!(voice.voice_state(), VoiceState::Playing);
    }

    #[test]
    fn test_static_completion_pauses_and_notifies_once() {
        let backend = MockBackend::new();
        let (source, voice) = source_with(&backend);
        let count = counting(&source);
        let format = AudioFormat::u8(1, 8000);
        source.set_buffer(buffer(format, 100)).unwrap();
        source.play().unwrap();
        source.service();
        assert!(!source.is_changing());

        voice.finish();
        let report = source.service();
        assert!(report.static_completed);
        assert!(source.is_paused());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(source.get_buffers_count(), 1);

        source.service();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_repeating_static_never_completes() {
        let backend = MockBackend::new();
        let (source, voice) = source_with(&backend);
        source.set_repeat(true);
        source.set_buffer(buffer(AudioFormat::u8(1, 8000), 10)).unwrap();
        assert!(voice.is_looping());
        source.play().unwrap();
        voice.finish();
        assert!(!source.service().static_completed);
        assert!(source.is_playing());
    }

    #[test]
    fn test_conversion_to_voice_format() {
        let backend = MockBackend::new().with_voice_format(AudioFormat::f32(2, 16000));
        let (source, voice) = source_with(&backend);
        let format = AudioFormat::i16(1, 8000);
        let samples: Vec<u8> = [16384i16; 100]
            .iter()
            .flat_map(|s| s.to_ne_bytes())
            .collect();
        source
            .queue_buffer(Arc::new(PcmBuffer::with_data(format, &samples).unwrap()))
            .unwrap();

        let handle = voice.queued_handles()[0];
        let (uploaded_format, bytes) = voice.uploaded(handle).unwrap();
        assert_eq!(uploaded_format, AudioFormat::f32(2, 16000));
        let blocks = uploaded_format.bytes_to_blocks(bytes.len());
        assert!((100..=202).contains(&blocks), "{blocks} blocks");
        let first = f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(first, 0.5);
    }

    #[test]
    fn test_upload_failure_leaves_source_unchanged() {
        let backend = MockBackend::new();
        let (source, voice) = source_with(&backend);
        voice.fail_uploads(true);
        let result = source.queue_buffer(buffer(AudioFormat::i16(1, 8000), 4));
        assert!(matches!(result, Err(EngineError::BackendError(_))));
        assert_eq!(source.mode(), SourceMode::Undetermined);
        assert_eq!(source.get_buffers_count(), 0);
        assert_eq!(source.stats().reuse_pool_size, 1);

        voice.fail_uploads(false);
        source.queue_buffer(buffer(AudioFormat::i16(1, 8000), 4)).unwrap();
        assert_eq!(voice.live_buffers(), 1);
    }

    #[test]
    fn test_buffer_offset_in_first_buffer() {
        let backend = MockBackend::new();
        let (source, _) = source_with(&backend);
        assert!(source.set_buffer_offset(OffsetUnit::Blocks, 1).is_err());

        let format = AudioFormat::i16(2, 16000);
        source.queue_buffer(buffer(format, 1600)).unwrap();
        source.set_buffer_offset(OffsetUnit::Millis, 50).unwrap();
        assert_eq!(source.get_blocks_offset(), 800);

        source.set_buffer_offset(OffsetUnit::Bytes, 403).unwrap();
        assert_eq!(source.get_blocks_offset(), 100);

        source.set_buffer_offset(OffsetUnit::Blocks, 99_999).unwrap();
        assert_eq!(source.get_blocks_offset(), 1600);
    }

    #[test]
    fn test_volume_and_group_gain() {
        let backend = MockBackend::new();
        let voice = backend.create_voice().unwrap();
        let groups = Arc::new(AudioGroups::new(2));
        let source = Source::new(StreamId::new(9), voice, groups.clone(), 4);
        let control = backend.voice(0).unwrap();

        source.set_volume(0.5);
        assert_eq!(control.volume(), 0.5);

        groups.set_volume(1, 0.5);
        source.set_group(1);
        assert_eq!(control.volume(), 0.25);

        groups.set_enabled(1, false);
        source.refresh_gain();
        assert_eq!(control.volume(), 0.0);
    }

    #[test]
    fn test_callback_may_requeue() {
        let backend = MockBackend::new();
        let (source, voice) = source_with(&backend);
        let format = AudioFormat::i16(1, 8000);
        source.set_callback(|source, buffers| {
            for b in buffers {
                source.queue_buffer(b.clone()).unwrap();
            }
        });
        source.queue_buffer(buffer(format, 8)).unwrap();
        source.play().unwrap();
        voice.complete_buffers(1);
        source.service();
        assert_eq!(source.get_buffers_count(), 1);
        assert_eq!(voice.live_buffers(), 1);
    }

    #[test]
    fn test_orphan_released_after_backend_stops() {
        let backend = MockBackend::new();
        let (source, voice) = source_with(&backend);
        let count = counting(&source);
        let format = AudioFormat::i16(1, 8000);
        source.queue_buffer(buffer(format, 8)).unwrap();
        source.queue_buffer(buffer(format, 8)).unwrap();
        source.play().unwrap();

        let handle = SourceHandle::new(source.clone());
        drop(handle);
        assert!(source.flags().orphan);
        assert!(source.queue_buffer(buffer(format, 8)).is_err());

        let report = source.service();
        assert!(report.released);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(voice.live_buffers(), 0);
        assert_eq!(voice.freed_buffers(), 2);
    }

    #[test]
    fn test_queue_after_stop_reuses_detached_handles() {
        let backend = MockBackend::new();
        let (source, voice) = source_with(&backend);
        let count = counting(&source);
        let format = AudioFormat::i16(1, 8000);
        source.queue_buffer(buffer(format, 8)).unwrap();
        source.queue_buffer(buffer(format, 8)).unwrap();
        source.play().unwrap();
        source.stop().unwrap();
        assert_eq!(source.stats().reuse_pool_size, 2);

        source.queue_buffer(buffer(format, 8)).unwrap();
        source.play().unwrap();
        source.service();
        voice.complete_buffers(1);
        source.service();

        let stats = source.stats();
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(voice.live_buffers(), 2);
        assert_eq!(stats.max_pend_depth, 2);
        assert!(stats.reuse_pool_size <= stats.max_pend_depth);
    }

    #[test]
    fn test_requeue_from_callback_keeps_batch_storage() {
        let backend = MockBackend::new();
        let (source, voice) = source_with(&backend);
        let lent = Arc::new(Mutex::new(Vec::new()));
        let sink = lent.clone();
        source.set_callback(move |source, buffers| {
            let before = source.inner.lock().batch.capacity();
            for b in buffers {
                source.queue_buffer(b.clone()).unwrap();
            }
            let after = source.inner.lock().batch.capacity();
            sink.lock().push((before, after));
        });
        source.queue_buffer(buffer(AudioFormat::i16(1, 8000), 8)).unwrap();
        source.play().unwrap();

        let mut storage = Vec::new();
        for _ in 0..3 {
            voice.complete_buffers(1);
            source.service();
            let inner = source.inner.lock();
            storage.push((inner.batch.capacity(), inner.batch.as_slice().as_ptr()));
        }

        assert_eq!(*lent.lock(), vec![(0, 0); 3]);
        assert_eq!(storage[0].0, 4);
        assert!(storage.iter().all(|entry| *entry == storage[0]));
        assert_eq!(source.get_buffers_count(), 1);
    }

    #[test]
    fn test_released_static_buffer_is_returned() {
        let backend = MockBackend::new();
        let (source, voice) = source_with(&backend);
        let count = counting(&source);
        source.set_buffer(buffer(AudioFormat::u8(1, 8000), 10)).unwrap();
        source.play().unwrap();
        source.service();

        drop(SourceHandle::new(source.clone()));
        let report = source.service();
        assert!(report.released);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(voice.static_buffer(), None);
        assert_eq!(voice.live_buffers(), 0);
    }

    #[test]
    fn test_completed_static_buffer_is_not_returned_twice() {
        let backend = MockBackend::new();
        let (source, voice) = source_with(&backend);
        let count = counting(&source);
        source.set_buffer(buffer(AudioFormat::u8(1, 8000), 10)).unwrap();
        source.play().unwrap();
        source.service();
        voice.finish();
        assert!(source.service().static_completed);

        SourceHandle::new(source.clone()).free();
        assert!(source.service().released);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(source.stats().buffers_notified, 1);
    }
}
