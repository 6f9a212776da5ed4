//! Capture recorders.
//!
//! A [`Recorder`] owns a fixed set of [`PcmBuffer`]s. The head of its reuse
//! queue is the buffer being filled: raw device data is converted into it
//! block by block until it is full, then it moves to the notify queue and the
//! next free buffer takes over. Filled buffers are handed to the callback
//! outside the recorder lock and recycled afterwards.
//!
//! When every buffer is full and waiting for delivery, new input is dropped
//! and counted rather than buffered.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::backend::CaptureDevice;
use crate::buffer::PcmBuffer;
use crate::format::{blocks_for_new_frequency, AudioFormat, Converter};
use crate::pipeline::{BufferQueue, NotifyBatch};
use crate::source::StreamId;
use crate::EngineError;

/// Callback receiving one filled buffer: its format, valid bytes and block
/// count.
pub type RecorderCallback = Arc<dyn Fn(&Recorder, &AudioFormat, &[u8], usize) + Send + Sync>;

/// Counters describing a recorder's traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderStats {
    /// Buffers that were filled (or flushed partially filled).
    pub buffers_filled: u64,
    /// Buffers handed to the callback.
    pub buffers_delivered: u64,
    /// Buffers recycled without delivery.
    pub buffers_discarded: u64,
    /// Input blocks dropped because no buffer was free.
    pub dropped_blocks: u64,
}

/// What one service pass observed.
#[derive(Debug, Default)]
pub(crate) struct RecorderReport {
    pub dropped_blocks: usize,
    pub released: bool,
    pub backend_error: Option<EngineError>,
}

struct RecorderInner {
    device: Box<dyn CaptureDevice>,
    native_format: AudioFormat,
    converter: Converter,
    reuse: BufferQueue<PcmBuffer>,
    notify: BufferQueue<PcmBuffer>,
    batch: NotifyBatch<PcmBuffer>,
    cur_sample: usize,
    scratch: Vec<u8>,
    carry: usize,
    capturing: bool,
    closing: bool,
    orphan: bool,
    dropped_since_tick: usize,
    stats: RecorderStats,
}

/// A capture stream delivering fixed-size buffers in the requested format.
///
/// Obtained from [`Engine::alloc_recorder`](crate::Engine::alloc_recorder)
/// as a [`RecorderHandle`].
pub struct Recorder {
    id: StreamId,
    format: AudioFormat,
    blocks_per_buffer: usize,
    buffer_count: usize,
    callback: RwLock<Option<RecorderCallback>>,
    inner: Mutex<RecorderInner>,
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("id", &self.id)
            .field("format", &self.format)
            .field("buffer_count", &self.buffer_count)
            .field("blocks_per_buffer", &self.blocks_per_buffer)
            .finish_non_exhaustive()
    }
}

impl Recorder {
    pub(crate) fn new(
        id: StreamId,
        device: Box<dyn CaptureDevice>,
        format: AudioFormat,
        buffer_count: usize,
        blocks_per_buffer: usize,
    ) -> Result<Self, EngineError> {
        if !format.is_supported() {
            return Err(EngineError::unsupported(&format));
        }
        if buffer_count == 0 || blocks_per_buffer == 0 {
            return Err(EngineError::invalid_state(
                "recorder needs at least one block of storage",
            ));
        }

        let native_format = device.native_format();
        let mut converter = Converter::new();
        converter.prepare(&native_format, &format)?;

        let mut reuse = BufferQueue::new();
        let mut notify = BufferQueue::new();
        reuse.prepare_for_sz(buffer_count)?;
        notify.prepare_for_sz(buffer_count)?;
        let mut batch = NotifyBatch::default();
        batch.reserve(buffer_count)?;
        for _ in 0..buffer_count {
            let buffer = PcmBuffer::new(format, blocks_per_buffer)?;
            if reuse.push_owning(buffer).is_err() {
                return Err(EngineError::invalid_state("reuse queue not reserved"));
            }
        }

        // Room for one buffer's worth of device input plus a partial block.
        let native_blocks = blocks_for_new_frequency(
            blocks_per_buffer,
            format.sample_rate(),
            native_format.sample_rate(),
        );
        let scratch_bytes = native_format.blocks_to_bytes(native_blocks.max(1) + 1);
        let mut scratch = Vec::new();
        scratch
            .try_reserve_exact(scratch_bytes)
            .map_err(|_| EngineError::AllocationFailure { bytes: scratch_bytes })?;
        scratch.resize(scratch_bytes, 0);

        Ok(Self {
            id,
            format,
            blocks_per_buffer,
            buffer_count,
            callback: RwLock::new(None),
            inner: Mutex::new(RecorderInner {
                device,
                native_format,
                converter,
                reuse,
                notify,
                batch,
                cur_sample: 0,
                scratch,
                carry: 0,
                capturing: false,
                closing: false,
                orphan: false,
                dropped_since_tick: 0,
                stats: RecorderStats::default(),
            }),
        })
    }

    /// Returns the recorder's id.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Format of the delivered buffers.
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Format the device captures in.
    pub fn native_format(&self) -> AudioFormat {
        self.inner.lock().native_format
    }

    /// Capacity of each buffer in blocks.
    pub fn blocks_per_buffer(&self) -> usize {
        self.blocks_per_buffer
    }

    /// Number of buffers the recorder cycles through.
    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    /// Installs the callback receiving filled buffers.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&Recorder, &AudioFormat, &[u8], usize) + Send + Sync + 'static,
    {
        *self.callback.write() = Some(Arc::new(callback));
    }

    /// Removes the callback. Filled buffers are then recycled silently.
    pub fn clear_callback(&self) {
        *self.callback.write() = None;
    }

    /// Starts the capture device.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] for a releasing recorder, or the
    /// device's error.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if inner.closing || inner.orphan {
            return Err(EngineError::invalid_state("recorder is being released"));
        }
        if inner.capturing {
            return Ok(());
        }
        inner.device.start().inspect_err(|err| {
            tracing::error!("recorder {}: start failed: {}", self.id, err);
        })?;
        inner.capturing = true;
        Ok(())
    }

    /// Stops the capture device. Input already captured is still consumed
    /// on the next tick; call [`flush`](Self::flush) to deliver a partially
    /// filled buffer.
    ///
    /// # Errors
    ///
    /// Returns the device's error.
    pub fn stop(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if !inner.capturing {
            return Ok(());
        }
        inner.device.stop().inspect_err(|err| {
            tracing::error!("recorder {}: stop failed: {}", self.id, err);
        })?;
        inner.capturing = false;
        Ok(())
    }

    /// Returns `true` between `start` and `stop`.
    pub fn is_capturing(&self) -> bool {
        self.inner.lock().capturing
    }

    /// Number of full buffers waiting for delivery.
    pub fn get_buffers_filled_count(&self) -> usize {
        self.inner.lock().notify.len()
    }

    /// Blocks written into the buffer currently being filled.
    pub fn get_blocks_filled(&self) -> usize {
        self.inner.lock().cur_sample
    }

    /// Returns a snapshot of the traffic counters.
    pub fn stats(&self) -> RecorderStats {
        self.inner.lock().stats
    }

    /// Converts raw device-format bytes into the recorder's buffers.
    ///
    /// A trailing partial block is ignored. Input that finds no free buffer
    /// is dropped and counted. Never allocates. Returns the number of input
    /// blocks consumed.
    pub fn consume_input_buffer(&self, data: &[u8]) -> usize {
        self.inner.lock().consume(data)
    }

    /// Delivers filled buffers now.
    ///
    /// Pending device input is consumed first. With `include_partial` the
    /// buffer being filled is delivered too, holding only what it has. With
    /// `discard` everything is recycled without calling the callback.
    /// Returns the number of buffers delivered or discarded.
    pub fn flush(&self, include_partial: bool, discard: bool) -> usize {
        {
            let mut inner = self.inner.lock();
            inner.pump();
            if include_partial {
                inner.close_partial();
            }
        }
        self.notify_buffers(discard)
    }

    /// Hands every filled buffer to the callback (or drops them with
    /// `discard`) and recycles them. The callback runs without the recorder
    /// lock held. Returns the number of buffers handled.
    pub fn notify_buffers(&self, discard: bool) -> usize {
        let mut batch = {
            let mut inner = self.inner.lock();
            let inner = &mut *inner;
            while !inner.batch.is_full() {
                let Some(buffer) = inner.notify.pop_orphaning() else {
                    break;
                };
                if let Err(buffer) = inner.batch.push(buffer) {
                    debug_assert!(false, "notify batch smaller than buffer count");
                    if inner.reuse.push_owning(buffer).is_err() {
                        tracing::warn!(
                            "recorder {}: no room to recycle buffer, dropped",
                            self.id
                        );
                    }
                }
            }
            inner.batch.take()
        };
        let handled = batch.len();
        if handled == 0 {
            self.inner.lock().batch.restore(batch);
            return 0;
        }

        let callback = if discard {
            None
        } else {
            self.callback.read().clone()
        };
        if let Some(callback) = &callback {
            for buffer in batch.as_slice() {
                callback(self, buffer.format(), buffer.bytes(), buffer.blocks_used());
            }
        }

        let mut inner = self.inner.lock();
        if callback.is_some() {
            inner.stats.buffers_delivered += handled as u64;
        } else {
            inner.stats.buffers_discarded += handled as u64;
        }
        for buffer in batch.drain() {
            if inner.reuse.push_owning(buffer).is_err() {
                debug_assert!(false, "reuse queue smaller than buffer count");
                tracing::warn!("recorder {}: no room to recycle buffer, dropped", self.id);
            }
        }
        inner.batch.restore(batch);
        handled
    }

    /// Marks the recorder for teardown and stops the device.
    pub(crate) fn release(&self, closing: bool) {
        let mut inner = self.inner.lock();
        if closing {
            inner.closing = true;
        } else {
            inner.orphan = true;
        }
        if inner.capturing {
            if let Err(err) = inner.device.stop() {
                tracing::error!("recorder {}: stop on release failed: {}", self.id, err);
            }
            inner.capturing = false;
        }
    }

    /// Pulls device input, delivers filled buffers, and reports overruns.
    pub(crate) fn service(&self) -> RecorderReport {
        let mut report = RecorderReport::default();
        let releasing = {
            let mut inner = self.inner.lock();
            inner.pump();
            report.dropped_blocks = std::mem::take(&mut inner.dropped_since_tick);
            let releasing = inner.closing || inner.orphan;
            if releasing {
                inner.close_partial();
            }
            releasing
        };
        if report.dropped_blocks > 0 {
            tracing::warn!(
                "recorder {}: no free buffer, dropped {} blocks",
                self.id,
                report.dropped_blocks
            );
        }

        self.notify_buffers(false);

        if releasing {
            let mut inner = self.inner.lock();
            if let Err(err) = inner.device.stop() {
                report.backend_error = Some(err);
            }
            inner.reuse.clear();
            inner.notify.clear();
            report.released = true;
        }
        report
    }
}

impl RecorderInner {
    fn consume(&mut self, data: &[u8]) -> usize {
        let total = self.native_format.bytes_to_blocks(data.len());
        let input = &data[..self.native_format.blocks_to_bytes(total)];
        let mut read = 0;

        while read < total {
            let Some(head) = self.reuse.front_mut() else {
                break;
            };
            if self.cur_sample == 0 {
                head.set_used(0);
            }
            let format = *head.format();
            let filled = format.blocks_to_bytes(self.cur_sample);
            let src = &input[self.native_format.blocks_to_bytes(read)..];
            let done = self
                .converter
                .convert_all(src, &mut head.storage_mut()[filled..]);

            read += done.blocks_read;
            self.cur_sample += done.blocks_written;
            head.set_used(format.blocks_to_bytes(self.cur_sample));

            if self.cur_sample >= head.blocks_capacity() {
                self.close_partial();
            } else if done.is_stalled() {
                break;
            }
        }

        let dropped = total - read;
        if dropped > 0 {
            self.dropped_since_tick += dropped;
            self.stats.dropped_blocks += dropped as u64;
        }
        read
    }

    /// Moves the buffer being filled to the notify queue if it holds data.
    fn close_partial(&mut self) {
        if self.cur_sample == 0 {
            return;
        }
        if self.reuse.pop_moving_to(&mut self.notify) {
            self.stats.buffers_filled += 1;
            self.cur_sample = 0;
        }
    }

    /// Reads everything the device has captured and consumes it.
    fn pump(&mut self) {
        let mut scratch = std::mem::take(&mut self.scratch);
        let align = self.native_format.block_align().max(1);
        loop {
            let n = self.device.read_available(&mut scratch[self.carry..]);
            if n == 0 {
                break;
            }
            let available = self.carry + n;
            let whole = available - available % align;
            self.consume(&scratch[..whole]);
            scratch.copy_within(whole..available, 0);
            self.carry = available - whole;
        }
        self.scratch = scratch;

        let lost = self.device.take_dropped_blocks();
        if lost > 0 {
            self.dropped_since_tick += lost;
            self.stats.dropped_blocks += lost as u64;
        }
    }
}

/// The user's reference to a [`Recorder`].
///
/// Dropping the handle orphans the recorder: the engine stops the device,
/// delivers whatever was captured (including a partial buffer) on the next
/// tick, and releases it. [`free`](Self::free) does the same explicitly.
pub struct RecorderHandle {
    recorder: Arc<Recorder>,
}

impl RecorderHandle {
    pub(crate) fn new(recorder: Arc<Recorder>) -> Self {
        Self { recorder }
    }

    /// Stops the recorder and hands it to the engine for teardown.
    pub fn free(self) {
        self.recorder.release(true);
    }
}

impl Deref for RecorderHandle {
    type Target = Recorder;

    fn deref(&self) -> &Recorder {
        &self.recorder
    }
}

impl fmt::Debug for RecorderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.recorder, f)
    }
}

impl Drop for RecorderHandle {
    fn drop(&mut self) {
        self.recorder.release(false);
    }
}
