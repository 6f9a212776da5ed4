//! In-memory backend for testing without audio hardware.
//!
//! Nothing plays on its own: tests decide when buffers are consumed
//! ([`MockVoice::complete_buffers`]) and when capture data arrives
//! ([`MockCapture::push_input`]). Every handle shares its state with the
//! object the engine holds, so it can be inspected while the engine runs.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Backend, CaptureDevice, NativeBuffer, Voice, VoiceState};
use crate::format::AudioFormat;
use crate::EngineError;

#[derive(Default)]
struct BackendState {
    voices: Vec<MockVoice>,
    captures: Vec<MockCapture>,
    voice_format: Option<AudioFormat>,
    capture_format: Option<AudioFormat>,
    active: bool,
    ticks: u64,
}

/// A scriptable backend.
///
/// Clones share state, so a test keeps one clone and gives another to the
/// engine.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use pcm_engine::backend::MockBackend;
/// use pcm_engine::{AudioFormat, Engine, EngineConfig, PcmBuffer};
///
/// let backend = MockBackend::new();
/// let engine = Engine::new(Box::new(backend.clone()), EngineConfig::default());
/// let source = engine.alloc_source()?;
///
/// let format = AudioFormat::i16(1, 8000);
/// source.queue_buffer(Arc::new(PcmBuffer::with_data(format, &[0u8; 160])?))?;
/// source.play()?;
///
/// let voice = backend.voice(0).unwrap();
/// assert_eq!(voice.queued_len(), 1);
/// voice.complete_buffers(1);
/// engine.tick();
/// assert_eq!(source.get_buffers_count(), 0);
/// # Ok::<(), pcm_engine::EngineError>(())
/// ```
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<BackendState>>,
}

impl MockBackend {
    /// Creates a backend whose voices accept any format unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every voice request buffers in `format`, forcing conversion.
    #[must_use]
    pub fn with_voice_format(self, format: AudioFormat) -> Self {
        self.state.lock().voice_format = Some(format);
        self
    }

    /// Makes capture devices deliver `format` regardless of the request.
    #[must_use]
    pub fn with_capture_format(self, format: AudioFormat) -> Self {
        self.state.lock().capture_format = Some(format);
        self
    }

    /// The `index`-th voice created, in creation order.
    pub fn voice(&self, index: usize) -> Option<MockVoice> {
        self.state.lock().voices.get(index).cloned()
    }

    /// The `index`-th capture device created, in creation order.
    pub fn capture(&self, index: usize) -> Option<MockCapture> {
        self.state.lock().captures.get(index).cloned()
    }

    /// Number of voices created so far.
    pub fn voice_count(&self) -> usize {
        self.state.lock().voices.len()
    }

    /// Returns `true` between `activate` and `deactivate`.
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Number of backend ticks seen.
    pub fn ticks(&self) -> u64 {
        self.state.lock().ticks
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn activate(&self) -> Result<(), EngineError> {
        self.state.lock().active = true;
        Ok(())
    }

    fn deactivate(&self) -> Result<(), EngineError> {
        self.state.lock().active = false;
        Ok(())
    }

    fn tick(&self) {
        self.state.lock().ticks += 1;
    }

    fn create_voice(&self) -> Result<Box<dyn Voice>, EngineError> {
        let mut state = self.state.lock();
        let voice = MockVoice::new(state.voice_format);
        state.voices.push(voice.clone());
        Ok(Box::new(voice))
    }

    fn create_capture(
        &self,
        requested: &AudioFormat,
    ) -> Result<Box<dyn CaptureDevice>, EngineError> {
        let mut state = self.state.lock();
        let capture = MockCapture::new(state.capture_format.unwrap_or(*requested));
        state.captures.push(capture.clone());
        Ok(Box::new(capture))
    }
}

struct VoiceInner {
    native_format: Option<AudioFormat>,
    next_handle: u32,
    uploads: BTreeMap<NativeBuffer, (AudioFormat, Vec<u8>)>,
    queue: VecDeque<NativeBuffer>,
    processed: VecDeque<NativeBuffer>,
    static_buffer: Option<NativeBuffer>,
    state: VoiceState,
    volume: f32,
    looping: bool,
    offset: usize,
    fail_uploads: bool,
    freed: usize,
}

/// Shared view of one mock playback voice.
#[derive(Clone)]
pub struct MockVoice {
    inner: Arc<Mutex<VoiceInner>>,
}

impl MockVoice {
    fn new(native_format: Option<AudioFormat>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VoiceInner {
                native_format,
                next_handle: 1,
                uploads: BTreeMap::new(),
                queue: VecDeque::new(),
                processed: VecDeque::new(),
                static_buffer: None,
                state: VoiceState::Stopped,
                volume: 1.0,
                looping: false,
                offset: 0,
                fail_uploads: false,
                freed: 0,
            })),
        }
    }

    /// Marks up to `n` queued buffers as played, oldest first. A playing
    /// voice that runs out of buffers stops. Returns how many completed.
    pub fn complete_buffers(&self, n: usize) -> usize {
        let mut inner = self.inner.lock();
        let mut done = 0;
        while done < n {
            let Some(handle) = inner.queue.pop_front() else {
                break;
            };
            inner.processed.push_back(handle);
            done += 1;
        }
        inner.offset = 0;
        if inner.queue.is_empty()
            && inner.static_buffer.is_none()
            && inner.state == VoiceState::Playing
        {
            inner.state = VoiceState::Stopped;
        }
        done
    }

    /// Plays whatever is attached to the end: a non-looping static buffer
    /// finishes and the voice stops; a queue completes every buffer.
    pub fn finish(&self) {
        let has_static = self.inner.lock().static_buffer.is_some();
        if has_static {
            let mut inner = self.inner.lock();
            if !inner.looping && inner.state == VoiceState::Playing {
                inner.state = VoiceState::Stopped;
                inner.offset = 0;
            }
        } else {
            self.complete_buffers(usize::MAX);
        }
    }

    /// Advances the play position of the current buffer.
    pub fn advance(&self, bytes: usize) {
        self.inner.lock().offset += bytes;
    }

    /// Makes subsequent uploads fail with a backend error.
    pub fn fail_uploads(&self, fail: bool) {
        self.inner.lock().fail_uploads = fail;
    }

    /// Number of buffers waiting to be played.
    pub fn queued_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Number of played buffers not yet collected by the engine.
    pub fn processed_len(&self) -> usize {
        self.inner.lock().processed.len()
    }

    /// Bytes last uploaded into `handle`.
    pub fn uploaded(&self, handle: NativeBuffer) -> Option<(AudioFormat, Vec<u8>)> {
        self.inner.lock().uploads.get(&handle).cloned()
    }

    /// Handles currently queued, oldest first.
    pub fn queued_handles(&self) -> Vec<NativeBuffer> {
        self.inner.lock().queue.iter().copied().collect()
    }

    /// Number of buffer objects alive on this voice.
    pub fn live_buffers(&self) -> usize {
        self.inner.lock().uploads.len()
    }

    /// Number of buffer objects freed so far.
    pub fn freed_buffers(&self) -> usize {
        self.inner.lock().freed
    }

    /// The attached static buffer.
    pub fn static_buffer(&self) -> Option<NativeBuffer> {
        self.inner.lock().static_buffer
    }

    /// Current play state.
    pub fn voice_state(&self) -> VoiceState {
        self.inner.lock().state
    }

    /// Last gain set by the engine.
    pub fn volume(&self) -> f32 {
        self.inner.lock().volume
    }

    /// Whether the static buffer loops.
    pub fn is_looping(&self) -> bool {
        self.inner.lock().looping
    }
}

impl Voice for MockVoice {
    fn native_format(&self, requested: &AudioFormat) -> AudioFormat {
        self.inner.lock().native_format.unwrap_or(*requested)
    }

    fn alloc_buffer(&mut self) -> Result<NativeBuffer, EngineError> {
        let mut inner = self.inner.lock();
        let handle = NativeBuffer(inner.next_handle);
        inner.next_handle += 1;
        inner
            .uploads
            .insert(handle, (AudioFormat::u8(1, 8000), Vec::new()));
        Ok(handle)
    }

    fn free_buffer(&mut self, handle: NativeBuffer) {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.queue.contains(&handle), "freeing a queued buffer");
        if inner.uploads.remove(&handle).is_some() {
            inner.freed += 1;
        }
    }

    fn upload(
        &mut self,
        handle: NativeBuffer,
        format: &AudioFormat,
        data: &[u8],
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if inner.fail_uploads {
            return Err(EngineError::backend("mock upload rejected"));
        }
        match inner.uploads.get_mut(&handle) {
            Some(slot) => {
                *slot = (*format, data.to_vec());
                Ok(())
            }
            None => Err(EngineError::backend(format!("unknown buffer {handle:?}"))),
        }
    }

    fn set_static_buffer(&mut self, handle: Option<NativeBuffer>) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        inner.static_buffer = handle;
        inner.offset = 0;
        Ok(())
    }

    fn enqueue(&mut self, handle: NativeBuffer) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if !inner.uploads.contains_key(&handle) {
            return Err(EngineError::backend(format!("unknown buffer {handle:?}")));
        }
        inner.queue.push_back(handle);
        Ok(())
    }

    fn unqueue_processed(&mut self) -> Option<NativeBuffer> {
        self.inner.lock().processed.pop_front()
    }

    fn play(&mut self) -> Result<(), EngineError> {
        self.inner.lock().state = VoiceState::Playing;
        Ok(())
    }

    fn pause(&mut self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if inner.state == VoiceState::Playing {
            inner.state = VoiceState::Paused;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        inner.state = VoiceState::Stopped;
        inner.offset = 0;
        while let Some(handle) = inner.queue.pop_front() {
            inner.processed.push_back(handle);
        }
        Ok(())
    }

    fn state(&self) -> VoiceState {
        self.inner.lock().state
    }

    fn set_volume(&mut self, gain: f32) {
        self.inner.lock().volume = gain;
    }

    fn set_looping(&mut self, looping: bool) {
        self.inner.lock().looping = looping;
    }

    fn set_offset_bytes(&mut self, bytes: usize) -> Result<(), EngineError> {
        self.inner.lock().offset = bytes;
        Ok(())
    }

    fn offset_bytes(&self) -> usize {
        self.inner.lock().offset
    }
}

struct CaptureInner {
    format: AudioFormat,
    started: bool,
    pending: VecDeque<u8>,
    lost: usize,
}

/// Shared view of one mock capture device.
#[derive(Clone)]
pub struct MockCapture {
    inner: Arc<Mutex<CaptureInner>>,
}

impl MockCapture {
    fn new(format: AudioFormat) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CaptureInner {
                format,
                started: false,
                pending: VecDeque::new(),
                lost: 0,
            })),
        }
    }

    /// Makes `bytes` available to the next read.
    pub fn push_input(&self, bytes: &[u8]) {
        self.inner.lock().pending.extend(bytes.iter().copied());
    }

    /// Records `blocks` lost inside the device, as an overflowing driver
    /// ring would.
    pub fn lose_blocks(&self, blocks: usize) {
        self.inner.lock().lost += blocks;
    }

    /// Bytes captured but not yet read.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Returns `true` while started.
    pub fn is_started(&self) -> bool {
        self.inner.lock().started
    }
}

impl CaptureDevice for MockCapture {
    fn native_format(&self) -> AudioFormat {
        self.inner.lock().format
    }

    fn start(&mut self) -> Result<(), EngineError> {
        self.inner.lock().started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        self.inner.lock().started = false;
        Ok(())
    }

    fn read_available(&mut self, out: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        let n = out.len().min(inner.pending.len());
        for (slot, byte) in out.iter_mut().zip(inner.pending.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn take_dropped_blocks(&mut self) -> usize {
        std::mem::take(&mut self.inner.lock().lost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_plays_queue_in_order() {
        let backend = MockBackend::new();
        let mut voice = backend.create_voice().unwrap();
        let a = voice.alloc_buffer().unwrap();
        let b = voice.alloc_buffer().unwrap();
        voice.enqueue(a).unwrap();
        voice.enqueue(b).unwrap();
        voice.play().unwrap();

        let control = backend.voice(0).unwrap();
        assert_eq!(control.complete_buffers(1), 1);
        assert_eq!(voice.state(), VoiceState::Playing);
        assert_eq!(voice.unqueue_processed(), Some(a));
        assert_eq!(voice.unqueue_processed(), None);

        control.complete_buffers(5);
        assert_eq!(voice.state(), VoiceState::Stopped);
        assert_eq!(voice.unqueue_processed(), Some(b));
    }

    #[test]
    fn test_stop_marks_everything_processed() {
        let backend = MockBackend::new();
        let mut voice = backend.create_voice().unwrap();
        for _ in 0..3 {
            let handle = voice.alloc_buffer().unwrap();
            voice.enqueue(handle).unwrap();
        }
        voice.stop().unwrap();
        assert_eq!(backend.voice(0).unwrap().processed_len(), 3);
    }

    #[test]
    fn test_static_finish_respects_looping() {
        let backend = MockBackend::new();
        let mut voice = backend.create_voice().unwrap();
        let handle = voice.alloc_buffer().unwrap();
        voice.set_static_buffer(Some(handle)).unwrap();
        voice.set_looping(true);
        voice.play().unwrap();

        let control = backend.voice(0).unwrap();
        control.finish();
        assert_eq!(voice.state(), VoiceState::Playing);

        voice.set_looping(false);
        control.finish();
        assert_eq!(voice.state(), VoiceState::Stopped);
    }

    #[test]
    fn test_upload_failure_is_reported() {
        let backend = MockBackend::new();
        let mut voice = backend.create_voice().unwrap();
        let handle = voice.alloc_buffer().unwrap();
        backend.voice(0).unwrap().fail_uploads(true);
        let result = voice.upload(handle, &AudioFormat::u8(1, 8000), &[1]);
        assert!(matches!(result, Err(EngineError::BackendError(_))));
    }

    #[test]
    fn test_capture_reads_pushed_bytes() {
        let backend = MockBackend::new().with_capture_format(AudioFormat::i16(1, 48000));
        let mut capture = backend.create_capture(&AudioFormat::i16(1, 16000)).unwrap();
        assert_eq!(capture.native_format(), AudioFormat::i16(1, 48000));

        backend.capture(0).unwrap().push_input(&[1, 2, 3, 4, 5]);
        let mut out = [0u8; 3];
        assert_eq!(capture.read_available(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(capture.read_available(&mut out), 2);
        assert_eq!(capture.read_available(&mut out), 0);
    }
}
