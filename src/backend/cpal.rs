//! CPAL backend: default output and input devices of the default host.
//!
//! `cpal::Stream` is not `Send`, so every voice and capture device owns a
//! small thread that builds its stream, keeps it alive, and drops it when the
//! voice goes away. The control side talks to the audio callback through
//! shared state only.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;

use super::{Backend, CaptureDevice, NativeBuffer, Voice, VoiceState};
use crate::format::AudioFormat;
use crate::EngineError;

/// Bytes per native sample. Voices and captures always exchange f32.
const SAMPLE_BYTES: usize = std::mem::size_of::<f32>();
/// Seconds of capture the ring buffer absorbs between ticks.
const CAPTURE_SECONDS: usize = 2;
/// Samples moved out of the capture ring per read.
const CAPTURE_CHUNK: usize = 4096;

/// Backend driving the default devices of the platform's default CPAL host.
#[derive(Debug, Default)]
pub struct CpalBackend {
    active: AtomicBool,
}

impl CpalBackend {
    /// Creates the backend. No device is opened until it is needed.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn activate(&self) -> Result<(), EngineError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| EngineError::backend("no default output device"))?;
        tracing::info!(
            "cpal output device: {}",
            device.name().unwrap_or_else(|_| "unknown".to_string())
        );
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn deactivate(&self) -> Result<(), EngineError> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn create_voice(&self) -> Result<Box<dyn Voice>, EngineError> {
        let shared = Arc::new(Mutex::new(Playlist {
            gain: 1.0,
            ..Default::default()
        }));
        let playlist = Arc::clone(&shared);
        let (thread, format) = spawn_stream("pcm-engine-voice", move || {
            let device = cpal::default_host()
                .default_output_device()
                .ok_or_else(|| EngineError::backend("no default output device"))?;
            let supported = device
                .default_output_config()
                .map_err(EngineError::backend)?;
            let config: cpal::StreamConfig = supported.config();
            let stream = match supported.sample_format() {
                SampleFormat::F32 => build_output::<f32>(&device, &config, playlist)?,
                SampleFormat::I16 => build_output::<i16>(&device, &config, playlist)?,
                SampleFormat::U16 => build_output::<u16>(&device, &config, playlist)?,
                other => {
                    return Err(EngineError::backend(format!(
                        "unsupported output sample format {other:?}"
                    )))
                }
            };
            Ok((stream, AudioFormat::f32(config.channels, config.sample_rate.0)))
        })?;

        Ok(Box::new(CpalVoice {
            shared,
            format,
            next_handle: 1,
            _thread: thread,
        }))
    }

    fn create_capture(
        &self,
        requested: &AudioFormat,
    ) -> Result<Box<dyn CaptureDevice>, EngineError> {
        let shared = Arc::new(CaptureShared::default());
        let gate = Arc::clone(&shared);
        let requested = *requested;
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let (thread, format) = spawn_stream("pcm-engine-capture", move || {
            let device = cpal::default_host()
                .default_input_device()
                .ok_or_else(|| EngineError::backend("no default input device"))?;
            let supported = input_config(&device, &requested)?;
            let config: cpal::StreamConfig = supported.config();
            let capacity =
                config.sample_rate.0 as usize * usize::from(config.channels) * CAPTURE_SECONDS;
            let (producer, consumer) = HeapRb::<f32>::new(capacity.max(CAPTURE_CHUNK)).split();
            let _ = ready_tx.send(consumer);

            let stream = match supported.sample_format() {
                SampleFormat::F32 => build_input::<f32>(&device, &config, producer, gate)?,
                SampleFormat::I16 => build_input::<i16>(&device, &config, producer, gate)?,
                SampleFormat::U16 => build_input::<u16>(&device, &config, producer, gate)?,
                other => {
                    return Err(EngineError::backend(format!(
                        "unsupported input sample format {other:?}"
                    )))
                }
            };
            Ok((stream, AudioFormat::f32(config.channels, config.sample_rate.0)))
        })?;
        let consumer = ready_rx.recv().map_err(EngineError::backend)?;

        if format != requested {
            tracing::debug!("capture runs at {} (requested {})", format, requested);
        }
        Ok(Box::new(CpalCapture {
            consumer,
            shared,
            format,
            scratch: vec![0.0; CAPTURE_CHUNK],
            _thread: thread,
        }))
    }
}

/// Keeps a stream alive on its own thread until dropped.
struct StreamThread {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("audio stream thread panicked");
            }
        }
    }
}

fn spawn_stream<F>(name: &str, build: F) -> Result<(StreamThread, AudioFormat), EngineError>
where
    F: FnOnce() -> Result<(cpal::Stream, AudioFormat), EngineError> + Send + 'static,
{
    let (ready_tx, ready_rx) = mpsc::sync_channel(1);
    let (stop_tx, stop_rx) = mpsc::channel::<()>();

    let thread = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let stream = match build().and_then(|(stream, format)| {
                stream.play().map_err(EngineError::backend)?;
                Ok((stream, format))
            }) {
                Ok((stream, format)) => {
                    let _ = ready_tx.send(Ok(format));
                    stream
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            // Returns once the owning StreamThread drops its sender.
            let _ = stop_rx.recv();
            drop(stream);
        })
        .map_err(EngineError::backend)?;

    let format = ready_rx.recv().map_err(EngineError::backend)??;
    Ok((
        StreamThread {
            stop: Some(stop_tx),
            thread: Some(thread),
        },
        format,
    ))
}

/// State shared between a voice and its output callback.
#[derive(Default)]
struct Playlist {
    state: VoiceState,
    gain: f32,
    looping: bool,
    data: HashMap<NativeBuffer, Vec<f32>>,
    queue: VecDeque<NativeBuffer>,
    processed: VecDeque<NativeBuffer>,
    static_buffer: Option<NativeBuffer>,
    /// Sample index into the current buffer.
    cursor: usize,
}

impl Playlist {
    fn current(&self) -> Option<NativeBuffer> {
        self.static_buffer.or_else(|| self.queue.front().copied())
    }

    fn finish_current(&mut self) {
        self.cursor = 0;
        if self.static_buffer.is_some() {
            if !self.looping {
                self.state = VoiceState::Stopped;
            }
        } else if let Some(handle) = self.queue.pop_front() {
            // Capacity was reserved by enqueue.
            self.processed.push_back(handle);
        }
    }
}

/// Fills `out` from the playlist. Writes silence if the control side holds
/// the lock.
fn render<T>(out: &mut [T], shared: &Mutex<Playlist>)
where
    T: SizedSample + FromSample<f32>,
{
    let Some(mut guard) = shared.try_lock() else {
        out.fill(T::EQUILIBRIUM);
        return;
    };
    let list = &mut *guard;
    let mut written = 0;

    while written < out.len() && list.state == VoiceState::Playing {
        let Some(current) = list.current() else {
            list.state = VoiceState::Stopped;
            break;
        };
        let samples = list.data.get(&current).map_or(&[][..], Vec::as_slice);
        if samples.is_empty() && list.static_buffer.is_some() && list.looping {
            break;
        }
        let start = list.cursor.min(samples.len());
        let n = (samples.len() - start).min(out.len() - written);
        for (dst, &src) in out[written..written + n]
            .iter_mut()
            .zip(&samples[start..start + n])
        {
            *dst = T::from_sample(src * list.gain);
        }
        written += n;
        list.cursor = start + n;
        if list.cursor >= samples.len() {
            list.finish_current();
        }
    }
    out[written..].fill(T::EQUILIBRIUM);
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: Arc<Mutex<Playlist>>,
) -> Result<cpal::Stream, EngineError>
where
    T: SizedSample + FromSample<f32>,
{
    device
        .build_output_stream(
            config,
            move |out: &mut [T], _: &cpal::OutputCallbackInfo| render(out, &shared),
            |err| {
                tracing::error!("output stream error: {}", err);
            },
            None,
        )
        .map_err(EngineError::backend)
}

/// A playback voice on the default output device.
struct CpalVoice {
    shared: Arc<Mutex<Playlist>>,
    format: AudioFormat,
    next_handle: u32,
    _thread: StreamThread,
}

impl Voice for CpalVoice {
    fn native_format(&self, _requested: &AudioFormat) -> AudioFormat {
        self.format
    }

    fn alloc_buffer(&mut self) -> Result<NativeBuffer, EngineError> {
        let handle = NativeBuffer(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        self.shared.lock().data.insert(handle, Vec::new());
        Ok(handle)
    }

    fn free_buffer(&mut self, handle: NativeBuffer) {
        self.shared.lock().data.remove(&handle);
    }

    fn upload(
        &mut self,
        handle: NativeBuffer,
        format: &AudioFormat,
        data: &[u8],
    ) -> Result<(), EngineError> {
        if *format != self.format {
            return Err(EngineError::FormatMismatch {
                expected: self.format,
                actual: *format,
            });
        }
        let mut list = self.shared.lock();
        let slot = list
            .data
            .get_mut(&handle)
            .ok_or_else(|| EngineError::backend(format!("unknown buffer {handle:?}")))?;
        slot.clear();
        slot.try_reserve(data.len() / SAMPLE_BYTES)?;
        slot.extend(
            data.chunks_exact(SAMPLE_BYTES)
                .map(bytemuck::pod_read_unaligned::<f32>),
        );
        Ok(())
    }

    fn set_static_buffer(&mut self, handle: Option<NativeBuffer>) -> Result<(), EngineError> {
        let mut list = self.shared.lock();
        list.static_buffer = handle;
        list.cursor = 0;
        Ok(())
    }

    fn enqueue(&mut self, handle: NativeBuffer) -> Result<(), EngineError> {
        let mut list = self.shared.lock();
        if !list.data.contains_key(&handle) {
            return Err(EngineError::backend(format!("unknown buffer {handle:?}")));
        }
        let pending = list.queue.len() + 1;
        list.queue.try_reserve(1)?;
        list.processed.try_reserve(pending)?;
        list.queue.push_back(handle);
        Ok(())
    }

    fn unqueue_processed(&mut self) -> Option<NativeBuffer> {
        self.shared.lock().processed.pop_front()
    }

    fn play(&mut self) -> Result<(), EngineError> {
        self.shared.lock().state = VoiceState::Playing;
        Ok(())
    }

    fn pause(&mut self) -> Result<(), EngineError> {
        let mut list = self.shared.lock();
        if list.state == VoiceState::Playing {
            list.state = VoiceState::Paused;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        let mut list = self.shared.lock();
        let list = &mut *list;
        list.state = VoiceState::Stopped;
        list.cursor = 0;
        list.processed.extend(list.queue.drain(..));
        Ok(())
    }

    fn state(&self) -> VoiceState {
        self.shared.lock().state
    }

    fn set_volume(&mut self, gain: f32) {
        self.shared.lock().gain = gain;
    }

    fn set_looping(&mut self, looping: bool) {
        self.shared.lock().looping = looping;
    }

    fn set_offset_bytes(&mut self, bytes: usize) -> Result<(), EngineError> {
        let channels = usize::from(self.format.channels()).max(1);
        let sample = bytes / SAMPLE_BYTES;
        self.shared.lock().cursor = sample - sample % channels;
        Ok(())
    }

    fn offset_bytes(&self) -> usize {
        self.shared.lock().cursor * SAMPLE_BYTES
    }
}

/// Picks an input configuration matching `requested` if the device offers
/// one, otherwise the device default.
fn input_config(
    device: &cpal::Device,
    requested: &AudioFormat,
) -> Result<cpal::SupportedStreamConfig, EngineError> {
    let rate = cpal::SampleRate(requested.sample_rate());
    let matching = device.supported_input_configs().ok().and_then(|mut ranges| {
        ranges.find(|range| {
            range.channels() == requested.channels()
                && range.min_sample_rate() <= rate
                && rate <= range.max_sample_rate()
        })
    });
    match matching {
        Some(range) => Ok(range.with_sample_rate(rate)),
        None => device.default_input_config().map_err(EngineError::backend),
    }
}

/// State shared between a capture device and its input callback.
#[derive(Debug, Default)]
struct CaptureShared {
    capturing: AtomicBool,
    /// Frames the callback found no room for since the last tick.
    dropped: AtomicUsize,
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: ringbuf::HeapProd<f32>,
    shared: Arc<CaptureShared>,
) -> Result<cpal::Stream, EngineError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels);
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !shared.capturing.load(Ordering::Relaxed) {
                    return;
                }
                let dropped = push_frames(&mut producer, data, channels);
                if dropped > 0 {
                    shared.dropped.fetch_add(dropped, Ordering::Relaxed);
                }
            },
            |err| {
                tracing::error!("input stream error: {}", err);
            },
            None,
        )
        .map_err(EngineError::backend)
}

/// Pushes as many whole frames of `data` as the ring has room for, so the
/// ring never holds a partial frame. Returns the number of frames dropped.
fn push_frames<T, P>(producer: &mut P, data: &[T], channels: usize) -> usize
where
    T: Sample,
    f32: FromSample<T>,
    P: Producer<Item = f32>,
{
    let channels = channels.max(1);
    let frames = data.len() / channels;
    let room = producer.vacant_len() / channels;
    let kept = frames.min(room);
    for &sample in &data[..kept * channels] {
        let _ = producer.try_push(sample.to_sample::<f32>());
    }
    frames - kept
}

/// A capture device on the default input device.
struct CpalCapture {
    consumer: ringbuf::HeapCons<f32>,
    shared: Arc<CaptureShared>,
    format: AudioFormat,
    scratch: Vec<f32>,
    _thread: StreamThread,
}

impl CaptureDevice for CpalCapture {
    fn native_format(&self) -> AudioFormat {
        self.format
    }

    fn start(&mut self) -> Result<(), EngineError> {
        self.shared.capturing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        self.shared.capturing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn take_dropped_blocks(&mut self) -> usize {
        self.shared.dropped.swap(0, Ordering::Relaxed)
    }

    fn read_available(&mut self, out: &mut [u8]) -> usize {
        let want = (out.len() / SAMPLE_BYTES).min(self.scratch.len());
        let n = self.consumer.pop_slice(&mut self.scratch[..want]);
        let bytes = n * SAMPLE_BYTES;
        out[..bytes].copy_from_slice(bytemuck::cast_slice(&self.scratch[..n]));
        bytes
    }
}
