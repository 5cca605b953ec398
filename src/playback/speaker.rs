//! Speaker output using CPAL
//!
//! A small mixer renders every started chunk at its exact start frame. The
//! output clock is the number of frames the device has pulled, so
//! `current_time()` advances only while audio is actually being rendered.
//! Chunks at other sample rates are resampled linearly on the fly.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::scheduler::{AudioOutput, DecodedAudio, PlaybackHandle};
use crate::audio::AudioError;

struct Voice {
    handle: PlaybackHandle,
    samples: Arc<[f32]>,
    /// Source samples advanced per device frame
    step: f64,
    start_frame: u64,
    position: f64,
}

impl Voice {
    fn next_sample(&mut self) -> Option<f32> {
        let len = self.samples.len();
        if self.position >= len as f64 {
            return None;
        }
        let index = self.position.floor() as usize;
        let frac = (self.position - index as f64) as f32;
        let a = self.samples[index];
        let b = self.samples.get(index + 1).copied().unwrap_or(a);
        self.position += self.step;
        Some(a + (b - a) * frac)
    }

    fn finished(&self) -> bool {
        self.position >= self.samples.len() as f64
    }
}

/// Mixes scheduled voices into interleaved device frames.
struct Mixer {
    device_rate: u32,
    channels: usize,
    frames_rendered: u64,
    voices: Vec<Voice>,
}

impl Mixer {
    fn new(device_rate: u32, channels: usize) -> Self {
        Self {
            device_rate,
            channels: channels.max(1),
            frames_rendered: 0,
            voices: Vec::new(),
        }
    }

    fn current_time(&self) -> f64 {
        self.frames_rendered as f64 / self.device_rate as f64
    }

    fn add(&mut self, handle: PlaybackHandle, audio: &DecodedAudio, start_time: f64) {
        let start_frame = (start_time.max(0.0) * self.device_rate as f64).round() as u64;
        self.voices.push(Voice {
            handle,
            samples: audio.samples().clone(),
            step: audio.sample_rate() as f64 / self.device_rate as f64,
            start_frame,
            position: 0.0,
        });
    }

    fn remove(&mut self, handle: PlaybackHandle) {
        self.voices.retain(|v| v.handle != handle);
    }

    /// Fill `out` with interleaved frames; finished voices are moved to `ended`.
    fn render(&mut self, out: &mut [f32], ended: &mut Vec<PlaybackHandle>) {
        let channels = self.channels;
        for (offset, frame) in out.chunks_mut(channels).enumerate() {
            let now = self.frames_rendered + offset as u64;
            let mut mixed = 0.0f32;
            for voice in &mut self.voices {
                if now >= voice.start_frame {
                    mixed += voice.next_sample().unwrap_or(0.0);
                }
            }
            frame.fill(mixed.clamp(-1.0, 1.0));
        }
        self.frames_rendered += (out.len() / channels) as u64;

        self.voices.retain(|voice| {
            if voice.finished() {
                ended.push(voice.handle);
                false
            } else {
                true
            }
        });
    }
}

fn lock(mixer: &Mutex<Mixer>) -> MutexGuard<'_, Mixer> {
    mixer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Default (or named) system output device.
///
/// The cpal stream lives on a dedicated thread for the lifetime of the
/// speaker; dropping the speaker stops it.
pub struct Speaker {
    mixer: Arc<Mutex<Mixer>>,
    next_handle: u64,
    completion_rx: Option<mpsc::UnboundedReceiver<PlaybackHandle>>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Speaker {
    /// Open the output device and start rendering silence.
    ///
    /// # Arguments
    /// * `device_name` - Exact device name, or `None` for the system default
    pub fn open(device_name: Option<&str>) -> Result<Self, AudioError> {
        let (ready_tx, ready_rx) =
            std_mpsc::sync_channel::<Result<Arc<Mutex<Mixer>>, AudioError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let device_name = device_name.map(str::to_string);

        let worker = thread::Builder::new()
            .name("speaker-output".to_string())
            .spawn(move || {
                let (stream, mixer) = match open_stream(device_name.as_deref(), completion_tx) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(mixer));

                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Speaker: output thread exiting");
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        let mixer = match ready_rx.recv() {
            Ok(Ok(mixer)) => mixer,
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(AudioError::StreamCreationFailed(
                    "output thread exited before the stream started".to_string(),
                ));
            }
        };

        Ok(Self {
            mixer,
            next_handle: 0,
            completion_rx: Some(completion_rx),
            stop_tx: Some(stop_tx),
            worker: Some(worker),
        })
    }
}

impl AudioOutput for Speaker {
    fn current_time(&self) -> f64 {
        lock(&self.mixer).current_time()
    }

    fn start_at(&mut self, audio: &DecodedAudio, start_time: f64) -> PlaybackHandle {
        let handle = PlaybackHandle::new(self.next_handle);
        self.next_handle += 1;
        lock(&self.mixer).add(handle, audio, start_time);
        handle
    }

    fn stop(&mut self, handle: PlaybackHandle) {
        lock(&self.mixer).remove(handle);
    }

    fn take_completion_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<PlaybackHandle>> {
        self.completion_rx.take()
    }
}

impl Drop for Speaker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("Speaker: output thread panicked");
            }
        }
    }
}

fn find_output_device(name: Option<&str>) -> Result<Device, AudioError> {
    let host = cpal::default_host();
    match name {
        None => host.default_output_device().ok_or(AudioError::NoOutputDevice),
        Some(wanted) => host
            .output_devices()
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or(AudioError::NoOutputDevice),
    }
}

fn open_stream(
    device_name: Option<&str>,
    completion_tx: mpsc::UnboundedSender<PlaybackHandle>,
) -> Result<(Stream, Arc<Mutex<Mixer>>), AudioError> {
    let device = find_output_device(device_name)?;
    log::info!("Speaker: using output device {:?}", device.name());

    let supported_config = device
        .default_output_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;

    log::info!(
        "Speaker: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();
    let mixer = Arc::new(Mutex::new(Mixer::new(
        config.sample_rate.0,
        config.channels as usize,
    )));

    let stream = match sample_format {
        SampleFormat::I16 => {
            build_stream_typed::<i16>(&device, &config, mixer.clone(), completion_tx)?
        }
        SampleFormat::U16 => {
            build_stream_typed::<u16>(&device, &config, mixer.clone(), completion_tx)?
        }
        SampleFormat::F32 => {
            build_stream_typed::<f32>(&device, &config, mixer.clone(), completion_tx)?
        }
        other => return Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
    };

    stream.play().map_err(|e| {
        AudioError::StreamCreationFailed(format!("Failed to start output stream: {}", e))
    })?;

    Ok((stream, mixer))
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
    completion_tx: mpsc::UnboundedSender<PlaybackHandle>,
) -> Result<Stream, AudioError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let mut scratch: Vec<f32> = Vec::new();
    let mut ended: Vec<PlaybackHandle> = Vec::new();
    let err_fn = |err| log::error!("Speaker: stream error: {}", err);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                lock(&mixer).render(&mut scratch, &mut ended);
                for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample_(sample);
                }
                for handle in ended.drain(..) {
                    let _ = completion_tx.send(handle);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}
