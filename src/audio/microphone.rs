//! Microphone input using CPAL
//!
//! The cpal stream is not `Send`, so each attached tap gets a dedicated
//! capture thread that builds the stream, plays it, and parks until the
//! [`InputTap`] is dropped. Only the stop channel and join handle cross
//! threads.

use std::sync::mpsc as std_mpsc;
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig};

use super::capture::{InputFormat, InputSource, InputTap, SampleTap};
use super::AudioError;

/// Default (or named) system input device.
#[derive(Debug, Clone)]
pub struct Microphone {
    device_name: Option<String>,
    config: StreamConfig,
    sample_format: SampleFormat,
}

impl Microphone {
    /// Probe the input device and its default configuration.
    ///
    /// Fails fast when no device is present so a session can refuse to open
    /// before touching the network.
    ///
    /// # Arguments
    /// * `device_name` - Exact device name, or `None` for the system default
    pub fn open(device_name: Option<&str>) -> Result<Self, AudioError> {
        let device = find_input_device(device_name)?;

        log::info!("Microphone: using input device {:?}", device.name());

        let supported_config = device
            .default_input_config()
            .map_err(|_| AudioError::NoSupportedConfig)?;

        log::info!(
            "Microphone: {} Hz, {} channels, {:?}",
            supported_config.sample_rate().0,
            supported_config.channels(),
            supported_config.sample_format()
        );

        Ok(Self {
            device_name: device_name.map(str::to_string),
            sample_format: supported_config.sample_format(),
            config: supported_config.into(),
        })
    }
}

impl InputSource for Microphone {
    fn format(&self) -> InputFormat {
        InputFormat {
            sample_rate: self.config.sample_rate.0,
            channels: self.config.channels,
        }
    }

    fn attach(&self, tap: SampleTap) -> Result<InputTap, AudioError> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let device_name = self.device_name.clone();
        let config = self.config.clone();
        let sample_format = self.sample_format;

        let worker = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let stream = match open_stream(device_name.as_deref(), &config, sample_format, tap)
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Park until the tap is dropped (explicit stop or sender dropped)
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Microphone: capture thread exiting");
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(AudioError::StreamCreationFailed(
                    "capture thread exited before the stream started".to_string(),
                ));
            }
        }

        Ok(InputTap::new(move || {
            let _ = stop_tx.send(());
            if worker.join().is_err() {
                log::warn!("Microphone: capture thread panicked");
            }
        }))
    }
}

fn find_input_device(name: Option<&str>) -> Result<Device, AudioError> {
    let host = cpal::default_host();
    match name {
        None => host.default_input_device().ok_or(AudioError::NoInputDevice),
        Some(wanted) => host
            .input_devices()
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or(AudioError::NoInputDevice),
    }
}

fn open_stream(
    device_name: Option<&str>,
    config: &StreamConfig,
    sample_format: SampleFormat,
    tap: SampleTap,
) -> Result<Stream, AudioError> {
    let device = find_input_device(device_name)?;
    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, config, tap)?,
        SampleFormat::U16 => build_stream_typed::<u16>(&device, config, tap)?,
        SampleFormat::F32 => build_stream_typed::<f32>(&device, config, tap)?,
        other => return Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
    };

    stream.play().map_err(|e| {
        AudioError::StreamCreationFailed(format!("Failed to start input stream: {}", e))
    })?;
    Ok(stream)
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    mut tap: SampleTap,
) -> Result<Stream, AudioError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    let err_fn = |err| log::error!("Microphone: stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|&s| f32::from_sample_(s)));
                tap(&scratch);
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Requires an audio input device
    fn test_open_default_microphone() {
        let mic = Microphone::open(None).expect("input device required");
        let format = mic.format();
        assert!(format.sample_rate > 0);
        assert!(format.channels > 0);
    }

    #[test]
    fn test_unknown_device_name_is_rejected() {
        let result = Microphone::open(Some("no-such-device-for-cohost-studio"));
        assert!(result.is_err());
    }
}
