//! Microphone capture using cpal.
//!
//! `cpal::Stream` is not `Send`, so every device stream lives on its own thread
//! and only plain sample blocks cross into async code. The thread holds the OS
//! input handle until it is told to stop, and drops it on every exit path.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SizedSample, Stream, StreamConfig};
use std::sync::mpsc as std_mpsc;
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};
use voz_core::{AudioFrame, LivenessFlag};

use crate::audio_utils::downmix;
use crate::error::PermissionFault;

/// Something that can hand out a live microphone stream.
#[async_trait]
pub trait MicrophoneSource: Send + Sync {
    /// Acquires the device. Suspends until the platform grants or refuses access.
    async fn start(&self) -> Result<MicrophoneStream, PermissionFault>;
}

/// A live, non-restartable sequence of mono capture blocks.
///
/// Dropping the stream releases the device.
pub struct MicrophoneStream {
    blocks: mpsc::Receiver<AudioFrame>,
    sample_rate: u32,
    liveness: LivenessFlag,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl MicrophoneStream {
    /// Wraps a block receiver that is not backed by a device thread.
    pub fn from_parts(
        blocks: mpsc::Receiver<AudioFrame>,
        sample_rate: u32,
        liveness: LivenessFlag,
    ) -> Self {
        Self {
            blocks,
            sample_rate,
            liveness,
            stop_tx: None,
            thread: None,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_active(&self) -> bool {
        self.liveness.is_active()
    }

    /// Waits for the next block. Returns `None` once the stream is stopped or the device went away.
    pub async fn next_block(&mut self) -> Option<AudioFrame> {
        if !self.liveness.is_active() {
            return None;
        }
        self.blocks.recv().await
    }

    /// Releases the device. Safe to call any number of times.
    pub fn stop(&mut self) {
        self.liveness.stop();
        self.blocks.close();
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("Audio capture thread panicked");
            }
            info!("Microphone released");
        }
    }
}

impl Drop for MicrophoneStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Captures from a cpal input device.
pub struct CpalMicrophone {
    device: String,
    block_capacity: usize,
}

impl CpalMicrophone {
    /// `device` is `"default"` or a substring of the device name.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            block_capacity: 64,
        }
    }
}

#[async_trait]
impl MicrophoneSource for CpalMicrophone {
    async fn start(&self) -> Result<MicrophoneStream, PermissionFault> {
        let (block_tx, block_rx) = mpsc::channel(self.block_capacity);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let liveness = LivenessFlag::new();

        let device_name = self.device.clone();
        let thread_liveness = liveness.clone();
        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                run_capture_thread(device_name, thread_liveness, block_tx, ready_tx, stop_rx)
            })
            .map_err(|e| {
                PermissionFault::DeviceUnavailable(format!("Failed to spawn audio thread: {}", e))
            })?;

        // If this future is dropped while waiting, the thread sees the closed
        // channel and releases the device instead of handing it over.
        let sample_rate = match ready_rx.await {
            Ok(Ok(rate)) => rate,
            Ok(Err(fault)) => {
                let _ = handle.join();
                return Err(fault);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(PermissionFault::DeviceUnavailable(
                    "Audio capture thread exited before the device opened".to_string(),
                ));
            }
        };

        Ok(MicrophoneStream {
            blocks: block_rx,
            sample_rate,
            liveness,
            stop_tx: Some(stop_tx),
            thread: Some(handle),
        })
    }
}

fn run_capture_thread(
    device_name: String,
    liveness: LivenessFlag,
    block_tx: mpsc::Sender<AudioFrame>,
    ready_tx: oneshot::Sender<Result<u32, PermissionFault>>,
    stop_rx: std_mpsc::Receiver<()>,
) {
    if ready_tx.is_closed() {
        debug!("Microphone start cancelled before the device was opened");
        return;
    }

    let (stream, sample_rate) = match open_input_stream(&device_name, liveness, block_tx) {
        Ok(opened) => opened,
        Err(fault) => {
            let _ = ready_tx.send(Err(fault));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(PermissionFault::PermissionDenied(e.to_string())));
        return;
    }

    if ready_tx.send(Ok(sample_rate)).is_err() {
        debug!("Microphone start cancelled; releasing device");
        return;
    }

    debug!("Audio capture thread started");
    // Any message or a dropped sender means stop.
    let _ = stop_rx.recv();
    debug!("Audio capture thread stopping");
    drop(stream);
}

fn open_input_stream(
    device_name: &str,
    liveness: LivenessFlag,
    block_tx: mpsc::Sender<AudioFrame>,
) -> Result<(Stream, u32), PermissionFault> {
    let host = cpal::default_host();
    let device = if device_name == "default" {
        host.default_input_device().ok_or_else(|| {
            PermissionFault::DeviceUnavailable("No default input device".to_string())
        })?
    } else {
        find_device_by_name(&host, device_name)?
    };

    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    info!("Using audio input device: {}", name);

    let supported = device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => {
            PermissionFault::DeviceUnavailable(e.to_string())
        }
        other => PermissionFault::PermissionDenied(other.to_string()),
    })?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();
    let sample_rate = config.sample_rate.0;

    debug!(
        "Input stream config: {} Hz, {} channels, {:?}",
        sample_rate, config.channels, sample_format
    );

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, liveness, block_tx),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, liveness, block_tx),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, liveness, block_tx),
        cpal::SampleFormat::U8 => build_stream::<u8>(&device, &config, liveness, block_tx),
        cpal::SampleFormat::I32 => build_stream::<i32>(&device, &config, liveness, block_tx),
        other => {
            return Err(PermissionFault::DeviceUnavailable(format!(
                "Unsupported sample format: {:?}",
                other
            )));
        }
    }
    .map_err(|e| match e {
        cpal::BuildStreamError::DeviceNotAvailable => {
            PermissionFault::DeviceUnavailable(e.to_string())
        }
        other => PermissionFault::PermissionDenied(other.to_string()),
    })?;

    Ok((stream, sample_rate))
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    liveness: LivenessFlag,
    tx: mpsc::Sender<AudioFrame>,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels;
    let mut sequence: u64 = 0;
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            if !liveness.is_active() {
                return;
            }
            let samples: Vec<f32> = data.iter().map(|&s| f32::from_sample(s)).collect();
            let frame = AudioFrame::outbound(sequence, downmix(&samples, channels));
            sequence += 1;
            // A full queue drops the block; the receiver sees the sequence gap.
            let _ = tx.try_send(frame);
        },
        |err| error!("Audio input stream error: {}", err),
        None,
    )
}

fn find_device_by_name(host: &cpal::Host, name: &str) -> Result<Device, PermissionFault> {
    let devices = host
        .input_devices()
        .map_err(|e| PermissionFault::DeviceUnavailable(e.to_string()))?;

    for device in devices {
        if let Ok(device_name) = device.name() {
            if device_name.contains(name) || name.contains(&device_name) {
                return Ok(device);
            }
        }
    }

    Err(PermissionFault::DeviceUnavailable(format!(
        "No input device matching '{}'",
        name
    )))
}

/// List all available input devices.
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    host.input_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_from_parts_yields_blocks() {
        let (tx, rx) = mpsc::channel(4);
        let mut stream = MicrophoneStream::from_parts(rx, 16000, LivenessFlag::new());
        tx.send(AudioFrame::outbound(0, vec![0.1, 0.2])).await.unwrap();

        let block = stream.next_block().await.unwrap();
        assert_eq!(block.sequence, 0);
        assert_eq!(stream.sample_rate(), 16000);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_ends_stream() {
        let (tx, rx) = mpsc::channel(4);
        let liveness = LivenessFlag::new();
        let mut stream = MicrophoneStream::from_parts(rx, 16000, liveness.clone());
        tx.send(AudioFrame::outbound(0, vec![0.0])).await.unwrap();

        stream.stop();
        stream.stop();

        assert!(!stream.is_active());
        assert!(!liveness.is_active());
        assert!(stream.next_block().await.is_none());
        // The producer side observes the closed channel.
        assert!(tx.send(AudioFrame::outbound(1, vec![0.0])).await.is_err());
    }
}
