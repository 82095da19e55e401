//! Plays decoded agent audio on the default output device.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample, Stream, StreamConfig};
use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Producer, Split},
};
use std::sync::mpsc as std_mpsc;
use std::thread;
use tracing::{debug, error, info, warn};

use crate::audio_utils::{AGENT_OUTPUT_PCM16_SAMPLE_RATE, StreamResampler};

/// Receives mono agent samples at [`AGENT_OUTPUT_PCM16_SAMPLE_RATE`].
///
/// Implementations must not block: they run on the connection's event loop.
pub trait AgentAudioSink: Send {
    fn play(&mut self, samples: &[f32]);
}

/// Ring-buffered playback through cpal.
pub struct CpalPlayback {
    producer: HeapProd<f32>,
    resampler: StreamResampler,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalPlayback {
    /// Opens the default output device. Buffers up to `buffer_secs` of audio.
    pub fn open(buffer_secs: f32) -> anyhow::Result<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<anyhow::Result<(u32, HeapProd<f32>)>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                let (stream, sample_rate, producer) = match open_output_stream(buffer_secs) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
                if ready_tx.send(Ok((sample_rate, producer))).is_err() {
                    return;
                }
                let _ = stop_rx.recv();
                debug!("Audio playback thread stopping");
                drop(stream);
            })?;

        let (device_rate, producer) = ready_rx.recv()??;
        let resampler = StreamResampler::new(AGENT_OUTPUT_PCM16_SAMPLE_RATE, device_rate, 480)?;
        info!(device_rate, "Agent audio playback ready");

        Ok(Self {
            producer,
            resampler,
            stop_tx: Some(stop_tx),
            thread: Some(handle),
        })
    }
}

impl AgentAudioSink for CpalPlayback {
    fn play(&mut self, samples: &[f32]) {
        let resampled = self.resampler.process(samples);
        let pushed = self.producer.push_slice(&resampled);
        if pushed < resampled.len() {
            warn!(
                dropped = resampled.len() - pushed,
                "Playback buffer full, dropping agent audio"
            );
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn open_output_stream(buffer_secs: f32) -> anyhow::Result<(Stream, u32, HeapProd<f32>)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow::anyhow!("No default output device"))?;
    let supported = device.default_output_config()?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();
    let sample_rate = config.sample_rate.0;

    let capacity = ((sample_rate as f32 * buffer_secs.max(0.1)) as usize).max(1024);
    let (producer, consumer) = HeapRb::<f32>::new(capacity).split();

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_output::<f32>(&device, &config, consumer)?,
        cpal::SampleFormat::I16 => build_output::<i16>(&device, &config, consumer)?,
        cpal::SampleFormat::U16 => build_output::<u16>(&device, &config, consumer)?,
        other => anyhow::bail!("Unsupported output sample format: {:?}", other),
    };
    Ok((stream, sample_rate, producer))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut consumer: HeapCons<f32>,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            for frame in data.chunks_mut(channels) {
                // Underruns play silence.
                let value = T::from_sample(consumer.try_pop().unwrap_or(0.0));
                for out in frame.iter_mut() {
                    *out = value;
                }
            }
        },
        |err| error!("Audio output stream error: {}", err),
        None,
    )
}
