//! Device enumeration and cpal stream construction. Capture accumulates raw
//! samples into fixed-size frames matching the negotiated `AudioConfig`
//! before handing them to the caller; playback drains a per-stream ring
//! buffer straight into the output callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat as CpalSampleFormat, StreamConfig};
use tracing::{debug, warn};

use crate::error::ProtocolError as Error;
use crate::error::Result;
use crate::ring::RingBuffer;
use crate::wire::{AudioConfig, SampleFormat};

pub fn list_devices() -> Result<(Vec<Device>, Vec<Device>)> {
    let host = cpal::default_host();
    let inputs: Vec<_> = host
        .input_devices()
        .map_err(|e| Error::AudioOpenFailed(format!("enumerating input devices: {e}")))?
        .collect();
    let outputs: Vec<_> = host
        .output_devices()
        .map_err(|e| Error::AudioOpenFailed(format!("enumerating output devices: {e}")))?
        .collect();
    Ok((inputs, outputs))
}

pub fn device_name(dev: &Device) -> String {
    dev.name().unwrap_or_else(|_| "<unknown>".into())
}

/// First device whose name starts with `prefix`, case-insensitively. Used to
/// resolve the `device` config/CLI key against whatever cpal enumerates.
pub fn find_by_name_prefix<'a>(devices: &'a [Device], prefix: &str) -> Option<&'a Device> {
    let prefix = prefix.to_lowercase();
    devices
        .iter()
        .find(|d| device_name(d).to_lowercase().starts_with(&prefix))
}

/// Negotiate a config for `dev`'s default input, preferring the device's own
/// native rate/channel count; the codec module rejects anything it can't
/// handle at `Codec::new` time.
pub fn default_capture_config(dev: &Device) -> Result<AudioConfig> {
    let cfg = dev
        .default_input_config()
        .map_err(|e| Error::AudioOpenFailed(format!("default_input_config: {e}")))?;
    let sample_format = match cfg.sample_format() {
        CpalSampleFormat::I16 => SampleFormat::I16,
        _ => SampleFormat::F32,
    };
    Ok(AudioConfig {
        channel_count: cfg.channels().min(255) as u8,
        sample_format,
        frame_size: 960,
        sample_rate: cfg.sample_rate().0,
    })
}

/// Starts capture on `dev`, calling `on_frame` once per full `frame_size *
/// channel_count * sample_size` chunk of interleaved raw little-endian bytes
/// in `config.sample_format`. Partial tail samples from one callback are
/// carried over and prefixed to the next. Builds an `f32` or `i16` cpal
/// stream depending on the negotiated format; both branches convert into the
/// same raw-byte carry buffer so callers never see the sample type directly.
pub fn build_capture_stream(
    dev: &Device,
    config: &AudioConfig,
    running: Arc<AtomicBool>,
    mut on_frame: impl FnMut(&[u8]) + Send + 'static,
) -> Result<cpal::Stream> {
    let stream_config = StreamConfig {
        channels: config.channel_count as u16,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let sample_size = config.sample_format.sample_size();
    let frame_len_bytes = config.frame_size as usize * config.channel_count as usize * sample_size;
    // Capacity covers one frame plus the largest plausible host callback
    // block, so `extend_from_slice`/`drain` below never reallocate on the
    // realtime thread.
    const MAX_CALLBACK_FRAMES: usize = 8192;
    let carry_cap =
        frame_len_bytes + MAX_CALLBACK_FRAMES * config.channel_count.max(1) as usize * sample_size;

    let stream = match config.sample_format {
        SampleFormat::F32 => {
            let mut carry: Vec<u8> = Vec::with_capacity(carry_cap);
            dev.build_input_stream(
                &stream_config,
                move |data: &[f32], _| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    carry.extend(data.iter().flat_map(|s| s.to_le_bytes()));
                    let mut offset = 0;
                    while carry.len() - offset >= frame_len_bytes {
                        on_frame(&carry[offset..offset + frame_len_bytes]);
                        offset += frame_len_bytes;
                    }
                    carry.drain(..offset);
                },
                |err| warn!(%err, "capture stream error"),
                None,
            )
        }
        SampleFormat::I16 => {
            let mut carry: Vec<u8> = Vec::with_capacity(carry_cap);
            dev.build_input_stream(
                &stream_config,
                move |data: &[i16], _| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    carry.extend(data.iter().flat_map(|s| s.to_le_bytes()));
                    let mut offset = 0;
                    while carry.len() - offset >= frame_len_bytes {
                        on_frame(&carry[offset..offset + frame_len_bytes]);
                        offset += frame_len_bytes;
                    }
                    carry.drain(..offset);
                },
                |err| warn!(%err, "capture stream error"),
                None,
            )
        }
    }
    .map_err(|e| Error::AudioOpenFailed(format!("build_input_stream: {e}")))?;
    stream
        .play()
        .map_err(|e| Error::AudioOpenFailed(format!("starting capture stream: {e}")))?;
    debug!(
        sample_rate = config.sample_rate,
        channels = config.channel_count,
        "capture stream running"
    );
    Ok(stream)
}

/// Starts playback on `dev`, draining `ring` (raw little-endian bytes in
/// `config.sample_format`) into the output callback. The callback never
/// blocks or allocates: `ring`'s own atomics make every read wait-free, and
/// an underrun simply plays back the silence `read_or_silence` already
/// zero-fills.
pub fn build_playback_stream(
    dev: &Device,
    config: &AudioConfig,
    ring: Arc<RingBuffer>,
    running: Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    let stream_config = StreamConfig {
        channels: config.channel_count as u16,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    // Pre-allocated once, before the stream starts, so the realtime callback
    // never touches the allocator. Sized generously against the host's
    // largest plausible callback block; a request beyond this is clamped
    // (the excess plays silence) rather than resized on the audio thread.
    const MAX_CALLBACK_FRAMES: usize = 8192;
    let sample_size = config.sample_format.sample_size();
    let scratch_cap = MAX_CALLBACK_FRAMES * config.channel_count.max(1) as usize * sample_size;

    let stream = match config.sample_format {
        SampleFormat::F32 => {
            let mut scratch: Vec<u8> = vec![0u8; scratch_cap];
            dev.build_output_stream(
                &stream_config,
                move |out: &mut [f32], _| {
                    if !running.load(Ordering::Relaxed) {
                        out.fill(0.0);
                        return;
                    }
                    let needed = (out.len() * 4).min(scratch.len());
                    let usable_samples = needed / 4;
                    ring.read_or_silence(&mut scratch[..needed]);
                    for (sample, bytes) in out[..usable_samples]
                        .iter_mut()
                        .zip(scratch[..needed].chunks_exact(4))
                    {
                        *sample = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                    }
                    out[usable_samples..].fill(0.0);
                },
                |err| warn!(%err, "playback stream error"),
                None,
            )
        }
        SampleFormat::I16 => {
            let mut scratch: Vec<u8> = vec![0u8; scratch_cap];
            dev.build_output_stream(
                &stream_config,
                move |out: &mut [i16], _| {
                    if !running.load(Ordering::Relaxed) {
                        out.fill(0);
                        return;
                    }
                    let needed = (out.len() * 2).min(scratch.len());
                    let usable_samples = needed / 2;
                    ring.read_or_silence(&mut scratch[..needed]);
                    for (sample, bytes) in out[..usable_samples]
                        .iter_mut()
                        .zip(scratch[..needed].chunks_exact(2))
                    {
                        *sample = i16::from_le_bytes([bytes[0], bytes[1]]);
                    }
                    out[usable_samples..].fill(0);
                },
                |err| warn!(%err, "playback stream error"),
                None,
            )
        }
    }
    .map_err(|e| Error::AudioOpenFailed(format!("build_output_stream: {e}")))?;
    stream
        .play()
        .map_err(|e| Error::AudioOpenFailed(format!("starting playback stream: {e}")))?;
    debug!(
        sample_rate = config.sample_rate,
        channels = config.channel_count,
        "playback stream running"
    );
    Ok(stream)
}
