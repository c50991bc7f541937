//! Thin wrapper around the low-delay perceptual codec used to compress
//! captured audio before encryption and to decompress it again on the sink
//! side. Kept behind a small trait so the transport/session code never
//! touches `audiopus` types directly.

use audiopus::coder::{Decoder as OpusDecoder, Encoder as OpusEncoder};
use audiopus::{Application, Channels, SampleRate};

use crate::error::ProtocolError as Error;
use crate::error::Result;
use crate::wire::{AudioConfig, SampleFormat};

pub trait FrameEncoder {
    /// Encodes one PCM frame (interleaved raw samples in the session's
    /// negotiated `sample_format`, `frame_size * channel_count * sample_size`
    /// bytes long) into `out`, returning the number of bytes written.
    fn encode(&mut self, pcm: &[u8], out: &mut [u8]) -> Result<usize>;
}

pub trait FrameDecoder {
    /// Decodes one compressed frame into `pcm` (interleaved raw samples in
    /// the session's negotiated `sample_format`), returning the number of
    /// samples written per channel. Pass an empty `payload` to signal packet
    /// loss concealment.
    fn decode(&mut self, payload: &[u8], pcm: &mut [u8]) -> Result<usize>;
}

fn bytes_to_f32(bytes: &[u8], out: &mut Vec<f32>) {
    out.clear();
    out.extend(bytes.chunks_exact(4).map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])));
}

fn f32_to_bytes(samples: &[f32], out: &mut [u8]) {
    for (sample, chunk) in samples.iter().zip(out.chunks_exact_mut(4)) {
        chunk.copy_from_slice(&sample.to_le_bytes());
    }
}

fn bytes_to_i16(bytes: &[u8], out: &mut Vec<i16>) {
    out.clear();
    out.extend(bytes.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])));
}

fn i16_to_bytes(samples: &[i16], out: &mut [u8]) {
    for (sample, chunk) in samples.iter().zip(out.chunks_exact_mut(2)) {
        chunk.copy_from_slice(&sample.to_le_bytes());
    }
}

fn channels_for(count: u8) -> Result<Channels> {
    match count {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        other => Err(Error::AudioOpenFailed(format!(
            "codec only supports mono/stereo, got {other} channels"
        ))),
    }
}

fn sample_rate_for(rate: u32) -> Result<SampleRate> {
    match rate {
        8_000 => Ok(SampleRate::Hz8000),
        12_000 => Ok(SampleRate::Hz12000),
        16_000 => Ok(SampleRate::Hz16000),
        24_000 => Ok(SampleRate::Hz24000),
        48_000 => Ok(SampleRate::Hz48000),
        other => Err(Error::AudioOpenFailed(format!(
            "unsupported sample rate {other}, codec requires an Opus-standard rate"
        ))),
    }
}

pub struct Codec {
    encoder: OpusEncoder,
    decoder: OpusDecoder,
    channel_count: usize,
    sample_format: SampleFormat,
    f32_scratch: Vec<f32>,
    i16_scratch: Vec<i16>,
}

impl Codec {
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let channels = channels_for(config.channel_count)?;
        let sample_rate = sample_rate_for(config.sample_rate)?;
        let encoder = OpusEncoder::new(sample_rate, channels, Application::Audio)
            .map_err(|e| Error::AudioOpenFailed(format!("opus encoder init: {e}")))?;
        let decoder = OpusDecoder::new(sample_rate, channels)
            .map_err(|e| Error::AudioOpenFailed(format!("opus decoder init: {e}")))?;
        let max_samples = config.frame_size as usize * config.channel_count.max(1) as usize;
        Ok(Self {
            encoder,
            decoder,
            channel_count: config.channel_count as usize,
            sample_format: config.sample_format,
            f32_scratch: vec![0.0; max_samples],
            i16_scratch: vec![0i16; max_samples],
        })
    }
}

impl FrameEncoder for Codec {
    fn encode(&mut self, pcm: &[u8], out: &mut [u8]) -> Result<usize> {
        match self.sample_format {
            SampleFormat::F32 => {
                bytes_to_f32(pcm, &mut self.f32_scratch);
                self.encoder
                    .encode_float(&self.f32_scratch, out)
                    .map_err(|_| Error::DecodeFailed)
            }
            SampleFormat::I16 => {
                bytes_to_i16(pcm, &mut self.i16_scratch);
                self.encoder
                    .encode(&self.i16_scratch, out)
                    .map_err(|_| Error::DecodeFailed)
            }
        }
    }
}

impl FrameDecoder for Codec {
    fn decode(&mut self, payload: &[u8], pcm: &mut [u8]) -> Result<usize> {
        let sample_size = self.sample_format.sample_size();
        let frame_size_per_channel = (pcm.len() / sample_size) / self.channel_count.max(1);
        let packet = if payload.is_empty() { None } else { Some(payload) };
        match self.sample_format {
            SampleFormat::F32 => {
                let total_samples = pcm.len() / sample_size;
                self.f32_scratch.resize(total_samples, 0.0);
                let written = self
                    .decoder
                    .decode_float(packet, &mut self.f32_scratch, false)
                    .map_err(|_| Error::DecodeFailed)?
                    .min(frame_size_per_channel);
                f32_to_bytes(&self.f32_scratch, pcm);
                Ok(written)
            }
            SampleFormat::I16 => {
                let total_samples = pcm.len() / sample_size;
                self.i16_scratch.resize(total_samples, 0);
                let written = self
                    .decoder
                    .decode(packet, &mut self.i16_scratch, false)
                    .map_err(|_| Error::DecodeFailed)?
                    .min(frame_size_per_channel);
                i16_to_bytes(&self.i16_scratch, pcm);
                Ok(written)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AudioConfig {
        AudioConfig {
            channel_count: 1,
            sample_format: crate::wire::SampleFormat::F32,
            frame_size: 960,
            sample_rate: 48_000,
        }
    }

    #[test]
    fn rejects_unsupported_channel_count() {
        let mut bad = config();
        bad.channel_count = 5;
        assert!(Codec::new(&bad).is_err());
    }

    #[test]
    fn rejects_non_opus_sample_rate() {
        let mut bad = config();
        bad.sample_rate = 44_100;
        assert!(Codec::new(&bad).is_err());
    }

    #[test]
    fn encode_then_decode_round_trips_silence() {
        let cfg = config();
        let mut codec = Codec::new(&cfg).unwrap();
        let pcm_in = vec![0u8; cfg.frame_size as usize * 4];
        let mut out = vec![0u8; 1200];
        let written = codec.encode(&pcm_in, &mut out).unwrap();
        assert!(written > 0);

        let mut pcm_out = vec![0u8; cfg.frame_size as usize * 4];
        let decoded = codec.decode(&out[..written], &mut pcm_out).unwrap();
        assert_eq!(decoded, cfg.frame_size as usize);
    }

    #[test]
    fn empty_payload_triggers_concealment() {
        let cfg = config();
        let mut codec = Codec::new(&cfg).unwrap();
        let mut pcm_out = vec![0u8; cfg.frame_size as usize * 4];
        let decoded = codec.decode(&[], &mut pcm_out).unwrap();
        assert_eq!(decoded, cfg.frame_size as usize);
    }

    #[test]
    fn i16_round_trip_uses_the_integer_codec_path() {
        let mut cfg = config();
        cfg.sample_format = crate::wire::SampleFormat::I16;
        let mut codec = Codec::new(&cfg).unwrap();
        let pcm_in = vec![0u8; cfg.frame_size as usize * 2];
        let mut out = vec![0u8; 1200];
        let written = codec.encode(&pcm_in, &mut out).unwrap();
        assert!(written > 0);

        let mut pcm_out = vec![0u8; cfg.frame_size as usize * 2];
        let decoded = codec.decode(&out[..written], &mut pcm_out).unwrap();
        assert_eq!(decoded, cfg.frame_size as usize);
    }
}
