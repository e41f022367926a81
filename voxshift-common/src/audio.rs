//! Audio buffers and PCM conversion
//!
//! Blobs hold encoded audio (anything symphonia probes). The model only ever
//! sees [`AudioBuffer`]s already normalized to the configured format; the
//! conversion path is decode → 16-bit PCM → f32 in [-1, 1] → down-mix →
//! resample. Output goes the other way: clip → 16-bit PCM → WAV.

use crate::config::AudioSettings;
use crate::{Error, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// Only 16-bit PCM is produced or accepted by the model
pub const SAMPLE_WIDTH: u16 = 2;

const PCM16_SCALE: f32 = 32768.0;

/// Sample layout of an [`AudioBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bytes per sample of the fixed-point representation
    pub sample_width: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            sample_width: SAMPLE_WIDTH,
        }
    }
}

impl From<&AudioSettings> for AudioFormat {
    fn from(settings: &AudioSettings) -> Self {
        Self {
            sample_rate: settings.sample_rate,
            channels: settings.num_channels,
            sample_width: settings.sample_width,
        }
    }
}

/// Interleaved f32 samples in [-1, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub format: AudioFormat,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, format: AudioFormat) -> Self {
        Self { samples, format }
    }

    pub fn num_frames(&self) -> usize {
        match self.format.channels {
            0 => 0,
            n => self.samples.len() / n as usize,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.format.sample_rate == 0 {
            return 0.0;
        }
        self.num_frames() as f64 / self.format.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Fails unless the buffer is exactly in `expected` format
    pub fn ensure_format(&self, expected: &AudioFormat) -> Result<()> {
        if &self.format != expected {
            return Err(Error::Audio(format!(
                "Buffer format {:?} does not match model format {:?}",
                self.format, expected
            )));
        }
        if self.samples.len() % expected.channels as usize != 0 {
            return Err(Error::Audio(
                "Buffer length is not a whole number of frames".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / PCM16_SCALE).collect()
}

/// Scale to 16-bit, clipping anything outside the integer range
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let scaled = (s * PCM16_SCALE).round();
            if scaled.is_nan() {
                0
            } else {
                scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
            }
        })
        .collect()
}

/// Decode an encoded audio blob to 16-bit PCM, then to f32.
///
/// The returned buffer keeps the blob's native sample rate and channel count.
pub fn decode(bytes: &[u8]) -> Result<AudioBuffer> {
    let source = Cursor::new(bytes.to_vec());
    let mss = MediaSourceStream::new(Box::new(source), Default::default());

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| Error::Audio(format!("Failed to probe audio: {}", e)))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| Error::Audio("No audio track found".to_string()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| Error::Audio("Sample rate unknown".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| Error::Audio(format!("Failed to create decoder: {}", e)))?;

    let mut pcm: Vec<i16> = Vec::new();
    let mut channels: Option<u16> = track.codec_params.channels.map(|c| c.count() as u16);

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(Error::Audio(format!("Error reading packet: {}", e))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("Skipping undecodable packet: {}", e);
                continue;
            }
            Err(e) => return Err(Error::Audio(format!("Failed to decode packet: {}", e))),
        };

        let spec = *decoded.spec();
        channels.get_or_insert(spec.channels.count() as u16);

        let mut buf = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        pcm.extend_from_slice(buf.samples());
    }

    let channels = channels.ok_or_else(|| Error::Audio("Channel count unknown".to_string()))?;

    debug!(
        sample_rate = sample_rate,
        channels = channels,
        samples = pcm.len(),
        "Decoded audio blob"
    );

    Ok(AudioBuffer::new(
        pcm16_to_f32(&pcm),
        AudioFormat::new(sample_rate, channels),
    ))
}

/// Bring a decoded buffer into `target` format. Empty audio is rejected.
pub fn normalize(buffer: AudioBuffer, target: &AudioFormat) -> Result<AudioBuffer> {
    if buffer.is_empty() {
        return Err(Error::Audio("Audio contains no samples".to_string()));
    }
    if target.sample_width != SAMPLE_WIDTH {
        return Err(Error::Audio(format!(
            "Unsupported sample width {}",
            target.sample_width
        )));
    }

    let mixed = remix(&buffer.samples, buffer.format.channels, target.channels)?;
    let samples = resample(
        &mixed,
        buffer.format.sample_rate,
        target.sample_rate,
        target.channels,
    )?;

    Ok(AudioBuffer::new(samples, *target))
}

/// Change channel count. Mono targets average all channels, mono sources are
/// duplicated, anything else keeps the first `to` channels.
fn remix(samples: &[f32], from: u16, to: u16) -> Result<Vec<f32>> {
    if from == 0 || to == 0 {
        return Err(Error::Audio("Channel count must be non-zero".to_string()));
    }
    if from == to {
        return Ok(samples.to_vec());
    }

    let from = from as usize;
    let to = to as usize;
    let frames = samples.chunks_exact(from);

    let mixed = if to == 1 {
        frames
            .map(|frame| frame.iter().sum::<f32>() / from as f32)
            .collect()
    } else if from == 1 {
        frames
            .flat_map(|frame| std::iter::repeat(frame[0]).take(to))
            .collect()
    } else if from > to {
        frames.flat_map(|frame| frame[..to].iter().copied()).collect()
    } else {
        return Err(Error::Audio(format!(
            "Cannot up-mix {} channels to {}",
            from, to
        )));
    };
    Ok(mixed)
}

fn resample(input: &[f32], input_rate: u32, output_rate: u32, channels: u16) -> Result<Vec<f32>> {
    if input_rate == output_rate {
        return Ok(input.to_vec());
    }

    debug!(
        "Resampling from {}Hz to {}Hz ({} channels)",
        input_rate, output_rate, channels
    );

    let planar = deinterleave(input, channels);
    let input_frames = planar[0].len();
    if input_frames == 0 {
        return Err(Error::Audio("Audio contains no whole frames".to_string()));
    }

    let mut resampler = FastFixedIn::<f32>::new(
        output_rate as f64 / input_rate as f64,
        1.0,
        PolynomialDegree::Septic,
        input_frames,
        channels as usize,
    )
    .map_err(|e| Error::Audio(format!("Failed to create resampler: {}", e)))?;

    let output = resampler
        .process(&planar, None)
        .map_err(|e| Error::Audio(format!("Resampling failed: {}", e)))?;

    Ok(interleave(output))
}

fn deinterleave(samples: &[f32], channels: u16) -> Vec<Vec<f32>> {
    let n = channels as usize;
    let mut planar = vec![Vec::with_capacity(samples.len() / n); n];
    for frame in samples.chunks_exact(n) {
        for (ch, &s) in frame.iter().enumerate() {
            planar[ch].push(s);
        }
    }
    planar
}

fn interleave(planar: Vec<Vec<f32>>) -> Vec<f32> {
    let frames = planar.first().map(Vec::len).unwrap_or(0);
    let mut out = Vec::with_capacity(frames * planar.len());
    for i in 0..frames {
        for channel in &planar {
            out.push(channel[i]);
        }
    }
    out
}

/// Encode as a 16-bit PCM WAV, clipping out-of-range samples
pub fn encode_wav(buffer: &AudioBuffer) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: buffer.format.channels,
        sample_rate: buffer.format.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut bytes = Vec::new();
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec)
            .map_err(|e| Error::Audio(format!("Failed to create WAV writer: {}", e)))?;
        for sample in f32_to_pcm16(&buffer.samples) {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(format!("Failed to write sample: {}", e)))?;
        }
        writer
            .finalize()
            .map_err(|e| Error::Audio(format!("Failed to finalize WAV: {}", e)))?;
    }
    Ok(bytes)
}
