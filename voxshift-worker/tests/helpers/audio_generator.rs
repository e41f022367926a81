//! Sine-tone WAV fixtures

use std::io::Cursor;

/// 16-bit PCM WAV of a 30% amplitude sine tone
pub fn sine_wav(sample_rate: u32, channels: u16, seconds: f64, freq: f32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut bytes = Vec::new();
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec).unwrap();
        let frames = (seconds * sample_rate as f64) as usize;
        for i in 0..frames {
            let t = i as f32 / sample_rate as f32;
            let sample = (0.3 * (2.0 * std::f32::consts::PI * freq * t).sin() * i16::MAX as f32) as i16;
            for _ in 0..channels {
                writer.write_sample(sample).unwrap();
            }
        }
        writer.finalize().unwrap();
    }
    bytes
}

/// One second of 440 Hz at `sample_rate`, mono
pub fn one_second_tone(sample_rate: u32) -> Vec<u8> {
    sine_wav(sample_rate, 1, 1.0, 440.0)
}
