//! PCM conversion helpers.
//!
//! Speech providers want 16 kHz mono; the transport wants 48 kHz stereo.
//! These helpers convert between the two and package PCM as WAV for upload.

use parley_types::{CHANNELS, SAMPLE_RATE};
use std::time::Duration;

/// Sample rate used for recognition uploads.
pub const RECOGNITION_SAMPLE_RATE: u32 = 16_000;

/// Averages interleaved channels down to mono.
pub fn downmix(samples: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|group| {
            let sum: i32 = group.iter().map(|&s| i32::from(s)).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Converts transport PCM (48 kHz interleaved stereo) to 16 kHz mono.
///
/// Each output sample is the mean of three consecutive mono samples, which
/// doubles as a crude anti-aliasing filter.
pub fn transport_to_recognition(samples: &[i16]) -> Vec<i16> {
    let mono = downmix(samples, CHANNELS);
    let factor = (SAMPLE_RATE / RECOGNITION_SAMPLE_RATE) as usize;
    mono.chunks_exact(factor)
        .map(|group| {
            let sum: i32 = group.iter().map(|&s| i32::from(s)).sum();
            (sum / factor as i32) as i16
        })
        .collect()
}

/// Linear-interpolation resampler for mono PCM.
pub fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * u64::from(to_rate) / u64::from(from_rate)) as usize;
    let step = f64::from(from_rate) / f64::from(to_rate);
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            let frac = pos - idx as f64;
            let a = f64::from(samples[idx.min(last)]);
            let b = f64::from(samples[(idx + 1).min(last)]);
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}

/// Converts provider PCM of any rate and channel count to transport PCM.
pub fn to_transport(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<i16> {
    let mono = downmix(samples, usize::from(channels.max(1)));
    let resampled = resample_linear(&mono, sample_rate, SAMPLE_RATE);
    let mut stereo = Vec::with_capacity(resampled.len() * CHANNELS);
    for sample in resampled {
        for _ in 0..CHANNELS {
            stereo.push(sample);
        }
    }
    stereo
}

/// Decodes little-endian 16-bit PCM bytes. A trailing odd byte is ignored.
pub fn pcm_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Playback duration of `samples` interleaved samples.
pub fn duration_of(samples: usize, sample_rate: u32, channels: u16) -> Duration {
    let per_channel = samples as u64 / u64::from(channels.max(1));
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(per_channel * 1_000_000 / u64::from(sample_rate))
}

/// Wraps 16-bit PCM in a canonical 44-byte RIFF/WAVE header.
pub fn encode_wav(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
    const BITS_PER_SAMPLE: u16 = 16;
    let block_align = channels * BITS_PER_SAMPLE / 8;
    let byte_rate = sample_rate * u32::from(block_align);
    let data_size = (samples.len() * 2) as u32;

    let mut wav = Vec::with_capacity(44 + samples.len() * 2);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_size).to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());

    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_size.to_le_bytes());
    for sample in samples {
        wav.extend_from_slice(&sample.to_le_bytes());
    }
    wav
}

/// Extracts the PCM body and format of a 16-bit WAV file.
///
/// Returns `None` if the header is not PCM16 RIFF/WAVE or has no data chunk.
pub fn decode_wav(bytes: &[u8]) -> Option<(Vec<i16>, u32, u16)> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return None;
    }
    let mut pos = 12;
    let mut format = None;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let size = u32::from_le_bytes([bytes[pos + 4], bytes[pos + 5], bytes[pos + 6], bytes[pos + 7]])
            as usize;
        let body_start = pos + 8;
        let body_end = body_start.saturating_add(size).min(bytes.len());
        let body = &bytes[body_start..body_end];
        match id {
            b"fmt " if body.len() >= 16 => {
                let audio_format = u16::from_le_bytes([body[0], body[1]]);
                let channels = u16::from_le_bytes([body[2], body[3]]);
                let rate = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
                let bits = u16::from_le_bytes([body[14], body[15]]);
                if audio_format != 1 || bits != 16 {
                    return None;
                }
                format = Some((rate, channels));
            }
            b"data" => {
                let (rate, channels) = format?;
                return Some((pcm_from_le_bytes(body), rate, channels));
            }
            _ => {}
        }
        // Chunks are word aligned.
        pos = body_start.saturating_add(size).saturating_add(size & 1);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_averages_pairs() {
        assert_eq!(downmix(&[100, 300, -50, 50], 2), vec![200, 0]);
        assert_eq!(downmix(&[1, 2, 3], 1), vec![1, 2, 3]);
    }

    #[test]
    fn transport_frame_becomes_320_mono_samples() {
        let frame = vec![600i16; parley_types::SAMPLES_PER_FRAME];
        let out = transport_to_recognition(&frame);
        assert_eq!(out.len(), 320);
        assert!(out.iter().all(|&s| s == 600));
    }

    #[test]
    fn resample_24k_to_48k_doubles_length_and_interpolates() {
        let out = resample_linear(&[0, 100, 200], 24_000, 48_000);
        assert_eq!(out.len(), 6);
        assert_eq!(&out[..4], &[0, 50, 100, 150]);
    }

    #[test]
    fn to_transport_duplicates_mono_into_stereo() {
        let out = to_transport(&[7, 9], SAMPLE_RATE, 1);
        assert_eq!(out, vec![7, 7, 9, 9]);
    }

    #[test]
    fn wav_header_describes_body() {
        let wav = encode_wav(&[1, -1, 2, -2], 16_000, 1);
        assert_eq!(wav.len(), 44 + 8);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes(wav[24..28].try_into().unwrap()), 16_000);
        assert_eq!(u32::from_le_bytes(wav[40..44].try_into().unwrap()), 8);

        let (samples, rate, channels) = decode_wav(&wav).unwrap();
        assert_eq!(samples, vec![1, -1, 2, -2]);
        assert_eq!((rate, channels), (16_000, 1));
    }

    #[test]
    fn decode_wav_rejects_non_riff() {
        assert!(decode_wav(b"not a wav file at all").is_none());
    }

    #[test]
    fn duration_counts_per_channel_samples() {
        assert_eq!(duration_of(1920, 48_000, 2), Duration::from_millis(20));
        assert_eq!(duration_of(16_000, 16_000, 1), Duration::from_secs(1));
    }
}
