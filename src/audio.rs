//! # Audio Payload Decoding
//!
//! Turns the raw bytes a client uploads into the normalized mono samples the
//! recognizer consumes. Two formats are accepted:
//! - raw little-endian 16-bit PCM, mono, 16kHz
//! - a WAV container holding 16-bit PCM or 32-bit float at 16kHz
//!
//! Anything else is rejected with a descriptive message. Stereo WAV input is
//! downmixed by averaging the channels.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// The sample rate the recognizer expects.
pub const SAMPLE_RATE: u32 = 16000;

/// Decode an uploaded audio payload into normalized f32 samples.
pub fn decode_samples(bytes: &[u8]) -> Result<Vec<f32>, String> {
    if bytes.is_empty() {
        return Err("No audio data provided".to_string());
    }
    if bytes.len() >= 4 && &bytes[..4] == b"RIFF" {
        decode_wav(bytes)
    } else {
        decode_pcm16(bytes)
    }
}

/// Raw 16-bit PCM little-endian, normalized to [-1.0, 1.0].
fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, String> {
    if bytes.len() % 2 != 0 {
        return Err("Audio data length must be even for 16-bit samples".to_string());
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }
    Ok(samples)
}

/// WAV container. Validates the sample rate, converts the bit depth, and
/// downmixes stereo.
fn decode_wav(bytes: &[u8]) -> Result<Vec<f32>, String> {
    let mut cursor = Cursor::new(bytes);
    let (header, data) =
        wav::read(&mut cursor).map_err(|err| format!("Invalid WAV payload: {}", err))?;

    if header.sampling_rate != SAMPLE_RATE {
        return Err(format!(
            "Unsupported WAV sample rate {} (expected {})",
            header.sampling_rate, SAMPLE_RATE
        ));
    }

    let samples: Vec<f32> = match data {
        wav::BitDepth::Sixteen(samples) => samples
            .into_iter()
            .map(|sample| sample as f32 / 32768.0)
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        other => {
            return Err(format!(
                "Unsupported WAV bit depth {:?} (expected 16-bit PCM or 32-bit float)",
                other
            ))
        }
    };

    match header.channel_count {
        1 => Ok(samples),
        2 => Ok(samples
            .chunks_exact(2)
            .map(|pair| (pair[0] + pair[1]) / 2.0)
            .collect()),
        n => Err(format!("Unsupported WAV channel count {}", n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn pcm16_bytes(samples: &[i16]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for &sample in samples {
            bytes.write_i16::<LittleEndian>(sample).unwrap();
        }
        bytes
    }

    #[test]
    fn test_raw_pcm16_decoding() {
        let bytes = pcm16_bytes(&[0, 16384, -16384, 32767]);
        let samples = decode_samples(&bytes).unwrap();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0], 0.0);
        assert!((samples[1] - 0.5).abs() < 1e-4);
        assert!((samples[2] + 0.5).abs() < 1e-4);
        assert!(samples[3] < 1.0);
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(decode_samples(&[]).is_err());
    }

    #[test]
    fn test_odd_length_pcm_rejected() {
        assert!(decode_samples(&[0x01, 0x02, 0x03]).is_err());
    }

    #[test]
    fn test_wav_mono_decoding() {
        let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 1, SAMPLE_RATE, 16);
        let mut bytes = Cursor::new(Vec::new());
        wav::write(header, &wav::BitDepth::Sixteen(vec![0, 16384, -16384]), &mut bytes).unwrap();

        let samples = decode_samples(bytes.get_ref()).unwrap();
        assert_eq!(samples.len(), 3);
        assert!((samples[1] - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_wav_stereo_downmix() {
        let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 2, SAMPLE_RATE, 16);
        let mut bytes = Cursor::new(Vec::new());
        // Left channel loud, right channel silent
        wav::write(
            header,
            &wav::BitDepth::Sixteen(vec![16384, 0, 16384, 0]),
            &mut bytes,
        )
        .unwrap();

        let samples = decode_samples(bytes.get_ref()).unwrap();
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 0.25).abs() < 1e-4);
    }

    #[test]
    fn test_wav_wrong_sample_rate_rejected() {
        let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 1, 44100, 16);
        let mut bytes = Cursor::new(Vec::new());
        wav::write(header, &wav::BitDepth::Sixteen(vec![0, 1, 2]), &mut bytes).unwrap();

        let err = decode_samples(bytes.get_ref()).unwrap_err();
        assert!(err.contains("sample rate"));
    }
}
