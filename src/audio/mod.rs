//! Audio packaging utilities
//!
//! Repackages raw PCM into canonical WAV containers for the ASR and TTS
//! adapters, and computes RMS energy for the ambient noise baseline.
//! No encoding or decoding beyond the RIFF header is performed here.

use anyhow::{bail, Context, Result};

/// Sample rate used for microphone capture
pub const MIC_SAMPLE_RATE: u32 = 16_000;

/// Sample rate used for TTS injection into meeting workers
pub const TTS_SAMPLE_RATE: u32 = 24_000;

/// Decoded WAV header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavInfo {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub data_len: u32,
}

/// Pack raw little-endian PCM i16 mono bytes into a WAV container.
///
/// Produces the canonical 44-byte RIFF/WAVE header followed by the payload.
/// A trailing odd byte is dropped so the payload stays sample-aligned.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::new(&mut cursor, spec)
        .context("Failed to create WAV writer")?;

    for chunk in pcm.chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([chunk[0], chunk[1]]))?;
    }

    writer.finalize()?;
    Ok(cursor.into_inner())
}

/// Parse a WAV header and return its fields plus the PCM payload.
///
/// Parses the header manually rather than via hound: upstream services
/// stream WAV files with 0xFFFFFFFF chunk sizes that hound rejects. The
/// data length is clamped to the bytes actually present.
pub fn read_wav(bytes: &[u8]) -> Result<(WavInfo, &[u8])> {
    if bytes.len() < 44 {
        bail!("WAV data too short: {} bytes", bytes.len());
    }
    if &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        bail!("Not a RIFF/WAVE container");
    }

    let mut pos = 12;
    let mut fmt: Option<(u16, u32, u16)> = None;

    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let size = u32::from_le_bytes([bytes[pos + 4], bytes[pos + 5], bytes[pos + 6], bytes[pos + 7]]);
        let body = pos + 8;

        match id {
            b"fmt " => {
                if body + 16 > bytes.len() {
                    bail!("Truncated fmt chunk");
                }
                let channels = u16::from_le_bytes([bytes[body + 2], bytes[body + 3]]);
                let sample_rate = u32::from_le_bytes([
                    bytes[body + 4], bytes[body + 5], bytes[body + 6], bytes[body + 7],
                ]);
                let bits = u16::from_le_bytes([bytes[body + 14], bytes[body + 15]]);
                fmt = Some((channels, sample_rate, bits));
            }
            b"data" => {
                let (channels, sample_rate, bits) = fmt.context("data chunk before fmt chunk")?;
                let available = (bytes.len() - body) as u32;
                let data_len = if size == u32::MAX || size > available { available } else { size };
                let payload = &bytes[body..body + data_len as usize];
                return Ok((
                    WavInfo { channels, sample_rate, bits_per_sample: bits, data_len },
                    payload,
                ));
            }
            _ => {}
        }

        // Chunks are word-aligned
        let advance = size.min((bytes.len() - body) as u32);
        pos = body + advance as usize + (advance as usize & 1);
    }

    bail!("WAV container has no data chunk")
}

/// Accept a client audio blob as raw PCM.
///
/// Clients normally upload bare PCM; some send a WAV container. Strip the
/// header when present so downstream packing never double-wraps.
pub fn ensure_pcm(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        match read_wav(bytes) {
            Ok((_, payload)) => payload.to_vec(),
            Err(_) => bytes.to_vec(),
        }
    } else {
        bytes.to_vec()
    }
}

/// Interpret raw little-endian bytes as PCM i16 samples
pub fn pcm_bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Compute RMS energy of PCM samples
pub fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&s| (s as f32).powi(2)).sum::<f32>() / samples.len() as f32).sqrt()
}
