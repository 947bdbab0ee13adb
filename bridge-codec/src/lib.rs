//! G.711 μ-law codec and naive 8 kHz ↔ 16 kHz resampling.
//!
//! Phone audio is band-limited well below 4 kHz, so zero-order-hold
//! upsampling and plain decimation are audibly indistinguishable from
//! proper filtering here, and downstream speech recognition tolerates
//! narrowband input anyway. All functions are pure and stateless.

const BIAS: i32 = 0x84; // 132
const CLIP: i32 = 32635;

/// Decode μ-law bytes to linear PCM16, one sample per byte.
pub fn mulaw_decode(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| mulaw_decode_one(b)).collect()
}

/// Encode linear PCM16 samples to μ-law, one byte per sample.
pub fn mulaw_encode(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| mulaw_encode_one(s)).collect()
}

fn mulaw_decode_one(byte: u8) -> i16 {
    let u = !byte;
    let exponent = i32::from((u >> 4) & 0x07);
    let mantissa = i32::from(u & 0x0F);
    // reconstruct the quantization interval midpoint, then strip the bias
    let magnitude = (((mantissa << 1) | 0x21) << (exponent + 2)) - BIAS;
    if u & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

fn mulaw_encode_one(sample: i16) -> u8 {
    let mut pcm = i32::from(sample);
    let sign: u8 = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    if pcm > CLIP {
        pcm = CLIP;
    }
    pcm += BIAS;

    // segment = position of the highest set bit among 14..7
    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        mask >>= 1;
        exponent -= 1;
    }
    let mantissa = ((pcm >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Duplicate every sample (zero-order hold). Output length is `2 * input`.
pub fn upsample_8k_to_16k(samples: &[i16]) -> Vec<i16> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.push(s);
        out.push(s);
    }
    out
}

/// Drop every second sample. Output length is `input / 2` (floor).
pub fn downsample_16k_to_8k(samples: &[i16]) -> Vec<i16> {
    samples.iter().step_by(2).copied().collect()
}

/// Pack PCM16 samples as little-endian bytes.
pub fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Unpack little-endian bytes to PCM16 samples. A trailing odd byte is dropped.
pub fn bytes_to_pcm(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}
