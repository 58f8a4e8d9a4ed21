//! G.711 companding (RFC 3551): µ-law (PCMU, payload type 0) and A-law
//! (PCMA, payload type 8). Both directions are pure arithmetic over lookup
//! tables computed at compile time.

/// Byte a PCMU packet is padded with when the microphone queue is empty.
pub const MULAW_SILENCE: u8 = 0xFF;
/// Byte a PCMA packet is padded with when the microphone queue is empty.
pub const ALAW_SILENCE: u8 = 0xD5;

const BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32635;

// EXP_LUT[n] is the position of the highest set bit of n (0 for n = 0),
// i.e. the G.711 segment number once the magnitude has been shifted into
// an 8-bit index.
const EXP_LUT: [u8; 256] = build_exp_lut();

const fn build_exp_lut() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut n = 1usize;
    while n < 256 {
        let mut value = n;
        let mut exp = 0u8;
        while value > 1 {
            value >>= 1;
            exp += 1;
        }
        table[n] = exp;
        n += 1;
    }
    table
}

const MULAW_DECODE: [i16; 256] = build_mulaw_decode();
const ALAW_DECODE: [i16; 256] = build_alaw_decode();

const fn build_mulaw_decode() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut byte = 0usize;
    while byte < 256 {
        table[byte] = decode_mulaw_sample(byte as u8);
        byte += 1;
    }
    table
}

const fn build_alaw_decode() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut byte = 0usize;
    while byte < 256 {
        table[byte] = decode_alaw_sample(byte as u8);
        byte += 1;
    }
    table
}

/// Encode one signed 16-bit linear sample to µ-law.
pub const fn encode_mulaw_sample(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80u8
    } else {
        0x00
    };
    if magnitude > MULAW_CLIP {
        magnitude = MULAW_CLIP;
    }
    magnitude += BIAS;
    let exponent = EXP_LUT[((magnitude >> 7) & 0xFF) as usize];
    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Decode one µ-law byte to a signed 16-bit linear sample.
pub const fn decode_mulaw_sample(byte: u8) -> i16 {
    let ulaw = !byte;
    let exponent = ((ulaw >> 4) & 0x07) as i32;
    let mantissa = (ulaw & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if ulaw & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encode one signed 16-bit linear sample to A-law.
pub const fn encode_alaw_sample(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    // Transmitted sign bit set means positive in A-law.
    let sign = if magnitude >= 0 {
        0x80u8
    } else {
        magnitude = -magnitude;
        0x00
    };
    if magnitude > 32767 {
        magnitude = 32767;
    }
    let companded = if magnitude >= 256 {
        let exponent = EXP_LUT[((magnitude >> 8) & 0x7F) as usize];
        let mantissa = ((magnitude >> (exponent + 4)) & 0x0F) as u8;
        ((exponent + 1) << 4) | mantissa
    } else {
        (magnitude >> 4) as u8
    };
    (companded | sign) ^ 0x55
}

/// Decode one A-law byte to a signed 16-bit linear sample.
pub const fn decode_alaw_sample(byte: u8) -> i16 {
    let alaw = byte ^ 0x55;
    let exponent = ((alaw >> 4) & 0x07) as i32;
    let mantissa = (alaw & 0x0F) as i32;
    let magnitude = if exponent == 0 {
        (mantissa << 4) + 8
    } else {
        ((mantissa << 4) + 0x108) << (exponent - 1)
    };
    if alaw & 0x80 != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}

pub fn encode_mulaw(pcm: &[i16]) -> Vec<u8> {
    pcm.iter().map(|&s| encode_mulaw_sample(s)).collect()
}

pub fn decode_mulaw(data: &[u8]) -> Vec<i16> {
    data.iter().map(|&b| MULAW_DECODE[b as usize]).collect()
}

pub fn encode_alaw(pcm: &[i16]) -> Vec<u8> {
    pcm.iter().map(|&s| encode_alaw_sample(s)).collect()
}

pub fn decode_alaw(data: &[u8]) -> Vec<i16> {
    data.iter().map(|&b| ALAW_DECODE[b as usize]).collect()
}

/// Reinterpret little-endian PCM bytes as samples. A trailing odd byte is
/// dropped.
pub fn pcm_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

pub fn pcm_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}
