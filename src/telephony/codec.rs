//! G.711 µ-law und lineares Resampling für die Telefonleitung

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Invalid resampling rates: {from} Hz -> {to} Hz")]
    InvalidRate { from: u32, to: u32 },

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

// ============================================================================
// µ-LAW
// ============================================================================

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// Kodiert ein PCM16 Sample nach G.711 µ-law
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };

    pcm = pcm.min(CLIP) + BIAS;
    let exponent = 31 - ((pcm >> 7) as u32).leading_zeros() as i32;
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;

    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Dekodiert ein G.711 µ-law Byte nach PCM16
pub fn ulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = ((byte >> 4) & 0x07) as i32;
    let mantissa = (byte & 0x0F) as i32;

    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

pub fn encode_ulaw(samples: &[i16]) -> Vec<u8> {
    samples.iter().copied().map(linear_to_ulaw).collect()
}

pub fn decode_ulaw(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().copied().map(ulaw_to_linear).collect()
}

/// PCM16 (Leitungsrate) -> µ-law -> base64
pub fn encode_payload(samples: &[i16]) -> String {
    STANDARD.encode(encode_ulaw(samples))
}

/// base64 -> µ-law -> PCM16 (Leitungsrate)
pub fn decode_payload(payload: &str) -> Result<Vec<i16>, CodecError> {
    Ok(decode_ulaw(&STANDARD.decode(payload.trim())?))
}

// ============================================================================
// RESAMPLER
// ============================================================================

/// Linearer Resampler mit Zustand über Blockgrenzen hinweg.
///
/// Die Position des nächsten Ausgabe-Samples wird in Einheiten von `1/to`
/// Eingabe-Samples gezählt, gemessen ab dem letzten Sample des vorigen Blocks.
/// Damit liefert jeder Block exakt `len * to / from` Samples, sofern die
/// Blocklänge ein Vielfaches von `from` ist.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    from: u64,
    to: u64,
    pos: u64,
    prev: i16,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, CodecError> {
        if from_rate == 0 || to_rate == 0 {
            return Err(CodecError::InvalidRate {
                from: from_rate,
                to: to_rate,
            });
        }
        let divisor = gcd(from_rate as u64, to_rate as u64);
        let from = from_rate as u64 / divisor;
        let to = to_rate as u64 / divisor;

        Ok(Self {
            from,
            to,
            pos: from,
            prev: 0,
        })
    }

    pub fn process(&mut self, input: &[i16]) -> Vec<i16> {
        let Some(&last) = input.last() else {
            return Vec::new();
        };
        let n = input.len() as u64;
        let mut output = Vec::with_capacity((n * self.to / self.from + 1) as usize);

        // Index 0 ist das letzte Sample des vorigen Blocks
        let sample_at = |index: u64| -> i64 {
            if index == 0 {
                self.prev as i64
            } else {
                input[(index - 1) as usize] as i64
            }
        };

        let mut pos = self.pos;
        while pos <= n * self.to {
            let index = pos / self.to;
            let frac = (pos % self.to) as i64;
            let a = sample_at(index);
            let value = if frac == 0 {
                a
            } else {
                let b = sample_at(index + 1);
                a + (b - a) * frac / self.to as i64
            };
            output.push(value as i16);
            pos += self.from;
        }

        self.pos = pos - n * self.to;
        self.prev = last;
        output
    }

    pub fn reset(&mut self) {
        self.pos = self.from;
        self.prev = 0;
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ulaw_known_values() {
        assert_eq!(linear_to_ulaw(0), 0xFF);
        assert_eq!(ulaw_to_linear(0xFF), 0);
        assert_eq!(ulaw_to_linear(0x7F), 0);
        assert_eq!(linear_to_ulaw(i16::MAX), 0x80);
        assert_eq!(linear_to_ulaw(i16::MIN), 0x00);
        assert_eq!(ulaw_to_linear(0x80), 32124);
        assert_eq!(ulaw_to_linear(0x00), -32124);
    }

    #[test]
    fn test_ulaw_roundtrip_error_is_bounded() {
        for x in (i16::MIN..=i16::MAX).step_by(7) {
            let decoded = ulaw_to_linear(linear_to_ulaw(x)) as i32;
            let x = x as i32;
            let bound = (x.abs() >> 4) + 8;
            assert!(
                (decoded - x).abs() <= bound,
                "sample {} decoded as {}",
                x,
                decoded
            );
            // Vorzeichen bleibt erhalten
            assert!(decoded == 0 || decoded.signum() == x.signum());
        }
    }

    #[test]
    fn test_payload_roundtrip() {
        let samples = vec![0, 1000, -1000, 8000, -8000];
        let payload = encode_payload(&samples);
        let decoded = decode_payload(&payload).unwrap();
        assert_eq!(decoded.len(), samples.len());
        assert!(decode_payload("not base64!").is_err());
    }

    #[test]
    fn test_resampler_counts() {
        let mut down = LinearResampler::new(16_000, 8_000).unwrap();
        let mut up = LinearResampler::new(8_000, 16_000).unwrap();

        for _ in 0..3 {
            assert_eq!(down.process(&[100; 320]).len(), 160);
            assert_eq!(up.process(&[100; 160]).len(), 320);
        }

        let block: Vec<i16> = (0..640).map(|i| (i % 100) as i16).collect();
        let roundtrip = up.process(&down.process(&block));
        assert_eq!(roundtrip.len(), block.len());
    }

    #[test]
    fn test_resampler_interpolates() {
        let mut up = LinearResampler::new(8_000, 16_000).unwrap();
        // Erster Wert liegt zwischen dem (stillen) Vorgänger und dem ersten Sample
        assert_eq!(up.process(&[100, 200]), vec![50, 100, 150, 200]);
        assert_eq!(up.process(&[300]), vec![250, 300]);
    }

    #[test]
    fn test_resampler_rejects_zero_rate() {
        assert_eq!(
            LinearResampler::new(0, 8_000).unwrap_err(),
            CodecError::InvalidRate { from: 0, to: 8_000 }
        );
    }
}
