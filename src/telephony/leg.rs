//! Ein aktiver Media-Stream der Telefonleitung

use super::codec::{self, CodecError, LinearResampler};
use crate::audio_engine::{AudioFrame, ChunkResizer};

/// Zustand eines Media-Streams: Resampler beider Richtungen und der
/// Sammelpuffer für eingehendes Audio.
#[derive(Debug)]
pub struct TelephonyLeg {
    stream_id: String,
    call_id: Option<String>,
    /// Leitung -> Engine
    inbound: LinearResampler,
    /// Engine -> Leitung
    outbound: LinearResampler,
    accumulator: ChunkResizer,
}

impl TelephonyLeg {
    pub fn new(
        stream_id: impl Into<String>,
        call_id: Option<String>,
        native_rate: u32,
        line_rate: u32,
        chunk_size: usize,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            stream_id: stream_id.into(),
            call_id,
            inbound: LinearResampler::new(line_rate, native_rate)?,
            outbound: LinearResampler::new(native_rate, line_rate)?,
            accumulator: ChunkResizer::new(chunk_size),
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn call_id(&self) -> Option<&str> {
        self.call_id.as_deref()
    }

    /// Dekodiert einen Payload und liefert alle vollständigen Engine-Frames.
    /// Ein Rest bleibt für den nächsten Payload im Puffer.
    pub fn receive(&mut self, payload: &str) -> Result<Vec<AudioFrame>, CodecError> {
        let line = codec::decode_payload(payload)?;
        let native = self.inbound.process(&line);
        Ok(self.accumulator.push(&native))
    }

    /// Kodiert einen Engine-Frame zu einem Leitungs-Payload
    pub fn encode(&mut self, frame: &[i16]) -> String {
        let line = self.outbound.process(frame);
        codec::encode_payload(&line)
    }

    /// Samples, die noch auf einen vollständigen Frame warten
    pub fn pending(&self) -> usize {
        self.accumulator.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    fn leg() -> TelephonyLeg {
        TelephonyLeg::new("MZ123", Some("CA1".into()), 16_000, 8_000, 640).unwrap()
    }

    fn silence_payload(bytes: usize) -> String {
        // 0xFF ist µ-law Stille
        STANDARD.encode(vec![0xFF; bytes])
    }

    #[test]
    fn test_payloads_accumulate_into_frames() {
        let mut leg = leg();

        // 160 Bytes µ-law = 20 ms = 320 Samples bei 16 kHz
        assert!(leg.receive(&silence_payload(160)).unwrap().is_empty());
        assert_eq!(leg.pending(), 320);

        let frames = leg.receive(&silence_payload(160)).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 640);
        assert!(frames[0].iter().all(|&s| s == 0));
        assert_eq!(leg.pending(), 0);
    }

    #[test]
    fn test_encode_halves_sample_count() {
        let mut leg = leg();
        let payload = leg.encode(&[0; 640]);
        let bytes = STANDARD.decode(payload).unwrap();
        assert_eq!(bytes.len(), 320);
        assert!(bytes.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_invalid_payload() {
        let mut leg = leg();
        assert!(leg.receive("%%%").is_err());
        assert_eq!(leg.pending(), 0);
        assert_eq!(leg.stream_id(), "MZ123");
        assert_eq!(leg.call_id(), Some("CA1"));
    }
}
