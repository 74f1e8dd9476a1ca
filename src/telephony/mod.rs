//! Telephony Module - Anrufe über das Telefonnetz
//!
//! Dieses Modul verwaltet:
//! - G.711 µ-law und das Resampling zwischen Leitungs- und Engine-Rate
//! - Den aktiven Media-Stream eines Anrufs
//! - Die Abbildung der Anrufstatus auf den Call-Lifecycle

mod bridge;
mod codec;
mod leg;

pub use bridge::{CallPlacer, TelephonyBridge, TelephonyError};
pub use codec::{
    decode_payload, decode_ulaw, encode_payload, encode_ulaw, linear_to_ulaw, ulaw_to_linear,
    CodecError, LinearResampler,
};
pub use leg::TelephonyLeg;
