pub mod primitives;
pub mod session;

pub use primitives::{
    aggregate_nonces, aggregate_signatures, key_agg, key_agg_tweaked, partial_sig_from_bytes,
    partial_sig_to_bytes, partial_sign, pubnonce_from_bytes, pubnonce_to_bytes,
    verify_aggregated_signature, verify_partial_signature, MusigError,
};
pub use session::{
    Effect, InboundMessage, MuSig2Session, OutboundMessage, Phase, SessionDescriptor,
    SessionEvent, SessionRegistry, DEFAULT_MAX_SEQUENCE_GAP,
};
