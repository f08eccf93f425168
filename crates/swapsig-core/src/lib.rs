//! Shared data model, identity, digests and wire codec for the swap coordinator.
//!
//! Every other `swapsig-*` crate depends on this one for the types that cross
//! layer boundaries: [`identity::PeerIdentity`] / [`identity::LongTermKeypair`],
//! [`model::Advertisement`] / [`model::SigningRequest`] / [`model::BurnConfig`],
//! [`digest::Digest32`], and the [`wire::WireMessage`] envelope.

pub mod digest;
pub mod identity;
pub mod model;
pub mod wire;

pub use digest::{digest_parts, Digest32};
pub use identity::{verify_schnorr, IdentityError, LongTermKeypair, PeerIdentity};
pub use model::{Advertisement, BurnConfig, Capability, ModelError, SigningRequest};
pub use wire::{WireError, WireMessage, MAX_MESSAGE_SIZE};
