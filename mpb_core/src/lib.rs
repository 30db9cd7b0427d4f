//! Protocol-level building blocks for multipath bundling: roles, packet
//! classification, handshake options, key material and the token
//! derivation that lets a responder recognise joining subflows.

pub mod types;
pub mod token;
pub mod error;

pub use error::{MultipathError, Result};
