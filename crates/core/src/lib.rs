//! Domain layer for e-signature webhook processing.
//!
//! Everything here is free of I/O: decoding provider events, deciding
//! lifecycle transitions, ledger vocabulary and webhook signature checks.

pub mod events;
pub mod lifecycle;
pub mod signature;
pub mod types;
