//! Network transports.
//!
//! Only TCP is provided. See [`tcp`] for the server, its connection lifecycle
//! and the two execution modes.

pub mod tcp;
