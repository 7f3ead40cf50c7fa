//! # DRIFT Net
//!
//! Datagram endpoint for the DRIFT transfer engine: one bound UDP socket,
//! an always-armed receive pump that decodes packets and hands them to a
//! registered callback, and fire-and-forget packet sends.
//!
//! Framing is one packet per datagram; the wire layout lives in
//! [`drift_core::packet`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod endpoint;
pub mod error;

pub use endpoint::{EndpointStats, PacketCallback, UdpEndpoint};
pub use error::{NetError, Result};
