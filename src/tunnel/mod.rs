//! Reverse tunnel between the manager and edge agents.
//!
//! Agents behind NAT or firewalls dial out to the manager over a persistent
//! WebSocket; the manager then proxies HTTP requests and WebSocket
//! sub-streams back through that connection. Frames are JSON envelopes
//! ([`message::TunnelMessage`]), correlated by uuid where a reply is
//! expected, with base64 bodies so payloads round-trip byte-exact.

pub mod agent;
pub mod correlator;
pub mod manager;
pub mod message;
pub mod registry;
pub mod stream;
