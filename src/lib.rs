//! Control plane for a public relay node of a mesh-networking overlay.
//!
//! The node answers STUN address-discovery probes over UDP and terminates TLS
//! connections which are handed to a pluggable [`relay::RelayEngine`].  Around that it
//! manages the TLS certificate (manually supplied, self-signed, or issued over ACME with
//! a TLS-ALPN or DNS challenge) and rotates it by rebuilding the whole listener stack
//! in-process, see [`supervisor::Supervisor`].

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod cert;
pub mod controller;
pub mod defaults;
pub mod dns;
pub mod identity;
pub mod protos;
pub mod relay;
pub mod server;
pub mod supervisor;
