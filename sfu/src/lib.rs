#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Conclave
//! Conclave is the signaling and session coordination layer of a multi-party videoconference built
//! on a selective forwarding unit. It maps client connections onto rooms, drives the transport
//! negotiation handshake, keeps the registries of transports, producers and consumers consistent
//! and tells peers when media appears or goes away. Packet switching itself is delegated to a
//! media engine implementing the traits in [`engine`].
//!
//! ## Usage
//! Create a [`coordinator::Coordinator`] with an engine, then open one
//! [`signaling::session::SignalingSession`] per client connection and feed it text frames.

/// Configuration for [`coordinator::Coordinator`] and the media engine.
pub mod config;
/// Outbound channels of live connections.
pub mod connection;
/// Consumer lifecycle: consume, resume, listing producers and cascade close.
pub mod consumer;
/// Coordinator owns the room, peer and resource registries.
pub mod coordinator;
/// Media engine capability surface and an in-process loopback implementation.
pub mod engine;
pub mod error;
/// Per-connection session state.
pub mod peer;
/// Producer lifecycle and fanout of new producers to the room.
pub mod producer;
/// Reclaims every resource of a disconnected connection.
mod reclaim;
pub mod registry;
/// Room is a named group of connections that share one router.
pub mod room;
/// Client-facing signaling protocol.
pub mod signaling;
/// Transport negotiation handshake.
pub mod transport;
