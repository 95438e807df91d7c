/// Schemas of every frame exchanged over the signaling channel.
pub mod message;
/// Per-connection dispatch from client events to the coordinator.
pub mod session;
