//! Upstream relay: the client seam, the multiplexed link and the engine
//! that pumps a client connection through one virtual channel.

pub mod client;
pub mod engine;
pub mod mux;

pub use client::{
    connect_upstream, BoxedChannelIo, ChannelIo, ChannelLease, RelayClient, RelayOp,
    RelayResponse, ResponseStatus, VirtualChannel,
};
pub use engine::{RelayEngine, RelayStats};
pub use mux::MuxRelayClient;

#[cfg(test)]
pub use client::MockRelayClient;
