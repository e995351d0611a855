//! Host-side message channel.
//!
//! Convinces the plugin page it is embedded, performs the hello
//! handshake and then carries events in both directions.

pub mod handshake;
pub mod message;
pub mod simulator;

pub use handshake::InitPayload;
pub use message::{ChannelEnvelope, EventBusMessage, EventResponse};
pub use simulator::{
    ChannelPhase, MessageChannelSimulator, Reply, ResponderHandle, Subscription,
    ACCESS_TOKEN_TOPIC, PROFILE_TOPIC,
};
