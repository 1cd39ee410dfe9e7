//! Unix-socket + msgpack transport between the parent and its workers.
//!
//! The parent runs a [`Broker`] that owns nothing but a reference to the real
//! registry; workers talk to it through a [`BrokerClient`]. Spawn arguments
//! are flattened by [`marshal`] and staged on the broker until the worker
//! attaches.

pub mod broker;
pub mod client;
pub mod codec;
pub mod marshal;
pub mod protocol;

pub use broker::Broker;
pub use client::BrokerClient;
pub use marshal::{decode, encode, Arg, Decoded, Segment, SpawnPayload};
pub use protocol::{LogChannelDescriptor, Request, Response};
