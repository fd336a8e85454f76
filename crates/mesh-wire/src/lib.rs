//! Wire-level transport for the cluster fabric: a reconnecting outbound
//! [`client::WireClient`] and an authorizer-gated inbound [`server::WireServer`]
//! (§4.5–4.6), both framing through `mesh_util::{encode, decode}`.

mod client;
mod error;
mod server;

pub use client::{TokenSource, WireClient, WireClientConfig, WireClientObserver};
pub use error::WireError;
pub use server::{Authorizer, PeerConduit, PeerHandle, SocketAttrs, WireServer, WireServerConfig};
