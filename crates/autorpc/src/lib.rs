//! Peer-symmetric bidirectional RPC over any duplex byte channel.
//!
//! A user-declared [`api::Api`] names the local methods a peer may
//! invoke and, through a [`remote::RemoteProxies`] record, the functions
//! this side may invoke on the peer. Both directions share one transport:
//! inbound requests are decoded, dispatched, and answered; outbound calls
//! are correlated back to their completions through a service-wide
//! pending-call registry.

pub mod api;
pub mod conn;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod remote;
pub mod service;
pub mod transport;

mod pending;

#[cfg(test)]
mod mock_transport;

#[cfg(test)]
mod tests;

pub use autorpc_wire as wire;

pub use crate::api::Api;
pub use crate::conn::Connection;
pub use crate::dispatch::Step;
pub use crate::error::CallError;
pub use crate::error::MethodError;
pub use crate::error::RpcError;
pub use crate::error::SessionError;
pub use crate::handler::Handler;
pub use crate::remote::Remote;
pub use crate::remote::RemoteFn;
pub use crate::remote::RemoteProxies;
pub use crate::service::Service;
pub use crate::service::ServiceBuilder;
pub use crate::transport::StreamTransport;
pub use crate::transport::Transport;
