//! Networking: wire protocol, connections and the outer servers

pub mod api;
pub mod connection;
pub mod framing;
pub mod protocol;

#[cfg(feature = "webtransport")]
pub mod tls;
#[cfg(feature = "webtransport")]
pub mod transport;
