//! The game server allocation API.
//!
//! Serves `POST /api/v1/allocate` over plain TCP or TLS. The server runs until its shutdown watch
//! is signaled, then stops accepting connections and gives in-flight requests a bounded grace
//! period to complete.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod allocate;
mod router;
mod server;
mod transport;


pub use self::{
    allocate::{
        ActivateError, ActivateGameServer, Allocate, AllocateRequest, Allocation, KubeActivator,
    },
    router::{Router, ALLOCATE_PATH},
    server::{
        ApiServer, ApiServerConfig, InvalidListenAddr, ListenAddr, ServiceError, State,
        DEFAULT_LISTEN_ADDR, DEFAULT_SHUTDOWN_GRACE_PERIOD,
    },
    transport::{CertificateMaterial, Connecting, Io, Listener, TransportError, TCP_KEEPALIVE},
};

/// Response bodies are always fully buffered.
pub type Body = http_body_util::Full<bytes::Bytes>;
