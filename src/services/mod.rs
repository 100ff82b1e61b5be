pub mod backoff;
pub mod connection;
pub mod publisher;
pub mod realtime;
pub mod registry;
pub mod router;
pub mod session;
pub mod transport;
pub mod webhook;
