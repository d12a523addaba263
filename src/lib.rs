//! Authoritative DNS resolver core backed by a blockchain name-value
//! store: wire codec, static lookup tables, DAP abuse prevention, signed
//! ENUM/toll-free lookup, and the UDP server loop that ties them
//! together. The chain itself is out of scope — callers provide an
//! implementation of [`nvs::NameBackend`].

pub mod buffer;
pub mod config;
pub mod dap;
pub mod enumlookup;
pub mod nvs;
pub mod protocols;
pub mod resolvers;
pub mod server;
pub mod tables;

pub use config::{AllowedTld, DapConfig, GatewaySuffix, ServerConfig, TldKind};
pub use nvs::NameBackend;
pub use resolvers::{HandlerOutcome, Resolver};
pub use server::{Server, ServerContext, ServerError};
