pub mod resolve;

pub use resolve::{HandlerOutcome, Resolver, ResolveError};
