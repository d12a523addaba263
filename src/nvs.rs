//! The name-value store collaborator. The blockchain-backed store itself
//! is out of scope for this crate; this trait is the seam a concrete
//! chain client implements against.

use async_trait::async_trait;
use derive_more::{Display, Error, From};

#[derive(Debug, Display, From, Error, PartialEq, Eq)]
pub enum NvsError {
    #[display(fmt = "name {:?} not found", _0)]
    NotFound(#[error(not(source))] String),
    #[display(fmt = "backend unavailable: {}", _0)]
    Unavailable(#[error(not(source))] String),
}

pub type Result<T> = std::result::Result<T, NvsError>;

/// Looks up the string value stored for `name` in the chain's
/// name-value store. Implementations are expected to apply their own
/// caching/retry policy; this trait only describes the read path the
/// resolver needs.
#[async_trait]
pub trait NameBackend: Send + Sync {
    async fn get_name_value(&self, name: &str) -> Result<String>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    /// An in-memory stand-in for the chain, used by resolver and
    /// integration tests.
    #[derive(Default)]
    pub struct InMemoryBackend {
        entries: RwLock<HashMap<String, String>>,
    }

    impl InMemoryBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn insert(&self, name: impl Into<String>, value: impl Into<String>) {
            self.entries.write().await.insert(name.into(), value.into());
        }
    }

    #[async_trait]
    impl NameBackend for InMemoryBackend {
        async fn get_name_value(&self, name: &str) -> Result<String> {
            self.entries
                .read()
                .await
                .get(name)
                .cloned()
                .ok_or_else(|| NvsError::NotFound(name.to_string()))
        }
    }
}
