//! The `ServerContext` holds the read-only state shared across the
//! (currently singular) server task: the static lookup tables, the
//! trusted ENUM verifiers, the toll-free rule set, and a handle to the
//! NVS backend. Built once at startup from a `ServerConfig`.

use std::sync::Arc;

use derive_more::{Display, Error, From};

use crate::config::{ConfigError, ServerConfig};
use crate::enumlookup::tollfree::{self, TollFreeError, TollFreeSource};
use crate::enumlookup::verifier::{Verifier, VerifierError};
use crate::enumlookup::EnumLookup;
use crate::nvs::{NameBackend, NvsError};
use crate::tables::{build_local_table, build_tld_table, HashTable, TablesError, TldEntry};

#[derive(Debug, Display, From, Error)]
pub enum ContextError {
    Config(ConfigError),
    Tables(TablesError),
    TollFree(TollFreeError),
}

pub type Result<T> = std::result::Result<T, ContextError>;

pub struct ServerContext<B: NameBackend> {
    pub config: ServerConfig,
    pub tld_table: HashTable<TldEntry>,
    pub local_table: HashTable<String>,
    pub enum_lookup: EnumLookup<B>,
    pub nvs: Arc<B>,
}

impl<B: NameBackend> ServerContext<B> {
    /// Builds the tables and ENUM state once from `config`. Toll-free
    /// rule sources named with an `@` prefix are fetched from `nvs`;
    /// bare paths are read from the local filesystem.
    pub async fn build(config: ServerConfig, nvs: Arc<B>) -> Result<Self> {
        config.validate()?;

        let tld_table = build_tld_table(&config.allowed_tlds)?;
        let local_table = build_local_table(&config.local_entries)?;

        let verifiers = config
            .enum_trust_list
            .iter()
            .map(|entry| parse_trust_entry(entry))
            .collect();

        let mut tollfree_rules = Vec::new();
        for source in &config.toll_free_sources {
            let text = match TollFreeSource::parse(source) {
                TollFreeSource::NvsKey(key) => match nvs.get_name_value(&key).await {
                    Ok(text) => text,
                    Err(NvsError::NotFound(_)) => continue,
                    Err(_) => continue,
                },
                TollFreeSource::FilePath(path) => {
                    tokio::fs::read_to_string(&path).await.unwrap_or_default()
                }
            };
            tollfree_rules.extend(tollfree::parse_rules(&text)?);
        }

        let enum_lookup = EnumLookup::new(nvs.clone(), verifiers, tollfree_rules);

        Ok(ServerContext {
            config,
            tld_table,
            local_table,
            enum_lookup,
            nvs,
        })
    }
}

/// Trust-list entries are the 40-hex-character hash160 key id of a
/// trusted signer, not a full base58check address — the latter would
/// need a base58 dependency this crate doesn't otherwise pull in. A
/// malformed entry is recorded as a blocked verifier rather than
/// rejected at startup, so one bad entry doesn't stop the server.
fn parse_trust_entry(entry: &str) -> Verifier {
    match decode_key_id(entry) {
        Some(key_id) => Verifier::loaded(key_id, None),
        None => Verifier::blocked(),
    }
}

fn decode_key_id(entry: &str) -> Option<[u8; 20]> {
    if entry.len() != 40 {
        return None;
    }
    let mut key_id = [0u8; 20];
    for i in 0..20 {
        key_id[i] = u8::from_str_radix(&entry[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(key_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllowedTld;
    use crate::nvs::test_support::InMemoryBackend;

    #[tokio::test]
    async fn builds_from_minimal_config() {
        let config = ServerConfig::new(5333, vec![AllowedTld::dns(".coin").unwrap()]);
        let nvs = Arc::new(InMemoryBackend::new());
        let ctx = ServerContext::build(config, nvs).await.unwrap();
        assert_eq!(ctx.tld_table.len(), 1);
    }

    #[test]
    fn trust_entry_must_be_40_hex_chars() {
        assert!(decode_key_id("not-hex").is_none());
        assert!(decode_key_id(&"ab".repeat(20)).is_some());
    }

    #[test]
    fn short_entry_becomes_blocked_verifier() {
        let v = parse_trust_entry("tooshort");
        assert_eq!(v.verify("sig", b"msg"), Err(VerifierError::Blocked));
    }
}
