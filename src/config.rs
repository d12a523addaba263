//! Server configuration: the immutable set of inputs the resolver is
//! constructed with. Everything here arrives from constructor
//! parameters — there is no config file, matching the original binary's
//! command-line/chain-param wiring, which is out of scope for this crate.

use std::net::IpAddr;

use thiserror::Error;
use tracing::Level;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("gateway suffix {0:?} must start with a dot")]
    GatewaySuffixNoDot(String),
    #[error("allowed TLD suffix {0:?} must start with a dot")]
    TldSuffixNoDot(String),
    #[error("ENUM TLD suffix {0:?} has enum_len {1} outside 1..=32")]
    EnumLenOutOfRange(String, u8),
    #[error("DAP size {0} must be a power of two")]
    DapSizeNotPowerOfTwo(u32),
    #[error("local entry name {0:?} must be lowercase already")]
    LocalEntryNotLowercase(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Rewrites a configured suffix (e.g. `.gw`) to another (e.g. the empty
/// string, or a different TLD) before the name is looked up, the way the
/// original's `gw_suffix`/`gw_suffix_replace` pair works.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySuffix {
    pub suffix: String,
    pub replace: String,
    pub dot_count: i32,
}

impl GatewaySuffix {
    pub fn new(suffix: impl Into<String>, replace: impl Into<String>) -> Result<Self> {
        let suffix = suffix.into();
        if !suffix.starts_with('.') {
            return Err(ConfigError::GatewaySuffixNoDot(suffix));
        }
        let dot_count = suffix.chars().filter(|&c| c == '.').count() as i32;
        Ok(GatewaySuffix {
            replace: replace.into(),
            suffix,
            dot_count,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TldKind {
    Dns,
    Enum,
}

/// A suffix this server is authoritative for, e.g. `.coin` or `.e164.arpa`.
/// `enum_len` is only meaningful for `TldKind::Enum` — the number of
/// E.164 digit labels expected before the suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedTld {
    pub suffix: String,
    pub kind: TldKind,
    pub enum_len: u8,
}

impl AllowedTld {
    pub fn dns(suffix: impl Into<String>) -> Result<Self> {
        let suffix = suffix.into();
        if !suffix.starts_with('.') {
            return Err(ConfigError::TldSuffixNoDot(suffix));
        }
        Ok(AllowedTld { suffix, kind: TldKind::Dns, enum_len: 0 })
    }

    pub fn enum_tld(suffix: impl Into<String>, enum_len: u8) -> Result<Self> {
        let suffix = suffix.into();
        if !suffix.starts_with('.') {
            return Err(ConfigError::TldSuffixNoDot(suffix));
        }
        if enum_len == 0 || enum_len > 32 {
            return Err(ConfigError::EnumLenOutOfRange(suffix, enum_len));
        }
        Ok(AllowedTld { suffix, kind: TldKind::Enum, enum_len })
    }
}

/// DAP (abuse-prevention) sizing: `size` is the bloom-style counter table
/// length (must be a power of two, see tables.rs), `threshold` is the
/// heat level above which a source is denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DapConfig {
    pub size: u32,
    pub threshold: u16,
}

impl DapConfig {
    pub fn new(size: u32, threshold: u16) -> Result<Self> {
        if size == 0 || size & (size - 1) != 0 {
            return Err(ConfigError::DapSizeNotPowerOfTwo(size));
        }
        Ok(DapConfig { size, threshold })
    }
}

/// The full set of inputs the server is built from. Immutable once
/// constructed; `ServerContext` derives its read-only shared state from
/// this at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: Option<IpAddr>,
    pub port: u16,
    pub gw_suffix: Option<GatewaySuffix>,
    pub allowed_tlds: Vec<AllowedTld>,
    pub local_entries: Vec<(String, String)>,
    pub dap: Option<DapConfig>,
    pub enum_trust_list: Vec<String>,
    pub toll_free_sources: Vec<String>,
    pub verbose: u8,
}

impl ServerConfig {
    pub fn new(port: u16, allowed_tlds: Vec<AllowedTld>) -> Self {
        ServerConfig {
            bind_addr: None,
            port,
            gw_suffix: None,
            allowed_tlds,
            local_entries: Vec::new(),
            dap: None,
            enum_trust_list: Vec::new(),
            toll_free_sources: Vec::new(),
            verbose: 2,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, _) in &self.local_entries {
            if name.chars().any(|c| c.is_ascii_uppercase()) {
                return Err(ConfigError::LocalEntryNotLowercase(name.clone()));
            }
        }
        Ok(())
    }

    /// Maps the original's integer verbosity levels onto a `tracing`
    /// filter level: 0-1 -> ERROR/WARN, 2-3 -> INFO, 4-5 -> DEBUG, 6+ ->
    /// TRACE.
    pub fn verbose_to_level(&self) -> Level {
        match self.verbose {
            0 => Level::ERROR,
            1 => Level::WARN,
            2 | 3 => Level::INFO,
            4 | 5 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_suffix_requires_leading_dot() {
        assert_eq!(
            GatewaySuffix::new("gw", ""),
            Err(ConfigError::GatewaySuffixNoDot("gw".to_string()))
        );
    }

    #[test]
    fn gateway_suffix_counts_dots() {
        let gw = GatewaySuffix::new(".my.gw", "").unwrap();
        assert_eq!(gw.dot_count, 2);
    }

    #[test]
    fn enum_tld_rejects_zero_len() {
        assert!(AllowedTld::enum_tld(".e164.arpa", 0).is_err());
    }

    #[test]
    fn dap_size_must_be_power_of_two() {
        assert!(DapConfig::new(100, 10).is_err());
        assert!(DapConfig::new(128, 10).is_ok());
    }

    #[test]
    fn verbose_maps_to_tracing_levels() {
        let mut cfg = ServerConfig::new(53, vec![]);
        cfg.verbose = 0;
        assert_eq!(cfg.verbose_to_level(), Level::ERROR);
        cfg.verbose = 7;
        assert_eq!(cfg.verbose_to_level(), Level::TRACE);
    }

    #[test]
    fn validate_rejects_uppercase_local_names() {
        let mut cfg = ServerConfig::new(53, vec![]);
        cfg.local_entries.push(("Example".to_string(), "A=1.2.3.4".to_string()));
        assert!(cfg.validate().is_err());
    }
}
