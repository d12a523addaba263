//! ENUM (RFC 6116) lookup: turns an `e164.arpa`-style query into an
//! E.164 number, fetches a signed record from the name-value store,
//! verifies it against the trusted key list (with SRL revocation), and
//! falls back to the toll-free regex matcher when there is no signed
//! record or the signature doesn't check out.

pub mod tollfree;
pub mod verifier;

use std::sync::Arc;

use derive_more::{Display, Error, From};
use tracing::{debug, warn};

use crate::nvs::{NameBackend, NvsError};
use crate::protocols::protocol::DnsRecord;
use tollfree::TollFreeRule;
use verifier::{Verifier, VerifierError, VerifierState};

pub const DEFAULT_NAPTR_ORDER: u16 = 100;
pub const DEFAULT_NAPTR_PREFERENCE: u16 = 10;

#[derive(Debug, Display, From, Error)]
pub enum EnumError {
    Verifier(VerifierError),
    Nvs(NvsError),
    #[display(fmt = "no E2U lines in record")]
    NoE2uLines,
}

pub type Result<T> = std::result::Result<T, EnumError>;

/// Pulls the E.164 digit string out of the reversed-digit labels that
/// precede an ENUM TLD suffix, e.g. labels `["4","3","2","1"]` (already
/// split off the suffix, outermost label first) decode to `"1234"`.
/// Returns `None` if there are fewer labels than `enum_len` expects or
/// any of them isn't a single ASCII digit.
pub fn extract_e164(labels: &[&str], enum_len: u8) -> Option<String> {
    let enum_len = enum_len as usize;
    if labels.len() < enum_len {
        return None;
    }
    let digit_labels = &labels[..enum_len];
    if !digit_labels
        .iter()
        .all(|l| l.len() == 1 && l.as_bytes()[0].is_ascii_digit())
    {
        return None;
    }
    Some(digit_labels.iter().rev().copied().collect())
}

#[derive(Debug, Default)]
struct EnumValue {
    e2u: Vec<String>,
    ttl: Option<u32>,
    sig: Option<String>,
}

fn tag3(line: &str, tag: &[u8; 3]) -> bool {
    let bytes = line.as_bytes();
    bytes.len() >= 3
        && bytes[..3]
            .iter()
            .map(|b| b.to_ascii_lowercase())
            .eq(tag.iter().copied())
}

fn parse_enum_value(raw: &str) -> EnumValue {
    let mut value = EnumValue::default();
    for raw_line in raw.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if tag3(line, b"sig") {
            value.sig = line.splitn(2, '=').nth(1).map(|s| s.to_string());
        } else if tag3(line, b"ttl") {
            value.ttl = line.splitn(2, '=').nth(1).and_then(|s| s.parse().ok());
        } else if tag3(line, b"e2u") {
            value.e2u.push(line.to_string());
        }
    }
    value
}

/// Parses one `E2U+service=regexp` line into the pieces a NAPTR record
/// needs. Returns `None` for lines that don't contain the `=` separator.
fn split_e2u_line(line: &str) -> Option<(&str, &str)> {
    let idx = line.find('=')?;
    Some((&line[..idx], &line[idx + 1..]))
}

fn e2u_lines_to_naptr(lines: &[String]) -> Vec<DnsRecord> {
    lines
        .iter()
        .filter_map(|line| split_e2u_line(line))
        .map(|(service, regexp)| DnsRecord::Naptr {
            order: DEFAULT_NAPTR_ORDER,
            preference: DEFAULT_NAPTR_PREFERENCE,
            service: service.to_string(),
            regexp: regexp.to_string(),
        })
        .collect()
}

/// Coordinates signed-record verification and the toll-free fallback
/// for one allowed ENUM suffix.
pub struct EnumLookup<B: NameBackend> {
    nvs: Arc<B>,
    verifiers: Vec<Verifier>,
    tollfree: Vec<TollFreeRule>,
}

impl<B: NameBackend> EnumLookup<B> {
    pub fn new(nvs: Arc<B>, verifiers: Vec<Verifier>, tollfree: Vec<TollFreeRule>) -> Self {
        EnumLookup { nvs, verifiers, tollfree }
    }

    /// Fetches `"<tld>:<number>:<qno>"` for `qno = 0, 1, 2, ...` until a
    /// miss, accumulating the verified NAPTRs each signed record
    /// contributes. Falls back to the toll-free regex matcher if no
    /// qno yielded a verified record (including the `qno=0` miss case).
    pub async fn lookup(&self, tld: &str, number: &str) -> Result<Vec<DnsRecord>> {
        let mut records = Vec::new();
        let mut qno: u32 = 0;
        loop {
            let key = format!("{tld}:{number}:{qno}");
            match self.nvs.get_name_value(&key).await {
                Ok(raw) => {
                    if let Some(found) = self.verified_naptrs(&raw, number).await? {
                        records.extend(found);
                    }
                    qno += 1;
                }
                Err(NvsError::NotFound(_)) => break,
                Err(e) => return Err(EnumError::Nvs(e)),
            }
        }

        if records.is_empty() {
            Ok(self.lookup_tollfree(number))
        } else {
            Ok(records)
        }
    }

    /// Verifies one record's `SIG=` against the trusted key list (with
    /// an SRL revocation check on a signature that otherwise recovers to
    /// a trusted key), returning its NAPTRs on success and `None` when
    /// the record is unsigned, unverified, or revoked.
    async fn verified_naptrs(&self, raw: &str, number: &str) -> Result<Option<Vec<DnsRecord>>> {
        let value = parse_enum_value(raw);
        if value.e2u.is_empty() {
            return Err(EnumError::NoE2uLines);
        }

        let Some(sig) = value.sig.as_deref() else {
            debug!("enum record has no SIG=, skipping");
            return Ok(None);
        };

        for verifier in &self.verifiers {
            match verifier.verify(sig, number.as_bytes()) {
                Ok(true) => {
                    if self.is_revoked(verifier, number).await? {
                        debug!("enum signature matched a revoked key, skipping");
                        continue;
                    }
                    return Ok(Some(e2u_lines_to_naptr(&value.e2u)));
                }
                Ok(false) => continue,
                Err(VerifierError::Unloaded) | Err(VerifierError::Blocked) => continue,
                Err(e) => {
                    warn!(error = %e, "enum signature check failed");
                    continue;
                }
            }
        }

        Ok(None)
    }

    /// Checks `verifier`'s SRL bucket (if it has one) for an entry whose
    /// value contains `number` as a substring — the revocation marker
    /// `emcdns.cpp`'s SRL lookup checks for.
    async fn is_revoked(&self, verifier: &Verifier, number: &str) -> Result<bool> {
        let Some(srl) = verifier.srl() else {
            return Ok(false);
        };
        let bucket_key = srl.bucket_key(number.as_bytes());
        match self.nvs.get_name_value(&bucket_key).await {
            Ok(value) => Ok(value.contains(number)),
            Err(NvsError::NotFound(_)) => Ok(false),
            Err(e) => Err(EnumError::Nvs(e)),
        }
    }

    fn lookup_tollfree(&self, number: &str) -> Vec<DnsRecord> {
        match tollfree::find_match(&self.tollfree, number) {
            Some(rule) => e2u_lines_to_naptr(&rule.e2u),
            None => Vec::new(),
        }
    }

    pub fn verifier_states(&self) -> impl Iterator<Item = &VerifierState> {
        self.verifiers.iter().map(|v| &v.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvs::test_support::InMemoryBackend;

    #[test]
    fn extract_e164_reverses_digit_labels() {
        let labels = ["4", "3", "2", "1"];
        assert_eq!(extract_e164(&labels, 4), Some("1234".to_string()));
    }

    #[test]
    fn extract_e164_rejects_non_digit_labels() {
        let labels = ["4", "x", "2", "1"];
        assert_eq!(extract_e164(&labels, 4), None);
    }

    #[test]
    fn extract_e164_rejects_short_label_list() {
        let labels = ["4", "3"];
        assert_eq!(extract_e164(&labels, 4), None);
    }

    #[tokio::test]
    async fn falls_back_to_tollfree_when_record_missing() {
        let backend = Arc::new(InMemoryBackend::new());
        let rules = tollfree::parse_rules("=^1800[0-9]{7}$\nE2U+sip=!^.*$!sip:a@b.com!").unwrap();
        let lookup = EnumLookup::new(backend, Vec::new(), rules);
        let records = lookup.lookup("e164.arpa", "18005551234").await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn falls_back_to_tollfree_when_record_has_no_signature() {
        let backend = Arc::new(InMemoryBackend::new());
        backend
            .insert("e164.arpa:18005551234:0", "E2U+sip=!^.*$!sip:a@b.com!")
            .await;
        let rules = tollfree::parse_rules("=^1800[0-9]{7}$\nE2U+sip=!^.*$!sip:c@d.com!").unwrap();
        let lookup = EnumLookup::new(backend, Vec::new(), rules);
        let records = lookup.lookup("e164.arpa", "18005551234").await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(matches!(&records[0], DnsRecord::Naptr { regexp, .. } if regexp.contains("c@d.com")));
    }

    #[tokio::test]
    async fn qno_loop_accumulates_records_across_sequential_keys() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert("e164.arpa:18005551234:0", "E2U+sip=!^.*$!sip:a@b.com!").await;
        backend.insert("e164.arpa:18005551234:1", "E2U+voice=!^.*$!tel:+18005551234!").await;
        let lookup = EnumLookup::new(backend, Vec::new(), Vec::new());
        let records = lookup.lookup("e164.arpa", "18005551234").await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn record_with_no_e2u_lines_is_an_error() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert("e164.arpa:1:0", "TTL=600").await;
        let lookup = EnumLookup::new(backend, Vec::new(), Vec::new());
        assert!(matches!(lookup.lookup("e164.arpa", "1").await, Err(EnumError::NoE2uLines)));
    }
}
