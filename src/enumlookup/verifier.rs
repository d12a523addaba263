//! Bitcoin-style message-signing verification for ENUM records, plus the
//! bucketed signature revocation list (SRL) check. Ported from
//! `emcdns.cpp`'s `CheckEnumSig`/`TryMakeref`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bitcoin_hashes::{hash160, sha256d, Hash};
use derive_more::{Display, Error, From};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, Secp256k1};

#[derive(Debug, Display, From, Error, PartialEq, Eq)]
pub enum VerifierError {
    #[display(fmt = "signature is not valid base64")]
    BadBase64,
    #[display(fmt = "signature must decode to 65 bytes, got {}", _0)]
    BadLength(#[error(not(source))] usize),
    #[display(fmt = "signature header byte {} out of range", _0)]
    BadHeader(#[error(not(source))] u8),
    #[display(fmt = "signature is cryptographically invalid")]
    InvalidSignature,
    #[display(fmt = "SRL template has more than one % conversion")]
    TooManyConversions,
    #[display(fmt = "verifier has no trusted key loaded")]
    Unloaded,
    #[display(fmt = "verifier is blocked")]
    Blocked,
}

pub type Result<T> = std::result::Result<T, VerifierError>;

const MAGIC_PREFIX: &[u8] = b"\x18Bitcoin Signed Message:\n";

fn write_varint(out: &mut Vec<u8>, n: usize) {
    if n < 0xfd {
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(n as u16).to_le_bytes());
    } else {
        out.push(0xfe);
        out.extend_from_slice(&(n as u32).to_le_bytes());
    }
}

fn magic_digest(message: &[u8]) -> sha256d::Hash {
    let mut buf = Vec::with_capacity(MAGIC_PREFIX.len() + message.len() + 5);
    buf.extend_from_slice(MAGIC_PREFIX);
    write_varint(&mut buf, message.len());
    buf.extend_from_slice(message);
    sha256d::Hash::hash(&buf)
}

/// Recovers the signer's hash160 key id (a Bitcoin-style address hash)
/// from a compact recoverable signature over `message`, the same scheme
/// Bitcoin Core's `signmessage`/`verifymessage` use.
pub fn recover_key_id(signature_b64: &str, message: &[u8]) -> Result<[u8; 20]> {
    let sig_bytes = STANDARD.decode(signature_b64).map_err(|_| VerifierError::BadBase64)?;
    if sig_bytes.len() != 65 {
        return Err(VerifierError::BadLength(sig_bytes.len()));
    }
    let header = sig_bytes[0];
    if !(27..=42).contains(&header) {
        return Err(VerifierError::BadHeader(header));
    }
    let recid = ((header - 27) & 3) as i32;
    let compressed = (header - 27) & 4 != 0;

    let recovery_id = RecoveryId::from_i32(recid).map_err(|_| VerifierError::InvalidSignature)?;
    let recoverable_sig = RecoverableSignature::from_compact(&sig_bytes[1..65], recovery_id)
        .map_err(|_| VerifierError::InvalidSignature)?;

    let digest = magic_digest(message);
    let msg = Message::from_digest(digest.to_byte_array());

    let secp = Secp256k1::new();
    let pubkey = secp
        .recover_ecdsa(&msg, &recoverable_sig)
        .map_err(|_| VerifierError::InvalidSignature)?;

    let pubkey_bytes = if compressed {
        pubkey.serialize().to_vec()
    } else {
        pubkey.serialize_uncompressed().to_vec()
    };
    Ok(hash160::Hash::hash(&pubkey_bytes).to_byte_array())
}

/// A parsed `SRL=` template: a name pattern into which a revocation
/// bucket number is substituted before the NVS lookup. A template with
/// no `%` conversion at all is a constant (unbucketed) key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrlTemplate {
    pub template: String,
    pub bucket_mask: u32,
}

impl SrlTemplate {
    pub fn parse(template: impl Into<String>, nbits: u32) -> Result<Self> {
        let template = template.into();
        let conversions = count_conversions(&template);
        if conversions > 1 {
            return Err(VerifierError::TooManyConversions);
        }
        let nbits = nbits.min(30);
        let bucket_mask = if nbits == 0 { 0 } else { (1u32 << nbits) - 1 };
        Ok(SrlTemplate { template, bucket_mask })
    }

    /// Builds the NVS key to look up for `q_str`'s revocation bucket.
    /// `q_str` is the queried number/string being checked for signature
    /// revocation, not the signer's key id.
    pub fn bucket_key(&self, q_str: &[u8]) -> String {
        if !self.template.contains('%') {
            return self.template.clone();
        }
        let bucket = srl_hash(q_str) & self.bucket_mask;
        substitute_conversion(&self.template, bucket)
    }
}

fn count_conversions(template: &str) -> usize {
    let mut count = 0;
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '%' {
            if let Some(&next) = chars.peek() {
                if "diouxX".contains(next) {
                    count += 1;
                }
            }
        }
    }
    count
}

/// The SRL bucket hash, folded over `q_str`'s bytes: `h=0x5555;
/// h+=(h<<5)+c`.
fn srl_hash(q_str: &[u8]) -> u32 {
    let mut h: u32 = 0x5555;
    for &c in q_str {
        h = h.wrapping_add((h << 5).wrapping_add(c as u32));
    }
    h
}

fn substitute_conversion(template: &str, value: u32) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '%' {
            if let Some(&next) = chars.peek() {
                let formatted = match next {
                    'd' | 'i' | 'u' => Some(format!("{}", value)),
                    'o' => Some(format!("{:o}", value)),
                    'x' => Some(format!("{:x}", value)),
                    'X' => Some(format!("{:X}", value)),
                    _ => None,
                };
                if let Some(text) = formatted {
                    chars.next();
                    out.push_str(&text);
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifierState {
    Unloaded,
    Blocked,
    Loaded {
        key_id: [u8; 20],
        srl: Option<SrlTemplate>,
    },
}

/// One trusted ENUM signing key. Lazily transitions out of `Unloaded`
/// once its address has been decoded; `Blocked` records a permanently
/// rejected key (malformed address, never retried).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verifier {
    pub state: VerifierState,
}

impl Verifier {
    pub fn unloaded() -> Self {
        Verifier { state: VerifierState::Unloaded }
    }

    pub fn loaded(key_id: [u8; 20], srl: Option<SrlTemplate>) -> Self {
        Verifier { state: VerifierState::Loaded { key_id, srl } }
    }

    pub fn blocked() -> Self {
        Verifier { state: VerifierState::Blocked }
    }

    /// The SRL template for this key, if one is configured, for a
    /// revocation check once `verify` has recovered a matching key id.
    pub fn srl(&self) -> Option<&SrlTemplate> {
        match &self.state {
            VerifierState::Loaded { srl, .. } => srl.as_ref(),
            _ => None,
        }
    }

    /// Checks that `signature_b64` over `message` recovers to this
    /// verifier's trusted key id. Does not consult the SRL; callers
    /// combine this with a separate NVS-backed revocation check using
    /// `VerifierState::Loaded::srl`.
    pub fn verify(&self, signature_b64: &str, message: &[u8]) -> Result<bool> {
        match &self.state {
            VerifierState::Unloaded => Err(VerifierError::Unloaded),
            VerifierState::Blocked => Err(VerifierError::Blocked),
            VerifierState::Loaded { key_id, .. } => {
                let recovered = recover_key_id(signature_b64, message)?;
                Ok(&recovered == key_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srl_template_with_no_percent_is_constant() {
        let t = SrlTemplate::parse("dns:srl:global", 10).unwrap();
        assert_eq!(t.bucket_key(b"18005551234"), "dns:srl:global");
    }

    #[test]
    fn srl_template_substitutes_hex_bucket() {
        let t = SrlTemplate::parse("dns:srl:%02x", 8).unwrap();
        let key = t.bucket_key(b"18005551234");
        assert!(key.starts_with("dns:srl:"));
    }

    #[test]
    fn srl_hash_is_stable_for_the_same_q_str() {
        assert_eq!(srl_hash(b"18005551234"), srl_hash(b"18005551234"));
        assert_ne!(srl_hash(b"18005551234"), srl_hash(b"18005551235"));
    }

    #[test]
    fn srl_template_rejects_multiple_conversions() {
        assert_eq!(
            SrlTemplate::parse("dns:%x:%x", 8),
            Err(VerifierError::TooManyConversions)
        );
    }

    #[test]
    fn nbits_clamped_to_30() {
        let t = SrlTemplate::parse("dns:%x", 64).unwrap();
        assert_eq!(t.bucket_mask, (1u32 << 30) - 1);
    }

    #[test]
    fn bad_base64_signature_rejected() {
        assert_eq!(
            recover_key_id("not valid base64!!", b"msg"),
            Err(VerifierError::BadBase64)
        );
    }

    #[test]
    fn unloaded_verifier_refuses_to_verify() {
        let v = Verifier::unloaded();
        assert_eq!(v.verify("anything", b"msg"), Err(VerifierError::Unloaded));
    }
}
