//! Tokenizes an NVS name-value record's string value into typed record
//! groups. The wire format is `KEY=VAL` pairs joined by an outer
//! separator (`|` by default), e.g. `A=1.2.3.4|A=5.6.7.8|TTL=600`. `=` is
//! a fixed key/value delimiter; a value may itself carry several entries
//! for the same key separated by `,` (e.g. `NS=ns1.example,ns2.example`
//! yields two separate `NS` records). The outer separator can be
//! redefined mid-string with a `~<sep>` escape — a tilde immediately
//! followed by the replacement character — used when a value needs to
//! contain a literal `|`.

use derive_more::{Display, Error, From};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::protocols::protocol::QueryType;

#[derive(Debug, Display, From, Error, PartialEq, Eq)]
pub enum ValueFmtError {
    #[display(fmt = "empty key in token {}", _0)]
    EmptyKey(#[error(not(source))] String),
    #[display(fmt = "TTL value {:?} is not a valid u32", _0)]
    BadTtl(#[error(not(source))] String),
}

pub type Result<T> = std::result::Result<T, ValueFmtError>;

/// A parsed NVS value: the extracted TTL override (if any), the allowed
/// subdomain list for referral (`SD=`, if any), and the remaining
/// records grouped by their uppercased key.
#[derive(Debug, Clone, Default)]
pub struct TokenizedValue {
    pub ttl: Option<u32>,
    pub subdomains: Option<Vec<String>>,
    records: Vec<(String, String)>,
}

impl TokenizedValue {
    pub fn parse(raw: &str) -> Result<TokenizedValue> {
        let mut outer_sep = '|';
        let mut out = TokenizedValue::default();

        let mut chars = raw.chars().peekable();
        let mut current = String::new();
        let mut tokens = Vec::new();

        while let Some(c) = chars.next() {
            if c == '~' {
                if let Some(&repl) = chars.peek() {
                    outer_sep = repl;
                    chars.next();
                    continue;
                }
            }
            if c == outer_sep {
                tokens.push(std::mem::take(&mut current));
            } else {
                current.push(c);
            }
        }
        tokens.push(current);

        for token in tokens {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (key, val) = match token.find('=') {
                Some(idx) => (&token[..idx], &token[idx + 1..]),
                None => (token, ""),
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(ValueFmtError::EmptyKey(token.to_string()));
            }
            let key_upper = key.to_ascii_uppercase();
            let val = val.trim();

            match key_upper.as_str() {
                "TTL" => {
                    out.ttl = Some(
                        val.parse::<u32>()
                            .map_err(|_| ValueFmtError::BadTtl(val.to_string()))?,
                    );
                }
                "SD" => {
                    out.subdomains = Some(
                        val.split(',')
                            .map(|s| s.trim().to_ascii_lowercase())
                            .filter(|s| !s.is_empty())
                            .collect(),
                    );
                }
                _ => {
                    for item in val.split(',') {
                        let item = item.trim();
                        if !item.is_empty() {
                            out.records.push((key_upper.clone(), item.to_string()));
                        }
                    }
                }
            }
        }

        Ok(out)
    }

    /// All raw values recorded under `key` (already uppercased), in the
    /// order they appeared in the value string.
    pub fn records_for(&self, key: &str) -> Vec<&str> {
        let key = key.to_ascii_uppercase();
        self.records
            .iter()
            .filter(move |(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn records_for_type(&self, qtype: QueryType) -> Vec<&str> {
        match qtype.token_key() {
            Some(key) => self.records_for(key),
            None => Vec::new(),
        }
    }

    /// Picks one value among those recorded under `key`, shuffled so that
    /// repeated queries load-balance across round-robin entries rather
    /// than always preferring the first.
    pub fn pick_shuffled<'a, R: Rng + ?Sized>(&'a self, key: &str, rng: &mut R) -> Option<&'a str> {
        let mut candidates = self.records_for(key);
        candidates.shuffle(rng);
        candidates.into_iter().next()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.ttl.is_none() && self.subdomains.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn parses_simple_pairs() {
        let tv = TokenizedValue::parse("A=1.2.3.4|TTL=600").unwrap();
        assert_eq!(tv.ttl, Some(600));
        assert_eq!(tv.records_for("A"), vec!["1.2.3.4"]);
    }

    #[test]
    fn multiple_same_key_records_preserved() {
        let tv = TokenizedValue::parse("A=1.1.1.1|A=2.2.2.2|A=3.3.3.3").unwrap();
        assert_eq!(tv.records_for("A"), vec!["1.1.1.1", "2.2.2.2", "3.3.3.3"]);
    }

    #[test]
    fn comma_separated_value_list_splits_into_separate_records() {
        let tv = TokenizedValue::parse("NS=ns1.example,ns2.example").unwrap();
        assert_eq!(tv.records_for("NS"), vec!["ns1.example", "ns2.example"]);
    }

    #[test]
    fn sd_parses_comma_list() {
        let tv = TokenizedValue::parse("SD=shop,blog , mail").unwrap();
        assert_eq!(
            tv.subdomains,
            Some(vec!["shop".to_string(), "blog".to_string(), "mail".to_string()])
        );
    }

    #[test]
    fn outer_separator_can_be_redefined() {
        let tv = TokenizedValue::parse("~;A=1.2.3.4;NS=ns1.example").unwrap();
        assert_eq!(tv.records_for("A"), vec!["1.2.3.4"]);
        assert_eq!(tv.records_for("NS"), vec!["ns1.example"]);
    }

    #[test]
    fn bad_ttl_is_rejected() {
        assert!(matches!(
            TokenizedValue::parse("TTL=notanumber"),
            Err(ValueFmtError::BadTtl(_))
        ));
    }

    #[test]
    fn shuffle_picks_one_of_the_candidates() {
        let tv = TokenizedValue::parse("A=1.1.1.1|A=2.2.2.2").unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let picked = tv.pick_shuffled("A", &mut rng).unwrap();
        assert!(picked == "1.1.1.1" || picked == "2.2.2.2");
    }
}
