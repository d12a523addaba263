//! Toll-free number matching: regex rule sets loaded either from a local
//! file or an NVS record (`@NVSKEY` source entries), ported from
//! `emcdns.cpp`'s `AddTF`/`Tokenize`.

use derive_more::{Display, Error, From};
use regex::Regex;

#[derive(Debug, Display, From, Error)]
pub enum TollFreeError {
    #[display(fmt = "invalid regex on rule line {:?}: {}", _0, _1)]
    BadRegex(String, #[error(source)] regex::Error),
}

pub type Result<T> = std::result::Result<T, TollFreeError>;

/// Where a configured toll-free source list entry points: an NVS record
/// key (`@coin:tollfree`) or a local file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TollFreeSource {
    NvsKey(String),
    FilePath(String),
}

impl TollFreeSource {
    pub fn parse(entry: &str) -> TollFreeSource {
        match entry.strip_prefix('@') {
            Some(key) => TollFreeSource::NvsKey(key.to_string()),
            None => TollFreeSource::FilePath(entry.to_string()),
        }
    }
}

/// One toll-free rule: a regex matched against the dialed E.164 number,
/// and the NAPTR `E2U+...` service/regexp lines it contributes when
/// matched.
#[derive(Debug, Clone)]
pub struct TollFreeRule {
    pub regex: Regex,
    pub source_text: String,
    pub e2u: Vec<String>,
}

impl TollFreeRule {
    pub fn matches(&self, number: &str) -> bool {
        self.regex.is_match(number)
    }
}

/// Parses a rule-set source's raw text. A line starting with `=` opens a
/// new rule whose match pattern is the remainder of the line; subsequent
/// `E2U...=...` lines (dispatched on their first three bytes folded to
/// lowercase, the same 3-byte tag check the original's `ENC3` macro
/// does) are appended to the current rule until the next `=` line.
/// Lines matching neither form are ignored.
pub fn parse_rules(text: &str) -> Result<Vec<TollFreeRule>> {
    let mut rules = Vec::new();
    let mut current: Option<TollFreeRule> = None;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(pattern) = line.strip_prefix('=') {
            if let Some(rule) = current.take() {
                rules.push(rule);
            }
            let regex = Regex::new(pattern)
                .map_err(|e| TollFreeError::BadRegex(line.to_string(), e))?;
            current = Some(TollFreeRule {
                regex,
                source_text: line.to_string(),
                e2u: Vec::new(),
            });
        } else if is_e2u_tag(line) {
            if let Some(rule) = current.as_mut() {
                rule.e2u.push(line.to_string());
            }
        }
    }

    if let Some(rule) = current.take() {
        rules.push(rule);
    }

    Ok(rules)
}

/// First three bytes folded to lowercase must equal `e2u` — a line
/// spelled `"e2uX..."` still dispatches since only the first three
/// bytes are inspected.
fn is_e2u_tag(line: &str) -> bool {
    let bytes = line.as_bytes();
    bytes.len() >= 3
        && bytes[..3]
            .iter()
            .map(|b| b.to_ascii_lowercase())
            .eq([b'e', b'2', b'u'])
}

/// Finds the first rule (in source order) whose pattern matches the
/// dialed number.
pub fn find_match<'a>(rules: &'a [TollFreeRule], number: &str) -> Option<&'a TollFreeRule> {
    rules.iter().find(|rule| rule.matches(number))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_parses_nvs_vs_file() {
        assert_eq!(
            TollFreeSource::parse("@coin:tollfree"),
            TollFreeSource::NvsKey("coin:tollfree".to_string())
        );
        assert_eq!(
            TollFreeSource::parse("/etc/tollfree.txt"),
            TollFreeSource::FilePath("/etc/tollfree.txt".to_string())
        );
    }

    #[test]
    fn parses_rule_and_e2u_lines() {
        let text = "=^1800\nE2U+sip=!^.*$!sip:support@example.com!\n=^1888\nE2U+voice:tel=!^.*$!tel:+18005551234!";
        let rules = parse_rules(text).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].source_text, "=^1800");
        assert_eq!(rules[0].e2u.len(), 1);
        assert_eq!(rules[1].e2u.len(), 1);
    }

    #[test]
    fn e2u_tag_is_case_insensitive_on_first_three_bytes() {
        assert!(is_e2u_tag("E2U+sip=!x!y!"));
        assert!(is_e2u_tag("e2uANYTHING=!x!y!"));
        assert!(!is_e2u_tag("TTL=600"));
    }

    #[test]
    fn find_match_picks_first_matching_rule() {
        let text = "=^1800[0-9]{7}$\nE2U+sip=!^.*$!sip:a@b.com!\n=^1888[0-9]{7}$\nE2U+sip=!^.*$!sip:c@d.com!";
        let rules = parse_rules(text).unwrap();
        let rule = find_match(&rules, "18005551234").unwrap();
        assert_eq!(rule.source_text, "=^1800[0-9]{7}$");
    }

    #[test]
    fn bad_regex_is_rejected() {
        assert!(parse_rules("=(unterminated").is_err());
    }
}
