//! The name resolver: turns a decoded query into an answer by walking
//! the gateway rewrite, DAP admission check, local override table,
//! allowed-TLD filter, and (for ordinary suffixes) the NVS suffix walk
//! or (for ENUM suffixes) the signed ENUM/toll-free lookup.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use derive_more::{Display, Error, From};
use tracing::{debug, instrument, warn};

use crate::buffer::buffer::{BufferError, PacketBuffer, VectorPacketBuffer};
use crate::config::GatewaySuffix;
use crate::dap::DapTable;
use crate::enumlookup::{self, EnumError};
use crate::nvs::{NameBackend, NvsError};
use crate::protocols::protocol::{
    DnsHeader, DnsMessageBuilder, DnsRecord, ProtocolError, QueryType, ResultCode, ANY_QUERY_TYPES,
};
use crate::protocols::valuefmt::{TokenizedValue, ValueFmtError};
use crate::server::context::ServerContext;
use crate::tables::find_longest_suffix;

#[derive(Debug, Display, From, Error)]
pub enum ResolveError {
    Buffer(BufferError),
    Protocol(ProtocolError),
    ValueFmt(ValueFmtError),
    Enum(EnumError),
    Nvs(NvsError),
    #[display(fmt = "question name is not valid UTF-8")]
    NotUtf8,
}

pub type Result<T> = std::result::Result<T, ResolveError>;

/// What the server loop should do with a decoded request: send a reply,
/// or drop it silently (the `0xDead` sentinel in the original, folded
/// into a real enum here instead of a magic RCODE value).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Reply(Vec<u8>),
    Drop,
}

/// Owns the per-task mutable DAP table; everything else it touches is
/// shared read-only state behind `context`. Not `Clone` — there is
/// exactly one resolver per server task.
pub struct Resolver<B: NameBackend> {
    context: Arc<ServerContext<B>>,
    dap: Option<DapTable>,
}

impl<B: NameBackend> Resolver<B> {
    pub fn new(context: Arc<ServerContext<B>>) -> Self {
        let dap = context.config.dap.map(DapTable::new);
        Resolver { context, dap }
    }

    #[instrument(skip(self, request), fields(source = %source_ip))]
    pub async fn handle_query(&mut self, request: &[u8], source_ip: IpAddr, now: u16) -> HandlerOutcome {
        match self.try_handle(request, source_ip, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "failed to handle query, dropping");
                HandlerOutcome::Drop
            }
        }
    }

    async fn try_handle(&mut self, request: &[u8], source_ip: IpAddr, now: u16) -> Result<HandlerOutcome> {
        let mut buf = VectorPacketBuffer::from_bytes(request);
        let header = DnsHeader::read(&mut buf)?;

        if header.questions == 0 || header.response {
            return Ok(HandlerOutcome::Drop);
        }

        let question_start = buf.pos();
        let name = buf.read_question_name()?;
        let qtype = QueryType::from_num(buf.read_u16()?);
        let _qclass = buf.read_u16()?;
        let question_end = buf.pos();
        let question_bytes = buf.get_range(question_start, question_end - question_start)?.to_vec();

        let ip_key = ip_key_bytes(source_ip);
        if let Some(dap) = self.dap.as_mut() {
            let inctemp = (request.len() / 32) as u16;
            if !dap.admit_ip(&ip_key, now, inctemp) {
                debug!("dap denied source ip");
                return Ok(HandlerOutcome::Drop);
            }
        }

        if matches!(qtype, QueryType::UNKNOWN(_)) {
            return Ok(reply(header, question_bytes, ResultCode::NOTIMP, &[]));
        }

        let mut qname = String::from_utf8(name.key.clone()).map_err(|_| ResolveError::NotUtf8)?;

        if let Some(gw) = &self.context.config.gw_suffix {
            qname = apply_gateway_suffix(gw, &qname);
        }

        if let Some(dap) = self.dap.as_mut() {
            // Decay-only: an already-hot domain is denied without adding
            // further heat for this particular check.
            if !dap.admit_domain(qname.as_bytes(), now, 0) {
                debug!("dap denied domain");
                return Ok(HandlerOutcome::Drop);
            }
        }

        let outcome = self.resolve_name(header, question_bytes, &qname, qtype, now).await?;
        Ok(self.charge_egress(outcome, &ip_key, now))
    }

    async fn resolve_name(
        &mut self,
        header: DnsHeader,
        question_bytes: Vec<u8>,
        qname: &str,
        qtype: QueryType,
        now: u16,
    ) -> Result<HandlerOutcome> {
        if let Some((value, _is_enum)) = self.context.local_table.get(qname.as_bytes()) {
            let tokenized = TokenizedValue::parse(value)?;
            return self.build_answer(header, question_bytes, qtype, &tokenized);
        }

        let Some((tld_entry, is_enum, suffix)) = find_longest_suffix(&self.context.tld_table, qname) else {
            let rcode = if qname.contains('.') {
                ResultCode::REFUSED
            } else {
                ResultCode::NXDOMAIN
            };
            return Ok(reply(header, question_bytes, rcode, &[]));
        };

        if is_enum {
            if qtype != QueryType::NAPTR {
                return Ok(reply(header, question_bytes, ResultCode::NXDOMAIN, &[]));
            }
            let enum_len = tld_entry.enum_len;
            return self
                .handle_enum(header, question_bytes, qname, suffix, enum_len, now)
                .await;
        }

        self.handle_nvs_walk(header, question_bytes, qname, qtype, now).await
    }

    /// Walks NVS keys from the 2-label registered suffix down to the
    /// full queried name (least-specific first). A subdomain not listed
    /// in a found record's `SD=` allowlist falls back to an NS referral
    /// (if the record carries NS records) rather than failing outright,
    /// so it can keep walking toward a more specific match or, failing
    /// that, return the delegation.
    async fn handle_nvs_walk(
        &mut self,
        header: DnsHeader,
        question_bytes: Vec<u8>,
        qname: &str,
        qtype: QueryType,
        now: u16,
    ) -> Result<HandlerOutcome> {
        let labels: Vec<&str> = qname.split('.').collect();
        if labels.len() < 2 {
            return Ok(reply(header, question_bytes, ResultCode::NXDOMAIN, &[]));
        }
        let apex_start = labels.len() - 2;

        let mut referral: Option<(DnsHeader, Vec<u8>, Vec<String>, u32)> = None;

        for start in (0..=apex_start).rev() {
            let candidate = labels[start..].join(".");
            let key = format!("dns:{candidate}");
            match self.context.nvs.get_name_value(&key).await {
                Ok(raw) => {
                    let tokenized = TokenizedValue::parse(&raw)?;
                    if start == 0 {
                        return self.build_answer(header, question_bytes, qtype, &tokenized);
                    }
                    let requested_sub = labels[..start].join(".");
                    let authorized = tokenized
                        .subdomains
                        .as_ref()
                        .map_or(false, |allowed| allowed.iter().any(|s| s == &requested_sub));
                    if authorized {
                        return self.build_answer(header, question_bytes, qtype, &tokenized);
                    }
                    let ns_hosts: Vec<String> =
                        tokenized.records_for("NS").into_iter().map(str::to_string).collect();
                    if !ns_hosts.is_empty() && referral.is_none() {
                        let ttl = tokenized.ttl.unwrap_or(3600);
                        referral = Some((header.clone(), question_bytes.clone(), ns_hosts, ttl));
                    }
                    continue;
                }
                Err(NvsError::NotFound(_)) => continue,
                Err(e) => return Err(ResolveError::Nvs(e)),
            }
        }

        if let Some((header, question_bytes, ns_hosts, ttl)) = referral {
            return build_referral(header, question_bytes, &ns_hosts, ttl);
        }

        self.penalize_nvs_miss(qname, now);
        Ok(reply(header, question_bytes, ResultCode::NXDOMAIN, &[]))
    }

    async fn handle_enum(
        &mut self,
        header: DnsHeader,
        question_bytes: Vec<u8>,
        qname: &str,
        suffix: &str,
        enum_len: u8,
        now: u16,
    ) -> Result<HandlerOutcome> {
        let prefix = &qname[..qname.len() - suffix.len()];
        let labels: Vec<&str> = prefix.split('.').filter(|l| !l.is_empty()).collect();

        let Some(number) = enumlookup::extract_e164(&labels, enum_len) else {
            return Ok(reply(header, question_bytes, ResultCode::FORMERR, &[]));
        };

        let tld = suffix.trim_start_matches('.');
        let records = self.context.enum_lookup.lookup(tld, &number).await?;

        if records.is_empty() {
            self.penalize_nvs_miss(&number, now);
            return Ok(reply(header, question_bytes, ResultCode::NXDOMAIN, &[]));
        }

        let mut builder = DnsMessageBuilder::new(header, question_bytes);
        for record in &records {
            builder.push_answer(record, DnsMessageBuilder::qname_ref(), 3600)?;
        }
        Ok(HandlerOutcome::Reply(builder.finish()?))
    }

    /// Charges the flat NVS-miss penalty against the domain key; the
    /// source-IP side of this penalty is folded into the egress charge
    /// since every miss still produces a reply (NXDOMAIN) that passes
    /// through `charge_egress`.
    fn penalize_nvs_miss(&mut self, key: &str, now: u16) {
        if let Some(dap) = self.dap.as_mut() {
            dap.admit_domain(key.as_bytes(), now, crate::dap::NVS_MISS_PENALTY);
        }
    }

    /// Charges the source IP for the reply about to be sent
    /// (`response_len/32` plus a small fixed per-datagram overhead) and
    /// returns the outcome unchanged — this charge never itself denies
    /// an already-decided reply.
    fn charge_egress(&mut self, outcome: HandlerOutcome, ip_key: &[u8], now: u16) -> HandlerOutcome {
        if let HandlerOutcome::Reply(bytes) = &outcome {
            if let Some(dap) = self.dap.as_mut() {
                let inctemp = (bytes.len() / 32) as u16 + 2;
                dap.admit_ip(ip_key, now, inctemp);
            }
        }
        outcome
    }

    fn build_answer(
        &self,
        header: DnsHeader,
        question_bytes: Vec<u8>,
        qtype: QueryType,
        tokenized: &TokenizedValue,
    ) -> Result<HandlerOutcome> {
        let ttl = tokenized.ttl.unwrap_or(3600);
        let mut builder = DnsMessageBuilder::new(header, question_bytes);

        let types: &[QueryType] = if qtype == QueryType::ANY {
            &ANY_QUERY_TYPES
        } else {
            std::slice::from_ref(&qtype)
        };

        let mut any_answer = false;
        for &t in types {
            for raw in tokenized.records_for_type(t) {
                if let Some(record) = record_from_token(t, raw) {
                    builder.push_answer(&record, DnsMessageBuilder::qname_ref(), ttl)?;
                    any_answer = true;
                }
            }
        }

        if !any_answer {
            builder.set_rcode(ResultCode::NXDOMAIN);
        }

        Ok(HandlerOutcome::Reply(builder.finish()?))
    }
}

/// Rewrites `qname` under a configured gateway suffix, e.g. `.gw.coin`
/// rewritten to `.coin` turns `shop.gw.coin` into `shop.coin`. A qname
/// equal to the suffix with its leading dot stripped (the bare gateway
/// site itself, with no label in front of it) reduces to `gw.replace`
/// directly, since `strip_suffix` alone can't match a qname that has no
/// leading dot of its own.
fn apply_gateway_suffix(gw: &GatewaySuffix, qname: &str) -> String {
    let bare = &gw.suffix[1..];
    if qname == bare {
        return String::new();
    }
    match qname.strip_suffix(gw.suffix.as_str()) {
        Some(stripped) => format!("{stripped}{}", gw.replace),
        None => qname.to_string(),
    }
}

/// Builds an NS-referral reply: the NS records are placed directly in
/// the authority section (via `demote_answers_to_authority`) and the
/// RCODE stays NOERROR with an empty answer section.
fn build_referral(
    header: DnsHeader,
    question_bytes: Vec<u8>,
    ns_hosts: &[String],
    ttl: u32,
) -> Result<HandlerOutcome> {
    let mut builder = DnsMessageBuilder::new(header, question_bytes);
    for host in ns_hosts {
        let record = DnsRecord::Ns { host: host.clone() };
        builder.push_answer(&record, DnsMessageBuilder::qname_ref(), ttl)?;
    }
    builder.demote_answers_to_authority();
    Ok(HandlerOutcome::Reply(builder.finish()?))
}

fn ip_key_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn record_from_token(qtype: QueryType, raw: &str) -> Option<DnsRecord> {
    match qtype {
        QueryType::A => raw.parse::<Ipv4Addr>().ok().map(|addr| DnsRecord::A { addr }),
        QueryType::AAAA => raw.parse::<Ipv6Addr>().ok().map(|addr| DnsRecord::Aaaa { addr }),
        QueryType::NS => Some(DnsRecord::Ns { host: raw.to_string() }),
        QueryType::CNAME => Some(DnsRecord::Cname { host: raw.to_string() }),
        QueryType::PTR => Some(DnsRecord::Ptr { host: raw.to_string() }),
        QueryType::MX => {
            let mut parts = raw.splitn(2, ':');
            let host = parts.next()?.trim().to_string();
            let priority: u16 = match parts.next() {
                Some(p) => p.trim().parse().ok()?,
                None => 1,
            };
            Some(DnsRecord::Mx { priority, host })
        }
        QueryType::TXT => Some(DnsRecord::Txt { data: raw.to_string() }),
        _ => None,
    }
}

fn reply(header: DnsHeader, question_bytes: Vec<u8>, rcode: ResultCode, answers: &[DnsRecord]) -> HandlerOutcome {
    let mut builder = DnsMessageBuilder::new(header, question_bytes);
    builder.set_rcode(rcode);
    for record in answers {
        if builder
            .push_answer(record, DnsMessageBuilder::qname_ref(), 3600)
            .is_err()
        {
            builder.set_rcode(ResultCode::SERVFAIL);
            break;
        }
    }
    match builder.finish() {
        Ok(bytes) => HandlerOutcome::Reply(bytes),
        Err(_) => HandlerOutcome::Drop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_from_token_parses_a_record() {
        let rec = record_from_token(QueryType::A, "1.2.3.4").unwrap();
        assert_eq!(rec, DnsRecord::A { addr: "1.2.3.4".parse().unwrap() });
    }

    #[test]
    fn record_from_token_parses_mx() {
        let rec = record_from_token(QueryType::MX, "mail.example.coin:10").unwrap();
        assert_eq!(rec, DnsRecord::Mx { priority: 10, host: "mail.example.coin".to_string() });
    }

    #[test]
    fn record_from_token_mx_defaults_priority_to_one() {
        let rec = record_from_token(QueryType::MX, "mail.example.coin").unwrap();
        assert_eq!(rec, DnsRecord::Mx { priority: 1, host: "mail.example.coin".to_string() });
    }

    #[test]
    fn gateway_bare_site_reduces_to_empty_key() {
        let gw = GatewaySuffix::new(".gw.coin", ".coin").unwrap();
        assert_eq!(apply_gateway_suffix(&gw, "gw.coin"), "");
        assert_eq!(apply_gateway_suffix(&gw, "shop.gw.coin"), "shop.coin");
    }

    #[test]
    fn record_from_token_rejects_malformed_a() {
        assert!(record_from_token(QueryType::A, "not-an-ip").is_none());
    }

    #[test]
    fn ip_key_bytes_differ_for_v4_and_v6() {
        let v4 = ip_key_bytes("1.2.3.4".parse().unwrap());
        let v6 = ip_key_bytes("::1".parse().unwrap());
        assert_eq!(v4.len(), 4);
        assert_eq!(v6.len(), 16);
    }
}
