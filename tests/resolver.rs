//! End-to-end scenarios against an in-memory name-value store: local
//! overrides, gateway rewrite, subdomain referral, TLD filtering,
//! truncation, and DAP denial.

use std::net::IpAddr;
use std::sync::Arc;

use emercoin_dns_core::buffer::buffer::{PacketBuffer, VectorPacketBuffer};
use emercoin_dns_core::config::{AllowedTld, DapConfig, GatewaySuffix, ServerConfig};
use emercoin_dns_core::nvs::test_support::InMemoryBackend;
use emercoin_dns_core::protocols::protocol::{DnsHeader, QueryType, ResultCode};
use emercoin_dns_core::{HandlerOutcome, Resolver, ServerContext};

fn build_query(id: u16, qname: &str, qtype: QueryType) -> Vec<u8> {
    let mut header = DnsHeader::new();
    header.id = id;
    header.recursion_desired = true;
    header.questions = 1;

    let mut buf = VectorPacketBuffer::new();
    header.write(&mut buf).unwrap();
    buf.write_label_sequence(qname).unwrap();
    buf.write_u16(qtype.to_num()).unwrap();
    buf.write_u16(1).unwrap(); // IN
    buf.buf
}

fn read_header(bytes: &[u8]) -> DnsHeader {
    let mut buf = VectorPacketBuffer::from_bytes(bytes);
    DnsHeader::read(&mut buf).unwrap()
}

fn source_ip() -> IpAddr {
    "198.51.100.7".parse().unwrap()
}

#[tokio::test]
async fn local_override_wins_over_nvs_record() {
    let mut config = ServerConfig::new(0, vec![AllowedTld::dns(".coin").unwrap()]);
    config.local_entries.push(("example.coin".to_string(), "A=9.9.9.9".to_string()));

    let nvs = Arc::new(InMemoryBackend::new());
    nvs.insert("dns:example.coin", "A=1.1.1.1").await;

    let context = Arc::new(ServerContext::build(config, nvs).await.unwrap());
    let mut resolver = Resolver::new(context);

    let query = build_query(1, "example.coin", QueryType::A);
    let outcome = resolver.handle_query(&query, source_ip(), 0).await;

    match outcome {
        HandlerOutcome::Reply(bytes) => {
            let header = read_header(&bytes);
            assert_eq!(header.rescode, ResultCode::NOERROR);
            assert_eq!(header.answers, 1);
            assert!(bytes.windows(4).any(|w| w == [9, 9, 9, 9]));
        }
        HandlerOutcome::Drop => panic!("expected a reply"),
    }
}

#[tokio::test]
async fn gateway_suffix_is_rewritten_before_lookup() {
    let mut config = ServerConfig::new(0, vec![AllowedTld::dns(".coin").unwrap()]);
    config.gw_suffix = Some(GatewaySuffix::new(".gw.coin", ".coin").unwrap());

    let nvs = Arc::new(InMemoryBackend::new());
    nvs.insert("dns:example.coin", "A=1.2.3.4").await;

    let context = Arc::new(ServerContext::build(config, nvs).await.unwrap());
    let mut resolver = Resolver::new(context);

    let query = build_query(2, "example.gw.coin", QueryType::A);
    let outcome = resolver.handle_query(&query, source_ip(), 0).await;

    match outcome {
        HandlerOutcome::Reply(bytes) => {
            let header = read_header(&bytes);
            assert_eq!(header.rescode, ResultCode::NOERROR);
            assert_eq!(header.answers, 1);
        }
        HandlerOutcome::Drop => panic!("expected a reply"),
    }
}

#[tokio::test]
async fn subdomain_is_referred_via_sd_allowlist() {
    let config = ServerConfig::new(0, vec![AllowedTld::dns(".coin").unwrap()]);

    let nvs = Arc::new(InMemoryBackend::new());
    nvs.insert("dns:example.coin", "A=5.5.5.5|SD=shop").await;

    let context = Arc::new(ServerContext::build(config, nvs).await.unwrap());
    let mut resolver = Resolver::new(context);

    let allowed = build_query(3, "shop.example.coin", QueryType::A);
    match resolver.handle_query(&allowed, source_ip(), 0).await {
        HandlerOutcome::Reply(bytes) => assert_eq!(read_header(&bytes).rescode, ResultCode::NOERROR),
        HandlerOutcome::Drop => panic!("expected a reply"),
    }

    let denied = build_query(4, "mail.example.coin", QueryType::A);
    match resolver.handle_query(&denied, source_ip(), 0).await {
        HandlerOutcome::Reply(bytes) => assert_eq!(read_header(&bytes).rescode, ResultCode::NXDOMAIN),
        HandlerOutcome::Drop => panic!("expected a reply"),
    }
}

#[tokio::test]
async fn unlisted_subdomain_with_ns_records_is_referred_not_refused() {
    let config = ServerConfig::new(0, vec![AllowedTld::dns(".coin").unwrap()]);

    let nvs = Arc::new(InMemoryBackend::new());
    nvs.insert(
        "dns:example.coin",
        "NS=ns1.example.coin,ns2.example.coin|SD=shop",
    )
    .await;

    let context = Arc::new(ServerContext::build(config, nvs).await.unwrap());
    let mut resolver = Resolver::new(context);

    let query = build_query(7, "sub.example.coin", QueryType::A);
    match resolver.handle_query(&query, source_ip(), 0).await {
        HandlerOutcome::Reply(bytes) => {
            let header = read_header(&bytes);
            assert_eq!(header.rescode, ResultCode::NOERROR);
            assert_eq!(header.answers, 0);
            assert_eq!(header.authoritative_entries, 2);
        }
        HandlerOutcome::Drop => panic!("expected a reply"),
    }
}

#[tokio::test]
async fn disallowed_tld_is_refused() {
    let config = ServerConfig::new(0, vec![AllowedTld::dns(".coin").unwrap()]);
    let nvs = Arc::new(InMemoryBackend::new());
    let context = Arc::new(ServerContext::build(config, nvs).await.unwrap());
    let mut resolver = Resolver::new(context);

    let query = build_query(5, "example.com", QueryType::A);
    match resolver.handle_query(&query, source_ip(), 0).await {
        HandlerOutcome::Reply(bytes) => assert_eq!(read_header(&bytes).rescode, ResultCode::REFUSED),
        HandlerOutcome::Drop => panic!("expected a reply"),
    }
}

#[tokio::test]
async fn dap_denies_after_repeated_queries_from_same_source() {
    let mut config = ServerConfig::new(0, vec![AllowedTld::dns(".coin").unwrap()]);
    config.dap = Some(DapConfig::new(64, 10).unwrap());

    let nvs = Arc::new(InMemoryBackend::new());
    nvs.insert("dns:example.coin", "A=1.2.3.4").await;

    let context = Arc::new(ServerContext::build(config, nvs).await.unwrap());
    let mut resolver = Resolver::new(context);

    let mut saw_drop = false;
    for i in 0..20 {
        let query = build_query(i, "example.coin", QueryType::A);
        if matches!(resolver.handle_query(&query, source_ip(), 0).await, HandlerOutcome::Drop) {
            saw_drop = true;
            break;
        }
    }
    assert!(saw_drop, "expected DAP to eventually deny a flood from one source");
}

#[tokio::test]
async fn unknown_query_type_is_not_implemented() {
    let config = ServerConfig::new(0, vec![AllowedTld::dns(".coin").unwrap()]);
    let nvs = Arc::new(InMemoryBackend::new());
    let context = Arc::new(ServerContext::build(config, nvs).await.unwrap());
    let mut resolver = Resolver::new(context);

    let query = build_query(6, "example.coin", QueryType::UNKNOWN(999));
    match resolver.handle_query(&query, source_ip(), 0).await {
        HandlerOutcome::Reply(bytes) => assert_eq!(read_header(&bytes).rescode, ResultCode::NOTIMP),
        HandlerOutcome::Drop => panic!("expected a reply"),
    }
}
