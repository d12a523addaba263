//! DNS wire types: header, query type / result code enums, typed answer
//! records, and the message builder that assembles a reply within the
//! `MAX_OUT` budget.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use derive_more::{Display, Error, From};

use crate::buffer::buffer::{BufferError, PacketBuffer, VectorPacketBuffer, MAX_OUT};

#[derive(Debug, Display, From, Error)]
pub enum ProtocolError {
    Buffer(BufferError),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// DNS query types this server understands. Anything else decodes to
/// `UNKNOWN` and is answered with NOTIMP-free empty ANY-style handling
/// upstream (the resolver never special-cases it beyond that).
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum QueryType {
    UNKNOWN(u16),
    A,     // 1
    NS,    // 2
    CNAME, // 5
    PTR,   // 12
    MX,    // 15
    TXT,   // 16
    AAAA,  // 28
    NAPTR, // 35
    OPT,   // 41
    ANY,   // 255
}

impl QueryType {
    pub fn to_num(self) -> u16 {
        match self {
            QueryType::UNKNOWN(x) => x,
            QueryType::A => 1,
            QueryType::NS => 2,
            QueryType::CNAME => 5,
            QueryType::PTR => 12,
            QueryType::MX => 15,
            QueryType::TXT => 16,
            QueryType::AAAA => 28,
            QueryType::NAPTR => 35,
            QueryType::OPT => 41,
            QueryType::ANY => 255,
        }
    }

    pub fn from_num(num: u16) -> QueryType {
        match num {
            1 => QueryType::A,
            2 => QueryType::NS,
            5 => QueryType::CNAME,
            12 => QueryType::PTR,
            15 => QueryType::MX,
            16 => QueryType::TXT,
            28 => QueryType::AAAA,
            35 => QueryType::NAPTR,
            41 => QueryType::OPT,
            255 => QueryType::ANY,
            _ => QueryType::UNKNOWN(num),
        }
    }

    /// The token key used to look a record up in a tokenized NVS value,
    /// e.g. `A=1.2.3.4`. Types with no textual key (OPT, ANY, UNKNOWN)
    /// return `None`.
    pub fn token_key(self) -> Option<&'static str> {
        match self {
            QueryType::A => Some("A"),
            QueryType::NS => Some("NS"),
            QueryType::CNAME => Some("CNAME"),
            QueryType::PTR => Some("PTR"),
            QueryType::MX => Some("MX"),
            QueryType::TXT => Some("TXT"),
            QueryType::AAAA => Some("AAAA"),
            _ => None,
        }
    }
}

/// The set iterated for an ANY query: A, NS, CNAME, PTR, MX, AAAA (no TXT,
/// matching the original's `q_all` table).
pub const ANY_QUERY_TYPES: [QueryType; 6] = [
    QueryType::A,
    QueryType::NS,
    QueryType::CNAME,
    QueryType::PTR,
    QueryType::MX,
    QueryType::AAAA,
];

#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    NOERROR = 0,
    FORMERR = 1,
    SERVFAIL = 2,
    NXDOMAIN = 3,
    NOTIMP = 4,
    REFUSED = 5,
}

impl Default for ResultCode {
    fn default() -> Self {
        ResultCode::NOERROR
    }
}

impl ResultCode {
    pub fn from_num(num: u8) -> ResultCode {
        match num & 0x0f {
            1 => ResultCode::FORMERR,
            2 => ResultCode::SERVFAIL,
            3 => ResultCode::NXDOMAIN,
            4 => ResultCode::NOTIMP,
            5 => ResultCode::REFUSED,
            _ => ResultCode::NOERROR,
        }
    }
}

/// Representation of a DNS header. Flags mirror RFC 1035 4.1.1 bit for bit.
#[derive(Clone, Debug, Default)]
pub struct DnsHeader {
    pub id: u16,

    pub recursion_desired: bool,
    pub truncated_message: bool,
    pub authoritative_answer: bool,
    pub opcode: u8,
    pub response: bool,

    pub rescode: ResultCode,
    pub checking_disabled: bool,
    pub authed_data: bool,
    pub z: bool,
    pub recursion_available: bool,

    pub questions: u16,
    pub answers: u16,
    pub authoritative_entries: u16,
    pub resource_entries: u16,
}

impl DnsHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read<T: PacketBuffer>(buffer: &mut T) -> Result<DnsHeader> {
        let id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        let flags1 = (flags >> 8) as u8;
        let flags2 = (flags & 0xff) as u8;

        Ok(DnsHeader {
            id,
            recursion_desired: (flags1 & 1) > 0,
            truncated_message: (flags1 & (1 << 1)) > 0,
            authoritative_answer: (flags1 & (1 << 2)) > 0,
            opcode: (flags1 >> 3) & 0x0f,
            response: (flags1 & (1 << 7)) > 0,
            rescode: ResultCode::from_num(flags2),
            checking_disabled: (flags2 & (1 << 4)) > 0,
            authed_data: (flags2 & (1 << 5)) > 0,
            z: (flags2 & (1 << 6)) > 0,
            recursion_available: (flags2 & (1 << 7)) > 0,
            questions: buffer.read_u16()?,
            answers: buffer.read_u16()?,
            authoritative_entries: buffer.read_u16()?,
            resource_entries: buffer.read_u16()?,
        })
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_u16(self.id)?;

        let flags1 = (self.recursion_desired as u8)
            | ((self.truncated_message as u8) << 1)
            | ((self.authoritative_answer as u8) << 2)
            | (self.opcode << 3)
            | ((self.response as u8) << 7);

        let flags2 = (self.rescode as u8)
            | ((self.checking_disabled as u8) << 4)
            | ((self.authed_data as u8) << 5)
            | ((self.z as u8) << 6)
            | ((self.recursion_available as u8) << 7);

        buffer.write_u8(flags1)?;
        buffer.write_u8(flags2)?;
        buffer.write_u16(self.questions)?;
        buffer.write_u16(self.answers)?;
        buffer.write_u16(self.authoritative_entries)?;
        buffer.write_u16(self.resource_entries)?;
        Ok(())
    }

    pub const BINARY_LEN: usize = 12;
}

impl fmt::Display for DnsHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id={} rd={} tc={} rcode={:?} qd={} an={} ns={} ar={}",
            self.id,
            self.recursion_desired,
            self.truncated_message,
            self.rescode,
            self.questions,
            self.answers,
            self.authoritative_entries,
            self.resource_entries
        )
    }
}

impl fmt::Debug for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultCode::NOERROR => "NOERROR",
            ResultCode::FORMERR => "FORMERR",
            ResultCode::SERVFAIL => "SERVFAIL",
            ResultCode::NXDOMAIN => "NXDOMAIN",
            ResultCode::NOTIMP => "NOTIMP",
            ResultCode::REFUSED => "REFUSED",
        };
        write!(f, "{}", s)
    }
}

/// A single answer/authority record, already typed from the tokenized NVS
/// value. `write` emits it against a caller-supplied owner pointer (always
/// a compression pointer into the echoed question, per §4.3).
#[derive(Debug, Clone, PartialEq)]
pub enum DnsRecord {
    A { addr: Ipv4Addr },
    Aaaa { addr: Ipv6Addr },
    Ns { host: String },
    Cname { host: String },
    Ptr { host: String },
    Mx { priority: u16, host: String },
    Txt { data: String },
    Naptr {
        order: u16,
        preference: u16,
        service: String,
        regexp: String,
    },
}

impl DnsRecord {
    pub fn qtype(&self) -> QueryType {
        match self {
            DnsRecord::A { .. } => QueryType::A,
            DnsRecord::Aaaa { .. } => QueryType::AAAA,
            DnsRecord::Ns { .. } => QueryType::NS,
            DnsRecord::Cname { .. } => QueryType::CNAME,
            DnsRecord::Ptr { .. } => QueryType::PTR,
            DnsRecord::Mx { .. } => QueryType::MX,
            DnsRecord::Txt { .. } => QueryType::TXT,
            DnsRecord::Naptr { .. } => QueryType::NAPTR,
        }
    }

    /// Writes owner (as a pointer), type, class, ttl, and RDATA. Returns
    /// an error only on a label-too-long RDATA name (the caller maps that
    /// to SERVFAIL and aborts the record, matching `Fill_RD_DName`'s
    /// behavior of emitting a diagnostic label instead of the real name).
    pub fn write<T: PacketBuffer>(
        &self,
        buffer: &mut T,
        owner_ref: u16,
        ttl: u32,
    ) -> Result<()> {
        buffer.write_name_pointer(owner_ref)?;
        buffer.write_u16(self.qtype().to_num())?;
        buffer.write_u16(1)?; // IN
        buffer.write_u32(ttl)?;

        match self {
            DnsRecord::A { addr } => {
                buffer.write_u16(4)?;
                for octet in addr.octets() {
                    buffer.write_u8(octet)?;
                }
            }
            DnsRecord::Aaaa { addr } => {
                buffer.write_u16(16)?;
                for octet in addr.octets() {
                    buffer.write_u8(octet)?;
                }
            }
            DnsRecord::Ns { host } | DnsRecord::Cname { host } | DnsRecord::Ptr { host } => {
                let len_pos = buffer.pos();
                buffer.write_u16(0)?;
                buffer.write_label_sequence(host)?;
                let len = buffer.pos() - len_pos - 2;
                buffer.set_u16(len_pos, len as u16)?;
            }
            DnsRecord::Mx { priority, host } => {
                let len_pos = buffer.pos();
                buffer.write_u16(0)?;
                buffer.write_u16(*priority)?;
                buffer.write_label_sequence(host)?;
                let len = buffer.pos() - len_pos - 2;
                buffer.set_u16(len_pos, len as u16)?;
            }
            DnsRecord::Txt { data } => {
                buffer.write_u16(data.len() as u16)?;
                for &b in data.as_bytes() {
                    buffer.write_u8(b)?;
                }
            }
            DnsRecord::Naptr {
                order,
                preference,
                service,
                regexp,
            } => {
                let len_pos = buffer.pos();
                buffer.write_u16(0)?;
                buffer.write_u16(*order)?;
                buffer.write_u16(*preference)?;
                write_character_string(buffer, "u")?;
                write_character_string(buffer, service)?;
                write_character_string(buffer, regexp)?;
                buffer.write_u8(0)?; // replacement = root
                let len = buffer.pos() - len_pos - 2;
                buffer.set_u16(len_pos, len as u16)?;
            }
        }
        Ok(())
    }
}

fn write_character_string<T: PacketBuffer>(buffer: &mut T, s: &str) -> Result<()> {
    buffer.write_u8(s.len() as u8)?;
    for &b in s.as_bytes() {
        buffer.write_u8(b)?;
    }
    Ok(())
}

/// Assembles header + echoed question + answer/authority/additional
/// sections, enforcing the `MAX_OUT` budget and the TC bit.
pub struct DnsMessageBuilder {
    header: DnsHeader,
    question_bytes: Vec<u8>,
    answers: Vec<u8>,
    answer_count: u16,
    authorities: Vec<u8>,
    authority_count: u16,
}

impl DnsMessageBuilder {
    /// `question_bytes` is the raw wire bytes of the (single) question as
    /// received, echoed back verbatim. `qname_ref` is the offset of that
    /// slice within the final message, i.e. `DnsHeader::BINARY_LEN`.
    pub fn new(mut header: DnsHeader, question_bytes: Vec<u8>) -> Self {
        header.response = true;
        header.authoritative_answer = true;
        header.questions = 1;
        header.answers = 0;
        header.authoritative_entries = 0;
        header.resource_entries = 0;
        DnsMessageBuilder {
            header,
            question_bytes,
            answers: Vec::new(),
            answer_count: 0,
            authorities: Vec::new(),
            authority_count: 0,
        }
    }

    pub const fn qname_ref() -> u16 {
        DnsHeader::BINARY_LEN as u16
    }

    pub fn set_rcode(&mut self, rcode: ResultCode) {
        self.header.rescode = rcode;
    }

    pub fn rcode(&self) -> ResultCode {
        self.header.rescode
    }

    pub fn push_answer(&mut self, record: &DnsRecord, owner_ref: u16, ttl: u32) -> Result<()> {
        let mut buf = VectorPacketBuffer::new();
        record.write(&mut buf, owner_ref, ttl)?;
        self.answers.extend_from_slice(&buf.buf);
        self.answer_count += 1;
        Ok(())
    }

    pub fn push_authority(&mut self, record: &DnsRecord, owner_ref: u16, ttl: u32) -> Result<()> {
        let mut buf = VectorPacketBuffer::new();
        record.write(&mut buf, owner_ref, ttl)?;
        self.authorities.extend_from_slice(&buf.buf);
        self.authority_count += 1;
        Ok(())
    }

    pub fn answer_count(&self) -> u16 {
        self.answer_count
    }

    /// Moves the answer section into the authority section (DNS referral:
    /// NS records move from Answer to Authority, leaving an empty answer).
    pub fn demote_answers_to_authority(&mut self) {
        self.authorities = std::mem::take(&mut self.answers);
        self.authority_count = self.answer_count;
        self.answers.clear();
        self.answer_count = 0;
    }

    /// Serializes header, question, answers, and authorities, appends an
    /// EDNS OPT record when RCODE is NOERROR, and truncates to `MAX_OUT`
    /// with TC set if the assembled message doesn't fit.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        self.header.answers = self.answer_count;
        self.header.authoritative_entries = self.authority_count;

        if self.header.rescode == ResultCode::NOERROR {
            self.header.resource_entries = 1;
        }

        let mut out = VectorPacketBuffer::new();
        self.header.write(&mut out)?;
        out.buf.extend_from_slice(&self.question_bytes);
        out.buf.extend_from_slice(&self.answers);
        out.buf.extend_from_slice(&self.authorities);

        if self.header.rescode == ResultCode::NOERROR {
            write_opt_record(&mut out)?;
        }

        if out.buf.len() > MAX_OUT {
            self.header.truncated_message = true;
            out.buf.truncate(MAX_OUT);
            // rewrite the header in place with TC set and the record
            // counts it had before we know how many were actually kept;
            // a truncated response is advisory only, clients must retry.
            let mut head = VectorPacketBuffer::new();
            self.header.write(&mut head)?;
            out.buf[..DnsHeader::BINARY_LEN].copy_from_slice(&head.buf[..DnsHeader::BINARY_LEN]);
        }

        Ok(out.buf)
    }
}

fn write_opt_record<T: PacketBuffer>(buffer: &mut T) -> Result<()> {
    buffer.write_u8(0)?; // root name
    buffer.write_u16(QueryType::OPT.to_num())?;
    buffer.write_u16(MAX_OUT as u16)?; // class carries UDP payload size
    buffer.write_u32(0)?; // extended RCODE + flags
    buffer.write_u16(0)?; // RDLEN
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_type_round_trips() {
        for &qt in &[
            QueryType::A,
            QueryType::NS,
            QueryType::CNAME,
            QueryType::PTR,
            QueryType::MX,
            QueryType::TXT,
            QueryType::AAAA,
            QueryType::NAPTR,
        ] {
            assert_eq!(QueryType::from_num(qt.to_num()), qt);
        }
        assert_eq!(QueryType::from_num(999), QueryType::UNKNOWN(999));
    }

    #[test]
    fn a_record_rdata_round_trips() {
        let mut buf = VectorPacketBuffer::new();
        let rec = DnsRecord::A { addr: "1.2.3.4".parse().unwrap() };
        rec.write(&mut buf, DnsMessageBuilder::qname_ref(), 3600).unwrap();
        buf.seek(0).unwrap();
        assert_eq!(buf.read_u16().unwrap(), 0xc000 | DnsMessageBuilder::qname_ref());
        assert_eq!(buf.read_u16().unwrap(), 1); // A
        assert_eq!(buf.read_u16().unwrap(), 1); // IN
        assert_eq!(buf.read_u32().unwrap(), 3600);
        assert_eq!(buf.read_u16().unwrap(), 4);
        let octets = [buf.read().unwrap(), buf.read().unwrap(), buf.read().unwrap(), buf.read().unwrap()];
        assert_eq!(octets, [1, 2, 3, 4]);
    }

    #[test]
    fn builder_appends_opt_on_noerror() {
        let header = DnsHeader::new();
        let builder = DnsMessageBuilder::new(header, vec![0, 0, 1, 0, 1]);
        let bytes = builder.finish().unwrap();
        // header(12) + question(5) + opt(11) = 28, and no answers
        assert_eq!(bytes.len(), 12 + 5 + 11);
    }

    #[test]
    fn result_code_masks_to_four_bits() {
        assert_eq!(ResultCode::from_num(0xf3), ResultCode::NXDOMAIN);
    }
}
