pub mod protocol;
pub mod valuefmt;

pub use protocol::{
    DnsHeader, DnsMessageBuilder, DnsRecord, ProtocolError, QueryType, ResultCode,
    ANY_QUERY_TYPES,
};
pub use valuefmt::{TokenizedValue, ValueFmtError};
