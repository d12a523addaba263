//! Byte-level primitives for the DNS wire format: reading the incoming
//! header/question, and writing header/question/answer bytes back out.
//!
//! Unlike a general-purpose resolver, this server never needs to decode an
//! arbitrary RR (it only ever answers), so there is no general `read_qname`
//! that follows compression pointers. The only qname ever decoded is the
//! question's, and per RFC 1035 a compressed label there is a protocol
//! violation we reject rather than support.

use derive_more::{Display, Error, From};

pub const MAX_OUT: usize = 512;
pub const BUF_SIZE: usize = 2 * MAX_OUT;
pub const MAX_DOM: usize = 20;
const MAX_LABEL: usize = 63;

#[derive(Debug, Display, From, Error, PartialEq, Eq)]
pub enum BufferError {
    #[display(fmt = "end of buffer reached")]
    EndOfBuffer,
    #[display(fmt = "invalid buffer access at position {}", _0)]
    InvalidAccess(#[error(not(source))] usize),
    #[display(fmt = "label length {} exceeds 63 octets", _0)]
    LabelTooLong(#[error(not(source))] usize),
    #[display(fmt = "compressed label not allowed in question")]
    CompressedLabel,
    #[display(fmt = "domain name exceeds {} labels", MAX_DOM)]
    TooManyLabels,
    #[display(fmt = "decoded name exceeds buffer capacity")]
    NameTooLong,
}

pub type Result<T> = std::result::Result<T, BufferError>;

/// A decoded question name: the lowercased, dot-joined key plus the byte
/// offset (into `key`) where each label starts, outermost label first.
#[derive(Debug, Clone, Default)]
pub struct DecodedName {
    pub key: Vec<u8>,
    pub label_starts: Vec<usize>,
}

pub trait PacketBuffer {
    fn read(&mut self) -> Result<u8>;

    fn read_u16(&mut self) -> Result<u16> {
        Ok(((self.read()? as u16) << 8) | (self.read()? as u16))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(((self.read()? as u32) << 24)
            | ((self.read()? as u32) << 16)
            | ((self.read()? as u32) << 8)
            | (self.read()? as u32))
    }

    /// Reads the single question qname, lowercasing it and recording label
    /// boundaries. Rejects any label whose top two bits are set (a
    /// compression pointer in the question is a FORMERR condition, not a
    /// feature we support on the decode side).
    fn read_question_name(&mut self) -> Result<DecodedName> {
        let mut name = DecodedName::default();
        loop {
            let len = self.read()? as usize;
            if len == 0 {
                break;
            }
            if len & 0xc0 != 0 {
                return Err(BufferError::CompressedLabel);
            }
            if name.label_starts.len() >= MAX_DOM {
                return Err(BufferError::TooManyLabels);
            }
            if name.key.len() + len + 1 > BUF_SIZE {
                return Err(BufferError::NameTooLong);
            }
            name.label_starts.push(name.key.len());
            for _ in 0..len {
                let c = self.read()?;
                name.key.push(if c.is_ascii_uppercase() { c | 0x20 } else { c });
            }
            name.key.push(b'.');
        }
        // drop the trailing dot, matching the original's in-place NUL swap
        name.key.pop();
        Ok(name)
    }

    fn write(&mut self, val: u8) -> Result<()>;

    fn write_u8(&mut self, val: u8) -> Result<()> {
        self.write(val)
    }

    fn write_u16(&mut self, val: u16) -> Result<()> {
        self.write((val >> 8) as u8)?;
        self.write((val & 0xff) as u8)
    }

    fn write_u32(&mut self, val: u32) -> Result<()> {
        for i in (0..4).rev() {
            self.write(((val >> (i * 8)) & 0xff) as u8)?;
        }
        Ok(())
    }

    /// Writes `name` as a sequence of length-prefixed labels terminated by
    /// a zero octet. Used for RDATA names (NS/CNAME/PTR/MX host, NAPTR
    /// replacement) which are never compressed in this server's answers.
    fn write_label_sequence(&mut self, name: &str) -> Result<()> {
        if name.is_empty() {
            return self.write_u8(0);
        }
        for label in name.split('.') {
            if label.len() > MAX_LABEL {
                return Err(BufferError::LabelTooLong(label.len()));
            }
            self.write_u8(label.len() as u8)?;
            for &b in label.as_bytes() {
                self.write_u8(b)?;
            }
        }
        self.write_u8(0)
    }

    /// Writes a 2-byte compression pointer (top two bits set) referring
    /// back to an earlier offset in the packet — always the question's
    /// qname in this server, since no other name is ever repeated.
    fn write_name_pointer(&mut self, offset: u16) -> Result<()> {
        self.write_u16(0xc000 | (offset & 0x3fff))
    }

    fn get(&self, pos: usize) -> Result<u8>;

    fn get_range(&self, start: usize, len: usize) -> Result<&[u8]>;

    fn set_u16(&mut self, pos: usize, val: u16) -> Result<()> {
        self.set(pos, (val >> 8) as u8)?;
        self.set(pos + 1, (val & 0xff) as u8)
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()>;

    fn seek(&mut self, pos: usize) -> Result<()>;

    fn step(&mut self, steps: usize) -> Result<()>;

    fn pos(&self) -> usize;
}

/// Growable packet buffer backing both request parsing and response
/// assembly. Capacity is not clamped here; truncation to `MAX_OUT` is the
/// caller's responsibility once a full answer has been assembled (it needs
/// to know how many whole records fit, which this buffer doesn't track).
#[derive(Default)]
pub struct VectorPacketBuffer {
    pub buf: Vec<u8>,
    pub pos: usize,
}

impl VectorPacketBuffer {
    pub fn new() -> VectorPacketBuffer {
        VectorPacketBuffer {
            buf: Vec::with_capacity(BUF_SIZE),
            pos: 0,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> VectorPacketBuffer {
        VectorPacketBuffer {
            buf: bytes.to_vec(),
            pos: 0,
        }
    }
}

impl PacketBuffer for VectorPacketBuffer {
    fn read(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        let res = self.buf[self.pos];
        self.pos += 1;
        Ok(res)
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos == self.buf.len() {
            self.buf.push(val);
        } else {
            self.buf[self.pos] = val;
        }
        self.pos += 1;
        Ok(())
    }

    fn get(&self, pos: usize) -> Result<u8> {
        self.buf.get(pos).copied().ok_or(BufferError::InvalidAccess(pos))
    }

    fn get_range(&self, start: usize, len: usize) -> Result<&[u8]> {
        if start + len > self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(&self.buf[start..start + len])
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        if pos >= self.buf.len() {
            return Err(BufferError::InvalidAccess(pos));
        }
        self.buf[pos] = val;
        Ok(())
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos = pos;
        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        let next = self.pos + steps;
        if next > self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos = next;
        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_primitives() {
        let mut buf = VectorPacketBuffer::new();
        buf.write_u16(0x1337).unwrap();
        buf.write_u32(0xdead_beef).unwrap();
        buf.seek(0).unwrap();
        assert_eq!(buf.read_u16().unwrap(), 0x1337);
        assert_eq!(buf.read_u32().unwrap(), 0xdead_beef);
    }

    #[test]
    fn question_name_lowercased_and_split() {
        let mut buf = VectorPacketBuffer::new();
        buf.write_u8(3).unwrap();
        buf.buf.extend_from_slice(b"WWW");
        buf.write_u8(4).unwrap();
        buf.buf.extend_from_slice(b"Coin");
        buf.write_u8(0).unwrap();
        buf.seek(0).unwrap();
        let name = buf.read_question_name().unwrap();
        assert_eq!(std::str::from_utf8(&name.key).unwrap(), "www.coin");
        assert_eq!(name.label_starts, vec![0, 4]);
    }

    #[test]
    fn compressed_label_in_question_rejected() {
        let mut buf = VectorPacketBuffer::new();
        buf.write_u8(0xc0).unwrap();
        buf.write_u8(0x0c).unwrap();
        buf.seek(0).unwrap();
        assert_eq!(buf.read_question_name().unwrap_err(), BufferError::CompressedLabel);
    }

    #[test]
    fn label_too_long_rejected_on_write() {
        let mut buf = VectorPacketBuffer::new();
        let long_label = "a".repeat(64);
        assert!(matches!(
            buf.write_label_sequence(&long_label),
            Err(BufferError::LabelTooLong(64))
        ));
    }

    #[test]
    fn name_pointer_sets_top_bits() {
        let mut buf = VectorPacketBuffer::new();
        buf.write_name_pointer(0x0c).unwrap();
        buf.seek(0).unwrap();
        assert_eq!(buf.read_u16().unwrap(), 0xc00c);
    }
}
