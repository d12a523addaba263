//! Build-once, read-only lookup tables: the double-hashed open-addressed
//! table used for both the allowed-TLD suffix list and local name
//! overrides, using the exact hash/probe recurrence of the original
//! implementation (`emcdns.cpp`'s `Ent::RSH`/`GetHash` and probe loop).

use derive_more::{Display, Error, From};

use crate::config::{AllowedTld, TldKind};

pub const TABLE_SIZE: usize = 256;
/// Tags a stored slot index as an ENUM-TLD entry rather than a plain DNS
/// suffix, mirroring the original's high bit on the signed offset.
pub const ENUM_FLAG: i16 = 1 << 14;

#[derive(Debug, Display, From, Error, PartialEq, Eq)]
pub enum TablesError {
    #[display(fmt = "hash table is full, could not insert {:?}", _0)]
    TableFull(#[error(not(source))] String),
    #[display(fmt = "duplicate entry for key {:?}", _0)]
    Duplicate(#[error(not(source))] String),
}

pub type Result<T> = std::result::Result<T, TablesError>;

/// `pos = rotl8(pos, 1) + c; step = (step * 31) xor c`, folded over the
/// key from its last byte to its first. Suffix matching relies on this
/// walking right-to-left: two keys sharing a suffix produce related,
/// not identical, hash states at the point the shared suffix begins,
/// which is exactly what lets the caller probe progressively shorter
/// candidate suffixes independently.
fn hash_step(key: &[u8]) -> (u8, u8) {
    let mut pos: u8 = 0;
    let mut step: u8 = 1;
    for &c in key.iter().rev() {
        pos = pos.rotate_left(1).wrapping_add(c);
        step = step.wrapping_mul(31) ^ c;
        if step == 0 {
            step = 1;
        }
    }
    (pos, step)
}

/// A generic double-hashed open-addressing table over exact byte-string
/// keys. Suffix matching (trying `.com`, `.example.com`, ...) is the
/// caller's job: it tries exact lookups for each candidate suffix.
#[derive(Debug)]
pub struct HashTable<V> {
    slots: [i16; TABLE_SIZE],
    arena: Vec<(Vec<u8>, V)>,
}

impl<V> HashTable<V> {
    pub fn new() -> Self {
        HashTable {
            slots: [0; TABLE_SIZE],
            arena: Vec::new(),
        }
    }

    pub fn insert(&mut self, key: &[u8], value: V, flag: i16) -> Result<()> {
        if self.get(key).is_some() {
            return Err(TablesError::Duplicate(String::from_utf8_lossy(key).into_owned()));
        }
        let (mut pos, step) = hash_step(key);
        for _ in 0..TABLE_SIZE {
            if self.slots[pos as usize] == 0 {
                self.arena.push((key.to_vec(), value));
                let idx = self.arena.len() as i16; // 1-based, 0 means empty
                self.slots[pos as usize] = idx | flag;
                return Ok(());
            }
            pos = pos.wrapping_add(step);
        }
        Err(TablesError::TableFull(String::from_utf8_lossy(key).into_owned()))
    }

    pub fn get(&self, key: &[u8]) -> Option<(&V, bool)> {
        let (mut pos, step) = hash_step(key);
        for _ in 0..TABLE_SIZE {
            let slot = self.slots[pos as usize];
            if slot == 0 {
                return None;
            }
            let is_enum = slot & ENUM_FLAG != 0;
            let idx = (slot & !ENUM_FLAG) as usize;
            if idx != 0 {
                let (stored_key, value) = &self.arena[idx - 1];
                if stored_key.as_slice() == key {
                    return Some((value, is_enum));
                }
            }
            pos = pos.wrapping_add(step);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

impl<V> Default for HashTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// The payload stored for an allowed-TLD entry: its kind and, for ENUM
/// TLDs, the expected digit-label count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TldEntry {
    pub kind: TldKind,
    pub enum_len: u8,
}

pub fn build_tld_table(tlds: &[AllowedTld]) -> Result<HashTable<TldEntry>> {
    let mut table = HashTable::new();
    for tld in tlds {
        let flag = match tld.kind {
            TldKind::Enum => ENUM_FLAG,
            TldKind::Dns => 0,
        };
        table.insert(
            tld.suffix.as_bytes(),
            TldEntry { kind: tld.kind, enum_len: tld.enum_len },
            flag,
        )?;
    }
    Ok(table)
}

pub fn build_local_table(entries: &[(String, String)]) -> Result<HashTable<String>> {
    let mut table = HashTable::new();
    for (name, value) in entries {
        table.insert(name.as_bytes(), value.clone(), 0)?;
    }
    Ok(table)
}

/// Walks `name` from the full string down to each shorter dot-delimited
/// suffix (`www.shop.example.coin` -> `.coin`, `.example.coin`,
/// `.shop.example.coin`, ...) and returns the first one the table
/// recognizes, innermost match first — matching the original's
/// preference for the most specific registered suffix.
pub fn find_longest_suffix<'a, V>(
    table: &'a HashTable<V>,
    name: &str,
) -> Option<(&'a V, bool, &'a str)> {
    let mut best: Option<(&'a V, bool, &'a str)> = None;
    let bytes = name.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'.' {
            let suffix = &name[i..];
            if let Some((value, is_enum)) = table.get(suffix.as_bytes()) {
                if best.map_or(true, |(_, _, cur)| suffix.len() > cur.len()) {
                    best = Some((value, is_enum, suffix));
                }
            }
        }
    }
    best
}
