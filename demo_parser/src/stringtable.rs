use std::collections::BTreeMap;
use std::io::Cursor;

use ahash::AHashMap as HashMap;
use demo_bitreader::BitReader;
use prost::Message;
use tracing::debug;

use crate::commands::DemoProtocol;
use crate::error::{ParseError, Result};

pub const ST_NAME_INSTANCE_BASELINE: &str = "instancebaseline";
pub const ST_NAME_USER_INFO: &str = "userinfo";
pub const ST_NAME_MODEL_PRECACHE: &str = "modelprecache";

// Prefix compression runs over a ring of the last 32 inserted keys.
const KEY_HISTORY_SIZE: usize = 32;
const KEY_HISTORY_BITS: usize = 5;

const S1_USER_DATA_SIZE_BITS: usize = 14;
const S2_USER_DATA_SIZE_BITS: usize = 17;

// Table flag: non-fixed user data entries carry a compression bit.
const TABLE_FLAG_DATA_COMPRESSED: i32 = 1;

#[derive(Clone, PartialEq, Message)]
pub struct CsvcMsgCreateStringTable {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(int32, optional, tag = "2")]
    pub max_entries: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub num_entries: Option<i32>,
    #[prost(bool, optional, tag = "4")]
    pub user_data_fixed_size: Option<bool>,
    #[prost(int32, optional, tag = "5")]
    pub user_data_size: Option<i32>,
    #[prost(int32, optional, tag = "6")]
    pub user_data_size_bits: Option<i32>,
    #[prost(int32, optional, tag = "7")]
    pub flags: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "8")]
    pub string_data: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CsvcMsgCreateStringTableS2 {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(int32, optional, tag = "2")]
    pub num_entries: Option<i32>,
    #[prost(bool, optional, tag = "3")]
    pub user_data_fixed_size: Option<bool>,
    #[prost(int32, optional, tag = "4")]
    pub user_data_size: Option<i32>,
    #[prost(int32, optional, tag = "5")]
    pub user_data_size_bits: Option<i32>,
    #[prost(int32, optional, tag = "6")]
    pub flags: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub string_data: Option<Vec<u8>>,
    #[prost(bool, optional, tag = "8")]
    pub uses_varint_bitcounts: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CsvcMsgUpdateStringTable {
    #[prost(int32, optional, tag = "1")]
    pub table_id: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub num_changed_entries: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub string_data: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CDemoStringTables {
    #[prost(message, repeated, tag = "1")]
    pub tables: Vec<StringTableT>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StringTableT {
    #[prost(string, optional, tag = "1")]
    pub table_name: Option<String>,
    #[prost(message, repeated, tag = "2")]
    pub items: Vec<StringTableItemT>,
    #[prost(message, repeated, tag = "3")]
    pub items_clientside: Vec<StringTableItemT>,
    #[prost(int32, optional, tag = "4")]
    pub table_flags: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StringTableItemT {
    #[prost(string, optional, tag = "1")]
    pub str: Option<String>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub data: Option<Vec<u8>>,
}

/// Creation parameters, normalized over both protocol variants.
#[derive(Debug, Clone)]
pub struct StringTableParams {
    pub name: String,
    pub max_entries: i32,
    pub num_entries: i32,
    pub user_data_fixed_size: bool,
    pub user_data_size_bits: i32,
    pub flags: i32,
    pub uses_varint_bitcounts: bool,
    pub string_data: Vec<u8>,
}

impl From<CsvcMsgCreateStringTable> for StringTableParams {
    fn from(msg: CsvcMsgCreateStringTable) -> Self {
        Self {
            name: msg.name().to_string(),
            max_entries: msg.max_entries(),
            num_entries: msg.num_entries(),
            user_data_fixed_size: msg.user_data_fixed_size(),
            user_data_size_bits: msg.user_data_size_bits(),
            flags: msg.flags(),
            uses_varint_bitcounts: false,
            string_data: msg.string_data.unwrap_or_default(),
        }
    }
}

impl From<CsvcMsgCreateStringTableS2> for StringTableParams {
    fn from(msg: CsvcMsgCreateStringTableS2) -> Self {
        Self {
            name: msg.name().to_string(),
            max_entries: 0,
            num_entries: msg.num_entries(),
            user_data_fixed_size: msg.user_data_fixed_size(),
            user_data_size_bits: msg.user_data_size_bits(),
            flags: msg.flags(),
            uses_varint_bitcounts: msg.uses_varint_bitcounts(),
            string_data: msg.string_data.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StringTableEntry {
    pub key: String,
    pub user_data: Vec<u8>,
}

/// One named table with partial per-index updates.
#[derive(Debug, Clone)]
pub struct StringTable {
    pub name: String,
    pub max_entries: i32,
    pub user_data_fixed_size: bool,
    pub user_data_size_bits: i32,
    pub flags: i32,
    pub uses_varint_bitcounts: bool,
    entries: BTreeMap<i32, StringTableEntry>,
}

impl StringTable {
    pub fn entry(&self, index: i32) -> Option<&StringTableEntry> {
        self.entries.get(&index)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&i32, &StringTableEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An entry that changed in the table named `table`.
#[derive(Debug, Clone)]
pub struct StringTableUpdate {
    pub table: String,
    pub index: i32,
    pub key: String,
    pub user_data: Vec<u8>,
}

type TableChangeHandler = Box<dyn FnMut(&StringTableUpdate) + Send>;

/// Tracks the demo's named tables, updated in-band.
#[derive(Default)]
pub struct StringTableRegistry {
    tables: Vec<StringTable>,
    by_name: HashMap<String, usize>,
    observers: HashMap<String, Vec<TableChangeHandler>>,
}

impl StringTableRegistry {
    pub fn by_name(&self, name: &str) -> Option<&StringTable> {
        self.by_name.get(name).map(|i| &self.tables[*i])
    }

    /// Registers a callback invoked for every changed entry of `table`.
    pub fn on_table_change(
        &mut self,
        table: &str,
        handler: impl FnMut(&StringTableUpdate) + Send + 'static,
    ) {
        self.observers
            .entry(table.to_string())
            .or_default()
            .push(Box::new(handler));
    }

    fn notify(&mut self, updates: &[StringTableUpdate]) {
        for update in updates {
            if let Some(handlers) = self.observers.get_mut(&update.table) {
                for handler in handlers.iter_mut() {
                    handler(update);
                }
            }
        }
    }

    pub fn by_id(&self, id: i32) -> Option<&StringTable> {
        self.tables.get(id as usize)
    }

    pub fn tables(&self) -> impl Iterator<Item = &StringTable> {
        self.tables.iter()
    }

    pub fn on_create(
        &mut self,
        params: StringTableParams,
        protocol: DemoProtocol,
    ) -> Result<Vec<StringTableUpdate>> {
        let mut table = StringTable {
            name: params.name.to_owned(),
            max_entries: params.max_entries,
            user_data_fixed_size: params.user_data_fixed_size,
            user_data_size_bits: params.user_data_size_bits,
            flags: params.flags,
            uses_varint_bitcounts: params.uses_varint_bitcounts,
            entries: BTreeMap::new(),
        };

        let updates = parse_entries(
            &mut table,
            &params.string_data,
            params.num_entries,
            protocol,
        )?;

        debug!(table = %table.name, entries = table.len(), "created string table");
        self.by_name
            .insert(table.name.to_owned(), self.tables.len());
        self.tables.push(table);
        self.notify(&updates);
        Ok(updates)
    }

    pub fn on_update(
        &mut self,
        msg: &CsvcMsgUpdateStringTable,
        protocol: DemoProtocol,
    ) -> Result<Vec<StringTableUpdate>> {
        let table = self
            .tables
            .get_mut(msg.table_id() as usize)
            .ok_or_else(|| {
                ParseError::SchemaMismatch(format!("update for unknown table {}", msg.table_id()))
            })?;
        let updates = parse_entries(
            table,
            msg.string_data(),
            msg.num_changed_entries(),
            protocol,
        )?;
        self.notify(&updates);
        Ok(updates)
    }

    /// Full snapshot from a `StringTables` or `FullPacket` frame: replaces
    /// matching tables wholesale.
    pub fn on_snapshot(&mut self, msg: &CDemoStringTables) -> Result<Vec<StringTableUpdate>> {
        let mut updates = Vec::new();
        for table_msg in msg.tables.iter() {
            let name = table_msg.table_name().to_string();
            let idx = match self.by_name.get(&name) {
                Some(idx) => *idx,
                None => {
                    self.by_name.insert(name.to_owned(), self.tables.len());
                    self.tables.push(StringTable {
                        name: name.to_owned(),
                        max_entries: 0,
                        user_data_fixed_size: false,
                        user_data_size_bits: 0,
                        flags: table_msg.table_flags(),
                        uses_varint_bitcounts: false,
                        entries: BTreeMap::new(),
                    });
                    self.tables.len() - 1
                }
            };

            let table = &mut self.tables[idx];
            table.entries.clear();
            for (i, item) in table_msg.items.iter().enumerate() {
                let entry = StringTableEntry {
                    key: item.str().to_string(),
                    user_data: item.data.to_owned().unwrap_or_default(),
                };
                updates.push(StringTableUpdate {
                    table: name.to_owned(),
                    index: i as i32,
                    key: entry.key.to_owned(),
                    user_data: entry.user_data.to_owned(),
                });
                table.entries.insert(i as i32, entry);
            }
        }
        self.notify(&updates);
        Ok(updates)
    }
}

fn entry_index_bits(max_entries: i32) -> usize {
    let mut n_tmp = max_entries;
    let mut bits = 0;
    while n_tmp != 0 {
        n_tmp >>= 1;
        bits += 1;
    }
    bits.max(1) - 1
}

fn parse_entries(
    table: &mut StringTable,
    data: &[u8],
    num_entries: i32,
    protocol: DemoProtocol,
) -> Result<Vec<StringTableUpdate>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let mut r = BitReader::new_small_bit_reader(Cursor::new(data.to_vec()))?;

    if protocol == DemoProtocol::Source1 && r.read_bit()? {
        return Err(ParseError::MalformedFrame(
            "dictionary-encoded string table".to_string(),
        ));
    }

    let index_bits = entry_index_bits(table.max_entries);
    let mut history: Vec<String> = Vec::with_capacity(KEY_HISTORY_SIZE);
    let mut updates = Vec::new();
    let mut last_entry = -1_i32;

    for _ in 0..num_entries {
        let mut index = last_entry + 1;
        if !r.read_bit()? {
            index = match protocol {
                DemoProtocol::Source1 => r.read_int(index_bits)? as i32,
                DemoProtocol::Source2 => r.read_varint32()? as i32,
            };
        }
        last_entry = index;

        if index < 0 || (table.max_entries > 0 && index >= table.max_entries) {
            return Err(ParseError::MalformedFrame(format!(
                "string table index {index} out of bounds (max {})",
                table.max_entries
            )));
        }

        let mut key = String::new();
        if r.read_bit()? {
            if r.read_bit()? {
                // Prefix-compressed against the history ring.
                let hist_index = r.read_int(KEY_HISTORY_BITS)?;
                let prefix_len = r.read_int(KEY_HISTORY_BITS)?;
                let prefix = history.get(hist_index).ok_or_else(|| {
                    ParseError::MalformedFrame(format!(
                        "string table history index {hist_index} out of range"
                    ))
                })?;
                key.push_str(&prefix[..prefix_len.min(prefix.len())]);
                key.push_str(&r.read_string()?);
            } else {
                key = r.read_string()?;
            }
        } else if let Some(existing) = table.entries.get(&index) {
            key = existing.key.to_owned();
        }

        if history.len() >= KEY_HISTORY_SIZE {
            history.remove(0);
        }
        history.push(key.to_owned());

        let mut user_data = Vec::new();
        if r.read_bit()? {
            if table.user_data_fixed_size {
                user_data = read_bits_to_bytes(&mut r, table.user_data_size_bits as usize)?;
            } else {
                let (size, compressed) = match protocol {
                    DemoProtocol::Source1 => (r.read_int(S1_USER_DATA_SIZE_BITS)?, false),
                    DemoProtocol::Source2 => {
                        let compressed = if table.flags & TABLE_FLAG_DATA_COMPRESSED != 0 {
                            r.read_bit()?
                        } else {
                            false
                        };
                        let size = if table.uses_varint_bitcounts {
                            r.read_ubitint()?
                        } else {
                            r.read_int(S2_USER_DATA_SIZE_BITS)?
                        };
                        (size, compressed)
                    }
                };
                user_data = r.read_bytes(size)?;
                if compressed {
                    user_data = snap::raw::Decoder::new().decompress_vec(&user_data)?;
                }
            }
        } else if let Some(existing) = table.entries.get(&index) {
            user_data = existing.user_data.to_owned();
        }

        let entry = StringTableEntry {
            key: key.to_owned(),
            user_data: user_data.to_owned(),
        };
        table.entries.insert(index, entry);
        updates.push(StringTableUpdate {
            table: table.name.to_owned(),
            index,
            key,
            user_data,
        });
    }

    Ok(updates)
}

fn read_bits_to_bytes<T: std::io::Read + std::io::Seek + Send>(
    r: &mut BitReader<T>,
    bits: usize,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity((bits + 7) >> 3);
    let mut remaining = bits;
    while remaining >= 8 {
        out.push(r.read_int(8)? as u8);
        remaining -= 8;
    }
    if remaining > 0 {
        out.push(r.read_int(remaining)? as u8);
    }
    Ok(out)
}
