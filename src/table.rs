//! Declarative key/value tables (BPF maps)

use serde::{Deserialize, Serialize};

/// Kernel map types supported by the loader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    /// `BPF_MAP_TYPE_HASH`
    Hash,
    /// `BPF_MAP_TYPE_ARRAY`
    Array,
    /// `BPF_MAP_TYPE_PROG_ARRAY`
    ProgArray,
    /// `BPF_MAP_TYPE_PERF_EVENT_ARRAY`
    PerfEventArray,
    /// `BPF_MAP_TYPE_PERCPU_HASH`
    PerCpuHash,
    /// `BPF_MAP_TYPE_PERCPU_ARRAY`
    PerCpuArray,
    /// `BPF_MAP_TYPE_LRU_HASH`
    LruHash,
    /// `BPF_MAP_TYPE_LPM_TRIE`
    LpmTrie,
    /// `BPF_MAP_TYPE_RINGBUF`
    RingBuf,
}

impl TableKind {
    /// The `bpf_map_type` value passed to the kernel
    pub fn map_type(self) -> u32 {
        match self {
            TableKind::Hash => 1,
            TableKind::Array => 2,
            TableKind::ProgArray => 3,
            TableKind::PerfEventArray => 4,
            TableKind::PerCpuHash => 5,
            TableKind::PerCpuArray => 6,
            TableKind::LruHash => 9,
            TableKind::LpmTrie => 11,
            TableKind::RingBuf => 27,
        }
    }
}

/// One initial key/value pair of a table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    /// Raw key bytes
    #[serde(default)]
    pub key: Vec<u8>,
    /// Raw value bytes
    pub value: Vec<u8>,
}

/// A named key/value resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Name, also the key other instructions reference it by
    pub name: String,
    /// Map type
    pub kind: TableKind,
    /// Size of a key in bytes
    pub key_size: u32,
    /// Size of a value in bytes
    pub value_size: u32,
    /// Capacity
    pub max_entries: u32,
    /// `BPF_F_*` creation flags
    #[serde(default)]
    pub flags: u32,
    /// Initial contents, written in order after creation
    #[serde(default)]
    pub contents: Vec<TableEntry>,
}

impl TableSpec {
    /// Creates an empty table without initial contents
    pub fn new(
        name: impl Into<String>,
        kind: TableKind,
        key_size: u32,
        value_size: u32,
        max_entries: u32,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            key_size,
            value_size,
            max_entries,
            flags: 0,
            contents: Vec::new(),
        }
    }

    /// A single-entry array holding `value`, the layout used for global data
    pub fn global_data(name: impl Into<String>, value: Vec<u8>) -> Self {
        let mut table = Self::new(name, TableKind::Array, 4, value.len() as u32, 1);
        table.contents.push(TableEntry {
            key: 0u32.to_ne_bytes().to_vec(),
            value,
        });
        table
    }

    /// The value blob of a table with exactly one entry
    pub fn single_value(&self) -> Option<&[u8]> {
        match self.contents.as_slice() {
            [entry] => Some(entry.value.as_slice()),
            _ => None,
        }
    }
}
