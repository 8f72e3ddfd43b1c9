//! Error definitions

use crate::kernel::KernelError;

/// A read of `width` bytes at `offset` does not fit into `len` bytes
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
#[error("read of {width} bytes at offset {offset} exceeds buffer of {len} bytes")]
pub struct OutOfBounds {
    /// Requested offset
    pub offset: usize,
    /// Requested width
    pub width: usize,
    /// Available length
    pub len: usize,
}

/// The collection specification is malformed
///
/// Detected purely from in-memory data, before any kernel call.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum SpecError {
    /// Global data must be addressable through exactly one value
    #[error("table {table}: expected exactly one key/value entry, found {found}")]
    AmbiguousContents {
        /// Table name
        table: String,
        /// Number of entries present
        found: usize,
    },
    /// An indirect load reads past the end of the value
    #[error("program {program}, instruction #{index}: table {table}: {source}")]
    OutOfBounds {
        /// Program name
        program: String,
        /// Index of the instruction
        index: usize,
        /// Table name
        table: String,
        /// Bounds that were violated
        source: OutOfBounds,
    },
    /// A table or program is filed under a key other than its name
    #[error("{kind} {name} is stored under the key {key}")]
    NameMismatch {
        /// `table` or `program`
        kind: &'static str,
        /// Key in the collection
        key: String,
        /// Name of the entry
        name: String,
    },
    /// An instruction references a table missing from the collection
    #[error("program {program}, instruction #{index}: reference to unknown table {table}")]
    UnknownTable {
        /// Program name
        program: String,
        /// Index of the instruction
        index: usize,
        /// Table name
        table: String,
    },
}

/// Lowering a symbolic instruction into raw slots failed
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum EncodeError {
    /// No kernel handle exists for the referenced table
    #[error("no handle for table {0}")]
    UnresolvedTable(String),
    /// Only `lddw` can carry a table reference
    #[error("opcode {opc:#04x} cannot reference table {table}")]
    ReferenceOnNonLoad {
        /// Operation code
        opc: u8,
        /// Table name
        table: String,
    },
    /// A register operand does not fit into its 4 bit field
    #[error("opcode {opc:#04x}: register operand {register} out of range")]
    RegisterOutOfRange {
        /// Operation code
        opc: u8,
        /// Offending `dst` or `src`
        register: u8,
    },
    /// The immediate does not fit into 32 bits
    #[error("immediate {imm:#x} of opcode {opc:#04x} does not fit into 32 bits")]
    ImmediateOutOfRange {
        /// Operation code
        opc: u8,
        /// Immediate value
        imm: i64,
    },
}

/// Identifies the kernel resource an error is about
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Resource {
    /// A table
    Table(String),
    /// A program
    Program(String),
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Table(name) => write!(f, "table {name}"),
            Resource::Program(name) => write!(f, "program {name}"),
        }
    }
}

/// Loading a collection failed
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum LoadError {
    /// The specification is malformed, no kernel resource was created
    #[error("invalid collection specification: {0}")]
    SpecInvalid(#[from] SpecError),
    /// A program could not be lowered into raw slots
    #[error("program {program}: {source}")]
    Encode {
        /// Program name
        program: String,
        /// Cause
        source: EncodeError,
    },
    /// The verifier found a program unsafe
    #[error("program {program} rejected by the verifier after {attempts} attempt(s):\n{log}")]
    Rejected {
        /// Program name
        program: String,
        /// Number of submissions
        attempts: u32,
        /// Verifier log of the last submission
        log: String,
    },
    /// The verifier log never fit into the buffer within the retry limits
    #[error(
        "program {program}: verifier log still truncated after {attempts} attempt(s) with a buffer of {log_size} bytes"
    )]
    ResourceExhausted {
        /// Program name
        program: String,
        /// Number of submissions
        attempts: u32,
        /// Size of the last buffer
        log_size: u32,
        /// Truncated verifier log of the last submission
        log: String,
    },
    /// Creating a table or program failed for reasons unrelated to verification
    #[error("{resource}: {source}")]
    KernelResource {
        /// Resource being created
        resource: Resource,
        /// Number of submissions, 0 for tables
        attempts: u32,
        /// Verifier log of the last submission before the failure
        log: String,
        /// Cause
        source: KernelError,
    },
    /// The load was cancelled at a retry boundary
    #[error("program {program}: load cancelled after {attempts} attempt(s)")]
    Cancelled {
        /// Program about to be submitted
        program: String,
        /// Number of submissions already made for it
        attempts: u32,
    },
}

impl LoadError {
    /// The verifier log attached to the error, if any
    pub fn verifier_log(&self) -> Option<&str> {
        match self {
            LoadError::Rejected { log, .. } | LoadError::ResourceExhausted { log, .. } => {
                Some(log.as_str())
            }
            LoadError::KernelResource { log, .. } if !log.is_empty() => Some(log.as_str()),
            _ => None,
        }
    }
}
