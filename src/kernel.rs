//! Interface to the kernel's table and program facilities
//!
//! The loader only talks to the kernel through [`Kernel`]. Implementations
//! classify every failed program submission into a [`SubmitError`], so the
//! retry policy never has to look at raw error numbers or log text.

use {
    crate::{collection::Endianness, ebpf::Insn, table::TableSpec, verifier_log::LogLevel},
    std::fmt,
};

/// Kernel handle of a table, a file descriptor on Linux
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableHandle(pub u32);

/// Kernel handle of a verified program, a file descriptor on Linux
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProgramHandle(pub u32);

impl fmt::Display for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table#{}", self.0)
    }
}

impl fmt::Display for ProgramHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "program#{}", self.0)
    }
}

/// An OS level failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed: {}", os_message(.errno))]
pub struct KernelError {
    /// The failed operation, e.g. `BPF_MAP_CREATE`
    pub operation: &'static str,
    /// Raw error number
    pub errno: i32,
}

fn os_message(errno: &i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(*errno)
}

impl KernelError {
    /// Creates an error for `operation`
    pub fn new(operation: &'static str, errno: i32) -> Self {
        Self { operation, errno }
    }
}

/// Everything the verifier needs for one submission
#[derive(Debug, Clone, Copy)]
pub struct ProgramLoadRequest<'a> {
    /// Program name
    pub name: &'a str,
    /// `bpf_prog_type`
    pub program_type: u32,
    /// License string
    pub license: &'a str,
    /// Raw slots, with table handles already resolved
    pub insns: &'a [Insn],
    /// Byte order to serialize `insns` in
    pub byte_order: Endianness,
    /// Requested verbosity
    pub log_level: LogLevel,
    /// Size of the log buffer in bytes, 0 for none
    pub log_size: u32,
}

/// A program accepted by the verifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramLoad {
    /// Kernel handle of the program
    pub handle: ProgramHandle,
    /// Text the verifier wrote into the log buffer
    pub log: String,
}

/// Classification of a failed submission
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The log did not fit into the buffer; `log` holds what was written
    #[error("verifier log buffer too small")]
    BufferTooSmall {
        /// Truncated log
        log: String,
    },
    /// The verifier found the program unsafe
    #[error("program rejected by the verifier")]
    Rejected {
        /// Log explaining the rejection
        log: String,
    },
    /// Any other failure, e.g. missing privileges or resource limits
    #[error(transparent)]
    Os(#[from] KernelError),
}

/// Table and program operations of the kernel
pub trait Kernel {
    /// Creates a table and writes its initial contents
    fn create_table(&self, spec: &TableSpec) -> Result<TableHandle, KernelError>;

    /// Submits a program to the verifier
    fn load_program(&self, request: &ProgramLoadRequest<'_>) -> Result<ProgramLoad, SubmitError>;

    /// Releases a table handle
    fn close_table(&self, handle: TableHandle) -> Result<(), KernelError>;

    /// Releases a program handle
    fn close_program(&self, handle: ProgramHandle) -> Result<(), KernelError>;
}

impl<K: Kernel + ?Sized> Kernel for &K {
    fn create_table(&self, spec: &TableSpec) -> Result<TableHandle, KernelError> {
        (**self).create_table(spec)
    }

    fn load_program(&self, request: &ProgramLoadRequest<'_>) -> Result<ProgramLoad, SubmitError> {
        (**self).load_program(request)
    }

    fn close_table(&self, handle: TableHandle) -> Result<(), KernelError> {
        (**self).close_table(handle)
    }

    fn close_program(&self, handle: ProgramHandle) -> Result<(), KernelError> {
        (**self).close_program(handle)
    }
}
