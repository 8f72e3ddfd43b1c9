//! Loader for eBPF collections
//!
//! A [`CollectionSpec`](collection::CollectionSpec) describes tables and
//! programs declaratively. [`CollectionLoader`](loader::CollectionLoader)
//! turns it into live kernel resources:
//!
//! 1. Read-only global data is inlined into the bytecode, see [`inline`].
//! 2. Every table is created and filled with its initial contents.
//! 3. Every program is submitted to the verifier. When the verifier log does
//!    not fit into the buffer, the submission is retried with a bigger one.
//!
//! All kernel access goes through the [`Kernel`](kernel::Kernel) trait, the
//! Linux implementation lives in `sys`.
#![warn(missing_docs)]

pub mod collection;
pub mod ebpf;
pub mod error;
pub mod inline;
pub mod instruction;
pub mod kernel;
pub mod loader;
pub mod program;
#[cfg(all(feature = "sys", target_os = "linux"))]
pub mod sys;
pub mod table;
pub mod verifier_log;

pub use {
    collection::{CollectionSpec, Endianness, LoadedCollection, LoadedProgram},
    error::{LoadError, SpecError},
    loader::{load_collection, CollectionLoader, LoadOptions},
};
