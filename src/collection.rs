//! Collections of programs and tables, before and after loading

use {
    crate::{
        error::SpecError,
        kernel::{Kernel, KernelError, ProgramHandle, TableHandle},
        program::ProgramSpec,
        table::TableSpec,
    },
    serde::{Deserialize, Serialize},
    std::collections::BTreeMap,
};

/// Byte order of multi-byte values in table contents and instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endianness {
    /// Least significant byte first
    Little,
    /// Most significant byte first
    Big,
}

impl Endianness {
    /// Byte order of the host
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }
}

impl Default for Endianness {
    fn default() -> Self {
        Self::native()
    }
}

/// The unit of work: named tables and programs loaded together
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    /// Tables by name
    #[serde(default)]
    pub tables: BTreeMap<String, TableSpec>,
    /// Programs by name
    #[serde(default)]
    pub programs: BTreeMap<String, ProgramSpec>,
    /// Byte order used to interpret table contents
    #[serde(default)]
    pub byte_order: Endianness,
}

impl CollectionSpec {
    /// Creates an empty collection in host byte order
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table, keyed by its name
    pub fn with_table(mut self, table: TableSpec) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Adds a program, keyed by its name
    pub fn with_program(mut self, program: ProgramSpec) -> Self {
        self.programs.insert(program.name.clone(), program);
        self
    }

    /// Sets the byte order of table contents
    pub fn with_byte_order(mut self, byte_order: Endianness) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Parses a collection from its JSON description
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Checks that every entry is keyed by its name and every table reference
    /// names a table of this collection
    pub fn validate(&self) -> Result<(), SpecError> {
        self.validate_against(|name| self.tables.contains_key(name))
    }

    /// Checks every table reference against a caller-defined set of tables
    pub(crate) fn validate_against<F>(&self, exists: F) -> Result<(), SpecError>
    where
        F: Fn(&str) -> bool,
    {
        let tables = self
            .tables
            .iter()
            .map(|(key, table)| ("table", key, &table.name));
        let programs = self
            .programs
            .iter()
            .map(|(key, program)| ("program", key, &program.name));
        if let Some((kind, key, name)) = tables.chain(programs).find(|(_, key, name)| key != name)
        {
            return Err(SpecError::NameMismatch {
                kind,
                key: key.clone(),
                name: name.clone(),
            });
        }
        for (key, program) in &self.programs {
            for (index, table) in program.references() {
                if !exists(table) {
                    return Err(SpecError::UnknownTable {
                        program: key.clone(),
                        index,
                        table: table.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A program accepted by the verifier
#[derive(Debug, PartialEq, Eq)]
pub struct LoadedProgram {
    /// Kernel handle of the program
    pub handle: ProgramHandle,
    /// Verifier log, empty if no diagnostics were requested
    pub verifier_log: String,
    /// Number of submissions it took
    pub attempts: u32,
    /// Size of the log buffer of the successful submission
    pub log_size: u32,
}

/// The live kernel resources of a loaded collection
///
/// The caller owns every handle and releases them with
/// [`LoadedCollection::close`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LoadedCollection {
    /// Programs by name
    pub programs: BTreeMap<String, LoadedProgram>,
    /// Tables by name
    pub tables: BTreeMap<String, TableHandle>,
}

impl LoadedCollection {
    /// A loaded program by name
    pub fn program(&self, name: &str) -> Option<&LoadedProgram> {
        self.programs.get(name)
    }

    /// A table handle by name
    pub fn table(&self, name: &str) -> Option<TableHandle> {
        self.tables.get(name).copied()
    }

    /// Releases every handle, programs first
    ///
    /// All handles are released even if some fail; the first error is
    /// returned.
    pub fn close<K: Kernel + ?Sized>(self, kernel: &K) -> Result<(), KernelError> {
        let mut result = Ok(());
        for (_name, program) in self.programs {
            let closed = kernel.close_program(program.handle);
            if result.is_ok() {
                result = closed;
            }
        }
        for (_name, handle) in self.tables {
            let closed = kernel.close_table(handle);
            if result.is_ok() {
                result = closed;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{instruction::Instruction, program::ProgramType},
    };

    #[test]
    fn test_validate_unknown_table() {
        let spec = CollectionSpec::new().with_program(ProgramSpec::new(
            "prog",
            ProgramType::SocketFilter,
            "MIT",
            vec![
                Instruction::mov64_imm(0, 0),
                Instruction::load_table_fd(1, "missing"),
                Instruction::exit(),
            ],
        ));
        assert_eq!(
            spec.validate(),
            Err(SpecError::UnknownTable {
                program: "prog".to_string(),
                index: 1,
                table: "missing".to_string(),
            })
        );
    }

    #[test]
    fn test_validate_name_mismatch() {
        let mut spec = CollectionSpec::new().with_program(ProgramSpec::new(
            "inner",
            ProgramType::Xdp,
            "MIT",
            vec![Instruction::exit()],
        ));
        let program = spec.programs.remove("inner").unwrap();
        spec.programs.insert("outer".to_string(), program);
        assert_eq!(
            spec.validate(),
            Err(SpecError::NameMismatch {
                kind: "program",
                key: "outer".to_string(),
                name: "inner".to_string(),
            })
        );

        let mut spec = CollectionSpec::new();
        spec.tables.insert(
            "events".to_string(),
            TableSpec::global_data("globals", vec![0; 4]),
        );
        assert!(matches!(
            spec.validate(),
            Err(SpecError::NameMismatch { kind: "table", .. })
        ));
    }

    #[test]
    fn test_validate_known_table() {
        let spec = CollectionSpec::new()
            .with_table(TableSpec::global_data("globals", vec![0; 8]))
            .with_program(ProgramSpec::new(
                "prog",
                ProgramType::SocketFilter,
                "MIT",
                vec![
                    Instruction::load_table_value(0, 0).with_reference("globals"),
                    Instruction::exit(),
                ],
            ));
        assert_eq!(spec.validate(), Ok(()));
    }
}
