//! Symbolic instructions with table references and debug metadata

use {
    crate::{
        ebpf::{self, Insn},
        error::EncodeError,
    },
    serde::{Deserialize, Serialize},
    std::fmt,
};

/// A table name plus a byte offset into that table's value region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "fuzzer-not-safe-for-production", derive(arbitrary::Arbitrary))]
pub struct TableReference {
    /// Name of the referenced table
    pub table: String,
    /// Byte offset into the table's value
    #[serde(default)]
    pub offset: u32,
}

/// The constant operand of an instruction
///
/// An instruction carries either a plain immediate or a table reference,
/// never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "fuzzer-not-safe-for-production", derive(arbitrary::Arbitrary))]
pub enum Operand {
    /// Direct form, wide enough for the 64 bit immediate of `lddw`
    Imm(i64),
    /// Indirect form, resolved to a kernel handle at load time
    Table(TableReference),
}

impl Default for Operand {
    fn default() -> Self {
        Operand::Imm(0)
    }
}

/// Debug information attached to an instruction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "fuzzer-not-safe-for-production", derive(arbitrary::Arbitrary))]
pub struct Metadata {
    /// Name of the function starting at this instruction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Source correlation tag, e.g. `file.c:42`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Metadata {
    /// Returns true if neither a symbol nor a source tag is attached
    pub fn is_empty(&self) -> bool {
        self.symbol.is_none() && self.source.is_none()
    }
}

/// One symbolic bytecode operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "fuzzer-not-safe-for-production", derive(arbitrary::Arbitrary))]
pub struct Instruction {
    /// Operation code
    pub opc: u8,
    /// Destination register
    #[serde(default)]
    pub dst: u8,
    /// Source register, or the pseudo source of an `lddw`
    #[serde(default)]
    pub src: u8,
    /// Signed offset
    #[serde(default)]
    pub off: i16,
    /// Immediate or table reference
    #[serde(default)]
    pub operand: Operand,
    /// Attached debug information
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl Instruction {
    /// Creates an instruction with a plain immediate
    pub fn new(opc: u8, dst: u8, src: u8, off: i16, imm: i64) -> Self {
        Self {
            opc,
            dst,
            src,
            off,
            operand: Operand::Imm(imm),
            metadata: Metadata::default(),
        }
    }

    /// `dst = src`
    pub fn mov64_reg(dst: u8, src: u8) -> Self {
        Self::new(ebpf::MOV64_REG, dst, src, 0, 0)
    }

    /// `dst = imm` (32 bit, sign extended)
    pub fn mov64_imm(dst: u8, imm: i32) -> Self {
        Self::new(ebpf::MOV64_IMM, dst, 0, 0, imm as i64)
    }

    /// `dst = imm` (64 bit)
    pub fn load_imm64(dst: u8, imm: i64) -> Self {
        Self::new(ebpf::LD_DW_IMM, dst, 0, 0, imm)
    }

    /// `dst = &table.value[offset]`, the indirect load of a table value
    ///
    /// Until a reference is attached with [`Instruction::with_reference`] the
    /// offset is carried as the immediate.
    pub fn load_table_value(dst: u8, offset: u32) -> Self {
        Self::new(
            ebpf::LD_DW_IMM,
            dst,
            ebpf::BPF_PSEUDO_MAP_VALUE,
            0,
            offset as i64,
        )
    }

    /// `dst = table`, the kernel handle of a table
    pub fn load_table_fd(dst: u8, table: impl Into<String>) -> Self {
        Self::new(ebpf::LD_DW_IMM, dst, ebpf::BPF_PSEUDO_MAP_FD, 0, 0).with_reference(table)
    }

    /// `call imm`
    pub fn call(helper: i32) -> Self {
        Self::new(ebpf::CALL_IMM, 0, 0, 0, helper as i64)
    }

    /// `exit`
    pub fn exit() -> Self {
        Self::new(ebpf::EXIT, 0, 0, 0, 0)
    }

    /// Alias of [`Instruction::exit`]
    pub fn ret() -> Self {
        Self::exit()
    }

    /// Points the instruction at a table
    ///
    /// A plain immediate already present is taken as the byte offset into the
    /// table's value.
    pub fn with_reference(mut self, table: impl Into<String>) -> Self {
        let offset = match &self.operand {
            Operand::Imm(imm) => *imm as u32,
            Operand::Table(reference) => reference.offset,
        };
        self.operand = Operand::Table(TableReference {
            table: table.into(),
            offset,
        });
        self
    }

    /// Marks the instruction as the start of function `symbol`
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.metadata.symbol = Some(symbol.into());
        self
    }

    /// Attaches a source correlation tag
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.source = Some(source.into());
        self
    }

    /// Name of the function starting here, if any
    pub fn symbol(&self) -> Option<&str> {
        self.metadata.symbol.as_deref()
    }

    /// Source correlation tag, if any
    pub fn source(&self) -> Option<&str> {
        self.metadata.source.as_deref()
    }

    /// The referenced table, if this is an indirect instruction
    pub fn reference(&self) -> Option<&TableReference> {
        match &self.operand {
            Operand::Table(reference) => Some(reference),
            Operand::Imm(_) => None,
        }
    }

    /// The plain immediate, if this is a direct instruction
    pub fn constant(&self) -> Option<i64> {
        match self.operand {
            Operand::Imm(imm) => Some(imm),
            Operand::Table(_) => None,
        }
    }

    /// Returns true for `lddw`, which spans two slots
    pub fn is_dword_load(&self) -> bool {
        self.opc == ebpf::LD_DW_IMM
    }

    /// Returns true for an indirect load of a value out of a table
    pub fn is_load_from_table_value(&self) -> bool {
        self.is_dword_load() && self.src == ebpf::BPF_PSEUDO_MAP_VALUE
    }

    /// Number of raw slots the instruction occupies
    pub fn slots(&self) -> usize {
        if self.is_dword_load() {
            2
        } else {
            1
        }
    }

    /// Lowers the instruction into raw slots
    ///
    /// `resolve` maps a table name to the kernel handle written into the
    /// first slot's immediate.
    pub fn encode<F>(&self, resolve: &mut F, out: &mut Vec<Insn>) -> Result<(), EncodeError>
    where
        F: FnMut(&str) -> Option<u32>,
    {
        if let Some(register) = [self.dst, self.src]
            .into_iter()
            .find(|register| *register > ebpf::MAX_REGISTER_FIELD)
        {
            return Err(EncodeError::RegisterOutOfRange {
                opc: self.opc,
                register,
            });
        }
        let (low, high) = match &self.operand {
            Operand::Imm(imm) => (*imm as i32, (*imm as u64 >> 32) as i32),
            Operand::Table(reference) => {
                if !self.is_dword_load() {
                    return Err(EncodeError::ReferenceOnNonLoad {
                        opc: self.opc,
                        table: reference.table.clone(),
                    });
                }
                let handle = resolve(&reference.table)
                    .ok_or_else(|| EncodeError::UnresolvedTable(reference.table.clone()))?;
                (handle as i32, reference.offset as i32)
            }
        };
        out.push(Insn {
            opc: self.opc,
            dst: self.dst,
            src: self.src,
            off: self.off,
            imm: low,
        });
        if self.is_dword_load() {
            out.push(Insn {
                imm: high,
                ..Insn::default()
            });
        } else if self.constant().is_some_and(|imm| imm != low as i64) {
            return Err(EncodeError::ImmediateOutOfRange {
                opc: self.opc,
                imm: self.constant().unwrap_or_default(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.opc, &self.operand) {
            (ebpf::MOV64_REG, _) => write!(f, "mov64 r{}, r{}", self.dst, self.src),
            (ebpf::MOV64_IMM, Operand::Imm(imm)) => write!(f, "mov64 r{}, {:#x}", self.dst, imm),
            (ebpf::EXIT, _) => write!(f, "exit"),
            (ebpf::CALL_IMM, Operand::Imm(imm)) => write!(f, "call {}", imm),
            (ebpf::LD_DW_IMM, Operand::Imm(imm)) => write!(f, "lddw r{}, {:#x}", self.dst, imm),
            (ebpf::LD_DW_IMM, Operand::Table(reference)) if self.is_load_from_table_value() => {
                write!(
                    f,
                    "lddw r{}, map_value({}) + {}",
                    self.dst, reference.table, reference.offset
                )
            }
            (ebpf::LD_DW_IMM, Operand::Table(reference)) => {
                write!(f, "lddw r{}, map({})", self.dst, reference.table)
            }
            (opc, Operand::Imm(imm)) => write!(
                f,
                "op {:#04x} r{}, r{}, {:+}, {:#x}",
                opc, self.dst, self.src, self.off, imm
            ),
            (opc, Operand::Table(reference)) => write!(
                f,
                "op {:#04x} r{}, r{}, {:+}, {}+{}",
                opc, self.dst, self.src, self.off, reference.table, reference.offset
            ),
        }
    }
}

/// Lowers a whole instruction sequence into raw slots
pub fn encode_all<F>(instructions: &[Instruction], mut resolve: F) -> Result<Vec<Insn>, EncodeError>
where
    F: FnMut(&str) -> Option<u32>,
{
    let slots = instructions.iter().map(Instruction::slots).sum();
    let mut out = Vec::with_capacity(slots);
    for insn in instructions {
        insn.encode(&mut resolve, &mut out)?;
    }
    Ok(out)
}
