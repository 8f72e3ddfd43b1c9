//! Inlining of global data into the bytecode
//!
//! Compilers emit read-only global variables as indirect loads from a single
//! array table. Once the table contents are known these loads can be replaced
//! by immediates, which lets the verifier track the values as constants and
//! prune branches depending on them.

use {
    crate::{
        collection::{CollectionSpec, Endianness},
        error::{OutOfBounds, SpecError},
        instruction::{Instruction, Operand},
    },
    byteorder::{BigEndian, ByteOrder, LittleEndian},
    std::ops::Range,
};

/// Well-known name of the global-data table
pub const GLOBAL_DATA_TABLE: &str = ".rodata.config";

/// Width of a constant read out of table contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantWidth {
    /// 1 byte
    Byte,
    /// 2 bytes
    Half,
    /// 4 bytes
    Word,
    /// 8 bytes
    DWord,
}

impl ConstantWidth {
    /// Size in bytes
    pub const fn bytes(self) -> usize {
        match self {
            ConstantWidth::Byte => 1,
            ConstantWidth::Half => 2,
            ConstantWidth::Word => 4,
            ConstantWidth::DWord => 8,
        }
    }
}

/// Width of an inlined constant
pub const INLINE_WIDTH: ConstantWidth = ConstantWidth::Word;

/// Outcome of an inlining pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InlineSummary {
    /// Number of rewritten instructions across all programs
    pub inlined: usize,
    /// Number of programs with at least one rewritten instruction
    pub programs: usize,
}

/// Returns the byte range of a `width` byte read at `offset` of a `len` byte buffer
pub fn check_bounds(len: usize, offset: usize, width: usize) -> Result<Range<usize>, OutOfBounds> {
    let error = OutOfBounds { offset, width, len };
    let end = offset.checked_add(width).ok_or(error)?;
    if end > len {
        return Err(error);
    }
    Ok(offset..end)
}

/// Reads an unsigned value at `offset` of `value`
pub fn read_constant(
    value: &[u8],
    offset: usize,
    width: ConstantWidth,
    order: Endianness,
) -> Result<u64, OutOfBounds> {
    let range = check_bounds(value.len(), offset, width.bytes())?;
    let bytes = &value[range];
    Ok(match order {
        Endianness::Little => LittleEndian::read_uint(bytes, width.bytes()),
        Endianness::Big => BigEndian::read_uint(bytes, width.bytes()),
    })
}

/// Inlines the contents of [`GLOBAL_DATA_TABLE`] into every program of `spec`
pub fn inline(spec: &mut CollectionSpec) -> Result<InlineSummary, SpecError> {
    inline_global_data(spec, GLOBAL_DATA_TABLE)
}

/// Replaces every indirect load from `table` with a 64 bit immediate load
///
/// Does nothing if `spec` has no such table. Otherwise the table must hold
/// exactly one entry, and it stays in `spec`. Running the pass again is a
/// no-op, since no indirect loads from `table` remain.
///
/// On error `spec` is left unchanged.
pub fn inline_global_data(
    spec: &mut CollectionSpec,
    table: &str,
) -> Result<InlineSummary, SpecError> {
    let Some(global_data) = spec.tables.get(table) else {
        return Ok(InlineSummary::default());
    };
    let value = global_data
        .single_value()
        .ok_or_else(|| SpecError::AmbiguousContents {
            table: table.to_string(),
            found: global_data.contents.len(),
        })?;

    // Nothing is rewritten until every load has been checked.
    let mut replacements = Vec::new();
    for (name, program) in &spec.programs {
        for (index, insn) in program.instructions.iter().enumerate() {
            let Some(offset) = global_data_offset(insn, table) else {
                continue;
            };
            let constant = read_constant(value, offset as usize, INLINE_WIDTH, spec.byte_order)
                .map_err(|source| SpecError::OutOfBounds {
                    program: name.clone(),
                    index,
                    table: table.to_string(),
                    source,
                })?;
            replacements.push((name.clone(), index, constant));
        }
    }

    let mut summary = InlineSummary::default();
    let mut last_program: Option<&str> = None;
    for (name, index, constant) in &replacements {
        let Some(program) = spec.programs.get_mut(name) else {
            continue;
        };
        let insn = &mut program.instructions[*index];
        log::trace!(
            "{}[{}]: inlining `{}` as {:#x}",
            name,
            index,
            insn,
            constant
        );
        // The loaded register holds a 64 bit value, so the replacement has to
        // be a 64 bit immediate load as well.
        let mut replacement = Instruction::load_imm64(insn.dst, *constant as i64);
        replacement.metadata = std::mem::take(&mut insn.metadata);
        *insn = replacement;

        summary.inlined = summary.inlined.saturating_add(1);
        if last_program != Some(name.as_str()) {
            summary.programs = summary.programs.saturating_add(1);
            last_program = Some(name.as_str());
        }
    }
    if summary.inlined > 0 {
        log::debug!(
            "inlined {} load(s) from {} in {} program(s)",
            summary.inlined,
            table,
            summary.programs
        );
    }
    Ok(summary)
}

fn global_data_offset(insn: &Instruction, table: &str) -> Option<u32> {
    if !insn.is_load_from_table_value() {
        return None;
    }
    match &insn.operand {
        Operand::Table(reference) if reference.table == table => Some(reference.offset),
        _ => None,
    }
}
