//! Raw eBPF instruction slots and opcode constants

// For more information on the BPF instruction set:
// https://www.kernel.org/doc/html/latest/bpf/standardization/instruction-set.html

// msb                                                        lsb
// +------------------------+----------------+----+----+--------+
// |immediate               |offset          |src |dst |opcode  |
// +------------------------+----------------+----+----+--------+

// From least significant to most significant bit:
//   8 bit opcode
//   4 bit destination register (dst)
//   4 bit source register (src)
//   16 bit offset
//   32 bit immediate (imm)

use crate::collection::Endianness;
use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Size of an eBPF instructions, in bytes.
pub const INSN_SIZE: usize = 8;
/// Largest value of a 4 bit register field.
pub const MAX_REGISTER_FIELD: u8 = 0x0f;

// Operation classes
/// BPF operation class: load from immediate.
pub const BPF_LD: u8 = 0x00;
/// BPF operation class: jump.
pub const BPF_JMP: u8 = 0x05;
/// BPF operation class: 64 bits arithmetic operation.
pub const BPF_ALU64: u8 = 0x07;

// Size modifiers
/// BPF size modifier: double word (8 bytes).
pub const BPF_DW: u8 = 0x18;

// Mode modifiers
/// BPF mode modifier: immediate value.
pub const BPF_IMM: u8 = 0x00;

// Source modifiers
/// BPF source operand modifier: 32-bit immediate value.
pub const BPF_K: u8 = 0x00;
/// BPF source operand modifier: `src` register.
pub const BPF_X: u8 = 0x08;

// Operation codes
/// BPF ALU/ALU64 operation code: move.
pub const BPF_MOV: u8 = 0xb0;
/// BPF JMP operation code: helper function call.
pub const BPF_CALL: u8 = 0x80;
/// BPF JMP operation code: return from program.
pub const BPF_EXIT: u8 = 0x90;

/// BPF opcode: `lddw dst, imm` /// `dst = imm`, two slots
pub const LD_DW_IMM: u8 = BPF_LD | BPF_IMM | BPF_DW;
/// BPF opcode: `mov64 dst, imm` /// `dst = imm`
pub const MOV64_IMM: u8 = BPF_ALU64 | BPF_K | BPF_MOV;
/// BPF opcode: `mov64 dst, src` /// `dst = src`
pub const MOV64_REG: u8 = BPF_ALU64 | BPF_X | BPF_MOV;
/// BPF opcode: `call imm` /// helper function call
pub const CALL_IMM: u8 = BPF_JMP | BPF_CALL;
/// BPF opcode: `exit` /// `return r0`
pub const EXIT: u8 = BPF_JMP | BPF_EXIT;

/// `src` of an `lddw` whose `imm` is the file descriptor of a map.
pub const BPF_PSEUDO_MAP_FD: u8 = 1;
/// `src` of an `lddw` whose `imm` is a map file descriptor and whose second
/// slot carries an offset into the map's value.
pub const BPF_PSEUDO_MAP_VALUE: u8 = 2;

/// One raw 8-byte instruction slot, as expected by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Insn {
    /// Operation code.
    pub opc: u8,
    /// Destination register operand.
    pub dst: u8,
    /// Source register operand.
    pub src: u8,
    /// Offset operand.
    pub off: i16,
    /// Immediate value operand.
    pub imm: i32,
}

impl Insn {
    /// Turn an `Insn` back into an array of bytes in the given byte order.
    ///
    /// The register nibbles follow the layout of the kernel's `struct bpf_insn`
    /// bitfields, which put `dst` in the low nibble on little-endian hosts and
    /// in the high nibble on big-endian hosts.
    pub fn to_array(&self, order: Endianness) -> [u8; INSN_SIZE] {
        let mut insn = [0u8; INSN_SIZE];
        insn[0] = self.opc;
        match order {
            Endianness::Little => {
                insn[1] = ((self.src & 0x0f) << 4) | (self.dst & 0x0f);
                LittleEndian::write_i16(&mut insn[2..4], self.off);
                LittleEndian::write_i32(&mut insn[4..8], self.imm);
            }
            Endianness::Big => {
                insn[1] = ((self.dst & 0x0f) << 4) | (self.src & 0x0f);
                BigEndian::write_i16(&mut insn[2..4], self.off);
                BigEndian::write_i32(&mut insn[4..8], self.imm);
            }
        }
        insn
    }

    /// Decode one slot from exactly [`INSN_SIZE`] bytes.
    pub fn from_array(bytes: &[u8; INSN_SIZE], order: Endianness) -> Self {
        match order {
            Endianness::Little => Insn {
                opc: bytes[0],
                dst: bytes[1] & 0x0f,
                src: (bytes[1] & 0xf0) >> 4,
                off: LittleEndian::read_i16(&bytes[2..4]),
                imm: LittleEndian::read_i32(&bytes[4..8]),
            },
            Endianness::Big => Insn {
                opc: bytes[0],
                dst: (bytes[1] & 0xf0) >> 4,
                src: bytes[1] & 0x0f,
                off: BigEndian::read_i16(&bytes[2..4]),
                imm: BigEndian::read_i32(&bytes[4..8]),
            },
        }
    }
}

/// Serializes a sequence of slots into one contiguous buffer.
pub fn to_bytes(insns: &[Insn], order: Endianness) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(insns.len().saturating_mul(INSN_SIZE));
    for insn in insns {
        bytes.extend_from_slice(&insn.to_array(order));
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_layout() {
        let insn = Insn {
            opc: MOV64_REG,
            dst: 0,
            src: 1,
            off: -2,
            imm: 0x1234_5678,
        };
        assert_eq!(
            insn.to_array(Endianness::Little),
            [0xbf, 0x10, 0xfe, 0xff, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_big_endian_register_nibbles() {
        let insn = Insn {
            opc: LD_DW_IMM,
            dst: 3,
            src: BPF_PSEUDO_MAP_VALUE,
            off: 0,
            imm: 7,
        };
        let bytes = insn.to_array(Endianness::Big);
        assert_eq!(bytes[1], 0x32);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 7]);
        assert_eq!(Insn::from_array(&bytes, Endianness::Big), insn);
    }

    #[test]
    fn test_opcodes() {
        assert_eq!(LD_DW_IMM, 0x18);
        assert_eq!(MOV64_IMM, 0xb7);
        assert_eq!(MOV64_REG, 0xbf);
        assert_eq!(CALL_IMM, 0x85);
        assert_eq!(EXIT, 0x95);
    }

    #[test]
    fn test_register_fields_do_not_overlap() {
        let insn = Insn {
            opc: MOV64_REG,
            dst: 0x12,
            src: 0x34,
            ..Insn::default()
        };
        assert_eq!(insn.to_array(Endianness::Little)[1], 0x42);
        assert_eq!(insn.to_array(Endianness::Big)[1], 0x24);
    }
}
