//! Declarative programs

use {
    crate::instruction::Instruction,
    serde::{Deserialize, Serialize},
};

/// Defines the kind of hook a program is verified for
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramType {
    /// `BPF_PROG_TYPE_SOCKET_FILTER`
    SocketFilter,
    /// `BPF_PROG_TYPE_KPROBE`
    Kprobe,
    /// `BPF_PROG_TYPE_SCHED_CLS`
    SchedCls,
    /// `BPF_PROG_TYPE_SCHED_ACT`
    SchedAct,
    /// `BPF_PROG_TYPE_TRACEPOINT`
    TracePoint,
    /// `BPF_PROG_TYPE_XDP`
    Xdp,
    /// `BPF_PROG_TYPE_CGROUP_SKB`
    CGroupSkb,
    /// `BPF_PROG_TYPE_CGROUP_SOCK_ADDR`
    CGroupSockAddr,
    /// `BPF_PROG_TYPE_SK_LOOKUP`
    SkLookup,
}

impl ProgramType {
    /// The `bpf_prog_type` value passed to the kernel
    pub fn prog_type(self) -> u32 {
        match self {
            ProgramType::SocketFilter => 1,
            ProgramType::Kprobe => 2,
            ProgramType::SchedCls => 3,
            ProgramType::SchedAct => 4,
            ProgramType::TracePoint => 5,
            ProgramType::Xdp => 6,
            ProgramType::CGroupSkb => 8,
            ProgramType::CGroupSockAddr => 18,
            ProgramType::SkLookup => 30,
        }
    }
}

/// A named instruction sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramSpec {
    /// Name, truncated by the kernel to 15 bytes
    pub name: String,
    /// Hook the program is verified for
    pub program_type: ProgramType,
    /// License string, `GPL` compatible licenses unlock more helpers
    pub license: String,
    /// The bytecode
    pub instructions: Vec<Instruction>,
}

impl ProgramSpec {
    /// Creates a program
    pub fn new(
        name: impl Into<String>,
        program_type: ProgramType,
        license: impl Into<String>,
        instructions: Vec<Instruction>,
    ) -> Self {
        Self {
            name: name.into(),
            program_type,
            license: license.into(),
            instructions,
        }
    }

    /// Total number of raw slots
    pub fn slot_count(&self) -> usize {
        self.instructions.iter().map(Instruction::slots).sum()
    }

    /// Every table reference as (instruction index, table name), with duplicates
    pub fn references(&self) -> impl Iterator<Item = (usize, &str)> + '_ {
        self.instructions
            .iter()
            .enumerate()
            .filter_map(|(index, insn)| {
                insn.reference()
                    .map(|reference| (index, reference.table.as_str()))
            })
    }
}
