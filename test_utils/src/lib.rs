#![allow(dead_code)]

//! In-memory kernel and fixtures shared by the integration tests

use {
    bpf_collection::{
        ebpf::{self, Insn},
        instruction::Instruction,
        kernel::{
            Kernel, KernelError, ProgramHandle, ProgramLoad, ProgramLoadRequest, SubmitError,
            TableHandle,
        },
        loader::CancellationToken,
        program::{ProgramSpec, ProgramType},
        table::TableSpec,
        verifier_log::LogLevel,
        CollectionSpec,
    },
    std::{
        collections::{BTreeMap, BTreeSet},
        fmt::Write,
        sync::Mutex,
    },
};

/// Complexity limit reported in the statistics line
pub const COMPLEXITY_LIMIT: u64 = 1_000_000;

/// Error number of an unprivileged caller
pub const EPERM: i32 = 1;

/// Error number of a failed table creation
pub const ENOMEM: i32 = 12;

/// One recorded program submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Program name
    pub program: String,
    /// Requested verbosity
    pub log_level: LogLevel,
    /// Size of the log buffer
    pub log_size: u32,
    /// The submitted slots
    pub insns: Vec<Insn>,
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: u32,
    tables: BTreeMap<u32, TableSpec>,
    programs: BTreeMap<u32, String>,
    submissions: Vec<Submission>,
    closed: usize,
}

/// Kernel double with a simulated verifier
///
/// The verifier accepts every program unless told otherwise. Its log has one
/// line per slot at [`LogLevel::Instruction`] and always ends with the
/// statistics line, so the log of a program grows with its length.
#[derive(Debug, Default)]
pub struct MockKernel {
    /// Programs the verifier rejects
    pub rejected: BTreeSet<String>,
    /// Programs failing with `EPERM` from the given attempt on
    pub unprivileged: BTreeMap<String, usize>,
    /// Tables whose creation fails with `ENOMEM`
    pub failing_tables: BTreeSet<String>,
    /// Report every log as truncated, no matter the buffer size
    pub always_truncate: bool,
    /// Cancel the token after the given number of submissions
    pub cancel_after: Option<(usize, CancellationToken)>,
    state: Mutex<MockState>,
}

impl MockKernel {
    /// A kernel accepting everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects `program` during verification
    pub fn reject(mut self, program: &str) -> Self {
        self.rejected.insert(program.to_string());
        self
    }

    /// Fails `program` with `EPERM`
    pub fn deny(self, program: &str) -> Self {
        self.deny_from(program, 1)
    }

    /// Fails `program` with `EPERM` from its `attempt`-th submission on
    pub fn deny_from(mut self, program: &str, attempt: usize) -> Self {
        self.unprivileged.insert(program.to_string(), attempt);
        self
    }

    /// Fails the creation of `table` with `ENOMEM`
    pub fn fail_table(mut self, table: &str) -> Self {
        self.failing_tables.insert(table.to_string());
        self
    }

    /// Reports every log as truncated
    pub fn truncate_always(mut self) -> Self {
        self.always_truncate = true;
        self
    }

    /// Cancels `token` once `submissions` programs were submitted
    pub fn cancel_after(mut self, submissions: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((submissions, token));
        self
    }

    /// Every submission so far, in order
    pub fn submissions(&self) -> Vec<Submission> {
        self.lock().submissions.clone()
    }

    /// Log buffer sizes of the submissions of `program`
    pub fn log_sizes(&self, program: &str) -> Vec<u32> {
        self.lock()
            .submissions
            .iter()
            .filter(|submission| submission.program == program)
            .map(|submission| submission.log_size)
            .collect()
    }

    /// Specs of the tables which are currently open
    pub fn live_tables(&self) -> Vec<TableSpec> {
        self.lock().tables.values().cloned().collect()
    }

    /// Names of the programs which are currently open
    pub fn live_programs(&self) -> Vec<String> {
        self.lock().programs.values().cloned().collect()
    }

    /// Number of open handles
    pub fn live_handles(&self) -> usize {
        let state = self.lock();
        state.tables.len() + state.programs.len()
    }

    /// Number of handles released so far
    pub fn closed_handles(&self) -> usize {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

fn allocate(state: &mut MockState) -> u32 {
    // File descriptors 0 to 2 are taken by stdio.
    state.next_handle = state.next_handle.max(2) + 1;
    state.next_handle
}

/// The log the simulated verifier writes for `insns`
pub fn simulated_log(insns: &[Insn], log_level: LogLevel, rejected: bool) -> String {
    let mut log = String::new();
    if log_level == LogLevel::Off {
        return log;
    }
    if log_level == LogLevel::Instruction || rejected {
        for (pc, insn) in insns.iter().enumerate() {
            let _ = writeln!(
                log,
                "{}: ({:02x}) r{} src={} off={} imm={:#x}",
                pc, insn.opc, insn.dst, insn.src, insn.off, insn.imm
            );
        }
    }
    if rejected {
        log.push_str("R0 !read_ok\n");
    }
    let _ = writeln!(
        log,
        "processed {} insns (limit {}) max_states_per_insn 0 total_states 0 peak_states 0 mark_read 0",
        insns.len(),
        COMPLEXITY_LIMIT
    );
    log
}

impl Kernel for MockKernel {
    fn create_table(&self, spec: &TableSpec) -> Result<TableHandle, KernelError> {
        if self.failing_tables.contains(&spec.name) {
            return Err(KernelError::new("BPF_MAP_CREATE", ENOMEM));
        }
        let mut state = self.lock();
        let handle = allocate(&mut state);
        state.tables.insert(handle, spec.clone());
        Ok(TableHandle(handle))
    }

    fn load_program(&self, request: &ProgramLoadRequest<'_>) -> Result<ProgramLoad, SubmitError> {
        let mut state = self.lock();
        state.submissions.push(Submission {
            program: request.name.to_string(),
            log_level: request.log_level,
            log_size: request.log_size,
            insns: request.insns.to_vec(),
        });
        if let Some((after, token)) = &self.cancel_after {
            if state.submissions.len() >= *after {
                token.cancel();
            }
        }
        let attempt = state
            .submissions
            .iter()
            .filter(|submission| submission.program == request.name)
            .count();
        if let Some(from) = self.unprivileged.get(request.name) {
            if attempt >= *from {
                return Err(SubmitError::Os(KernelError::new("BPF_PROG_LOAD", EPERM)));
            }
        }

        let rejected = self.rejected.contains(request.name);
        let log_level = if request.log_size == 0 {
            LogLevel::Off
        } else {
            request.log_level
        };
        let log = simulated_log(request.insns, log_level, rejected);
        let capacity = request.log_size as usize;
        // The kernel reserves one byte of the buffer for the terminator.
        if capacity > 0 && (self.always_truncate || log.len() >= capacity) {
            let written = log.len().min(capacity.saturating_sub(1));
            return Err(SubmitError::BufferTooSmall {
                log: log[..written].to_string(),
            });
        }
        if rejected {
            return Err(SubmitError::Rejected { log });
        }
        let handle = allocate(&mut state);
        state.programs.insert(handle, request.name.to_string());
        Ok(ProgramLoad {
            handle: ProgramHandle(handle),
            log,
        })
    }

    fn close_table(&self, handle: TableHandle) -> Result<(), KernelError> {
        let mut state = self.lock();
        state
            .tables
            .remove(&handle.0)
            .ok_or(KernelError::new("close", 9))?;
        state.closed += 1;
        Ok(())
    }

    fn close_program(&self, handle: ProgramHandle) -> Result<(), KernelError> {
        let mut state = self.lock();
        state
            .programs
            .remove(&handle.0)
            .ok_or(KernelError::new("close", 9))?;
        state.closed += 1;
        Ok(())
    }
}

/// A socket filter returning 0, padded to `len` instructions
pub fn filter_program(name: &str, len: usize) -> ProgramSpec {
    let mut instructions = vec![Instruction::mov64_imm(0, 0); len.saturating_sub(1)];
    instructions.push(Instruction::exit());
    ProgramSpec::new(name, ProgramType::SocketFilter, "MIT", instructions)
}

/// A program reading the global-data constants at `offsets` into `r1`
pub fn global_data_reader(name: &str, table: &str, offsets: &[u32]) -> ProgramSpec {
    let mut instructions: Vec<Instruction> = offsets
        .iter()
        .map(|offset| Instruction::load_table_value(1, *offset).with_reference(table))
        .collect();
    instructions.push(Instruction::mov64_imm(0, 0));
    instructions.push(Instruction::exit());
    ProgramSpec::new(name, ProgramType::SocketFilter, "MIT", instructions)
}

/// A collection holding a single program
pub fn single_program(program: ProgramSpec) -> CollectionSpec {
    CollectionSpec::new().with_program(program)
}

/// Slots of `insns` which are the first half of an `lddw`
pub fn dword_loads(insns: &[Insn]) -> Vec<&Insn> {
    insns
        .iter()
        .filter(|insn| insn.opc == ebpf::LD_DW_IMM)
        .collect()
}

#[macro_export]
macro_rules! assert_error {
    ($result:expr, $($error:expr),+) => {
        assert!(format!("{:?}", $result).contains(&format!($($error),+)));
    }
}
