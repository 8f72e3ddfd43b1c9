use bpf_collection::{
    ebpf,
    error::{LoadError, Resource, SpecError},
    inline::GLOBAL_DATA_TABLE,
    instruction::Instruction,
    kernel::KernelError,
    loader::{CancellationToken, CollectionLoader, GlobalDataPolicy, LoadOptions},
    load_collection,
    program::{ProgramSpec, ProgramType},
    table::{TableKind, TableSpec},
    verifier_log::{parse_stats, LogLevel, MIN_LOG_SIZE},
    CollectionSpec,
};
use test_utils::{
    assert_error, dword_loads, filter_program, global_data_reader, simulated_log, single_program,
    MockKernel, ENOMEM, EPERM,
};

fn verbose(log_size: u32) -> LoadOptions {
    LoadOptions {
        log_level: LogLevel::Instruction,
        log_size,
        ..LoadOptions::default()
    }
}

fn register_copies(name: &str, copies: usize) -> ProgramSpec {
    let mut instructions = vec![Instruction::mov64_reg(0, 1); copies];
    instructions.push(Instruction::ret());
    ProgramSpec::new(name, ProgramType::SocketFilter, "MIT", instructions)
}

#[test]
fn test_resize_log_buffer() {
    let kernel = MockKernel::new();
    let spec = single_program(register_copies("copies", 31));
    let loaded = load_collection(&kernel, &spec, verbose(128)).unwrap();

    let program = loaded.program("copies").unwrap();
    assert!(!program.verifier_log.is_empty());
    assert!(program.verifier_log.len() > 128);
    assert!(program.attempts > 1);

    let sizes = kernel.log_sizes("copies");
    assert_eq!(sizes.len() as u32, program.attempts);
    assert_eq!(sizes[0], 128);
    for pair in sizes.windows(2) {
        assert_eq!(pair[1], pair[0] * 2);
    }
    assert_eq!(*sizes.last().unwrap(), program.log_size);
    assert!(program.log_size as usize > program.verifier_log.len());

    // Every attempt resubmits identical bytecode.
    let submissions = kernel.submissions();
    assert!(submissions
        .windows(2)
        .all(|pair| pair[0].insns == pair[1].insns && pair[0].log_level == pair[1].log_level));
}

#[test]
fn test_verifier_stats_in_log() {
    let kernel = MockKernel::new();
    let spec = single_program(register_copies("copies", 31));
    let loaded = load_collection(&kernel, &spec, verbose(1 << 16)).unwrap();
    let program = loaded.program("copies").unwrap();
    assert_eq!(program.attempts, 1);

    let stats = parse_stats(&program.verifier_log).unwrap();
    assert_eq!(stats.processed, 32);
    assert_eq!(stats.limit, test_utils::COMPLEXITY_LIMIT);
    assert_eq!(stats.counter("peak_states"), Some(0));
}

#[test]
fn test_no_log_requested() {
    let kernel = MockKernel::new();
    let spec = single_program(register_copies("copies", 31));
    let loaded = load_collection(&kernel, &spec, LoadOptions::default()).unwrap();
    let program = loaded.program("copies").unwrap();
    assert_eq!(program.verifier_log, "");
    assert_eq!(program.attempts, 1);
    assert_eq!(program.log_size, 0);

    let submissions = kernel.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].log_level, LogLevel::Off);
    assert_eq!(submissions[0].log_size, 0);

    // A level without a buffer is no diagnostics either.
    let kernel = MockKernel::new();
    load_collection(&kernel, &spec, verbose(0)).unwrap();
    assert_eq!(kernel.submissions()[0].log_level, LogLevel::Off);
}

#[test]
fn test_small_log_size_is_raised_to_minimum() {
    let kernel = MockKernel::new();
    let spec = single_program(filter_program("tiny", 1));
    let options = LoadOptions {
        log_level: LogLevel::Stats,
        ..verbose(16)
    };
    let loaded = load_collection(&kernel, &spec, options).unwrap();
    assert_eq!(kernel.log_sizes("tiny"), vec![MIN_LOG_SIZE]);
    assert_eq!(loaded.program("tiny").unwrap().log_size, MIN_LOG_SIZE);
}

#[test]
fn test_retry_stops_at_max_attempts() {
    let kernel = MockKernel::new().truncate_always();
    let spec = single_program(filter_program("noisy", 4));
    let options = LoadOptions {
        max_attempts: 3,
        ..verbose(128)
    };
    let err = load_collection(&kernel, &spec, options).unwrap_err();
    match err {
        LoadError::ResourceExhausted {
            program,
            attempts,
            log_size,
            log,
        } => {
            assert_eq!(program, "noisy");
            assert_eq!(attempts, 3);
            assert_eq!(log_size, 512);
            assert!(!log.is_empty());
        }
        err => panic!("unexpected error {:?}", err),
    }
    assert_eq!(kernel.log_sizes("noisy"), vec![128, 256, 512]);
    assert_eq!(kernel.live_handles(), 0);
}

#[test]
fn test_retry_stops_at_max_log_size() {
    let kernel = MockKernel::new().truncate_always();
    let spec = single_program(filter_program("noisy", 4));
    let options = LoadOptions {
        max_log_size: 300,
        max_attempts: 100,
        ..verbose(128)
    };
    let err = load_collection(&kernel, &spec, options).unwrap_err();
    assert!(matches!(
        err,
        LoadError::ResourceExhausted {
            attempts: 3,
            log_size: 300,
            ..
        }
    ));
    assert_eq!(kernel.log_sizes("noisy"), vec![128, 256, 300]);
}

#[test]
fn test_single_attempt_is_not_retried() {
    let kernel = MockKernel::new().truncate_always();
    let spec = single_program(filter_program("noisy", 4));
    for max_attempts in [0, 1] {
        let options = LoadOptions {
            max_attempts,
            ..verbose(128)
        };
        let err = load_collection(&kernel, &spec, options).unwrap_err();
        assert!(matches!(
            err,
            LoadError::ResourceExhausted { attempts: 1, .. }
        ));
    }
    assert_eq!(kernel.log_sizes("noisy"), vec![128, 128]);
}

#[test]
fn test_rejected_program_releases_collection() {
    let kernel = MockKernel::new().reject("b_bad");
    let spec = CollectionSpec::new()
        .with_table(TableSpec::new("events", TableKind::Hash, 4, 8, 16))
        .with_program(filter_program("a_good", 2))
        .with_program(filter_program("b_bad", 2))
        .with_program(filter_program("c_never", 2));
    let err = load_collection(&kernel, &spec, verbose(1 << 12)).unwrap_err();
    match &err {
        LoadError::Rejected {
            program,
            attempts,
            log,
        } => {
            assert_eq!(program, "b_bad");
            assert_eq!(*attempts, 1);
            assert!(log.contains("R0 !read_ok"));
        }
        err => panic!("unexpected error {:?}", err),
    }
    let expected = simulated_log(&kernel.submissions()[1].insns, LogLevel::Instruction, true);
    assert_eq!(err.verifier_log(), Some(expected.as_str()));
    assert!(kernel.log_sizes("c_never").is_empty());
    assert_eq!(kernel.live_handles(), 0);
    assert_eq!(kernel.closed_handles(), 2);
}

#[test]
fn test_rejection_log_is_complete() {
    let kernel = MockKernel::new().reject("bad");
    let spec = single_program(filter_program("bad", 16));
    let err = load_collection(&kernel, &spec, verbose(128)).unwrap_err();
    let log = err.verifier_log().unwrap();
    assert!(log.trim_end().ends_with("mark_read 0"));
    assert!(matches!(err, LoadError::Rejected { attempts, .. } if attempts > 1));
}

#[test]
fn test_rejection_without_log() {
    let kernel = MockKernel::new().reject("bad");
    let spec = single_program(filter_program("bad", 2));
    let err = load_collection(&kernel, &spec, LoadOptions::default()).unwrap_err();
    assert_eq!(
        err,
        LoadError::Rejected {
            program: "bad".to_string(),
            attempts: 1,
            log: String::new(),
        }
    );
}

#[test]
fn test_os_failure_is_not_retried() {
    let kernel = MockKernel::new().deny("denied");
    let spec = single_program(filter_program("denied", 2));
    let err = load_collection(&kernel, &spec, verbose(128)).unwrap_err();
    assert_eq!(
        err,
        LoadError::KernelResource {
            resource: Resource::Program("denied".to_string()),
            attempts: 1,
            log: String::new(),
            source: KernelError::new("BPF_PROG_LOAD", EPERM),
        }
    );
    assert_eq!(err.verifier_log(), None);
    assert_eq!(kernel.submissions().len(), 1);
}

#[test]
fn test_os_failure_after_buffer_retries() {
    let kernel = MockKernel::new().deny_from("denied", 3);
    let spec = single_program(filter_program("denied", 32));
    let err = load_collection(&kernel, &spec, verbose(128)).unwrap_err();
    match &err {
        LoadError::KernelResource {
            resource,
            attempts,
            log,
            source,
        } => {
            assert_eq!(resource, &Resource::Program("denied".to_string()));
            assert_eq!(*attempts, 3);
            assert_eq!(log.len(), 255);
            assert_eq!(source, &KernelError::new("BPF_PROG_LOAD", EPERM));
        }
        err => panic!("unexpected error {:?}", err),
    }
    assert_eq!(err.verifier_log().map(str::len), Some(255));
    assert_eq!(kernel.log_sizes("denied"), vec![128, 256, 512]);
    assert_eq!(kernel.live_handles(), 0);
}

#[test]
fn test_table_failure_releases_earlier_tables() {
    let kernel = MockKernel::new().fail_table("b_table");
    let spec = CollectionSpec::new()
        .with_table(TableSpec::new("a_table", TableKind::Array, 4, 4, 1))
        .with_table(TableSpec::new("b_table", TableKind::Hash, 4, 4, 1))
        .with_program(filter_program("prog", 2));
    let err = load_collection(&kernel, &spec, LoadOptions::default()).unwrap_err();
    assert_eq!(
        err,
        LoadError::KernelResource {
            resource: Resource::Table("b_table".to_string()),
            attempts: 0,
            log: String::new(),
            source: KernelError::new("BPF_MAP_CREATE", ENOMEM),
        }
    );
    assert_error!(err, "b_table");
    assert!(kernel.submissions().is_empty());
    assert_eq!(kernel.live_handles(), 0);
    assert_eq!(kernel.closed_handles(), 1);
}

#[test]
fn test_cancel_between_attempts() {
    let token = CancellationToken::new();
    let kernel = MockKernel::new().cancel_after(1, token.clone());
    let spec = CollectionSpec::new()
        .with_table(TableSpec::new("events", TableKind::Hash, 4, 8, 16))
        .with_program(filter_program("long", 32));
    let loader = CollectionLoader::new(&kernel, verbose(128)).with_cancellation(token);
    let err = loader.load(&spec).unwrap_err();
    assert_eq!(
        err,
        LoadError::Cancelled {
            program: "long".to_string(),
            attempts: 1,
        }
    );
    assert_eq!(kernel.submissions().len(), 1);
    assert_eq!(kernel.live_handles(), 0);
}

#[test]
fn test_cancel_before_next_program() {
    let token = CancellationToken::new();
    let kernel = MockKernel::new().cancel_after(1, token.clone());
    let spec = CollectionSpec::new()
        .with_program(filter_program("first", 2))
        .with_program(filter_program("second", 2));
    let loader =
        CollectionLoader::new(&kernel, LoadOptions::default()).with_cancellation(token.clone());
    let err = loader.load(&spec).unwrap_err();
    assert_eq!(
        err,
        LoadError::Cancelled {
            program: "second".to_string(),
            attempts: 0,
        }
    );
    assert!(token.is_cancelled());
    assert_eq!(kernel.live_handles(), 0);
    assert_eq!(kernel.closed_handles(), 1);
}

#[test]
fn test_cancelled_before_load() {
    let token = CancellationToken::new();
    token.cancel();
    let kernel = MockKernel::new();
    let loader = CollectionLoader::new(&kernel, LoadOptions::default()).with_cancellation(token);
    let err = loader.load(&single_program(filter_program("prog", 2))).unwrap_err();
    assert!(matches!(err, LoadError::Cancelled { attempts: 0, .. }));
    assert!(kernel.submissions().is_empty());
}

#[test]
fn test_out_of_bounds_fails_before_kernel() {
    let kernel = MockKernel::new();
    let spec = CollectionSpec::new()
        .with_table(TableSpec::global_data(GLOBAL_DATA_TABLE, vec![0; 8]))
        .with_table(TableSpec::new("events", TableKind::Hash, 4, 8, 16))
        .with_program(global_data_reader("reader", GLOBAL_DATA_TABLE, &[0, 6]));
    let err = load_collection(&kernel, &spec, LoadOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        LoadError::SpecInvalid(SpecError::OutOfBounds { index: 1, .. })
    ));
    assert!(kernel.live_tables().is_empty());
    assert!(kernel.submissions().is_empty());
}

#[test]
fn test_missing_table_fails_before_kernel() {
    let kernel = MockKernel::new();
    let spec = CollectionSpec::new()
        .with_table(TableSpec::new("events", TableKind::Hash, 4, 8, 16))
        .with_program(ProgramSpec::new(
            "prog",
            ProgramType::Kprobe,
            "GPL",
            vec![
                Instruction::load_table_fd(1, "missing"),
                Instruction::mov64_imm(0, 0),
                Instruction::exit(),
            ],
        ));
    let err = load_collection(&kernel, &spec, LoadOptions::default()).unwrap_err();
    assert_eq!(
        err,
        LoadError::SpecInvalid(SpecError::UnknownTable {
            program: "prog".to_string(),
            index: 0,
            table: "missing".to_string(),
        })
    );
    assert!(kernel.live_tables().is_empty());
    assert_eq!(kernel.closed_handles(), 0);
}

#[test]
fn test_ambiguous_global_data_fails_before_kernel() {
    let kernel = MockKernel::new();
    let mut table = TableSpec::global_data(GLOBAL_DATA_TABLE, vec![0; 4]);
    table.contents.push(table.contents[0].clone());
    let spec = CollectionSpec::new()
        .with_table(table)
        .with_program(filter_program("prog", 2));
    let err = load_collection(&kernel, &spec, LoadOptions::default()).unwrap_err();
    assert_eq!(
        err,
        LoadError::SpecInvalid(SpecError::AmbiguousContents {
            table: GLOBAL_DATA_TABLE.to_string(),
            found: 2,
        })
    );
    assert!(kernel.live_tables().is_empty());
    assert!(kernel.submissions().is_empty());
}

#[test]
fn test_program_key_differs_from_name() {
    let kernel = MockKernel::new();
    let spec = CollectionSpec::from_json(
        r#"{
            "programs": {
                "outer": {
                    "name": "inner",
                    "program_type": "xdp",
                    "license": "MIT",
                    "instructions": [{ "opc": 183 }, { "opc": 149 }]
                }
            }
        }"#,
    )
    .unwrap();
    let err = load_collection(&kernel, &spec, LoadOptions::default()).unwrap_err();
    assert_eq!(
        err,
        LoadError::SpecInvalid(SpecError::NameMismatch {
            kind: "program",
            key: "outer".to_string(),
            name: "inner".to_string(),
        })
    );
    assert!(kernel.submissions().is_empty());
}

#[test]
fn test_table_handles_are_resolved() {
    let kernel = MockKernel::new();
    let spec = CollectionSpec::new()
        .with_table(TableSpec::new("events", TableKind::PerfEventArray, 4, 4, 64))
        .with_program(ProgramSpec::new(
            "prog",
            ProgramType::TracePoint,
            "GPL",
            vec![
                Instruction::load_table_fd(1, "events"),
                Instruction::load_table_value(2, 4).with_reference("events"),
                Instruction::mov64_imm(0, 0),
                Instruction::exit(),
            ],
        ));
    let loaded = load_collection(&kernel, &spec, LoadOptions::default()).unwrap();
    let handle = loaded.table("events").unwrap();

    let submission = &kernel.submissions()[0];
    assert_eq!(submission.insns.len(), 6);
    let loads = dword_loads(&submission.insns);
    assert_eq!(loads.len(), 2);
    assert_eq!(loads[0].src, ebpf::BPF_PSEUDO_MAP_FD);
    assert_eq!(loads[0].imm as u32, handle.0);
    assert_eq!(loads[1].src, ebpf::BPF_PSEUDO_MAP_VALUE);
    assert_eq!(loads[1].imm as u32, handle.0);
    assert_eq!(submission.insns[3].imm, 4);
}

#[test]
fn test_global_data_is_inlined_and_created() {
    let kernel = MockKernel::new();
    let spec = CollectionSpec::new()
        .with_table(TableSpec::global_data(
            GLOBAL_DATA_TABLE,
            vec![0x2a, 0, 0, 0, 7, 0, 0, 0],
        ))
        .with_program(global_data_reader("reader", GLOBAL_DATA_TABLE, &[0, 4]))
        .with_byte_order(bpf_collection::Endianness::Little);
    let loaded = load_collection(&kernel, &spec, LoadOptions::default()).unwrap();
    assert!(loaded.table(GLOBAL_DATA_TABLE).is_some());
    assert_eq!(kernel.live_tables().len(), 1);

    let insns = &kernel.submissions()[0].insns;
    let loads = dword_loads(insns);
    assert_eq!(loads.len(), 2);
    assert!(loads.iter().all(|insn| insn.src == 0));
    assert_eq!(insns[0].imm, 0x2a);
    assert_eq!(insns[2].imm, 7);
}

#[test]
fn test_global_data_omitted() {
    let kernel = MockKernel::new();
    let spec = CollectionSpec::new()
        .with_table(TableSpec::global_data(GLOBAL_DATA_TABLE, vec![1, 0, 0, 0]))
        .with_program(global_data_reader("reader", GLOBAL_DATA_TABLE, &[0]));
    let options = LoadOptions {
        global_data: GlobalDataPolicy::Omit,
        ..LoadOptions::default()
    };
    let loaded = load_collection(&kernel, &spec, options).unwrap();
    assert!(loaded.table(GLOBAL_DATA_TABLE).is_none());
    assert!(kernel.live_tables().is_empty());
    assert!(loaded.program("reader").is_some());
}

#[test]
fn test_omitted_global_data_still_referenced() {
    let kernel = MockKernel::new();
    let mut reader = global_data_reader("reader", GLOBAL_DATA_TABLE, &[0]);
    reader
        .instructions
        .insert(0, Instruction::load_table_fd(2, GLOBAL_DATA_TABLE));
    let spec = CollectionSpec::new()
        .with_table(TableSpec::global_data(GLOBAL_DATA_TABLE, vec![1, 0, 0, 0]))
        .with_program(reader);
    let options = LoadOptions {
        global_data: GlobalDataPolicy::Omit,
        ..LoadOptions::default()
    };
    let err = load_collection(&kernel, &spec, options).unwrap_err();
    assert!(matches!(
        err,
        LoadError::SpecInvalid(SpecError::UnknownTable { index: 0, .. })
    ));
    assert!(kernel.submissions().is_empty());
}

#[test]
fn test_custom_global_data_table() {
    let kernel = MockKernel::new();
    let spec = CollectionSpec::new()
        .with_table(TableSpec::global_data(".data", 5u32.to_ne_bytes().to_vec()))
        .with_program(global_data_reader("reader", ".data", &[0]));
    let options = LoadOptions {
        global_data_table: ".data".to_string(),
        global_data: GlobalDataPolicy::Omit,
        ..LoadOptions::default()
    };
    load_collection(&kernel, &spec, options).unwrap();
    assert!(kernel.live_tables().is_empty());
    assert_eq!(kernel.submissions()[0].insns[0].imm, 5);
}

#[test]
fn test_spec_can_be_reused() {
    let kernel = MockKernel::new();
    let spec = CollectionSpec::new()
        .with_table(TableSpec::global_data(GLOBAL_DATA_TABLE, vec![3, 0, 0, 0]))
        .with_program(global_data_reader("reader", GLOBAL_DATA_TABLE, &[0]));
    let pristine = spec.clone();
    let loader = CollectionLoader::new(&kernel, LoadOptions::default());
    let first = loader.load(&spec).unwrap();
    let second = loader.load(&spec).unwrap();
    assert_eq!(spec, pristine);
    assert_ne!(
        first.program("reader").unwrap().handle,
        second.program("reader").unwrap().handle
    );
    assert_eq!(kernel.submissions()[0].insns, kernel.submissions()[1].insns);
}

#[test]
fn test_close_releases_everything() {
    let kernel = MockKernel::new();
    let spec = CollectionSpec::new()
        .with_table(TableSpec::new("events", TableKind::RingBuf, 0, 0, 4096))
        .with_table(TableSpec::global_data(GLOBAL_DATA_TABLE, vec![0; 4]))
        .with_program(filter_program("a", 2))
        .with_program(global_data_reader("b", GLOBAL_DATA_TABLE, &[0]));
    let loaded = load_collection(&kernel, &spec, LoadOptions::default()).unwrap();
    assert_eq!(kernel.live_handles(), 4);
    assert_eq!(kernel.live_programs(), vec!["a".to_string(), "b".to_string()]);
    loaded.close(&kernel).unwrap();
    assert_eq!(kernel.live_handles(), 0);
    assert_eq!(kernel.closed_handles(), 4);
}

#[test]
fn test_options_from_json() {
    let options = LoadOptions::from_json(
        r#"{
            "log_level": "instruction",
            "log_size": 256,
            "max_attempts": 2
        }"#,
    )
    .unwrap();
    let kernel = MockKernel::new().truncate_always();
    let spec = single_program(filter_program("p", 2));
    let err = load_collection(&kernel, &spec, options).unwrap_err();
    assert!(matches!(
        err,
        LoadError::ResourceExhausted {
            attempts: 2,
            log_size: 512,
            ..
        }
    ));
    assert_eq!(kernel.log_sizes("p"), vec![256, 512]);
}
