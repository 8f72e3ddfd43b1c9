//! Loading of collections with verifier log negotiation
//!
//! The size of the verifier log is not known before a program is verified.
//! The loader starts with the configured buffer size and, whenever the kernel
//! reports that the log did not fit, resubmits the same program with a larger
//! buffer. Only that condition is retried; a rejected program fails the load.

use {
    crate::{
        collection::{CollectionSpec, Endianness, LoadedCollection, LoadedProgram},
        ebpf::Insn,
        error::{LoadError, Resource},
        inline::{inline_global_data, GLOBAL_DATA_TABLE},
        instruction::encode_all,
        kernel::{Kernel, ProgramLoad, ProgramLoadRequest, SubmitError, TableHandle},
        program::ProgramSpec,
        verifier_log::{LogLevel, DEFAULT_LOG_SIZE, MAX_LOG_SIZE, MIN_LOG_SIZE},
    },
    serde::{Deserialize, Serialize},
    std::{
        collections::BTreeMap,
        mem,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
};

/// Default number of submissions per program
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Whether the global-data table is created after its contents were inlined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalDataPolicy {
    /// Create the table like any other
    #[default]
    Create,
    /// Skip the table; fails if an instruction still references it
    Omit,
}

/// Loader configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    /// Verbosity of the verifier
    pub log_level: LogLevel,
    /// Initial log buffer size in bytes, 0 requests no log at all
    pub log_size: u32,
    /// Upper bound for the log buffer
    pub max_log_size: u32,
    /// Upper bound for submissions of a single program
    pub max_attempts: u32,
    /// Name of the table whose contents are inlined
    pub global_data_table: String,
    /// What happens to the global-data table after inlining
    pub global_data: GlobalDataPolicy,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Off,
            log_size: DEFAULT_LOG_SIZE,
            max_log_size: MAX_LOG_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            global_data_table: GLOBAL_DATA_TABLE.to_string(),
            global_data: GlobalDataPolicy::Create,
        }
    }
}

impl LoadOptions {
    /// Parses options from JSON, missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Log level and buffer size of the first submission
    pub fn initial_log(&self) -> (LogLevel, u32) {
        if self.log_level == LogLevel::Off || self.log_size == 0 {
            return (LogLevel::Off, 0);
        }
        let max = self.max_log_size.max(MIN_LOG_SIZE);
        (self.log_level, self.log_size.clamp(MIN_LOG_SIZE, max))
    }

    /// Buffer size of the submission after `log_size` turned out too small
    ///
    /// Returns `None` once the buffer cannot grow any further.
    pub fn next_log_size(&self, log_size: u32) -> Option<u32> {
        let max = self.max_log_size.max(MIN_LOG_SIZE);
        if log_size >= max {
            return None;
        }
        Some(log_size.saturating_mul(2).clamp(MIN_LOG_SIZE, max))
    }
}

/// Shared flag which stops a load at the next retry boundary
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Creates a token which is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every load observing this token
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true once [`CancellationToken::cancel`] was called
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// State of a single program submission
#[derive(Debug)]
enum Submission {
    /// About to be submitted for the `attempt`-th time, `log` is the
    /// truncated log of the previous attempt
    Pending {
        attempt: u32,
        log_size: u32,
        log: String,
    },
    /// Accepted by the verifier
    Succeeded {
        attempts: u32,
        log_size: u32,
        load: ProgramLoad,
    },
    /// The log was truncated, retry with a bigger buffer
    BufferRetry {
        attempts: u32,
        log_size: u32,
        log: String,
    },
    /// Failed for good
    Failed(LoadError),
}

/// Handles created by a load, released on drop unless handed to the caller
struct Resources<'k, K: Kernel> {
    kernel: &'k K,
    tables: BTreeMap<String, TableHandle>,
    programs: BTreeMap<String, LoadedProgram>,
}

impl<'k, K: Kernel> Resources<'k, K> {
    fn new(kernel: &'k K) -> Self {
        Self {
            kernel,
            tables: BTreeMap::new(),
            programs: BTreeMap::new(),
        }
    }

    fn into_loaded(mut self) -> LoadedCollection {
        LoadedCollection {
            programs: mem::take(&mut self.programs),
            tables: mem::take(&mut self.tables),
        }
    }
}

impl<K: Kernel> Drop for Resources<'_, K> {
    fn drop(&mut self) {
        for (name, program) in mem::take(&mut self.programs) {
            if let Err(err) = self.kernel.close_program(program.handle) {
                log::warn!("failed to release program {}: {}", name, err);
            }
        }
        for (name, handle) in mem::take(&mut self.tables) {
            if let Err(err) = self.kernel.close_table(handle) {
                log::warn!("failed to release table {}: {}", name, err);
            }
        }
    }
}

/// Loads collections through a [`Kernel`]
#[derive(Debug)]
pub struct CollectionLoader<K: Kernel> {
    kernel: K,
    options: LoadOptions,
    cancellation: CancellationToken,
}

impl<K: Kernel> CollectionLoader<K> {
    /// Creates a loader
    pub fn new(kernel: K, options: LoadOptions) -> Self {
        Self {
            kernel,
            options,
            cancellation: CancellationToken::new(),
        }
    }

    /// Makes loads observe `token`
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Inlines global data, creates all tables and verifies all programs
    ///
    /// `spec` is not modified, inlining works on a copy. On error every
    /// resource created by this call has been released.
    pub fn load(&self, spec: &CollectionSpec) -> Result<LoadedCollection, LoadError> {
        let global_data_table = self.options.global_data_table.as_str();
        let mut spec = spec.clone();
        inline_global_data(&mut spec, global_data_table)?;

        let omit_global_data = self.options.global_data == GlobalDataPolicy::Omit;
        let is_created = |name: &str| {
            !(omit_global_data && name == global_data_table) && spec.tables.contains_key(name)
        };
        spec.validate_against(&is_created)?;

        let mut resources = Resources::new(&self.kernel);
        for (name, table) in &spec.tables {
            if !is_created(name) {
                log::debug!("omitting table {} after inlining", name);
                continue;
            }
            let handle =
                self.kernel
                    .create_table(table)
                    .map_err(|source| LoadError::KernelResource {
                        resource: Resource::Table(name.clone()),
                        attempts: 0,
                        log: String::new(),
                        source,
                    })?;
            log::debug!("created table {} as {}", name, handle);
            resources.tables.insert(name.clone(), handle);
        }

        for (name, program) in &spec.programs {
            let insns = encode_all(&program.instructions, |table| {
                resources.tables.get(table).map(|handle| handle.0)
            })
            .map_err(|source| LoadError::Encode {
                program: name.clone(),
                source,
            })?;
            let loaded = self.submit(name, program, &insns, spec.byte_order)?;
            resources.programs.insert(name.clone(), loaded);
        }

        let loaded = resources.into_loaded();
        log::info!(
            "loaded {} program(s) and {} table(s)",
            loaded.programs.len(),
            loaded.tables.len()
        );
        Ok(loaded)
    }

    /// Submits one program until it is accepted, rejected or the limits are hit
    fn submit(
        &self,
        name: &str,
        program: &ProgramSpec,
        insns: &[Insn],
        byte_order: Endianness,
    ) -> Result<LoadedProgram, LoadError> {
        let (log_level, log_size) = self.options.initial_log();
        let mut state = Submission::Pending {
            attempt: 1,
            log_size,
            log: String::new(),
        };
        loop {
            state = match state {
                Submission::Pending {
                    attempt,
                    log_size,
                    log,
                } => {
                    if self.cancellation.is_cancelled() {
                        Submission::Failed(LoadError::Cancelled {
                            program: name.to_string(),
                            attempts: attempt.saturating_sub(1),
                        })
                    } else {
                        log::debug!(
                            "submitting program {} ({} slots, attempt {}, log buffer {} bytes)",
                            name,
                            program.slot_count(),
                            attempt,
                            log_size
                        );
                        let request = ProgramLoadRequest {
                            name,
                            program_type: program.program_type.prog_type(),
                            license: &program.license,
                            insns,
                            byte_order,
                            log_level,
                            log_size,
                        };
                        let result = self.kernel.load_program(&request);
                        self.classify(name, attempt, log_size, log, result)
                    }
                }
                Submission::BufferRetry {
                    attempts,
                    log_size,
                    log,
                } => {
                    let next = if attempts < self.options.max_attempts {
                        self.options.next_log_size(log_size)
                    } else {
                        None
                    };
                    match next {
                        Some(next) => {
                            log::warn!(
                                "verifier log of program {} exceeds {} bytes, retrying with {} bytes",
                                name,
                                log_size,
                                next
                            );
                            Submission::Pending {
                                attempt: attempts.saturating_add(1),
                                log_size: next,
                                log,
                            }
                        }
                        None => Submission::Failed(LoadError::ResourceExhausted {
                            program: name.to_string(),
                            attempts,
                            log_size,
                            log,
                        }),
                    }
                }
                Submission::Succeeded {
                    attempts,
                    log_size,
                    load,
                } => {
                    return Ok(LoadedProgram {
                        handle: load.handle,
                        verifier_log: load.log,
                        attempts,
                        log_size,
                    })
                }
                Submission::Failed(err) => return Err(err),
            };
        }
    }

    fn classify(
        &self,
        name: &str,
        attempt: u32,
        log_size: u32,
        previous_log: String,
        result: Result<ProgramLoad, SubmitError>,
    ) -> Submission {
        match result {
            Ok(load) => Submission::Succeeded {
                attempts: attempt,
                log_size,
                load,
            },
            Err(SubmitError::BufferTooSmall { log }) => Submission::BufferRetry {
                attempts: attempt,
                log_size,
                log,
            },
            Err(SubmitError::Rejected { log }) => Submission::Failed(LoadError::Rejected {
                program: name.to_string(),
                attempts: attempt,
                log,
            }),
            Err(SubmitError::Os(source)) => Submission::Failed(LoadError::KernelResource {
                resource: Resource::Program(name.to_string()),
                attempts: attempt,
                log: previous_log,
                source,
            }),
        }
    }
}

/// Loads `spec` through `kernel` with `options`
pub fn load_collection<K: Kernel>(
    kernel: K,
    spec: &CollectionSpec,
    options: LoadOptions,
) -> Result<LoadedCollection, LoadError> {
    CollectionLoader::new(kernel, options).load(spec)
}
