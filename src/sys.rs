//! [`Kernel`] implementation on top of the Linux `bpf(2)` system call

use {
    crate::{
        ebpf,
        kernel::{
            Kernel, KernelError, ProgramHandle, ProgramLoad, ProgramLoadRequest, SubmitError,
            TableHandle,
        },
        table::TableSpec,
    },
    std::{ffi::CString, mem},
};

const BPF_MAP_CREATE: libc::c_long = 0;
const BPF_MAP_UPDATE_ELEM: libc::c_long = 2;
const BPF_PROG_LOAD: libc::c_long = 5;

/// Length of the name field of maps and programs, including the terminator
const BPF_OBJ_NAME_LEN: usize = 16;

/// `BPF_ANY`: create a new element or update an existing one
const BPF_ANY: u64 = 0;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct MapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    inner_map_fd: u32,
    numa_node: u32,
    map_name: [u8; BPF_OBJ_NAME_LEN],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct ProgLoadAttr {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
    prog_flags: u32,
    prog_name: [u8; BPF_OBJ_NAME_LEN],
}

/// Object names are truncated and restricted to the characters the kernel
/// accepts.
fn object_name(name: &str) -> [u8; BPF_OBJ_NAME_LEN] {
    let mut buffer = [0u8; BPF_OBJ_NAME_LEN];
    let accepted = name
        .bytes()
        .filter(|byte| byte.is_ascii_alphanumeric() || *byte == b'_' || *byte == b'.')
        .take(BPF_OBJ_NAME_LEN - 1);
    for (slot, byte) in buffer.iter_mut().zip(accepted) {
        *slot = byte;
    }
    buffer
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL)
}

/// Issues one `bpf(2)` command, returning the new file descriptor
///
/// # Safety
///
/// Every pointer stored inside `attr` must be valid for the duration of the
/// call, and the buffers they point to must have the sizes recorded in
/// `attr`.
unsafe fn bpf<T>(cmd: libc::c_long, attr: &mut T) -> Result<u32, i32> {
    let ret = libc::syscall(
        libc::SYS_bpf,
        cmd,
        attr as *mut T as *mut libc::c_void,
        mem::size_of::<T>() as libc::c_uint,
    );
    if ret < 0 {
        Err(errno())
    } else {
        Ok(ret as u32)
    }
}

/// Talks to the running kernel, requires `CAP_BPF` or root
#[derive(Debug, Default, Clone, Copy)]
pub struct BpfSyscall;

impl BpfSyscall {
    /// Creates the backend
    pub fn new() -> Self {
        Self
    }

    fn update_element(&self, fd: u32, key: &[u8], value: &[u8]) -> Result<(), KernelError> {
        let mut attr = MapElemAttr {
            map_fd: fd,
            key: key.as_ptr() as u64,
            value: value.as_ptr() as u64,
            flags: BPF_ANY,
            ..MapElemAttr::default()
        };
        // `key` and `value` outlive the call.
        unsafe { bpf(BPF_MAP_UPDATE_ELEM, &mut attr) }
            .map(|_| ())
            .map_err(|errno| KernelError::new("BPF_MAP_UPDATE_ELEM", errno))
    }
}

impl Kernel for BpfSyscall {
    fn create_table(&self, spec: &TableSpec) -> Result<TableHandle, KernelError> {
        let mut attr = MapCreateAttr {
            map_type: spec.kind.map_type(),
            key_size: spec.key_size,
            value_size: spec.value_size,
            max_entries: spec.max_entries,
            map_flags: spec.flags,
            map_name: object_name(&spec.name),
            ..MapCreateAttr::default()
        };
        let fd = unsafe { bpf(BPF_MAP_CREATE, &mut attr) }
            .map_err(|errno| KernelError::new("BPF_MAP_CREATE", errno))?;
        let populated = spec.contents.iter().try_for_each(|entry| {
            if entry.key.len() != spec.key_size as usize
                || entry.value.len() != spec.value_size as usize
            {
                return Err(KernelError::new("BPF_MAP_UPDATE_ELEM", libc::EINVAL));
            }
            self.update_element(fd, &entry.key, &entry.value)
        });
        populated.map_err(|err| abandon_table(fd, &spec.name, err))?;
        Ok(TableHandle(fd))
    }

    fn load_program(&self, request: &ProgramLoadRequest<'_>) -> Result<ProgramLoad, SubmitError> {
        let bytes = ebpf::to_bytes(request.insns, request.byte_order);
        let license = CString::new(request.license)
            .map_err(|_| KernelError::new("BPF_PROG_LOAD", libc::EINVAL))?;
        let mut log = vec![0u8; request.log_size as usize];
        let mut attr = ProgLoadAttr {
            prog_type: request.program_type,
            insn_cnt: (bytes.len() / ebpf::INSN_SIZE) as u32,
            insns: bytes.as_ptr() as u64,
            license: license.as_ptr() as u64,
            prog_name: object_name(request.name),
            ..ProgLoadAttr::default()
        };
        if !log.is_empty() {
            attr.log_level = request.log_level.as_raw();
            attr.log_size = request.log_size;
            attr.log_buf = log.as_mut_ptr() as u64;
        }
        // `bytes`, `license` and `log` outlive the call.
        let result = unsafe { bpf(BPF_PROG_LOAD, &mut attr) };
        let log = log_text(&log);
        match result {
            Ok(fd) => Ok(ProgramLoad {
                handle: ProgramHandle(fd),
                log,
            }),
            Err(libc::ENOSPC) if attr.log_size > 0 => Err(SubmitError::BufferTooSmall { log }),
            Err(libc::EACCES) | Err(libc::EINVAL) => Err(SubmitError::Rejected { log }),
            Err(errno) => Err(SubmitError::Os(KernelError::new("BPF_PROG_LOAD", errno))),
        }
    }

    fn close_table(&self, handle: TableHandle) -> Result<(), KernelError> {
        close(handle.0)
    }

    fn close_program(&self, handle: ProgramHandle) -> Result<(), KernelError> {
        close(handle.0)
    }
}

fn close(fd: u32) -> Result<(), KernelError> {
    if unsafe { libc::close(fd as libc::c_int) } < 0 {
        return Err(KernelError::new("close", errno()));
    }
    Ok(())
}

/// Closes a table which could not be populated, keeping `err` as the cause
fn abandon_table(fd: u32, name: &str, err: KernelError) -> KernelError {
    if let Err(close_err) = close(fd) {
        log::warn!("failed to release table {}: {}", name, close_err);
    }
    err
}

/// The log up to the first NUL the kernel wrote
fn log_text(buffer: &[u8]) -> String {
    let end = buffer
        .iter()
        .position(|byte| *byte == 0)
        .unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..end]).into_owned()
}
