//! The supervisor-call layer: SWI dispatch and the host resources it mediates.
//!
//! The 24-bit comment field of a SWI instruction selects a handler. Arguments travel in r0..r2
//! and the result returns in r0. Guest-visible failures (a file that does not open, a bad file
//! descriptor) come back as sentinel values in r0; violations of the core's own limits (I/O
//! size caps, jail escapes, unknown syscall numbers) are typed errors that stop execution.

use super::{Core, ExecutionError, ExecutionResult};
use crate::memory::{AccessType, MemoryError};
use crate::registers::Specifier;
use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;

/// The syscall numbers of the supervisor-call ABI.
pub mod numbers {
    pub const EXIT: u32 = 0x00;
    pub const WRITE_STRING: u32 = 0x02;
    pub const OPEN: u32 = 0x10;
    pub const CLOSE: u32 = 0x11;
    pub const READ: u32 = 0x12;
    pub const WRITE: u32 = 0x13;
    pub const ALLOCATE: u32 = 0x20;
    pub const FREE: u32 = 0x21;
    pub const REALLOCATE: u32 = 0x22;
    pub const GET_TIME: u32 = 0x30;
    pub const GET_RANDOM: u32 = 0x31;
    pub const GET_ARGUMENTS: u32 = 0x32;
    pub const GET_ENVIRONMENT: u32 = 0x33;
    pub const DEBUG_PRINT: u32 = 0xF0;
    pub const BREAKPOINT: u32 = 0xF1;
    pub const DUMP_REGISTERS: u32 = 0xF2;
    pub const DUMP_MEMORY: u32 = 0xF3;
    pub const ASSERT: u32 = 0xF4;
}

/// The guest-visible failure sentinel, `-1` as an unsigned word.
const FAILURE: u32 = 0xFFFF_FFFF;

/// Largest byte count a DUMP_MEMORY request will print.
const DUMP_LIMIT: u32 = 1024;

/// Host resources owned by a single core: stream endpoints, the file-descriptor table, the
/// filesystem jail, the PRNG, and the guest argument/environment blocks. Nothing here is shared
/// between instances.
pub(super) struct Supervisor {
    /// Locked so host-side I/O callbacks can interleave with guest syscalls.
    fd_table: Mutex<FdTable>,
    fs_root: Option<PathBuf>,
    stdin: Box<dyn BufRead>,
    stdout: Box<dyn Write>,
    stderr: Box<dyn Write>,
    rng: StdRng,
    start: Instant,
    arguments: Vec<String>,
    environment: Vec<String>,
    /// Cached guest-side argv block, materialized on the first GET_ARGUMENTS.
    argv: Option<(u32, u32)>,
    /// Cached guest-side envp block, materialized on the first GET_ENVIRONMENT.
    envp: Option<u32>,
    max_io_size: u32,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("fs_root", &self.fs_root)
            .field("arguments", &self.arguments)
            .field("max_io_size", &self.max_io_size)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(config: &super::Config) -> Self {
        let rng = match config.prng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            fd_table: Mutex::new(FdTable::new(config.max_file_descriptors)),
            fs_root: config.fs_root.clone(),
            stdin: Box::new(BufReader::new(std::io::stdin())),
            stdout: Box::new(std::io::stdout()),
            stderr: Box::new(std::io::stderr()),
            rng,
            start: Instant::now(),
            arguments: config.arguments.clone(),
            environment: config.environment.clone(),
            argv: None,
            envp: None,
            max_io_size: config.max_io_size,
        }
    }

    pub fn set_stdin(&mut self, reader: Box<dyn BufRead>) {
        self.stdin = reader;
    }

    pub fn set_stdout(&mut self, writer: Box<dyn Write>) {
        self.stdout = writer;
    }

    pub fn set_stderr(&mut self, writer: Box<dyn Write>) {
        self.stderr = writer;
    }
}

/// Guest file descriptors. Entries 0, 1, and 2 are reserved for the standard streams and never
/// stored here.
struct FdTable {
    files: HashMap<u32, File>,
    next: u32,
    capacity: usize,
}

impl FdTable {
    fn new(capacity: usize) -> Self {
        Self {
            files: HashMap::new(),
            next: 3,
            capacity,
        }
    }

    fn insert(&mut self, file: File) -> Result<u32, SyscallError> {
        // The three reserved stream entries count against the capacity.
        if self.files.len() + 3 >= self.capacity {
            return Err(SyscallError::FdTableFull);
        }
        let fd = self.next;
        self.next += 1;
        self.files.insert(fd, file);
        Ok(fd)
    }

    fn remove(&mut self, fd: u32) -> Option<File> {
        self.files.remove(&fd)
    }
}

/// Dispatches a software interrupt by its comment-field number.
pub(super) fn dispatch(core: &mut Core, number: u32) -> ExecutionResult {
    trace!("Dispatching syscall {number:#04x}");
    match number {
        numbers::EXIT => {
            let code = arg(core, 0);
            Err(ExecutionError::Halt { code })
        }
        numbers::WRITE_STRING => write_string(core),
        numbers::OPEN => open(core),
        numbers::CLOSE => close(core),
        numbers::READ => read(core),
        numbers::WRITE => write(core),
        numbers::ALLOCATE => {
            let size = arg(core, 0);
            let address = core.memory.allocate(size);
            set_result(core, address);
            Ok(())
        }
        numbers::FREE => {
            let address = arg(core, 0);
            let result = match core.memory.free(address) {
                Ok(()) => 0,
                Err(_) => FAILURE,
            };
            set_result(core, result);
            Ok(())
        }
        numbers::REALLOCATE => {
            let old = arg(core, 0);
            let new_size = arg(core, 1);
            let address = core.memory.reallocate(old, new_size);
            set_result(core, address);
            Ok(())
        }
        numbers::GET_TIME => {
            let ticks = core.supervisor.start.elapsed().as_millis() as u32;
            set_result(core, ticks);
            Ok(())
        }
        numbers::GET_RANDOM => {
            let value = core.supervisor.rng.gen();
            set_result(core, value);
            Ok(())
        }
        numbers::GET_ARGUMENTS => get_arguments(core),
        numbers::GET_ENVIRONMENT => get_environment(core),
        numbers::DEBUG_PRINT => debug_print(core),
        numbers::BREAKPOINT => Err(ExecutionError::Breakpoint),
        numbers::DUMP_REGISTERS => dump_registers(core),
        numbers::DUMP_MEMORY => dump_memory(core),
        numbers::ASSERT => assert_syscall(core),
        number => Err(SyscallError::Unknown { number }.into()),
    }
}

fn arg(core: &Core, index: u8) -> u32 {
    core.registers.get(Specifier::from_u4(index))
}

fn set_result(core: &mut Core, value: u32) {
    core.registers.set(Specifier::from_u4(0), value);
}

fn write_string(core: &mut Core) -> ExecutionResult {
    let address = arg(core, 0);
    let bytes = read_cstring(core, address)?;
    host_io(core.supervisor.stdout.write_all(&bytes))?;
    host_io(core.supervisor.stdout.flush())?;
    Ok(())
}

fn debug_print(core: &mut Core) -> ExecutionResult {
    let address = arg(core, 0);
    let bytes = read_cstring(core, address)?;
    host_io(core.supervisor.stderr.write_all(&bytes))?;
    host_io(core.supervisor.stderr.flush())?;
    Ok(())
}

fn open(core: &mut Core) -> ExecutionResult {
    let path_address = arg(core, 0);
    let mode = arg(core, 1);
    let path = String::from_utf8_lossy(&read_cstring(core, path_address)?).into_owned();
    let resolved = match &core.supervisor.fs_root {
        Some(root) => resolve_jailed(root, &path)?,
        None => PathBuf::from(&path),
    };
    let opened = match mode {
        0 => File::open(&resolved),
        1 => File::create(&resolved),
        2 => OpenOptions::new().append(true).create(true).open(&resolved),
        mode => {
            debug!("Open of {path:?} with unsupported mode {mode}");
            set_result(core, FAILURE);
            return Ok(());
        }
    };
    match opened {
        Ok(file) => {
            let fd = core.supervisor.fd_table.lock().unwrap().insert(file)?;
            trace!("Opened {resolved:?} as fd {fd}");
            set_result(core, fd);
        }
        Err(error) => {
            debug!("Open of {resolved:?} failed: {error}");
            set_result(core, FAILURE);
        }
    }
    Ok(())
}

fn close(core: &mut Core) -> ExecutionResult {
    let fd = arg(core, 0);
    let result = match fd {
        // Closing a standard stream is accepted and ignored.
        0..=2 => 0,
        fd => match core.supervisor.fd_table.lock().unwrap().remove(fd) {
            Some(_) => 0,
            None => FAILURE,
        },
    };
    set_result(core, result);
    Ok(())
}

fn read(core: &mut Core) -> ExecutionResult {
    let fd = arg(core, 0);
    let buffer = arg(core, 1);
    let length = arg(core, 2);
    check_io_size(core, length)?;
    if length == 0 {
        set_result(core, 0);
        return Ok(());
    }
    core.memory
        .check_span(buffer, length, AccessType::Write)?;
    let mut data = vec![0u8; length as usize];
    let count = match fd {
        0 => host_io(core.supervisor.stdin.read(&mut data))?,
        1 | 2 => {
            set_result(core, FAILURE);
            return Ok(());
        }
        fd => {
            let mut table = core.supervisor.fd_table.lock().unwrap();
            match table.files.get_mut(&fd) {
                Some(file) => host_io(file.read(&mut data))?,
                None => {
                    drop(table);
                    set_result(core, FAILURE);
                    return Ok(());
                }
            }
        }
    };
    core.memory.write_bytes(buffer, &data[..count])?;
    set_result(core, count as u32);
    Ok(())
}

fn write(core: &mut Core) -> ExecutionResult {
    let fd = arg(core, 0);
    let buffer = arg(core, 1);
    let length = arg(core, 2);
    check_io_size(core, length)?;
    if length == 0 {
        set_result(core, 0);
        return Ok(());
    }
    core.memory.check_span(buffer, length, AccessType::Read)?;
    let mut data = vec![0u8; length as usize];
    core.memory.read_bytes(buffer, &mut data)?;
    match fd {
        0 => {
            set_result(core, FAILURE);
            return Ok(());
        }
        1 => {
            host_io(core.supervisor.stdout.write_all(&data))?;
            host_io(core.supervisor.stdout.flush())?;
        }
        2 => {
            host_io(core.supervisor.stderr.write_all(&data))?;
            host_io(core.supervisor.stderr.flush())?;
        }
        fd => {
            let mut table = core.supervisor.fd_table.lock().unwrap();
            match table.files.get_mut(&fd) {
                Some(file) => {
                    host_io(file.write_all(&data))?;
                }
                None => {
                    drop(table);
                    set_result(core, FAILURE);
                    return Ok(());
                }
            }
        }
    }
    set_result(core, length);
    Ok(())
}

fn get_arguments(core: &mut Core) -> ExecutionResult {
    if let Some((argc, argv)) = core.supervisor.argv {
        set_result(core, argc);
        core.registers.set(Specifier::from_u4(1), argv);
        return Ok(());
    }
    let arguments = core.supervisor.arguments.clone();
    if arguments.is_empty() {
        set_result(core, 0);
        core.registers.set(Specifier::from_u4(1), 0);
        return Ok(());
    }
    let Some(pointers) = write_guest_strings(core, &arguments) else {
        set_result(core, 0);
        core.registers.set(Specifier::from_u4(1), 0);
        return Ok(());
    };
    let Some(argv) = write_pointer_vector(core, &pointers) else {
        set_result(core, 0);
        core.registers.set(Specifier::from_u4(1), 0);
        return Ok(());
    };
    let argc = arguments.len() as u32;
    core.supervisor.argv = Some((argc, argv));
    set_result(core, argc);
    core.registers.set(Specifier::from_u4(1), argv);
    Ok(())
}

fn get_environment(core: &mut Core) -> ExecutionResult {
    if let Some(envp) = core.supervisor.envp {
        set_result(core, envp);
        return Ok(());
    }
    let environment = core.supervisor.environment.clone();
    if environment.is_empty() {
        set_result(core, 0);
        return Ok(());
    }
    let envp = write_guest_strings(core, &environment)
        .and_then(|pointers| write_pointer_vector(core, &pointers))
        .unwrap_or(0);
    if envp != 0 {
        core.supervisor.envp = Some(envp);
    }
    set_result(core, envp);
    Ok(())
}

/// Copies each string into a fresh heap allocation, NUL-terminated. Returns `None` when the
/// heap runs out.
fn write_guest_strings(core: &mut Core, strings: &[String]) -> Option<Vec<u32>> {
    let mut pointers = Vec::with_capacity(strings.len());
    for string in strings {
        let mut bytes = string.clone().into_bytes();
        bytes.push(0);
        let address = core.memory.allocate(bytes.len() as u32);
        if address == 0 {
            return None;
        }
        core.memory.write_bytes(address, &bytes).ok()?;
        pointers.push(address);
    }
    Some(pointers)
}

/// Writes a NULL-terminated vector of guest pointers onto the heap.
fn write_pointer_vector(core: &mut Core, pointers: &[u32]) -> Option<u32> {
    let vector = core.memory.allocate(4 * (pointers.len() as u32 + 1));
    if vector == 0 {
        return None;
    }
    for (index, &pointer) in pointers.iter().enumerate() {
        core.memory
            .write_word(vector + 4 * index as u32, pointer)
            .ok()?;
    }
    core.memory
        .write_word(vector + 4 * pointers.len() as u32, 0)
        .ok()?;
    Some(vector)
}

fn dump_registers(core: &mut Core) -> ExecutionResult {
    let mut lines = String::new();
    for row in 0..4u8 {
        for column in 0..4u8 {
            let specifier = Specifier::from_u4(row * 4 + column);
            let value = core.registers.get(specifier);
            lines.push_str(&format!("{:>3} {value:08x}  ", specifier.to_string()));
        }
        lines.push('\n');
    }
    lines.push_str(&format!(
        "cpsr {}  spsr {}  cycles {}  pc {}\n",
        core.registers.cpsr(),
        core.registers.spsr(),
        core.cycles,
        core.symbols.format(core.registers.pc()),
    ));
    host_io(core.supervisor.stdout.write_all(lines.as_bytes()))?;
    host_io(core.supervisor.stdout.flush())?;
    Ok(())
}

fn dump_memory(core: &mut Core) -> ExecutionResult {
    let address = arg(core, 0);
    let length = arg(core, 1).min(DUMP_LIMIT);
    let mut lines = String::new();
    let mut offset = 0;
    while offset < length {
        let row_address = address.wrapping_add(offset);
        lines.push_str(&format!("{row_address:08x} "));
        let mut ascii = String::new();
        for i in 0..16 {
            if offset + i >= length {
                break;
            }
            match core.memory.read_byte(row_address.wrapping_add(i)) {
                Ok(byte) => {
                    lines.push_str(&format!(" {byte:02x}"));
                    ascii.push(match byte {
                        0x20..=0x7E => byte as char,
                        _ => '.',
                    });
                }
                Err(_) => {
                    lines.push_str(" ??");
                    ascii.push('.');
                }
            }
        }
        lines.push_str(&format!("  |{ascii}|\n"));
        offset += 16;
    }
    host_io(core.supervisor.stdout.write_all(lines.as_bytes()))?;
    host_io(core.supervisor.stdout.flush())?;
    Ok(())
}

fn assert_syscall(core: &mut Core) -> ExecutionResult {
    if arg(core, 0) != 0 {
        return Ok(());
    }
    let message_address = arg(core, 1);
    let message = match read_cstring(core, message_address) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => format!("<unreadable message at {message_address:#010x}>"),
    };
    Err(ExecutionError::AssertionFailed { message })
}

/// Reads a NUL-terminated guest string, bounded by the configured I/O size limit and rejecting
/// address wraparound.
fn read_cstring(core: &Core, address: u32) -> Result<Vec<u8>, ExecutionError> {
    let limit = core.supervisor.max_io_size;
    let mut bytes = Vec::new();
    let mut cursor = address;
    loop {
        let byte = core.memory.read_byte(cursor)?;
        if byte == 0 {
            return Ok(bytes);
        }
        bytes.push(byte);
        if bytes.len() as u32 > limit {
            return Err(SyscallError::StringTooLong { address, limit }.into());
        }
        cursor = cursor
            .checked_add(1)
            .ok_or(MemoryError::WrapAround { address })?;
    }
}

fn check_io_size(core: &Core, size: u32) -> Result<(), SyscallError> {
    let limit = core.supervisor.max_io_size;
    if size > limit {
        return Err(SyscallError::SizeExceeded { size, limit });
    }
    Ok(())
}

fn host_io<T>(result: std::io::Result<T>) -> Result<T, SyscallError> {
    result.map_err(|error| SyscallError::HostIo {
        message: error.to_string(),
    })
}

/// Resolves a guest path inside the filesystem root.
///
/// Rejection is lexical first (empty paths, any `..` component), then physical: the resolved
/// path is canonicalized and compared against the canonicalized root, so a symlink inside the
/// jail cannot point out of it. Guest-absolute paths are re-rooted at the jail root.
fn resolve_jailed(root: &Path, guest_path: &str) -> Result<PathBuf, SyscallError> {
    if guest_path.is_empty() {
        return Err(SyscallError::InvalidPath {
            path: guest_path.into(),
        });
    }
    let mut resolved = root.to_path_buf();
    for component in Path::new(guest_path).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(SyscallError::JailEscape {
                    path: guest_path.into(),
                })
            }
        }
    }
    let canonical_root = host_io(root.canonicalize())?;
    // Canonicalize what exists: the file itself, or its parent for a file being created. A
    // target with no existing parent is left lexical; the open will fail on its own terms.
    let physical = match resolved.canonicalize() {
        Ok(physical) => physical,
        Err(_) => match (resolved.parent(), resolved.file_name()) {
            (Some(parent), Some(name)) => match parent.canonicalize() {
                Ok(parent) => parent.join(name),
                Err(_) => return Ok(resolved),
            },
            _ => return Ok(resolved),
        },
    };
    if !physical.starts_with(&canonical_root) {
        return Err(SyscallError::JailEscape {
            path: guest_path.into(),
        });
    }
    Ok(physical)
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum SyscallError {
    #[error("unknown syscall number {number:#x}")]
    Unknown { number: u32 },
    #[error("i/o size {size} exceeds the {limit}-byte limit")]
    SizeExceeded { size: u32, limit: u32 },
    #[error("string at {address:#010x} exceeds the {limit}-byte limit")]
    StringTooLong { address: u32, limit: u32 },
    #[error("file descriptor table is full")]
    FdTableFull,
    #[error("invalid guest path {path:?}")]
    InvalidPath { path: String },
    #[error("path {path:?} escapes the filesystem root")]
    JailEscape { path: String },
    #[error("host i/o error: {message}")]
    HostIo { message: String },
}
