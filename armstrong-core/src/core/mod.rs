//! Provides the simulated ARM core: the scheduler, the execution-state machine, and the error
//! taxonomy that every component's failures funnel into.

mod execute;
pub mod syscall;

use crate::instruction::{DecodeError, Instruction};
use crate::memory::{Memory, MemoryError};
use crate::registers::{Registers, StackError};
use crate::symbols::SymbolTable;
use crate::trace::TraceSink;
use execute::Executor;
use log::{debug, trace};
use std::fmt;
use std::path::PathBuf;
use syscall::{Supervisor, SyscallError};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on executed cycles; exceeding it transitions the core to [`State::Error`].
    pub cycle_limit: u64,
    /// Root directory that jails every path-accepting syscall. `None` disables the jail.
    pub fs_root: Option<PathBuf>,
    /// Seed for the guest-visible PRNG. A fixed seed makes GET_RANDOM deterministic.
    pub prng_seed: Option<u64>,
    /// Capacity of the file-descriptor table, including the three reserved entries.
    pub max_file_descriptors: usize,
    /// Largest buffer a single I/O syscall may transfer, in bytes.
    pub max_io_size: u32,
    /// Guest program arguments, surfaced through GET_ARGUMENTS.
    pub arguments: Vec<String>,
    /// Guest environment entries (`KEY=VALUE`), surfaced through GET_ENVIRONMENT.
    pub environment: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cycle_limit: 1_000_000,
            fs_root: None,
            prng_seed: None,
            max_file_descriptors: 1024,
            max_io_size: 1 << 20,
            arguments: Vec::new(),
            environment: Vec::new(),
        }
    }
}

/// The execution state of a core.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    /// The guest requested termination, or the host cancelled execution.
    Halted,
    Running,
    /// Created but not yet started, or suspended by the host.
    Paused,
    /// The guest hit a breakpoint; the host may resume.
    Breakpoint,
    /// A non-sentinel error stopped execution; see [`Core::last_error`].
    Error,
}

/// The address and width of the most recent guest memory write, kept for the debugger to
/// highlight fresh mutations.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryWrite {
    pub address: u32,
    pub size: u32,
}

/// A single simulated ARM core together with the memory, supervisor, and bookkeeping it owns.
///
/// Every instance is fully self-contained: two cores never share heap state, file descriptors,
/// stream endpoints, or random state. A core is owned by exactly one caller; guest execution
/// advances only through [`step`](Self::step) and [`run`](Self::run).
pub struct Core {
    config: Config,
    registers: Registers,
    memory: Memory,
    supervisor: Supervisor,
    symbols: SymbolTable,
    state: State,
    cycles: u64,
    /// Step counter stamped onto trace events; unlike `cycles` it also advances on failed steps.
    sequence: u64,
    last_error: Option<ExecutionError>,
    last_write: Option<MemoryWrite>,
    hooks: Option<Box<dyn TraceSink>>,
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("state", &self.state)
            .field("cycles", &self.cycles)
            .field("registers", &self.registers)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl Core {
    /// Create a core with the standard memory layout and no loaded program.
    pub fn new(config: Config) -> Self {
        let supervisor = Supervisor::new(&config);
        Self {
            registers: Registers::new(crate::memory::CODE_BASE),
            memory: Memory::standard(),
            supervisor,
            symbols: SymbolTable::new(),
            state: State::Paused,
            cycles: 0,
            sequence: 0,
            last_error: None,
            last_write: None,
            hooks: None,
            config,
        }
    }

    /// Load a flat program image at `base` through the privileged write path, seal the code
    /// segment, and prepare the core to run: `pc` at the entry point resolved from `symbols`,
    /// `sp` bootstrapped to the empty-stack position.
    pub fn load_program(
        &mut self,
        base: u32,
        image: &[u8],
        symbols: SymbolTable,
    ) -> Result<(), ExecutionError> {
        self.memory.load_image(base, image)?;
        self.memory.make_code_readonly();
        self.symbols = symbols;
        let entry = self.symbols.entry_point(base);
        debug!("Program loaded at {base:#010x}, entry point {entry:#010x}");
        self.registers.branch(entry);
        if let Some(stack) = self.memory.segment_range("stack") {
            self.registers
                .set_sp_unchecked(stack.end().wrapping_add(1));
        }
        self.state = State::Running;
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// The most recent error returned by [`step`](Self::step), sentinels included.
    pub fn last_error(&self) -> Option<&ExecutionError> {
        self.last_error.as_ref()
    }

    /// The most recent guest memory write, if any.
    pub fn last_write(&self) -> Option<MemoryWrite> {
        self.last_write
    }

    /// The guest's exit code, once it has halted through the EXIT syscall.
    pub fn exit_code(&self) -> Option<u32> {
        match self.last_error {
            Some(ExecutionError::Halt { code }) => Some(code),
            _ => None,
        }
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Install a trace sink; subsequent steps report their events to it.
    pub fn set_trace_sink(&mut self, sink: Box<dyn TraceSink>) {
        self.hooks = Some(sink);
    }

    /// Remove and return the installed trace sink, if any.
    pub fn take_trace_sink(&mut self) -> Option<Box<dyn TraceSink>> {
        self.hooks.take()
    }

    /// Replace the guest's stdin endpoint. Each core owns its reader; instances never share.
    pub fn set_stdin(&mut self, reader: Box<dyn std::io::BufRead>) {
        self.supervisor.set_stdin(reader);
    }

    /// Replace the guest's stdout endpoint.
    pub fn set_stdout(&mut self, writer: Box<dyn std::io::Write>) {
        self.supervisor.set_stdout(writer);
    }

    /// Replace the guest's stderr endpoint.
    pub fn set_stderr(&mut self, writer: Box<dyn std::io::Write>) {
        self.supervisor.set_stderr(writer);
    }

    /// Request graceful termination before the next fetch. There is no mid-instruction
    /// cancellation.
    pub fn halt(&mut self) {
        self.state = State::Halted;
    }

    /// Resume a paused or breakpointed core.
    pub fn resume(&mut self) {
        if matches!(self.state, State::Paused | State::Breakpoint) {
            self.state = State::Running;
        }
    }

    /// Execute a single instruction: fetch, decode, check the condition, execute, advance.
    ///
    /// On failure the error is stored, the state transitions (to [`State::Halted`],
    /// [`State::Breakpoint`], or [`State::Error`] depending on the error), and the error is
    /// returned. Side effects performed before the failure are retained.
    pub fn step(&mut self) -> ExecutionResult {
        if matches!(self.state, State::Halted | State::Error) {
            return Err(self
                .last_error
                .clone()
                .unwrap_or(ExecutionError::Halt { code: 0 }));
        }
        if self.cycles >= self.config.cycle_limit {
            return self.fail(ExecutionError::CycleLimitExceeded {
                limit: self.config.cycle_limit,
            });
        }
        self.sequence += 1;
        let pc = self.registers.pc();
        let word = match self.memory.read_instruction(pc) {
            Ok(word) => word,
            Err(error) => return self.fail(error.into()),
        };
        let instruction = match Instruction::decode(word) {
            Ok(instruction) => instruction,
            Err(error) => return self.fail(error.into()),
        };
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.record_instruction(self.sequence, pc, word);
        }
        trace!("Executing {instruction} at {pc:#010x}");
        // Advancing before execution exposes pc + 8 to operand reads and leaves branch targets
        // in control of the next fetch.
        self.registers.increment_pc();
        if instruction.condition().holds(self.registers.cpsr()) {
            let mut executor = Executor { core: self, pc };
            if let Err(error) = executor.execute(instruction) {
                return self.fail(error);
            }
        }
        self.cycles += 1;
        Ok(())
    }

    /// Run until the state leaves [`State::Running`], and return the final state.
    pub fn run(&mut self) -> State {
        while self.state == State::Running {
            let _ = self.step();
        }
        self.state
    }

    fn fail(&mut self, error: ExecutionError) -> ExecutionResult {
        self.state = match error {
            ExecutionError::Halt { .. } => State::Halted,
            ExecutionError::Breakpoint => State::Breakpoint,
            _ => State::Error,
        };
        debug!("Execution stopped: {error}");
        self.last_error = Some(error.clone());
        Err(error)
    }
}

/// Result of executing a single instruction or step.
pub type ExecutionResult<T = ()> = Result<T, ExecutionError>;

/// Everything that can stop the core. `Halt`, `Breakpoint`, and `CycleLimitExceeded` are
/// sentinel conditions that transition the state machine rather than bugs in the guest.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ExecutionError {
    #[error("failed to decode instruction: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Stack(#[from] StackError),
    #[error("register constraint violated: {reason}")]
    RegisterConstraint { reason: &'static str },
    #[error("msr field mask {fields:#06b} is not supported; only the flag field is")]
    UnsupportedPsrFields { fields: u8 },
    #[error(transparent)]
    Syscall(#[from] SyscallError),
    #[error("guest assertion failed: {message}")]
    AssertionFailed { message: String },
    #[error("program halted with exit code {code}")]
    Halt { code: u32 },
    #[error("breakpoint")]
    Breakpoint,
    #[error("cycle limit of {limit} cycles exceeded")]
    CycleLimitExceeded { limit: u64 },
}

#[cfg(test)]
mod tests {
    use super::syscall::numbers;
    use super::*;
    use crate::memory::{AccessType, Permissions, CODE_BASE, DATA_BASE, HEAP_BASE, STACK_BASE};
    use crate::registers::{Psr, Specifier};
    use crate::symbols::SymbolTable;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    fn r(index: u8) -> Specifier {
        Specifier::from_u4(index)
    }

    /// Builds a core with `words` loaded at the code base and state Running.
    fn core_with_program(words: &[u32]) -> Core {
        let mut core = Core::new(Config::default());
        let image: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        core.load_program(CODE_BASE, &image, SymbolTable::new())
            .unwrap();
        core
    }

    /// A writer handing everything to a shared buffer, for capturing guest output.
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_scenario_arithmetic_flags() {
        // ADDS r0, r1, r2 with r1 = 0x7FFF_FFFF, r2 = 1: signed overflow into the negative.
        let mut core = core_with_program(&[0xE0B1_0002]);
        core.registers_mut().set(r(1), 0x7FFF_FFFF);
        core.registers_mut().set(r(2), 1);
        core.step().unwrap();
        assert_eq!(0x8000_0000, core.registers().get(r(0)));
        let psr = core.registers().cpsr();
        assert!(psr.n);
        assert!(!psr.z);
        assert!(!psr.c);
        assert!(psr.v);
        assert_eq!(CODE_BASE + 4, core.registers().pc());
    }

    #[test]
    fn test_scenario_condition_suppression() {
        // MOVEQ r0, #42 with Z clear leaves everything but pc untouched.
        let mut core = core_with_program(&[0x03A0_002A]);
        core.registers_mut().set(r(0), 10);
        core.registers_mut().set(r(1), 5);
        core.step().unwrap();
        assert_eq!(10, core.registers().get(r(0)));
        assert_eq!(CODE_BASE + 4, core.registers().pc());
        assert_eq!(Psr::default(), core.registers().cpsr());
    }

    #[test]
    fn test_scenario_ldr_pre_indexed_writeback() {
        // LDR r0, [r1, #-16]! with r1 = data base + 16.
        let mut core = core_with_program(&[0xE531_0010]);
        core.memory_mut().write_word(DATA_BASE, 0xDEAD_BEEF).unwrap();
        core.registers_mut().set(r(1), DATA_BASE + 16);
        core.step().unwrap();
        assert_eq!(0xDEAD_BEEF, core.registers().get(r(0)));
        assert_eq!(DATA_BASE, core.registers().get(r(1)));
        assert_eq!(CODE_BASE + 4, core.registers().pc());
    }

    #[test]
    fn test_scenario_push_pop_round_trip() {
        // STMFD sp!, {r1, r2} then LDMFD sp!, {r1, r2}, clearing the registers in between.
        let mut core = core_with_program(&[0xE92D_0006, 0xE8BD_0006]);
        core.registers_mut().set_sp_unchecked(0x0004_3000);
        core.registers_mut().set(r(1), 0xAAAA);
        core.registers_mut().set(r(2), 0xBBBB);
        core.step().unwrap();
        assert_eq!(0x0004_2FF8, core.registers().sp());
        core.registers_mut().set(r(1), 0);
        core.registers_mut().set(r(2), 0);
        core.step().unwrap();
        assert_eq!(0xAAAA, core.registers().get(r(1)));
        assert_eq!(0xBBBB, core.registers().get(r(2)));
        assert_eq!(0x0004_3000, core.registers().sp());
    }

    #[test]
    fn test_scenario_reallocate_preserves_payload() {
        // SWI ALLOCATE(100) → A, fill 8 bytes, SWI REALLOCATE(A, 200) → A'.
        let mut core = core_with_program(&[0xEF00_0020, 0xEF00_0022]);
        core.registers_mut().set(r(0), 100);
        core.step().unwrap();
        let a = core.registers().get(r(0));
        assert_ne!(0, a);
        let payload = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        core.memory_mut().write_bytes(a, &payload).unwrap();
        core.registers_mut().set(r(0), a);
        core.registers_mut().set(r(1), 200);
        core.step().unwrap();
        let moved = core.registers().get(r(0));
        assert_ne!(0, moved);
        assert_ne!(a, moved);
        let mut copied = [0u8; 8];
        core.memory().read_bytes(moved, &mut copied).unwrap();
        assert_eq!(payload, copied);
        let mut old = [0u8; 8];
        core.memory().read_bytes(a, &mut old).unwrap();
        assert_eq!([0; 8], old);
        assert_eq!(1, core.memory().live_allocations());
    }

    #[test]
    fn test_scenario_wraparound_segment_rejected() {
        let mut core = core_with_program(&[0xE591_0000]); // LDR r0, [r1]
        core.memory_mut()
            .add_segment("high", 0xFFFF_0000, 0x1_0000, Permissions::RW)
            .unwrap();
        core.registers_mut().set(r(1), 0x100);
        assert_eq!(
            Err(ExecutionError::Memory(MemoryError::AccessFault {
                address: 0x100
            })),
            core.step()
        );
        assert_eq!(State::Error, core.state());
    }

    #[test]
    fn test_condition_suppression_is_total() {
        // A suppressed store must leave memory, registers, and flags exactly as a NOP would.
        let mut core = core_with_program(&[0x0581_0000]); // STREQ r0, [r1]
        core.registers_mut().set(r(0), 0x1234);
        core.registers_mut().set(r(1), DATA_BASE);
        let registers_before = format!("{:?}", core.registers());
        core.step().unwrap();
        assert_eq!(0, core.memory().read_word(DATA_BASE).unwrap());
        assert_eq!(None, core.last_write());
        // Only pc moved.
        core.registers_mut().branch(CODE_BASE);
        assert_eq!(registers_before, format!("{:?}", core.registers()));
    }

    #[test]
    fn test_pc_operand_reads_as_plus_8() {
        let mut core = core_with_program(&[0xE1A0_000F]); // MOV r0, pc
        core.step().unwrap();
        assert_eq!(CODE_BASE + 8, core.registers().get(r(0)));
    }

    #[test]
    fn test_branch_and_link() {
        // BL #+8: target is pc+8 plus 8 = entry + 16.
        let mut core = core_with_program(&[0xEB00_0002]);
        core.step().unwrap();
        assert_eq!(CODE_BASE + 16, core.registers().pc());
        assert_eq!(CODE_BASE + 4, core.registers().get(Specifier::LR));
    }

    #[test]
    fn test_branch_exchange_clears_bit_0() {
        let mut core = core_with_program(&[0xE12F_FF13]); // BX r3
        core.registers_mut().set(r(3), 0x0000_9001);
        core.step().unwrap();
        assert_eq!(0x0000_9000, core.registers().pc());
    }

    #[test]
    fn test_exit_syscall_halts() {
        let mut core = core_with_program(&[0xEF00_0000]); // SWI EXIT
        core.registers_mut().set(r(0), 3);
        assert_eq!(Err(ExecutionError::Halt { code: 3 }), core.step());
        assert_eq!(State::Halted, core.state());
        assert_eq!(Some(3), core.exit_code());
        // Further steps keep returning the stored sentinel.
        assert_eq!(Err(ExecutionError::Halt { code: 3 }), core.step());
    }

    #[test]
    fn test_breakpoint_syscall_and_resume() {
        let mut core = core_with_program(&[0xEF00_00F1, 0xEF00_0000]); // SWI BREAKPOINT; SWI EXIT
        assert_eq!(State::Breakpoint, core.run());
        core.resume();
        assert_eq!(State::Halted, core.run());
    }

    #[test]
    fn test_assert_syscall() {
        // ASSERT with a true condition is a no-op; with false it stops with the message.
        let mut core = core_with_program(&[0xEF00_00F4, 0xEF00_00F4]);
        let message_address = DATA_BASE;
        core.memory_mut().write_bytes(message_address, b"boom\0").unwrap();
        core.registers_mut().set(r(0), 1);
        core.registers_mut().set(r(1), message_address);
        core.step().unwrap();
        core.registers_mut().set(r(0), 0);
        assert_eq!(
            Err(ExecutionError::AssertionFailed {
                message: "boom".into()
            }),
            core.step()
        );
        assert_eq!(State::Error, core.state());
    }

    #[test]
    fn test_write_string_syscall() {
        let mut core = core_with_program(&[0xEF00_0002, 0xEF00_0000]);
        let out = SharedBuffer::default();
        core.set_stdout(Box::new(out.clone()));
        core.memory_mut()
            .write_bytes(DATA_BASE, b"hello, guest\0")
            .unwrap();
        core.registers_mut().set(r(0), DATA_BASE);
        core.run();
        assert_eq!("hello, guest", out.contents());
    }

    #[test]
    fn test_cycle_limit_enforced() {
        let mut core = core_with_program(&[0xEAFF_FFFE]); // B . (spin forever)
        core.config.cycle_limit = 10;
        assert_eq!(State::Error, core.run());
        assert_eq!(10, core.cycles());
        assert_eq!(
            Some(&ExecutionError::CycleLimitExceeded { limit: 10 }),
            core.last_error()
        );
    }

    #[test]
    fn test_halt_cancels_before_next_fetch() {
        let mut core = core_with_program(&[0xEAFF_FFFE]);
        core.step().unwrap();
        core.halt();
        assert!(core.step().is_err());
        assert_eq!(1, core.cycles());
    }

    #[test]
    fn test_decode_failure_stops_core() {
        let mut core = core_with_program(&[0xEE01_0F10]); // coprocessor space
        assert_eq!(
            Err(ExecutionError::Decode(DecodeError::Unsupported)),
            core.step()
        );
        assert_eq!(State::Error, core.state());
    }

    #[test]
    fn test_executing_data_segment_fails() {
        let mut core = core_with_program(&[0xE1A0_0000]);
        core.registers_mut().branch(DATA_BASE);
        assert_eq!(
            Err(ExecutionError::Memory(MemoryError::PermissionDenied {
                address: DATA_BASE,
                access: AccessType::Execute,
            })),
            core.step()
        );
    }

    #[test]
    fn test_spsr_round_trip_through_ldm() {
        // Save flags, clobber them, then LDM sp!, {pc}^ restores the saved flags.
        let mut core = core_with_program(&[0xE8FD_8000]); // LDMFD sp!, {pc}^
        core.registers_mut().set_sp_unchecked(STACK_BASE + 0x100);
        core.memory_mut()
            .write_word(STACK_BASE + 0x100, CODE_BASE + 8)
            .unwrap();
        let flags = Psr {
            n: false,
            z: true,
            c: true,
            v: false,
        };
        *core.registers_mut().cpsr_mut() = flags;
        core.registers_mut().save_psr();
        *core.registers_mut().cpsr_mut() = Psr {
            n: true,
            z: false,
            c: false,
            v: true,
        };
        core.step().unwrap();
        assert_eq!(flags, core.registers().cpsr());
        assert_eq!(CODE_BASE + 8, core.registers().pc());
        assert_eq!(STACK_BASE + 0x104, core.registers().sp());
    }

    #[test]
    fn test_heap_isolation_between_cores() {
        let mut a = core_with_program(&[0xEF00_0020]); // SWI ALLOCATE
        let mut b = core_with_program(&[0xEF00_0020]);
        a.registers_mut().set(r(0), 64);
        b.registers_mut().set(r(0), 64);
        a.step().unwrap();
        b.step().unwrap();
        let block_b = b.registers().get(r(0));
        b.memory_mut().write_word(block_b, 0xB0B0_B0B0).unwrap();
        a.memory_mut().reset_heap();
        assert_eq!(1, b.memory().live_allocations());
        assert_eq!(0xB0B0_B0B0, b.memory().read_word(block_b).unwrap());
    }

    #[test]
    fn test_get_arguments_materializes_argv() {
        let mut core = Core::new(Config {
            arguments: vec!["prog".into(), "-v".into()],
            ..Config::default()
        });
        core.load_program(CODE_BASE, &0xEF00_0032_u32.to_le_bytes(), SymbolTable::new())
            .unwrap();
        core.step().unwrap();
        assert_eq!(2, core.registers().get(r(0)));
        let argv = core.registers().get(r(1));
        assert!(argv >= HEAP_BASE);
        let arg0 = core.memory().read_word(argv).unwrap();
        let arg1 = core.memory().read_word(argv + 4).unwrap();
        assert_eq!(0, core.memory().read_word(argv + 8).unwrap());
        let mut name = [0u8; 4];
        core.memory().read_bytes(arg0, &mut name).unwrap();
        assert_eq!(b"prog", &name);
        let mut flag = [0u8; 3];
        core.memory().read_bytes(arg1, &mut flag).unwrap();
        assert_eq!(b"-v\0", &flag);
    }

    #[test]
    fn test_get_arguments_empty() {
        let mut core = core_with_program(&[0xEF00_0032]);
        core.registers_mut().set(r(0), 7);
        core.registers_mut().set(r(1), 7);
        core.step().unwrap();
        assert_eq!(0, core.registers().get(r(0)));
        assert_eq!(0, core.registers().get(r(1)));
    }

    #[test]
    fn test_get_random_is_seeded() {
        let make = || {
            let mut core = core_with_program(&[0xEF00_0031]);
            core.config.prng_seed = Some(42);
            core.supervisor = Supervisor::new(&core.config);
            core.step().unwrap();
            core.registers().get(r(0))
        };
        assert_eq!(make(), make());
    }

    #[test]
    fn test_get_time_is_monotonic() {
        let mut core = core_with_program(&[0xEF00_0030, 0xEF00_0030]);
        core.step().unwrap();
        let first = core.registers().get(r(0));
        core.step().unwrap();
        assert!(core.registers().get(r(0)) >= first);
    }

    #[test]
    fn test_unknown_syscall_errors() {
        let mut core = core_with_program(&[0xEF00_0099]);
        assert_eq!(
            Err(ExecutionError::Syscall(SyscallError::Unknown {
                number: 0x99
            })),
            core.step()
        );
    }

    #[test]
    fn test_dump_registers_writes_to_stdout() {
        let mut core = core_with_program(&[0xEF00_00F2, 0xEF00_0000]);
        let out = SharedBuffer::default();
        core.set_stdout(Box::new(out.clone()));
        core.registers_mut().set(r(7), 0x1234_5678);
        core.run();
        let dump = out.contents();
        assert!(dump.contains("r7"));
        assert!(dump.contains("12345678"));
        assert!(dump.contains("cpsr"));
    }

    #[test]
    fn test_dump_memory_is_clamped() {
        let mut core = core_with_program(&[0xEF00_00F3, 0xEF00_0000]);
        let out = SharedBuffer::default();
        core.set_stdout(Box::new(out.clone()));
        core.registers_mut().set(r(0), DATA_BASE);
        core.registers_mut().set(r(1), 1 << 16);
        core.run();
        // 1 KiB at 16 bytes a line.
        assert_eq!(64, out.contents().lines().count());
    }

    #[test]
    fn test_syscall_numbers_are_stable() {
        assert_eq!(0x00, numbers::EXIT);
        assert_eq!(0x20, numbers::ALLOCATE);
        assert_eq!(0xF4, numbers::ASSERT);
    }
}
