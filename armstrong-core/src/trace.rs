//! Hook points for external execution recorders.
//!
//! The core holds an optional [`TraceSink`] and calls its record methods as side effects happen;
//! an absent sink costs nothing. Recorders accumulate their own state (instruction traces,
//! coverage maps, performance counters) outside the core. Every event carries the step sequence
//! number and the address of the instruction that caused it.

use crate::registers::{Psr, Specifier};

/// The semantic direction of a stack-pointer move.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SpMove {
    /// The stack grew (sp decreased).
    Push,
    /// The stack shrank (sp increased).
    Pop,
    /// A reassignment with no stack discipline implied.
    Move,
}

/// A sink for execution events. All methods default to doing nothing, so a recorder implements
/// only what it cares about. Events are fire-and-forget: the core ignores anything the sink does.
pub trait TraceSink {
    /// An instruction word was fetched and is about to be executed (or condition-suppressed).
    fn record_instruction(&mut self, sequence: u64, pc: u32, word: u32) {
        let _ = (sequence, pc, word);
    }

    /// A guest memory read of `size` bytes completed.
    fn record_memory_read(&mut self, sequence: u64, pc: u32, address: u32, value: u32, size: u32) {
        let _ = (sequence, pc, address, value, size);
    }

    /// A guest memory write of `size` bytes completed.
    fn record_memory_write(&mut self, sequence: u64, pc: u32, address: u32, value: u32, size: u32) {
        let _ = (sequence, pc, address, value, size);
    }

    /// A register was read as an operand.
    fn record_register_read(&mut self, sequence: u64, pc: u32, register: Specifier, value: u32) {
        let _ = (sequence, pc, register, value);
    }

    /// A register was written.
    fn record_register_write(
        &mut self,
        sequence: u64,
        pc: u32,
        register: Specifier,
        old: u32,
        new: u32,
    ) {
        let _ = (sequence, pc, register, old, new);
    }

    /// The stack pointer moved.
    fn record_sp_move(&mut self, sequence: u64, pc: u32, old_sp: u32, new_sp: u32, kind: SpMove) {
        let _ = (sequence, pc, old_sp, new_sp, kind);
    }

    /// The condition flags changed.
    fn record_flag_change(&mut self, sequence: u64, pc: u32, old: Psr, new: Psr) {
        let _ = (sequence, pc, old, new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingSink {
        instructions: usize,
        writes: usize,
    }

    impl TraceSink for CountingSink {
        fn record_instruction(&mut self, _sequence: u64, _pc: u32, _word: u32) {
            self.instructions += 1;
        }

        fn record_memory_write(
            &mut self,
            _sequence: u64,
            _pc: u32,
            _address: u32,
            _value: u32,
            _size: u32,
        ) {
            self.writes += 1;
        }
    }

    #[test]
    fn test_default_methods_are_noops() {
        // A sink that overrides nothing still satisfies the trait.
        struct Inert;
        impl TraceSink for Inert {}
        let mut sink = Inert;
        sink.record_instruction(0, 0x8000, 0);
        sink.record_flag_change(0, 0x8000, Psr::default(), Psr::default());
    }

    #[test]
    fn test_partial_override() {
        let mut sink = CountingSink::default();
        sink.record_instruction(0, 0x8000, 0xE1A0_0000);
        sink.record_memory_write(0, 0x8000, 0x2_0000, 1, 4);
        sink.record_memory_read(0, 0x8000, 0x2_0000, 1, 4);
        assert_eq!(1, sink.instructions);
        assert_eq!(1, sink.writes);
    }
}
