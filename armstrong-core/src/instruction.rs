use crate::registers::{Psr, Specifier};
use crate::shifter::ShiftKind;
use log::trace;
use std::fmt;
use thiserror::Error;

/// Data structure that can hold any supported instruction in its decoded form.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Instruction {
    DataProcessing {
        condition: Condition,
        op: DataOp,
        set_flags: bool,
        rn: Specifier,
        rd: Specifier,
        operand: Operand,
    },
    Multiply {
        condition: Condition,
        set_flags: bool,
        /// Multiply-accumulate (MLA): add `rn` to the product.
        accumulate: bool,
        rd: Specifier,
        rn: Specifier,
        rs: Specifier,
        rm: Specifier,
    },
    MultiplyLong {
        condition: Condition,
        set_flags: bool,
        signed: bool,
        /// Multiply-accumulate long (MLAL): add the existing `{rd_hi, rd_lo}` to the product.
        accumulate: bool,
        rd_hi: Specifier,
        rd_lo: Specifier,
        rs: Specifier,
        rm: Specifier,
    },
    LoadStore {
        condition: Condition,
        load: bool,
        width: TransferWidth,
        addressing: Addressing,
        /// Offset is added when `true`, subtracted when `false`.
        up: bool,
        rd: Specifier,
        rn: Specifier,
        offset: Offset,
    },
    LoadStoreMultiple {
        condition: Condition,
        load: bool,
        /// P bit: the base is adjusted before (`true`) or after (`false`) each transfer.
        pre_index: bool,
        /// U bit: the base walks up (`true`) or down (`false`) through memory.
        up: bool,
        /// S bit (the `^` suffix): restore SPSR on an LDM that loads the PC.
        psr: bool,
        write_back: bool,
        rn: Specifier,
        register_list: u16,
    },
    Branch {
        condition: Condition,
        link: bool,
        /// Byte offset relative to the read PC (instruction address + 8), already shifted.
        offset: i32,
    },
    BranchExchange {
        condition: Condition,
        rm: Specifier,
    },
    StatusTransfer {
        condition: Condition,
        op: PsrOp,
    },
    SoftwareInterrupt {
        condition: Condition,
        /// The 24-bit comment field, interpreted as the syscall number.
        comment: u32,
    },
}

/// A condition to execute an instruction on, from the top four bits of every encoding.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Condition {
    /// Z set (equal)
    Eq,
    /// Z clear (not equal)
    Ne,
    /// C set (unsigned higher or same)
    Cs,
    /// C clear (unsigned lower)
    Cc,
    /// N set (negative)
    Mi,
    /// N clear (positive or zero)
    Pl,
    /// V set (overflow)
    Vs,
    /// V clear (no overflow)
    Vc,
    /// C set and Z clear (unsigned higher)
    Hi,
    /// C clear or Z set (unsigned lower or same)
    Ls,
    /// N equals V (signed greater or equal)
    Ge,
    /// N not equal to V (signed less than)
    Lt,
    /// Z clear and N equals V (signed greater than)
    Gt,
    /// Z set or N not equal to V (signed less than or equal)
    Le,
    /// Always
    Al,
    /// Reserved; never executes.
    Nv,
}

impl Condition {
    /// Decode a 4-bit condition field.
    /// Panics if the value doesn't fit in 4 bits (`0..=15`).
    pub fn from_u4(value_u4: u8) -> Self {
        match value_u4 {
            0 => Self::Eq,
            1 => Self::Ne,
            2 => Self::Cs,
            3 => Self::Cc,
            4 => Self::Mi,
            5 => Self::Pl,
            6 => Self::Vs,
            7 => Self::Vc,
            8 => Self::Hi,
            9 => Self::Ls,
            10 => Self::Ge,
            11 => Self::Lt,
            12 => Self::Gt,
            13 => Self::Le,
            14 => Self::Al,
            15 => Self::Nv,
            _ => panic!("out of range u4 used"),
        }
    }

    /// Evaluate this condition against the flags in `psr`.
    pub fn holds(self, psr: Psr) -> bool {
        match self {
            Self::Eq => psr.z,
            Self::Ne => !psr.z,
            Self::Cs => psr.c,
            Self::Cc => !psr.c,
            Self::Mi => psr.n,
            Self::Pl => !psr.n,
            Self::Vs => psr.v,
            Self::Vc => !psr.v,
            Self::Hi => psr.c && !psr.z,
            Self::Ls => !psr.c || psr.z,
            Self::Ge => psr.n == psr.v,
            Self::Lt => psr.n != psr.v,
            Self::Gt => !psr.z && psr.n == psr.v,
            Self::Le => psr.z || psr.n != psr.v,
            Self::Al => true,
            Self::Nv => false,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Cs => "cs",
            Self::Cc => "cc",
            Self::Mi => "mi",
            Self::Pl => "pl",
            Self::Vs => "vs",
            Self::Vc => "vc",
            Self::Hi => "hi",
            Self::Ls => "ls",
            Self::Ge => "ge",
            Self::Lt => "lt",
            Self::Gt => "gt",
            Self::Le => "le",
            Self::Al => "",
            Self::Nv => "nv",
        })
    }
}

/// The sixteen data-processing opcodes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DataOp {
    /// rn AND op2
    And,
    /// rn XOR op2
    Eor,
    /// rn - op2
    Sub,
    /// op2 - rn
    Rsb,
    /// rn + op2
    Add,
    /// rn + op2 + C
    Adc,
    /// rn - op2 - (1 - C)
    Sbc,
    /// op2 - rn - (1 - C)
    Rsc,
    /// As `And`, but the result is discarded.
    Tst,
    /// As `Eor`, but the result is discarded.
    Teq,
    /// As `Sub`, but the result is discarded.
    Cmp,
    /// As `Add`, but the result is discarded.
    Cmn,
    /// rn OR op2
    Orr,
    /// op2; rn is ignored.
    Mov,
    /// rn AND NOT op2 (bit clear)
    Bic,
    /// NOT op2; rn is ignored.
    Mvn,
}

impl DataOp {
    /// Decode a 4-bit opcode field.
    /// Panics if the value doesn't fit in 4 bits (`0..=15`).
    pub fn from_u4(value_u4: u8) -> Self {
        match value_u4 {
            0 => Self::And,
            1 => Self::Eor,
            2 => Self::Sub,
            3 => Self::Rsb,
            4 => Self::Add,
            5 => Self::Adc,
            6 => Self::Sbc,
            7 => Self::Rsc,
            8 => Self::Tst,
            9 => Self::Teq,
            10 => Self::Cmp,
            11 => Self::Cmn,
            12 => Self::Orr,
            13 => Self::Mov,
            14 => Self::Bic,
            15 => Self::Mvn,
            _ => panic!("out of range u4 used"),
        }
    }

    /// Comparison opcodes set flags and discard their result.
    pub fn is_comparison(self) -> bool {
        matches!(self, Self::Tst | Self::Teq | Self::Cmp | Self::Cmn)
    }

    /// Arithmetic opcodes update C and V from the adder; logical opcodes take C from the shifter
    /// and leave V untouched.
    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            Self::Sub | Self::Rsb | Self::Add | Self::Adc | Self::Sbc | Self::Rsc | Self::Cmp | Self::Cmn
        )
    }

    /// MOV and MVN ignore the first operand register.
    pub fn ignores_rn(self) -> bool {
        matches!(self, Self::Mov | Self::Mvn)
    }
}

impl fmt::Display for DataOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::And => "and",
            Self::Eor => "eor",
            Self::Sub => "sub",
            Self::Rsb => "rsb",
            Self::Add => "add",
            Self::Adc => "adc",
            Self::Sbc => "sbc",
            Self::Rsc => "rsc",
            Self::Tst => "tst",
            Self::Teq => "teq",
            Self::Cmp => "cmp",
            Self::Cmn => "cmn",
            Self::Orr => "orr",
            Self::Mov => "mov",
            Self::Bic => "bic",
            Self::Mvn => "mvn",
        })
    }
}

/// The second operand of a data-processing instruction.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Operand {
    /// An 8-bit value rotated right by twice the 4-bit rotation.
    Immediate { value: u8, rotation: u8 },
    /// A register passed through the barrel shifter.
    Register {
        rm: Specifier,
        kind: ShiftKind,
        amount: ShiftAmount,
    },
}

/// The shift amount of a register operand.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ShiftAmount {
    /// A 5-bit constant from the encoding.
    Immediate(u8),
    /// The bottom byte of a register.
    Register(Specifier),
}

/// The transfer width of a single data transfer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransferWidth {
    Word,
    Byte,
    Halfword,
    /// Sign-extended byte; loads only.
    SignedByte,
    /// Sign-extended halfword; loads only.
    SignedHalfword,
}

/// The indexing discipline of a single data transfer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Addressing {
    /// P=1, W=0: the offset is applied for the access only; the base is unchanged.
    Offset,
    /// P=1, W=1: the offset is applied for the access and written back to the base.
    PreIndexed,
    /// P=0: the access uses the unmodified base; the offset is written back afterwards.
    PostIndexed,
}

/// The offset of a single data transfer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Offset {
    /// An unsigned constant (12 bits for word/byte transfers, 8 bits for halfword forms).
    Immediate(u16),
    /// A register shifted by an immediate amount. Shift-by-register is not permitted here.
    Register {
        rm: Specifier,
        kind: ShiftKind,
        amount: u8,
    },
}

/// A status-register transfer operation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PsrOp {
    /// MRS: read a PSR into a register.
    Read { psr: PsrKind, rd: Specifier },
    /// MSR: write the selected fields of a PSR from a register or immediate.
    Write {
        psr: PsrKind,
        /// The 4-bit field mask (bit 3 = flags, bit 0 = control). Only the flag field is
        /// architecturally modelled here.
        fields: u8,
        source: PsrSource,
    },
}

/// Which program status register a transfer addresses.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PsrKind {
    Cpsr,
    Spsr,
}

impl fmt::Display for PsrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cpsr => "cpsr",
            Self::Spsr => "spsr",
        })
    }
}

/// The source of an MSR write.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PsrSource {
    Register(Specifier),
    Immediate { value: u8, rotation: u8 },
}

/// The flag-field bit of an MSR field mask.
pub const PSR_FIELD_FLAGS: u8 = 0b1000;

impl Instruction {
    /// The condition field shared by every instruction class.
    pub fn condition(&self) -> Condition {
        match *self {
            Self::DataProcessing { condition, .. }
            | Self::Multiply { condition, .. }
            | Self::MultiplyLong { condition, .. }
            | Self::LoadStore { condition, .. }
            | Self::LoadStoreMultiple { condition, .. }
            | Self::Branch { condition, .. }
            | Self::BranchExchange { condition, .. }
            | Self::StatusTransfer { condition, .. }
            | Self::SoftwareInterrupt { condition, .. } => condition,
        }
    }

    pub fn decode(raw_instruction: u32) -> Result<Self, DecodeError> {
        trace!("Decoding instruction {raw_instruction:#010x}");
        let condition = condition(raw_instruction);
        // Patterns are tested in declining specificity: the multiply encodings live inside the
        // data-processing space (bits 7:4 == 1001), and BX inside the TEQ space.
        if raw_instruction & 0x0FFF_FFF0 == 0x012F_FF10 {
            return Ok(Self::BranchExchange {
                condition,
                rm: rm(raw_instruction),
            });
        }
        if raw_instruction & 0x0FC0_00F0 == 0x0000_0090 {
            return Ok(Self::Multiply {
                condition,
                set_flags: s_bit(raw_instruction),
                accumulate: bit(raw_instruction, 21),
                rd: Specifier::from_u4(((raw_instruction >> 16) & 0xF) as u8),
                rn: rd(raw_instruction),
                rs: rs(raw_instruction),
                rm: rm(raw_instruction),
            });
        }
        if raw_instruction & 0x0F80_00F0 == 0x0080_0090 {
            return Ok(Self::MultiplyLong {
                condition,
                set_flags: s_bit(raw_instruction),
                signed: bit(raw_instruction, 22),
                accumulate: bit(raw_instruction, 21),
                rd_hi: rn(raw_instruction),
                rd_lo: rd(raw_instruction),
                rs: rs(raw_instruction),
                rm: rm(raw_instruction),
            });
        }
        if raw_instruction & 0x0E00_0090 == 0x0000_0090 {
            return decode_halfword_transfer(raw_instruction);
        }
        if raw_instruction & 0x0C00_0000 == 0x0400_0000 {
            return decode_single_transfer(raw_instruction);
        }
        if raw_instruction & 0x0E00_0000 == 0x0800_0000 {
            return Ok(Self::LoadStoreMultiple {
                condition,
                load: l_bit(raw_instruction),
                pre_index: bit(raw_instruction, 24),
                up: bit(raw_instruction, 23),
                psr: bit(raw_instruction, 22),
                write_back: bit(raw_instruction, 21),
                rn: rn(raw_instruction),
                register_list: (raw_instruction & 0xFFFF) as u16,
            });
        }
        if raw_instruction & 0x0E00_0000 == 0x0A00_0000 {
            return Ok(Self::Branch {
                condition,
                link: bit(raw_instruction, 24),
                offset: branch_offset(raw_instruction),
            });
        }
        if raw_instruction & 0x0F00_0000 == 0x0F00_0000 {
            return Ok(Self::SoftwareInterrupt {
                condition,
                comment: raw_instruction & 0x00FF_FFFF,
            });
        }
        if raw_instruction & 0x0C00_0000 == 0 {
            return decode_data_processing(raw_instruction);
        }
        Err(DecodeError::Unsupported)
    }
}

fn decode_data_processing(raw_instruction: u32) -> Result<Instruction, DecodeError> {
    let opcode = ((raw_instruction >> 21) & 0xF) as u8;
    // A comparison opcode without S is no comparison at all: this corner of the encoding space
    // holds the PSR transfers.
    if (8..=11).contains(&opcode) && !s_bit(raw_instruction) {
        return decode_status_transfer(raw_instruction);
    }
    let operand = if bit(raw_instruction, 25) {
        Operand::Immediate {
            value: (raw_instruction & 0xFF) as u8,
            rotation: ((raw_instruction >> 8) & 0xF) as u8,
        }
    } else {
        let amount = match bit(raw_instruction, 4) {
            false => ShiftAmount::Immediate(((raw_instruction >> 7) & 0x1F) as u8),
            true => {
                // Register-specified amounts require bit 7 clear; a set bit 7 belongs to the
                // multiply and halfword-transfer encodings handled earlier.
                if bit(raw_instruction, 7) {
                    return Err(DecodeError::Undefined);
                }
                ShiftAmount::Register(rs(raw_instruction))
            }
        };
        Operand::Register {
            rm: rm(raw_instruction),
            kind: shift_kind(raw_instruction),
            amount,
        }
    };
    Ok(Instruction::DataProcessing {
        condition: condition(raw_instruction),
        op: DataOp::from_u4(opcode),
        set_flags: s_bit(raw_instruction),
        rn: rn(raw_instruction),
        rd: rd(raw_instruction),
        operand,
    })
}

fn decode_status_transfer(raw_instruction: u32) -> Result<Instruction, DecodeError> {
    let condition = condition(raw_instruction);
    let psr = match bit(raw_instruction, 22) {
        false => PsrKind::Cpsr,
        true => PsrKind::Spsr,
    };
    if raw_instruction & 0x0FBF_0FFF == 0x010F_0000 {
        return Ok(Instruction::StatusTransfer {
            condition,
            op: PsrOp::Read {
                psr,
                rd: rd(raw_instruction),
            },
        });
    }
    if raw_instruction & 0x0DB0_F000 == 0x0120_F000 {
        let source = if bit(raw_instruction, 25) {
            PsrSource::Immediate {
                value: (raw_instruction & 0xFF) as u8,
                rotation: ((raw_instruction >> 8) & 0xF) as u8,
            }
        } else {
            if raw_instruction & 0xFF0 != 0 {
                return Err(DecodeError::Undefined);
            }
            PsrSource::Register(rm(raw_instruction))
        };
        return Ok(Instruction::StatusTransfer {
            condition,
            op: PsrOp::Write {
                psr,
                fields: ((raw_instruction >> 16) & 0xF) as u8,
                source,
            },
        });
    }
    Err(DecodeError::Undefined)
}

fn decode_single_transfer(raw_instruction: u32) -> Result<Instruction, DecodeError> {
    let offset = if bit(raw_instruction, 25) {
        // Register offset with an immediate-amount shift; a set bit 4 (shift by register) is an
        // undefined instruction in this encoding space.
        if bit(raw_instruction, 4) {
            return Err(DecodeError::Undefined);
        }
        Offset::Register {
            rm: rm(raw_instruction),
            kind: shift_kind(raw_instruction),
            amount: ((raw_instruction >> 7) & 0x1F) as u8,
        }
    } else {
        Offset::Immediate((raw_instruction & 0xFFF) as u16)
    };
    let width = match bit(raw_instruction, 22) {
        false => TransferWidth::Word,
        true => TransferWidth::Byte,
    };
    Ok(Instruction::LoadStore {
        condition: condition(raw_instruction),
        load: l_bit(raw_instruction),
        width,
        addressing: addressing(raw_instruction),
        up: bit(raw_instruction, 23),
        rd: rd(raw_instruction),
        rn: rn(raw_instruction),
        offset,
    })
}

fn decode_halfword_transfer(raw_instruction: u32) -> Result<Instruction, DecodeError> {
    let load = l_bit(raw_instruction);
    let width = match ((raw_instruction >> 5) & 0b11, load) {
        // SH == 00 in this space is the SWP encoding, which this core does not carry.
        (0b00, _) => return Err(DecodeError::Unsupported),
        (0b01, _) => TransferWidth::Halfword,
        (0b10, true) => TransferWidth::SignedByte,
        (0b11, true) => TransferWidth::SignedHalfword,
        // Signed stores do not exist.
        (_, false) => return Err(DecodeError::Undefined),
        _ => unreachable!(),
    };
    let offset = match bit(raw_instruction, 22) {
        true => Offset::Immediate(
            (((raw_instruction >> 4) & 0xF0) | (raw_instruction & 0xF)) as u16,
        ),
        false => {
            if raw_instruction & 0xF00 != 0 {
                return Err(DecodeError::Undefined);
            }
            Offset::Register {
                rm: rm(raw_instruction),
                kind: ShiftKind::Lsl,
                amount: 0,
            }
        }
    };
    Ok(Instruction::LoadStore {
        condition: condition(raw_instruction),
        load,
        width,
        addressing: addressing(raw_instruction),
        up: bit(raw_instruction, 23),
        rd: rd(raw_instruction),
        rn: rn(raw_instruction),
        offset,
    })
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum DecodeError {
    /// An encoding outside the instruction classes this core implements (coprocessor space,
    /// SWP, and friends).
    #[error("instruction has unsupported encoding")]
    Unsupported,
    /// A bit pattern the architecture reserves as undefined.
    #[error("undefined instruction")]
    Undefined,
}

/// Returns the 4-bit condition field of any instruction.
fn condition(raw_instruction: u32) -> Condition {
    Condition::from_u4((raw_instruction >> 28) as u8)
}

/// Returns the 4-bit *Rn* (first operand / base) field.
fn rn(raw_instruction: u32) -> Specifier {
    Specifier::from_u4(((raw_instruction >> 16) & 0xF) as u8)
}

/// Returns the 4-bit *Rd* (destination / data) field.
fn rd(raw_instruction: u32) -> Specifier {
    Specifier::from_u4(((raw_instruction >> 12) & 0xF) as u8)
}

/// Returns the 4-bit *Rs* (shift amount) field.
fn rs(raw_instruction: u32) -> Specifier {
    Specifier::from_u4(((raw_instruction >> 8) & 0xF) as u8)
}

/// Returns the 4-bit *Rm* (shifted operand) field.
fn rm(raw_instruction: u32) -> Specifier {
    Specifier::from_u4((raw_instruction & 0xF) as u8)
}

/// Returns the 2-bit shift-type field of a register operand.
fn shift_kind(raw_instruction: u32) -> ShiftKind {
    ShiftKind::from_u2(((raw_instruction >> 5) & 0b11) as u8)
}

/// Returns the S (set condition codes) bit.
fn s_bit(raw_instruction: u32) -> bool {
    bit(raw_instruction, 20)
}

/// Returns the L (load/store) bit.
fn l_bit(raw_instruction: u32) -> bool {
    bit(raw_instruction, 20)
}

/// Returns the indexing discipline from the P and W bits.
///
/// In post-indexed form the W bit selects user-mode access in privileged modes; this core has no
/// privileged modes, so it is ignored.
fn addressing(raw_instruction: u32) -> Addressing {
    match (bit(raw_instruction, 24), bit(raw_instruction, 21)) {
        (true, false) => Addressing::Offset,
        (true, true) => Addressing::PreIndexed,
        (false, _) => Addressing::PostIndexed,
    }
}

/// Returns the 24-bit branch offset, sign-extended and shifted left by 2.
fn branch_offset(raw_instruction: u32) -> i32 {
    ((raw_instruction << 8) as i32) >> 6
}

fn bit(raw_instruction: u32, n: u32) -> bool {
    (raw_instruction >> n) & 1 == 1
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::DataProcessing {
                condition,
                op,
                set_flags,
                rn,
                rd,
                operand,
            } => {
                if op.is_comparison() {
                    write!(f, "{op}{condition} {rn}, {operand}")
                } else if op.ignores_rn() {
                    let s = if set_flags { "s" } else { "" };
                    write!(f, "{op}{condition}{s} {rd}, {operand}")
                } else {
                    let s = if set_flags { "s" } else { "" };
                    write!(f, "{op}{condition}{s} {rd}, {rn}, {operand}")
                }
            }
            Self::Multiply {
                condition,
                set_flags,
                accumulate,
                rd,
                rn,
                rs,
                rm,
            } => {
                let s = if set_flags { "s" } else { "" };
                match accumulate {
                    false => write!(f, "mul{condition}{s} {rd}, {rm}, {rs}"),
                    true => write!(f, "mla{condition}{s} {rd}, {rm}, {rs}, {rn}"),
                }
            }
            Self::MultiplyLong {
                condition,
                set_flags,
                signed,
                accumulate,
                rd_hi,
                rd_lo,
                rs,
                rm,
            } => {
                let sign = if signed { "s" } else { "u" };
                let op = if accumulate { "mlal" } else { "mull" };
                let s = if set_flags { "s" } else { "" };
                write!(f, "{sign}{op}{condition}{s} {rd_lo}, {rd_hi}, {rm}, {rs}")
            }
            Self::LoadStore {
                condition,
                load,
                width,
                addressing,
                up,
                rd,
                rn,
                offset,
            } => {
                let op = if load { "ldr" } else { "str" };
                let w = match width {
                    TransferWidth::Word => "",
                    TransferWidth::Byte => "b",
                    TransferWidth::Halfword => "h",
                    TransferWidth::SignedByte => "sb",
                    TransferWidth::SignedHalfword => "sh",
                };
                write!(f, "{op}{condition}{w} {rd}, ")?;
                let offset = SignedOffset { up, offset };
                match addressing {
                    Addressing::Offset => write!(f, "[{rn}, {offset}]"),
                    Addressing::PreIndexed => write!(f, "[{rn}, {offset}]!"),
                    Addressing::PostIndexed => write!(f, "[{rn}], {offset}"),
                }
            }
            Self::LoadStoreMultiple {
                condition,
                load,
                pre_index,
                up,
                psr,
                write_back,
                rn,
                register_list,
            } => {
                let op = if load { "ldm" } else { "stm" };
                let mode = match (up, pre_index) {
                    (true, false) => "ia",
                    (true, true) => "ib",
                    (false, false) => "da",
                    (false, true) => "db",
                };
                let wb = if write_back { "!" } else { "" };
                write!(f, "{op}{condition}{mode} {rn}{wb}, {{")?;
                let mut first = true;
                for i in 0..16 {
                    if register_list & (1 << i) != 0 {
                        if !first {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", Specifier::from_u4(i))?;
                        first = false;
                    }
                }
                write!(f, "}}")?;
                if psr {
                    write!(f, "^")?;
                }
                Ok(())
            }
            Self::Branch {
                condition,
                link,
                offset,
            } => {
                let l = if link { "l" } else { "" };
                write!(f, "b{l}{condition} #{offset}")
            }
            Self::BranchExchange { condition, rm } => write!(f, "bx{condition} {rm}"),
            Self::StatusTransfer { condition, op } => match op {
                PsrOp::Read { psr, rd } => write!(f, "mrs{condition} {rd}, {psr}"),
                PsrOp::Write {
                    psr,
                    fields,
                    source,
                } => {
                    write!(f, "msr{condition} {psr}_")?;
                    for (mask, ch) in [(0b1000, 'f'), (0b0100, 's'), (0b0010, 'x'), (0b0001, 'c')]
                    {
                        if fields & mask != 0 {
                            write!(f, "{ch}")?;
                        }
                    }
                    match source {
                        PsrSource::Register(rm) => write!(f, ", {rm}"),
                        PsrSource::Immediate { value, rotation } => {
                            let imm = (value as u32).rotate_right(2 * rotation as u32);
                            write!(f, ", #{imm}")
                        }
                    }
                }
            },
            Self::SoftwareInterrupt { condition, comment } => {
                write!(f, "swi{condition} {comment:#x}")
            }
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Immediate { value, rotation } => {
                let imm = (value as u32).rotate_right(2 * rotation as u32);
                write!(f, "#{imm}")
            }
            Self::Register { rm, kind, amount } => match amount {
                ShiftAmount::Immediate(0) if kind == ShiftKind::Lsl => write!(f, "{rm}"),
                ShiftAmount::Immediate(0) if kind == ShiftKind::Ror => write!(f, "{rm}, rrx"),
                ShiftAmount::Immediate(n) => write!(f, "{rm}, {kind} #{n}"),
                ShiftAmount::Register(rs) => write!(f, "{rm}, {kind} {rs}"),
            },
        }
    }
}

/// An [`Offset`] paired with its direction bit, for display as `#-16` or `-r2, lsl #2`.
struct SignedOffset {
    up: bool,
    offset: Offset,
}

impl fmt::Display for SignedOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.up { "" } else { "-" };
        match self.offset {
            Offset::Immediate(value) => write!(f, "#{sign}{value}"),
            Offset::Register { rm, kind, amount } => match amount {
                0 if kind == ShiftKind::Lsl => write!(f, "{sign}{rm}"),
                0 if kind == ShiftKind::Ror => write!(f, "{sign}{rm}, rrx"),
                n => write!(f, "{sign}{rm}, {kind} #{n}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_adds() {
        // ADDS r0, r1, r2
        let inst = Instruction::decode(0xE091_0002).unwrap();
        assert_eq!(
            Instruction::DataProcessing {
                condition: Condition::Al,
                op: DataOp::Add,
                set_flags: true,
                rn: Specifier::from_u4(1),
                rd: Specifier::from_u4(0),
                operand: Operand::Register {
                    rm: Specifier::from_u4(2),
                    kind: ShiftKind::Lsl,
                    amount: ShiftAmount::Immediate(0),
                },
            },
            inst
        );
        assert_eq!("adds r0, r1, r2", inst.to_string());
    }

    #[test]
    fn test_decode_moveq_immediate() {
        // MOVEQ r0, #42
        let inst = Instruction::decode(0x03A0_002A).unwrap();
        assert_eq!(
            Instruction::DataProcessing {
                condition: Condition::Eq,
                op: DataOp::Mov,
                set_flags: false,
                rn: Specifier::from_u4(0),
                rd: Specifier::from_u4(0),
                operand: Operand::Immediate {
                    value: 42,
                    rotation: 0,
                },
            },
            inst
        );
        assert_eq!("moveq r0, #42", inst.to_string());
    }

    #[test]
    fn test_decode_register_shift_by_register() {
        // ORR r3, r4, r5, LSL r6
        let inst = Instruction::decode(0xE184_3615).unwrap();
        assert_eq!(
            Instruction::DataProcessing {
                condition: Condition::Al,
                op: DataOp::Orr,
                set_flags: false,
                rn: Specifier::from_u4(4),
                rd: Specifier::from_u4(3),
                operand: Operand::Register {
                    rm: Specifier::from_u4(5),
                    kind: ShiftKind::Lsl,
                    amount: ShiftAmount::Register(Specifier::from_u4(6)),
                },
            },
            inst
        );
    }

    #[test]
    fn test_decode_ldr_pre_indexed() {
        // LDR r0, [r1, #-16]!
        let inst = Instruction::decode(0xE531_0010).unwrap();
        assert_eq!(
            Instruction::LoadStore {
                condition: Condition::Al,
                load: true,
                width: TransferWidth::Word,
                addressing: Addressing::PreIndexed,
                up: false,
                rd: Specifier::from_u4(0),
                rn: Specifier::from_u4(1),
                offset: Offset::Immediate(16),
            },
            inst
        );
        assert_eq!("ldr r0, [r1, #-16]!", inst.to_string());
    }

    #[test]
    fn test_decode_strb_post_indexed() {
        // STRB r2, [r3], #1
        let inst = Instruction::decode(0xE4C3_2001).unwrap();
        assert_eq!(
            Instruction::LoadStore {
                condition: Condition::Al,
                load: false,
                width: TransferWidth::Byte,
                addressing: Addressing::PostIndexed,
                up: true,
                rd: Specifier::from_u4(2),
                rn: Specifier::from_u4(3),
                offset: Offset::Immediate(1),
            },
            inst
        );
    }

    #[test]
    fn test_decode_ldrh() {
        // LDRH r0, [r1, #6]
        let inst = Instruction::decode(0xE1D1_00B6).unwrap();
        assert_eq!(
            Instruction::LoadStore {
                condition: Condition::Al,
                load: true,
                width: TransferWidth::Halfword,
                addressing: Addressing::Offset,
                up: true,
                rd: Specifier::from_u4(0),
                rn: Specifier::from_u4(1),
                offset: Offset::Immediate(6),
            },
            inst
        );
    }

    #[test]
    fn test_decode_signed_store_is_undefined() {
        // An STRSH-shaped encoding (L=0, SH=11) does not exist.
        assert_eq!(
            Err(DecodeError::Undefined),
            Instruction::decode(0xE1C1_00F6)
        );
    }

    #[test]
    fn test_decode_stmfd_ldmfd() {
        // STMFD sp!, {r1, r2}
        let inst = Instruction::decode(0xE92D_0006).unwrap();
        assert_eq!(
            Instruction::LoadStoreMultiple {
                condition: Condition::Al,
                load: false,
                pre_index: true,
                up: false,
                psr: false,
                write_back: true,
                rn: Specifier::SP,
                register_list: 0b110,
            },
            inst
        );
        assert_eq!("stmdb sp!, {r1, r2}", inst.to_string());
        // LDMFD sp!, {r1, r2}
        let inst = Instruction::decode(0xE8BD_0006).unwrap();
        assert_eq!(
            Instruction::LoadStoreMultiple {
                condition: Condition::Al,
                load: true,
                pre_index: false,
                up: true,
                psr: false,
                write_back: true,
                rn: Specifier::SP,
                register_list: 0b110,
            },
            inst
        );
    }

    #[test]
    fn test_decode_branches() {
        // B #+8 (offset field 0x000002)
        assert_eq!(
            Instruction::Branch {
                condition: Condition::Al,
                link: false,
                offset: 8,
            },
            Instruction::decode(0xEA00_0002).unwrap()
        );
        // BL #-4 (offset field 0xFFFFFF)
        assert_eq!(
            Instruction::Branch {
                condition: Condition::Al,
                link: true,
                offset: -4,
            },
            Instruction::decode(0xEBFF_FFFF).unwrap()
        );
        // BXNE r3
        assert_eq!(
            Instruction::BranchExchange {
                condition: Condition::Ne,
                rm: Specifier::from_u4(3),
            },
            Instruction::decode(0x112F_FF13).unwrap()
        );
    }

    #[test]
    fn test_decode_multiplies() {
        // MULS r2, r3, r4
        assert_eq!(
            Instruction::Multiply {
                condition: Condition::Al,
                set_flags: true,
                accumulate: false,
                rd: Specifier::from_u4(2),
                rn: Specifier::from_u4(0),
                rs: Specifier::from_u4(4),
                rm: Specifier::from_u4(3),
            },
            Instruction::decode(0xE012_0493).unwrap()
        );
        // MLA r2, r3, r4, r5
        assert_eq!(
            Instruction::Multiply {
                condition: Condition::Al,
                set_flags: false,
                accumulate: true,
                rd: Specifier::from_u4(2),
                rn: Specifier::from_u4(5),
                rs: Specifier::from_u4(4),
                rm: Specifier::from_u4(3),
            },
            Instruction::decode(0xE022_5493).unwrap()
        );
        // UMULL r0, r1, r2, r3
        assert_eq!(
            Instruction::MultiplyLong {
                condition: Condition::Al,
                set_flags: false,
                signed: false,
                accumulate: false,
                rd_hi: Specifier::from_u4(1),
                rd_lo: Specifier::from_u4(0),
                rs: Specifier::from_u4(3),
                rm: Specifier::from_u4(2),
            },
            Instruction::decode(0xE081_0392).unwrap()
        );
        // SMLALS r0, r1, r2, r3
        assert_eq!(
            Instruction::MultiplyLong {
                condition: Condition::Al,
                set_flags: true,
                signed: true,
                accumulate: true,
                rd_hi: Specifier::from_u4(1),
                rd_lo: Specifier::from_u4(0),
                rs: Specifier::from_u4(3),
                rm: Specifier::from_u4(2),
            },
            Instruction::decode(0xE0F1_0392).unwrap()
        );
    }

    #[test]
    fn test_decode_status_transfers() {
        // MRS r0, CPSR
        assert_eq!(
            Instruction::StatusTransfer {
                condition: Condition::Al,
                op: PsrOp::Read {
                    psr: PsrKind::Cpsr,
                    rd: Specifier::from_u4(0),
                },
            },
            Instruction::decode(0xE10F_0000).unwrap()
        );
        // MSR CPSR_f, r1
        assert_eq!(
            Instruction::StatusTransfer {
                condition: Condition::Al,
                op: PsrOp::Write {
                    psr: PsrKind::Cpsr,
                    fields: 0b1000,
                    source: PsrSource::Register(Specifier::from_u4(1)),
                },
            },
            Instruction::decode(0xE128_F001).unwrap()
        );
        // MSR CPSR_f, #0xF0000000 (0xF0 ROR 8)
        assert_eq!(
            Instruction::StatusTransfer {
                condition: Condition::Al,
                op: PsrOp::Write {
                    psr: PsrKind::Cpsr,
                    fields: 0b1000,
                    source: PsrSource::Immediate {
                        value: 0xF0,
                        rotation: 4,
                    },
                },
            },
            Instruction::decode(0xE328_F4F0).unwrap()
        );
    }

    #[test]
    fn test_decode_swi() {
        assert_eq!(
            Instruction::SoftwareInterrupt {
                condition: Condition::Al,
                comment: 0x20,
            },
            Instruction::decode(0xEF00_0020).unwrap()
        );
        assert_eq!(
            Instruction::SoftwareInterrupt {
                condition: Condition::Al,
                comment: 0xFF_FFFF,
            },
            Instruction::decode(0xEFFF_FFFF).unwrap()
        );
    }

    #[test]
    fn test_decode_coprocessor_space_unsupported() {
        // CDP p15, ...
        assert_eq!(
            Err(DecodeError::Unsupported),
            Instruction::decode(0xEE01_0F10)
        );
    }

    #[test]
    fn test_decode_swp_unsupported() {
        // SWP r0, r1, [r2]
        assert_eq!(
            Err(DecodeError::Unsupported),
            Instruction::decode(0xE102_0091)
        );
    }

    #[test]
    fn test_branch_offset() {
        assert_eq!(0, branch_offset(0xEA00_0000));
        assert_eq!(8, branch_offset(0xEA00_0002));
        assert_eq!(-4, branch_offset(0xEAFF_FFFF));
        assert_eq!(4 * 0x7F_FFFF, branch_offset(0xEA7F_FFFF));
        assert_eq!(-4 * 0x80_0000, branch_offset(0xEA80_0000));
    }

    #[test]
    fn test_condition_holds() {
        let mut psr = Psr::default();
        assert!(!Condition::Eq.holds(psr));
        assert!(Condition::Ne.holds(psr));
        assert!(Condition::Al.holds(psr));
        assert!(!Condition::Nv.holds(psr));
        psr.z = true;
        assert!(Condition::Eq.holds(psr));
        assert!(Condition::Ls.holds(psr));
        assert!(!Condition::Hi.holds(psr));
        psr = Psr {
            n: true,
            z: false,
            c: true,
            v: true,
        };
        assert!(Condition::Ge.holds(psr));
        assert!(Condition::Gt.holds(psr));
        assert!(!Condition::Lt.holds(psr));
        psr.v = false;
        assert!(Condition::Lt.holds(psr));
        assert!(Condition::Le.holds(psr));
        assert!(Condition::Hi.holds(psr));
    }
}
