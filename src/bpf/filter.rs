//! Classic BPF filter program construction.
//!
//! Programs are built from typed [`Instruction`]s and checked once at
//! construction time by [`FilterProgram::new`]. A program that passes the check
//! only branches forward, never jumps past its own end, and always finishes on a
//! `ret`, so the kernel evaluation terminates on every input.
//! [`FilterProgram::encode`] lowers it to the `struct bpf_insn` records consumed
//! by the `BIOCSETF` ioctl.

use std::fmt;

use crate::error::CaptureError;

// ---------------------------------------------------------------------------
// FFI type: BPF instruction
// ---------------------------------------------------------------------------

/// A single classic BPF instruction, matching the kernel `struct bpf_insn`.
///
/// - `code` (u16): opcode composed of class | size | mode
/// - `jt`   (u8):  jump-true offset (relative, for conditional jumps)
/// - `jf`   (u8):  jump-false offset (relative, for conditional jumps)
/// - `k`    (u32): generic constant (immediate value, packet offset, etc.)
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct bpf_insn {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

const _: () = assert!(std::mem::size_of::<bpf_insn>() == 8);

// ---------------------------------------------------------------------------
// Opcode bits
// ---------------------------------------------------------------------------

// Instruction classes
const BPF_LD: u16 = 0x00;
const BPF_LDX: u16 = 0x01;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;

// LD/LDX sizes
const BPF_W: u16 = 0x00;
const BPF_H: u16 = 0x08;
const BPF_B: u16 = 0x10;

// LD/LDX modes
const BPF_ABS: u16 = 0x20;
const BPF_IND: u16 = 0x40;
const BPF_MSH: u16 = 0xa0;

// JMP operations
const BPF_JEQ: u16 = 0x10;
const BPF_JSET: u16 = 0x40;

const BPF_K: u16 = 0x00;

/// Kernel limit on program length.
pub const BPF_MAXINSNS: usize = 4096;

/// `ret` value keeping the whole frame.
pub const ACCEPT: u32 = u32::MAX;
/// `ret` value discarding the frame.
pub const REJECT: u32 = 0;

const ETHERTYPE_IP: u32 = 0x0800;
const IPPROTO_TCP: u32 = 6;
const IP_FRAGMENT_MASK: u32 = 0x1fff;
const SSH_PORT: u16 = 22;

// ---------------------------------------------------------------------------
// Typed instructions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Word,
    Half,
    Byte,
}

impl Width {
    fn bits(self) -> u16 {
        match self {
            Width::Word => BPF_W,
            Width::Half => BPF_H,
            Width::Byte => BPF_B,
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            Width::Word => "ld",
            Width::Half => "ldh",
            Width::Byte => "ldb",
        }
    }
}

/// Addressing mode of a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// `A = packet[k]`
    Absolute,
    /// `A = packet[X + k]`
    Indexed,
    /// `X = 4 * (packet[k] & 0x0f)`, the IPv4 header length. Byte width only.
    HeaderLength,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Equal,
    /// `A & k != 0`
    AnyBitSet,
}

impl Condition {
    fn bits(self) -> u16 {
        match self {
            Condition::Equal => BPF_JEQ,
            Condition::AnyBitSet => BPF_JSET,
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            Condition::Equal => "jeq",
            Condition::AnyBitSet => "jset",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Load {
        width: Width,
        mode: Mode,
        offset: u32,
    },
    /// Compare the accumulator with `operand`; skip `jt` instructions when the
    /// condition holds and `jf` when it does not.
    Jump {
        cond: Condition,
        operand: u32,
        jt: u8,
        jf: u8,
    },
    Return(u32),
}

impl Instruction {
    pub const fn load(width: Width, mode: Mode, offset: u32) -> Self {
        Instruction::Load {
            width,
            mode,
            offset,
        }
    }

    pub const fn jeq(operand: u32, jt: u8, jf: u8) -> Self {
        Instruction::Jump {
            cond: Condition::Equal,
            operand,
            jt,
            jf,
        }
    }

    pub const fn jset(operand: u32, jt: u8, jf: u8) -> Self {
        Instruction::Jump {
            cond: Condition::AnyBitSet,
            operand,
            jt,
            jf,
        }
    }

    /// Lower to the kernel representation.
    pub fn encode(&self) -> bpf_insn {
        match *self {
            Instruction::Load {
                width,
                mode,
                offset,
            } => {
                let code = match mode {
                    Mode::Absolute => BPF_LD | width.bits() | BPF_ABS,
                    Mode::Indexed => BPF_LD | width.bits() | BPF_IND,
                    Mode::HeaderLength => BPF_LDX | BPF_B | BPF_MSH,
                };
                bpf_insn {
                    code,
                    jt: 0,
                    jf: 0,
                    k: offset,
                }
            }
            Instruction::Jump {
                cond,
                operand,
                jt,
                jf,
            } => bpf_insn {
                code: BPF_JMP | cond.bits() | BPF_K,
                jt,
                jf,
                k: operand,
            },
            Instruction::Return(value) => bpf_insn {
                code: BPF_RET | BPF_K,
                jt: 0,
                jf: 0,
                k: value,
            },
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Instruction::Load {
                mode: Mode::HeaderLength,
                offset,
                ..
            } => write!(f, "ldxb     4*([{offset}]&0xf)"),
            Instruction::Load {
                width,
                mode: Mode::Absolute,
                offset,
            } => write!(f, "{:<8} [{offset}]", width.mnemonic()),
            Instruction::Load {
                width,
                mode: Mode::Indexed,
                offset,
            } => write!(f, "{:<8} [x + {offset}]", width.mnemonic()),
            Instruction::Jump {
                cond,
                operand,
                jt,
                jf,
            } => write!(
                f,
                "{:<8} #{operand:#x}  jt +{jt}  jf +{jf}",
                cond.mnemonic()
            ),
            Instruction::Return(value) => write!(f, "ret      #{value}"),
        }
    }
}

// ---------------------------------------------------------------------------
// FilterProgram
// ---------------------------------------------------------------------------

/// A validated, immutable filter program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterProgram {
    insns: Vec<Instruction>,
}

impl FilterProgram {
    /// Checks that the program is non-empty, within `BPF_MAXINSNS`, ends with
    /// `ret`, and that every jump lands inside the program.
    pub fn new(insns: Vec<Instruction>) -> Result<Self, CaptureError> {
        if insns.is_empty() {
            return Err(CaptureError::InvalidProgram("empty program".to_string()));
        }
        if insns.len() > BPF_MAXINSNS {
            return Err(CaptureError::InvalidProgram(format!(
                "{} instructions exceeds BPF_MAXINSNS ({BPF_MAXINSNS})",
                insns.len()
            )));
        }
        if !matches!(insns.last(), Some(Instruction::Return(_))) {
            return Err(CaptureError::InvalidProgram(
                "last instruction must be ret".to_string(),
            ));
        }

        for (pc, insn) in insns.iter().enumerate() {
            match *insn {
                Instruction::Jump { jt, jf, .. } => {
                    let far = pc + 1 + usize::from(jt.max(jf));
                    if far >= insns.len() {
                        return Err(CaptureError::InvalidProgram(format!(
                            "[{pc}] jump target {far} out of range (len {})",
                            insns.len()
                        )));
                    }
                }
                Instruction::Load {
                    width,
                    mode: Mode::HeaderLength,
                    ..
                } if width != Width::Byte => {
                    return Err(CaptureError::InvalidProgram(format!(
                        "[{pc}] header-length load must be byte wide"
                    )));
                }
                _ => {}
            }
        }

        Ok(Self { insns })
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Kernel representation, ready for `BIOCSETF`.
    pub fn encode(&self) -> Vec<bpf_insn> {
        self.insns.iter().map(Instruction::encode).collect()
    }
}

impl fmt::Display for FilterProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (pc, insn) in self.insns.iter().enumerate() {
            writeln!(f, "({pc:03}) {insn}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Public filter constructors
// ---------------------------------------------------------------------------

/// Build a program accepting IPv4 TCP frames whose source or destination port
/// is `port`.
///
/// Non-first IPv4 fragments carry no TCP header and are accepted without a
/// port check. The header length comes from `ldx 4*([14]&0xf)`, so IP options
/// are handled.
///
/// ```text
///   (000) ldh  [12]
///   (001) jeq  #0x800      jt +0  jf +10   ; IPv4? else reject
///   (002) ldb  [23]
///   (003) jeq  #0x6        jt +0  jf +8    ; TCP? else reject
///   (004) ldh  [20]
///   (005) jset #0x1fff     jt +5  jf +0    ; non-first fragment -> accept
///   (006) ldxb 4*([14]&0xf)
///   (007) ldh  [x + 14]
///   (008) jeq  #port       jt +2  jf +0    ; source port -> accept
///   (009) ldh  [x + 16]
///   (010) jeq  #port       jt +0  jf +1    ; destination port
///   (011) ret  #4294967295
///   (012) ret  #0
/// ```
pub fn tcp_port_filter(port: u16) -> Result<FilterProgram, CaptureError> {
    let port = u32::from(port);
    FilterProgram::new(vec![
        Instruction::load(Width::Half, Mode::Absolute, 12),
        Instruction::jeq(ETHERTYPE_IP, 0, 10),
        Instruction::load(Width::Byte, Mode::Absolute, 23),
        Instruction::jeq(IPPROTO_TCP, 0, 8),
        Instruction::load(Width::Half, Mode::Absolute, 20),
        Instruction::jset(IP_FRAGMENT_MASK, 5, 0),
        Instruction::load(Width::Byte, Mode::HeaderLength, 14),
        Instruction::load(Width::Half, Mode::Indexed, 14),
        Instruction::jeq(port, 2, 0),
        Instruction::load(Width::Half, Mode::Indexed, 16),
        Instruction::jeq(port, 0, 1),
        Instruction::Return(ACCEPT),
        Instruction::Return(REJECT),
    ])
}

/// SSH traffic: IPv4 TCP on port 22.
pub fn ssh_filter() -> Result<FilterProgram, CaptureError> {
    tcp_port_filter(SSH_PORT)
}

// ===========================================================================
// Tests
// ===========================================================================
