//! Classic BPF programs
//!
//! A [`FilterProgram`] is the backend-neutral form of a filter compiled by
//! libpcap. The raw-socket backend hands it to the kernel after re-encoding
//! it as `sock_filter` entries, the live backend installs the expression it
//! was compiled from on the pcap handle, and the replay backend runs it
//! through [`FilterProgram::run`].

use sniwatch_core::{Error, Result};
use std::fmt;

/// Instruction classes
pub const BPF_LD: u16 = 0x00;
pub const BPF_LDX: u16 = 0x01;
pub const BPF_ST: u16 = 0x02;
pub const BPF_STX: u16 = 0x03;
pub const BPF_ALU: u16 = 0x04;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;
pub const BPF_MISC: u16 = 0x07;

/// Load sizes
pub const BPF_W: u16 = 0x00;
pub const BPF_H: u16 = 0x08;
pub const BPF_B: u16 = 0x10;

/// Addressing modes
pub const BPF_IMM: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;
pub const BPF_IND: u16 = 0x40;
pub const BPF_MEM: u16 = 0x60;
pub const BPF_LEN: u16 = 0x80;
pub const BPF_MSH: u16 = 0xa0;

/// ALU operations
pub const BPF_ADD: u16 = 0x00;
pub const BPF_SUB: u16 = 0x10;
pub const BPF_MUL: u16 = 0x20;
pub const BPF_DIV: u16 = 0x30;
pub const BPF_OR: u16 = 0x40;
pub const BPF_AND: u16 = 0x50;
pub const BPF_LSH: u16 = 0x60;
pub const BPF_RSH: u16 = 0x70;
pub const BPF_NEG: u16 = 0x80;
pub const BPF_MOD: u16 = 0x90;
pub const BPF_XOR: u16 = 0xa0;

/// Jump conditions
pub const BPF_JA: u16 = 0x00;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGT: u16 = 0x20;
pub const BPF_JGE: u16 = 0x30;
pub const BPF_JSET: u16 = 0x40;

/// Operand sources
pub const BPF_K: u16 = 0x00;
pub const BPF_X: u16 = 0x08;
pub const BPF_A: u16 = 0x10;

/// Register transfers
pub const BPF_TAX: u16 = 0x00;
pub const BPF_TXA: u16 = 0x80;

/// Kernel limit on program length
pub const BPF_MAXINSNS: usize = 4096;

/// Scratch memory slots
pub const BPF_MEMWORDS: usize = 16;

/// One classic BPF instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterInstruction {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl FilterInstruction {
    pub const fn new(code: u16, jt: u8, jf: u8, k: u32) -> Self {
        FilterInstruction { code, jt, jf, k }
    }

    /// Non-jump instruction
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self::new(code, 0, 0, k)
    }

    /// Conditional jump
    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self::new(code, jt, jf, k)
    }

    pub fn class(&self) -> u16 {
        self.code & 0x07
    }
}

impl fmt::Display for FilterInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ 0x{:02x}, {}, {}, 0x{:08x} }}",
            self.code, self.jt, self.jf, self.k
        )
    }
}

/// A compiled filter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterProgram {
    instructions: Vec<FilterInstruction>,
    expression: Option<String>,
}

impl FilterProgram {
    /// Wrap and validate a sequence of instructions
    pub fn new(instructions: Vec<FilterInstruction>) -> Result<Self> {
        let program = FilterProgram {
            instructions,
            expression: None,
        };
        program.validate()?;
        Ok(program)
    }

    /// Record the expression this program was compiled from
    pub fn with_expression<S: Into<String>>(mut self, expression: S) -> Self {
        self.expression = Some(expression.into());
        self
    }

    /// Source expression, if the program came from the compiler
    pub fn expression(&self) -> Option<&str> {
        self.expression.as_deref()
    }

    /// Program accepting every frame, truncated to `snaplen`
    pub fn accept_all(snaplen: u32) -> Self {
        FilterProgram {
            instructions: vec![FilterInstruction::stmt(BPF_RET | BPF_K, snaplen)],
            expression: None,
        }
    }

    /// Program rejecting every frame
    pub fn reject_all() -> Self {
        FilterProgram {
            instructions: vec![FilterInstruction::stmt(BPF_RET | BPF_K, 0)],
            expression: None,
        }
    }

    pub fn instructions(&self) -> &[FilterInstruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Check the constraints the kernel verifier enforces
    pub fn validate(&self) -> Result<()> {
        let len = self.instructions.len();
        if len == 0 {
            return Err(Error::invalid_config("filter program is empty"));
        }
        if len > BPF_MAXINSNS {
            return Err(Error::FilterTooComplex(format!(
                "{} instructions exceeds the limit of {}",
                len, BPF_MAXINSNS
            )));
        }

        for (pc, insn) in self.instructions.iter().enumerate() {
            let remaining = len - pc - 1;
            match insn.class() {
                BPF_JMP if insn.code & 0xf0 == BPF_JA => {
                    if insn.k as usize >= remaining {
                        return Err(Error::FilterTooComplex(format!(
                            "jump at {} leaves the program",
                            pc
                        )));
                    }
                }
                BPF_JMP => {
                    if insn.jt as usize >= remaining || insn.jf as usize >= remaining {
                        return Err(Error::FilterTooComplex(format!(
                            "branch at {} leaves the program",
                            pc
                        )));
                    }
                }
                BPF_LD | BPF_LDX if insn.code & 0xe0 == BPF_MEM => {
                    if insn.k as usize >= BPF_MEMWORDS {
                        return Err(Error::invalid_config(format!(
                            "scratch slot {} out of range at {}",
                            insn.k, pc
                        )));
                    }
                }
                BPF_ST | BPF_STX => {
                    if insn.k as usize >= BPF_MEMWORDS {
                        return Err(Error::invalid_config(format!(
                            "scratch slot {} out of range at {}",
                            insn.k, pc
                        )));
                    }
                }
                BPF_ALU if matches!(insn.code & 0xf0, BPF_DIV | BPF_MOD) => {
                    // A zero register divisor rejects at run time instead
                    if insn.code & BPF_X == 0 && insn.k == 0 {
                        return Err(Error::invalid_config(format!("division by zero at {}", pc)));
                    }
                }
                _ => {}
            }
        }

        match self.instructions.last() {
            Some(last) if last.class() == BPF_RET => Ok(()),
            _ => Err(Error::invalid_config(
                "filter program does not end with a return",
            )),
        }
    }

    /// Run the program over `packet`
    ///
    /// Returns the number of bytes to keep; zero means reject. Loads past
    /// the end of the packet reject, as in the kernel.
    pub fn run(&self, packet: &[u8]) -> u32 {
        let mut a: u32 = 0;
        let mut x: u32 = 0;
        let mut mem = [0u32; BPF_MEMWORDS];
        let mut pc = 0usize;

        while let Some(insn) = self.instructions.get(pc) {
            pc += 1;
            let k = insn.k;

            match insn.class() {
                BPF_LD => {
                    a = match insn.code & 0xe0 {
                        BPF_IMM => k,
                        BPF_LEN => packet.len() as u32,
                        BPF_MEM => mem[(k as usize) % BPF_MEMWORDS],
                        BPF_ABS => match load(packet, k as usize, insn.code & 0x18) {
                            Some(value) => value,
                            None => return 0,
                        },
                        BPF_IND => {
                            let offset = (x as usize).wrapping_add(k as usize);
                            match load(packet, offset, insn.code & 0x18) {
                                Some(value) => value,
                                None => return 0,
                            }
                        }
                        _ => return 0,
                    };
                }
                BPF_LDX => {
                    x = match insn.code & 0xe0 {
                        BPF_IMM => k,
                        BPF_LEN => packet.len() as u32,
                        BPF_MEM => mem[(k as usize) % BPF_MEMWORDS],
                        BPF_MSH => match packet.get(k as usize) {
                            Some(byte) => ((byte & 0x0f) as u32) << 2,
                            None => return 0,
                        },
                        _ => return 0,
                    };
                }
                BPF_ST => mem[(k as usize) % BPF_MEMWORDS] = a,
                BPF_STX => mem[(k as usize) % BPF_MEMWORDS] = x,
                BPF_ALU => {
                    let operand = if insn.code & BPF_X != 0 { x } else { k };
                    a = match insn.code & 0xf0 {
                        BPF_ADD => a.wrapping_add(operand),
                        BPF_SUB => a.wrapping_sub(operand),
                        BPF_MUL => a.wrapping_mul(operand),
                        BPF_DIV => match a.checked_div(operand) {
                            Some(value) => value,
                            None => return 0,
                        },
                        BPF_MOD => match a.checked_rem(operand) {
                            Some(value) => value,
                            None => return 0,
                        },
                        BPF_OR => a | operand,
                        BPF_AND => a & operand,
                        BPF_XOR => a ^ operand,
                        BPF_LSH => a.checked_shl(operand).unwrap_or(0),
                        BPF_RSH => a.checked_shr(operand).unwrap_or(0),
                        BPF_NEG => a.wrapping_neg(),
                        _ => return 0,
                    };
                }
                BPF_JMP => {
                    let operand = if insn.code & BPF_X != 0 { x } else { k };
                    let taken = match insn.code & 0xf0 {
                        BPF_JA => {
                            pc = pc.saturating_add(k as usize);
                            continue;
                        }
                        BPF_JEQ => a == operand,
                        BPF_JGT => a > operand,
                        BPF_JGE => a >= operand,
                        BPF_JSET => a & operand != 0,
                        _ => return 0,
                    };
                    let skip = if taken { insn.jt } else { insn.jf };
                    pc += skip as usize;
                }
                BPF_RET => {
                    return if insn.code & 0x18 == BPF_A { a } else { k };
                }
                BPF_MISC => {
                    if insn.code & 0xf8 == BPF_TXA {
                        a = x;
                    } else {
                        x = a;
                    }
                }
                _ => return 0,
            }
        }

        // Fell off the end: only possible for unvalidated programs
        0
    }

    /// True if the program accepts `packet`
    pub fn matches(&self, packet: &[u8]) -> bool {
        self.run(packet) != 0
    }

    /// Re-encode for `SO_ATTACH_FILTER`
    #[cfg(target_os = "linux")]
    pub fn to_sock_filters(&self) -> Vec<libc::sock_filter> {
        self.instructions
            .iter()
            .map(|insn| libc::sock_filter {
                code: insn.code,
                jt: insn.jt,
                jf: insn.jf,
                k: insn.k,
            })
            .collect()
    }
}

impl fmt::Display for FilterProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, insn) in self.instructions.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(f, "{},", insn)?;
        }
        Ok(())
    }
}

fn load(packet: &[u8], offset: usize, size: u16) -> Option<u32> {
    match size {
        BPF_W => {
            let bytes = packet.get(offset..offset.checked_add(4)?)?;
            Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
        BPF_H => {
            let bytes = packet.get(offset..offset.checked_add(2)?)?;
            Some(u16::from_be_bytes([bytes[0], bytes[1]]) as u32)
        }
        BPF_B => packet.get(offset).map(|byte| *byte as u32),
        _ => None,
    }
}
