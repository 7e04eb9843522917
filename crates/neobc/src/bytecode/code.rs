//! Single emitted instruction and its symbolic target.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::opcode::Opcode;

/// Stable handle of an instruction inside a [`CodeMap`](super::CodeMap) arena.
///
/// Handles survive insertions, removals and relocations of other instructions,
/// so jump targets never need rewriting when addresses shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CodeId(u32);

impl CodeId {
    pub(crate) fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("instruction arena exceeds u32"))
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Symbolic destination of a control-transfer instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// Not known yet; encoded as a zero offset.
    Unresolved,
    /// Start of another instruction.
    Code(CodeId),
    /// One past the last instruction of the script.
    End,
    /// `TRY` handler pair; a missing half is encoded as a zero offset.
    Try {
        except: Option<CodeId>,
        finally: Option<CodeId>,
    },
}

impl Target {
    /// Every instruction referenced by this target.
    pub fn codes(self) -> impl Iterator<Item = CodeId> {
        let (a, b) = match self {
            Self::Code(code) => (Some(code), None),
            Self::Try { except, finally } => (except, finally),
            Self::Unresolved | Self::End => (None, None),
        };
        a.into_iter().chain(b)
    }

    /// Replaces every reference to `old` with `new` (or drops it when `new` is `None`).
    #[must_use]
    pub fn retarget(self, old: CodeId, new: Option<CodeId>) -> Self {
        let swap = |slot: Option<CodeId>| if slot == Some(old) { new } else { slot };
        match self {
            Self::Code(code) if code == old => new.map_or(Self::Unresolved, Self::Code),
            Self::Try { except, finally } => Self::Try {
                except: swap(except),
                finally: swap(finally),
            },
            other => other,
        }
    }
}

/// One emitted instruction: opcode, operand payload and optional target.
///
/// For target-bearing opcodes the operand is never stored; it is derived from
/// the current addresses of this instruction and its target when encoding.
/// For `PUSHDATA*` the payload excludes the length prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmCode {
    opcode: Opcode,
    data: SmallVec<[u8; 4]>,
    target: Target,
}

impl VmCode {
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        Self::with_data(opcode, &[])
    }

    /// Instruction carrying an explicit operand (or `PUSHDATA*` payload).
    ///
    /// # Panics
    ///
    /// Panics when the operand length disagrees with the opcode descriptor.
    #[must_use]
    pub fn with_data(opcode: Opcode, data: &[u8]) -> Self {
        let info = opcode.info();
        if info.size_prefix > 0 {
            assert!(data.len() <= info.max_data_len, "{opcode} payload too long: {}", data.len());
        } else if !info.has_target {
            assert_eq!(data.len(), info.operand_size, "{opcode} operand size mismatch");
        }
        Self {
            opcode,
            data: SmallVec::from_slice(data),
            target: Target::Unresolved,
        }
    }

    /// Control-transfer instruction with a (possibly unresolved) target.
    #[must_use]
    pub fn jump(opcode: Opcode, target: Target) -> Self {
        debug_assert!(opcode.has_target(), "{opcode} does not carry a target");
        Self {
            opcode,
            data: SmallVec::new(),
            target,
        }
    }

    #[must_use]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Target of a control-transfer instruction, `None` for other opcodes.
    #[must_use]
    pub fn target(&self) -> Option<Target> {
        self.opcode.has_target().then_some(self.target)
    }

    pub(crate) fn set_target(&mut self, target: Target) {
        debug_assert!(self.opcode.has_target(), "{} does not carry a target", self.opcode);
        self.target = target;
    }

    /// Swaps a narrow control-transfer opcode for a sibling; the target is kept.
    pub(crate) fn set_opcode(&mut self, opcode: Opcode) {
        debug_assert!(opcode.has_target() && self.opcode.has_target());
        self.opcode = opcode;
    }

    /// Encoded size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.opcode.encoded_size(self.data.len())
    }

    /// Integer pushed by this instruction, if it is a constant integer push.
    #[must_use]
    pub fn pushed_int(&self) -> Option<num_bigint::BigInt> {
        if let Some(value) = self.opcode.small_value() {
            return Some(value.into());
        }
        match self.opcode {
            Opcode::PushInt8
            | Opcode::PushInt16
            | Opcode::PushInt32
            | Opcode::PushInt64
            | Opcode::PushInt128
            | Opcode::PushInt256 => Some(num_bigint::BigInt::from_signed_bytes_le(&self.data)),
            _ => None,
        }
    }

    /// Appends the encoded instruction to `out`.
    ///
    /// `address` is this instruction's start; `resolve` maps a target to its
    /// current start address, and `end` is the script length.
    pub(crate) fn encode(&self, address: u32, end: u32, resolve: impl Fn(CodeId) -> u32, out: &mut Vec<u8>) {
        out.push(self.opcode as u8);
        let info = self.opcode.info();
        if !info.has_target {
            match info.size_prefix {
                0 => {}
                1 => out.push(u8::try_from(self.data.len()).expect("PUSHDATA1 payload exceeds u8")),
                2 => out.extend_from_slice(
                    &u16::try_from(self.data.len())
                        .expect("PUSHDATA2 payload exceeds u16")
                        .to_le_bytes(),
                ),
                _ => out.extend_from_slice(
                    &u32::try_from(self.data.len())
                        .expect("PUSHDATA4 payload exceeds u32")
                        .to_le_bytes(),
                ),
            }
            out.extend_from_slice(&self.data);
            return;
        }

        let offset_to = |destination: Option<u32>| -> i64 {
            destination.map_or(0, |dest| i64::from(dest) - i64::from(address))
        };
        let (first, second) = match self.target {
            Target::Unresolved => (0, None),
            Target::Code(code) => (offset_to(Some(resolve(code))), None),
            Target::End => (offset_to(Some(end)), None),
            Target::Try { except, finally } => (
                offset_to(except.map(&resolve)),
                Some(offset_to(finally.map(&resolve))),
            ),
        };
        let width = if second.is_some() {
            info.operand_size / 2
        } else {
            info.operand_size
        };
        write_offset(first, width, self.opcode, out);
        if let Some(second) = second {
            write_offset(second, width, self.opcode, out);
        }
    }
}

/// Whether `offset` fits a signed operand of `width` bytes.
pub(crate) fn offset_fits(offset: i64, width: usize) -> bool {
    match width {
        1 => i8::try_from(offset).is_ok(),
        _ => i32::try_from(offset).is_ok(),
    }
}

fn write_offset(offset: i64, width: usize, opcode: Opcode, out: &mut Vec<u8>) {
    match width {
        1 => {
            let narrow = i8::try_from(offset).unwrap_or_else(|_| panic!("{opcode} offset {offset} exceeds i8"));
            out.extend_from_slice(&narrow.to_le_bytes());
        }
        _ => {
            let wide = i32::try_from(offset).unwrap_or_else(|_| panic!("{opcode} offset {offset} exceeds i32"));
            out.extend_from_slice(&wide.to_le_bytes());
        }
    }
}
