//! NeoVM opcode catalog and the static instruction descriptor table.
//!
//! Every opcode carries its exact VM byte value (`#[repr(u8)]`), so an
//! instruction is serialized as `opcode as u8` followed by its operand bytes.
//! [`Opcode::info`] is a pure lookup describing how the operand is laid out and
//! how control-transfer opcodes relate to their wide siblings.

use serde::{Deserialize, Serialize};

/// A NeoVM instruction opcode.
///
/// Variant names follow the VM mnemonics in CamelCase; `Display` renders the
/// canonical upper-case mnemonic (`JMP_L`, `PUSHDATA1`, ...).
#[repr(u8)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::FromRepr,
    strum::EnumIter,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Opcode {
    // constants
    PushInt8 = 0x00,
    PushInt16 = 0x01,
    PushInt32 = 0x02,
    PushInt64 = 0x03,
    PushInt128 = 0x04,
    PushInt256 = 0x05,
    PushT = 0x08,
    PushF = 0x09,
    PushA = 0x0A,
    PushNull = 0x0B,
    PushData1 = 0x0C,
    PushData2 = 0x0D,
    PushData4 = 0x0E,
    PushM1 = 0x0F,
    Push0 = 0x10,
    Push1 = 0x11,
    Push2 = 0x12,
    Push3 = 0x13,
    Push4 = 0x14,
    Push5 = 0x15,
    Push6 = 0x16,
    Push7 = 0x17,
    Push8 = 0x18,
    Push9 = 0x19,
    Push10 = 0x1A,
    Push11 = 0x1B,
    Push12 = 0x1C,
    Push13 = 0x1D,
    Push14 = 0x1E,
    Push15 = 0x1F,
    Push16 = 0x20,

    // flow control
    Nop = 0x21,
    Jmp = 0x22,
    #[strum(serialize = "JMP_L")]
    JmpL = 0x23,
    JmpIf = 0x24,
    #[strum(serialize = "JMPIF_L")]
    JmpIfL = 0x25,
    JmpIfNot = 0x26,
    #[strum(serialize = "JMPIFNOT_L")]
    JmpIfNotL = 0x27,
    JmpEq = 0x28,
    #[strum(serialize = "JMPEQ_L")]
    JmpEqL = 0x29,
    JmpNe = 0x2A,
    #[strum(serialize = "JMPNE_L")]
    JmpNeL = 0x2B,
    JmpGt = 0x2C,
    #[strum(serialize = "JMPGT_L")]
    JmpGtL = 0x2D,
    JmpGe = 0x2E,
    #[strum(serialize = "JMPGE_L")]
    JmpGeL = 0x2F,
    JmpLt = 0x30,
    #[strum(serialize = "JMPLT_L")]
    JmpLtL = 0x31,
    JmpLe = 0x32,
    #[strum(serialize = "JMPLE_L")]
    JmpLeL = 0x33,
    Call = 0x34,
    #[strum(serialize = "CALL_L")]
    CallL = 0x35,
    CallA = 0x36,
    CallT = 0x37,
    Abort = 0x38,
    Assert = 0x39,
    Throw = 0x3A,
    Try = 0x3B,
    #[strum(serialize = "TRY_L")]
    TryL = 0x3C,
    EndTry = 0x3D,
    #[strum(serialize = "ENDTRY_L")]
    EndTryL = 0x3E,
    EndFinally = 0x3F,
    Ret = 0x40,
    Syscall = 0x41,

    // stack
    Depth = 0x43,
    Drop = 0x45,
    Nip = 0x46,
    XDrop = 0x48,
    Clear = 0x49,
    Dup = 0x4A,
    Over = 0x4B,
    Pick = 0x4D,
    Tuck = 0x4E,
    Swap = 0x50,
    Rot = 0x51,
    Roll = 0x52,
    Reverse3 = 0x53,
    Reverse4 = 0x54,
    ReverseN = 0x55,

    // slots
    InitSSlot = 0x56,
    InitSlot = 0x57,
    LdSFld0 = 0x58,
    LdSFld1 = 0x59,
    LdSFld2 = 0x5A,
    LdSFld3 = 0x5B,
    LdSFld4 = 0x5C,
    LdSFld5 = 0x5D,
    LdSFld6 = 0x5E,
    LdSFld = 0x5F,
    StSFld0 = 0x60,
    StSFld1 = 0x61,
    StSFld2 = 0x62,
    StSFld3 = 0x63,
    StSFld4 = 0x64,
    StSFld5 = 0x65,
    StSFld6 = 0x66,
    StSFld = 0x67,
    LdLoc0 = 0x68,
    LdLoc1 = 0x69,
    LdLoc2 = 0x6A,
    LdLoc3 = 0x6B,
    LdLoc4 = 0x6C,
    LdLoc5 = 0x6D,
    LdLoc6 = 0x6E,
    LdLoc = 0x6F,
    StLoc0 = 0x70,
    StLoc1 = 0x71,
    StLoc2 = 0x72,
    StLoc3 = 0x73,
    StLoc4 = 0x74,
    StLoc5 = 0x75,
    StLoc6 = 0x76,
    StLoc = 0x77,
    LdArg0 = 0x78,
    LdArg1 = 0x79,
    LdArg2 = 0x7A,
    LdArg3 = 0x7B,
    LdArg4 = 0x7C,
    LdArg5 = 0x7D,
    LdArg6 = 0x7E,
    LdArg = 0x7F,
    StArg0 = 0x80,
    StArg1 = 0x81,
    StArg2 = 0x82,
    StArg3 = 0x83,
    StArg4 = 0x84,
    StArg5 = 0x85,
    StArg6 = 0x86,
    StArg = 0x87,

    // splice
    NewBuffer = 0x88,
    MemCpy = 0x89,
    Cat = 0x8B,
    SubStr = 0x8C,
    Left = 0x8D,
    Right = 0x8E,

    // bitwise logic
    Invert = 0x90,
    And = 0x91,
    Or = 0x92,
    Xor = 0x93,
    Equal = 0x97,
    NotEqual = 0x98,

    // arithmetic
    Sign = 0x99,
    Abs = 0x9A,
    Negate = 0x9B,
    Inc = 0x9C,
    Dec = 0x9D,
    Add = 0x9E,
    Sub = 0x9F,
    Mul = 0xA0,
    Div = 0xA1,
    Mod = 0xA2,
    Pow = 0xA3,
    Sqrt = 0xA4,
    ModMul = 0xA5,
    ModPow = 0xA6,
    Shl = 0xA8,
    Shr = 0xA9,
    Not = 0xAA,
    BoolAnd = 0xAB,
    BoolOr = 0xAC,
    Nz = 0xB1,
    NumEqual = 0xB3,
    NumNotEqual = 0xB4,
    Lt = 0xB5,
    Le = 0xB6,
    Gt = 0xB7,
    Ge = 0xB8,
    Min = 0xB9,
    Max = 0xBA,
    Within = 0xBB,

    // compound types
    PackMap = 0xBE,
    PackStruct = 0xBF,
    Pack = 0xC0,
    Unpack = 0xC1,
    NewArray0 = 0xC2,
    NewArray = 0xC3,
    #[strum(serialize = "NEWARRAY_T")]
    NewArrayT = 0xC4,
    NewStruct0 = 0xC5,
    NewStruct = 0xC6,
    NewMap = 0xC8,
    Size = 0xCA,
    HasKey = 0xCB,
    Keys = 0xCC,
    Values = 0xCD,
    PickItem = 0xCE,
    Append = 0xCF,
    SetItem = 0xD0,
    ReverseItems = 0xD1,
    Remove = 0xD2,
    ClearItems = 0xD3,
    PopItem = 0xD4,

    // types
    IsNull = 0xD8,
    IsType = 0xD9,
    Convert = 0xDB,

    // extensions
    AbortMsg = 0xE0,
    AssertMsg = 0xE1,
}

/// Static description of an opcode's encoding.
///
/// Returned by [`Opcode::info`]; never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeInfo {
    /// Fixed operand length in bytes (0 for no operand or for length-prefixed data).
    pub operand_size: usize,
    /// Width of the length prefix for `PUSHDATA*` opcodes, 0 otherwise.
    pub size_prefix: usize,
    /// Largest payload accepted after the length prefix.
    pub max_data_len: usize,
    /// Stack items consumed when the instruction is decoded (conditional jumps only).
    pub stack_items: u8,
    /// Wide (4-byte offset) sibling of a narrow control-transfer opcode.
    pub wide: Option<Opcode>,
    /// Whether the operand is derived from a symbolic target rather than stored.
    pub has_target: bool,
}

impl OpcodeInfo {
    const fn plain(operand_size: usize) -> Self {
        Self {
            operand_size,
            size_prefix: 0,
            max_data_len: 0,
            stack_items: 0,
            wide: None,
            has_target: false,
        }
    }

    const fn data(size_prefix: usize, max_data_len: usize) -> Self {
        Self {
            operand_size: 0,
            size_prefix,
            max_data_len,
            stack_items: 0,
            wide: None,
            has_target: false,
        }
    }

    const fn jump(operand_size: usize, stack_items: u8, wide: Option<Opcode>) -> Self {
        Self {
            operand_size,
            size_prefix: 0,
            max_data_len: 0,
            stack_items,
            wide,
            has_target: true,
        }
    }
}

impl Opcode {
    /// Looks up the encoding descriptor for this opcode.
    #[must_use]
    pub const fn info(self) -> OpcodeInfo {
        match self {
            Self::PushInt8 => OpcodeInfo::plain(1),
            Self::PushInt16 => OpcodeInfo::plain(2),
            Self::PushInt32 | Self::PushA | Self::Syscall => OpcodeInfo::plain(4),
            Self::PushInt64 => OpcodeInfo::plain(8),
            Self::PushInt128 => OpcodeInfo::plain(16),
            Self::PushInt256 => OpcodeInfo::plain(32),
            Self::PushData1 => OpcodeInfo::data(1, u8::MAX as usize),
            Self::PushData2 => OpcodeInfo::data(2, u16::MAX as usize),
            Self::PushData4 => OpcodeInfo::data(4, u32::MAX as usize),

            Self::Jmp => OpcodeInfo::jump(1, 0, Some(Self::JmpL)),
            Self::JmpIf => OpcodeInfo::jump(1, 1, Some(Self::JmpIfL)),
            Self::JmpIfNot => OpcodeInfo::jump(1, 1, Some(Self::JmpIfNotL)),
            Self::JmpEq => OpcodeInfo::jump(1, 2, Some(Self::JmpEqL)),
            Self::JmpNe => OpcodeInfo::jump(1, 2, Some(Self::JmpNeL)),
            Self::JmpGt => OpcodeInfo::jump(1, 2, Some(Self::JmpGtL)),
            Self::JmpGe => OpcodeInfo::jump(1, 2, Some(Self::JmpGeL)),
            Self::JmpLt => OpcodeInfo::jump(1, 2, Some(Self::JmpLtL)),
            Self::JmpLe => OpcodeInfo::jump(1, 2, Some(Self::JmpLeL)),
            Self::Call => OpcodeInfo::jump(1, 0, Some(Self::CallL)),
            Self::EndTry => OpcodeInfo::jump(1, 0, Some(Self::EndTryL)),
            Self::Try => OpcodeInfo::jump(2, 0, Some(Self::TryL)),

            Self::JmpL | Self::CallL | Self::EndTryL => OpcodeInfo::jump(4, 0, None),
            Self::JmpIfL | Self::JmpIfNotL => OpcodeInfo::jump(4, 1, None),
            Self::JmpEqL | Self::JmpNeL | Self::JmpGtL | Self::JmpGeL | Self::JmpLtL | Self::JmpLeL => {
                OpcodeInfo::jump(4, 2, None)
            }
            Self::TryL => OpcodeInfo::jump(8, 0, None),

            Self::CallT | Self::InitSlot => OpcodeInfo::plain(2),
            Self::InitSSlot
            | Self::LdSFld
            | Self::StSFld
            | Self::LdLoc
            | Self::StLoc
            | Self::LdArg
            | Self::StArg
            | Self::NewArrayT
            | Self::IsType
            | Self::Convert => OpcodeInfo::plain(1),

            _ => OpcodeInfo::plain(0),
        }
    }

    /// Narrow sibling of a wide control-transfer opcode.
    #[must_use]
    pub fn narrow(self) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|op| op.info().wide == Some(self))
    }

    /// Whether this opcode's operand is a relative offset to another instruction.
    #[must_use]
    pub const fn has_target(self) -> bool {
        self.info().has_target
    }

    /// Whether this is the wide (4-byte offset) form of a control-transfer opcode.
    #[must_use]
    pub fn is_wide(self) -> bool {
        self.has_target() && self.info().wide.is_none()
    }

    /// Unconditional jumps (`JMP`, `JMP_L`).
    #[must_use]
    pub const fn is_unconditional_jump(self) -> bool {
        matches!(self, Self::Jmp | Self::JmpL)
    }

    /// Conditional jumps, which fall through when the condition does not hold.
    #[must_use]
    pub const fn is_conditional_jump(self) -> bool {
        self.info().has_target && self.info().stack_items > 0
    }

    /// Relative calls into the same script (`CALL`, `CALL_L`).
    #[must_use]
    pub const fn is_call(self) -> bool {
        matches!(self, Self::Call | Self::CallL)
    }

    /// Opcodes after which execution never falls through to the next instruction.
    #[must_use]
    pub const fn ends_flow(self) -> bool {
        matches!(
            self,
            Self::Jmp
                | Self::JmpL
                | Self::Ret
                | Self::Throw
                | Self::Abort
                | Self::AbortMsg
                | Self::EndTry
                | Self::EndTryL
                | Self::EndFinally
        )
    }

    /// Total encoded size of an instruction with this opcode and a payload of `data_len` bytes.
    #[must_use]
    pub const fn encoded_size(self, data_len: usize) -> usize {
        let info = self.info();
        if info.size_prefix > 0 {
            1 + info.size_prefix + data_len
        } else {
            1 + info.operand_size
        }
    }

    /// `PUSH0`..`PUSH16` and `PUSHM1` for values in `-1..=16`.
    #[must_use]
    pub fn push_small(value: i64) -> Option<Self> {
        match value {
            -1 => Some(Self::PushM1),
            0..=16 => Self::from_repr(Self::Push0 as u8 + u8::try_from(value).ok()?),
            _ => None,
        }
    }

    /// Value pushed by a `PUSHM1`/`PUSH0`..`PUSH16` opcode.
    #[must_use]
    pub fn small_value(self) -> Option<i64> {
        match self {
            Self::PushM1 => Some(-1),
            op if (Self::Push0 as u8..=Self::Push16 as u8).contains(&(op as u8)) => {
                Some(i64::from(op as u8 - Self::Push0 as u8))
            }
            _ => None,
        }
    }

    /// Smallest length-prefixed push able to carry `len` bytes.
    #[must_use]
    pub fn push_data_for(len: usize) -> Self {
        if len <= Self::PushData1.info().max_data_len {
            Self::PushData1
        } else if len <= Self::PushData2.info().max_data_len {
            Self::PushData2
        } else {
            Self::PushData4
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_repr(byte).ok_or(byte)
    }
}
