//! Abstract value types tracked on the shadow stack, and the VM's own
//! stack item type bytes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Type byte used by `ISTYPE`, `CONVERT` and `NEWARRAY_T`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::FromRepr)]
pub enum StackItemType {
    Any = 0x00,
    Pointer = 0x10,
    Boolean = 0x20,
    Integer = 0x21,
    ByteString = 0x28,
    Buffer = 0x30,
    Array = 0x40,
    Struct = 0x41,
    Map = 0x48,
    InteropInterface = 0x60,
}

/// Abstract type tag of a value on the simulated operand stack.
///
/// `Any` doubles as the "unknown" sentinel returned when popping an empty
/// shadow stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    #[default]
    Any,
    None,
    Bool,
    Int,
    /// An integer statically known to be `>= 0` (non-negative literals, `len()`).
    NonNegInt,
    Str,
    Bytes,
    /// Mutable byte buffer.
    ByteArray,
    List(Box<ValueType>),
    Tuple(Box<ValueType>),
    Dict(Box<ValueType>, Box<ValueType>),
    /// A VM iterator object (`InteropInterface`) yielding the inner type.
    Iterator(Box<ValueType>),
    /// Instance of a user class, named by the class.
    Object(String),
}

impl ValueType {
    #[must_use]
    pub fn list_of(item: Self) -> Self {
        Self::List(Box::new(item))
    }

    #[must_use]
    pub fn dict_of(key: Self, value: Self) -> Self {
        Self::Dict(Box::new(key), Box::new(value))
    }

    #[must_use]
    pub fn iterator_of(item: Self) -> Self {
        Self::Iterator(Box::new(item))
    }

    /// VM representation of values of this type.
    #[must_use]
    pub fn stack_item(&self) -> StackItemType {
        match self {
            Self::Any | Self::None => StackItemType::Any,
            Self::Bool => StackItemType::Boolean,
            Self::Int | Self::NonNegInt => StackItemType::Integer,
            Self::Str | Self::Bytes => StackItemType::ByteString,
            Self::ByteArray => StackItemType::Buffer,
            Self::List(_) | Self::Tuple(_) | Self::Object(_) => StackItemType::Array,
            Self::Dict(..) => StackItemType::Map,
            Self::Iterator(_) => StackItemType::InteropInterface,
        }
    }

    #[must_use]
    pub fn is_int(&self) -> bool {
        matches!(self, Self::Int | Self::NonNegInt)
    }

    /// Values stored as VM byte strings or buffers.
    #[must_use]
    pub fn is_byte_like(&self) -> bool {
        matches!(self, Self::Str | Self::Bytes | Self::ByteArray)
    }

    /// Values stored as VM arrays and indexed by position.
    #[must_use]
    pub fn is_array_like(&self) -> bool {
        matches!(self, Self::List(_) | Self::Tuple(_))
    }

    /// Anything supporting positional indexing with Python's negative-index rules.
    #[must_use]
    pub fn is_sequence(&self) -> bool {
        self.is_array_like() || self.is_byte_like()
    }

    /// Type produced by indexing or iterating over a value of this type.
    #[must_use]
    pub fn item_type(&self) -> Self {
        match self {
            Self::List(item) | Self::Tuple(item) | Self::Iterator(item) => (**item).clone(),
            Self::Dict(key, _) => (**key).clone(),
            Self::Str => Self::Str,
            Self::Bytes | Self::ByteArray => Self::NonNegInt,
            _ => Self::Any,
        }
    }

    /// Type produced by `value[key]`.
    #[must_use]
    pub fn subscript_type(&self) -> Self {
        match self {
            Self::Dict(_, value) => (**value).clone(),
            _ => self.item_type(),
        }
    }

    /// Least common type of two branches merging at the same point.
    #[must_use]
    pub fn join(&self, other: &Self) -> Self {
        if self == other {
            return self.clone();
        }
        match (self, other) {
            (a, b) if a.is_int() && b.is_int() => Self::Int,
            (Self::List(a), Self::List(b)) => Self::list_of(a.join(b)),
            _ => Self::Any,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::None => f.write_str("None"),
            Self::Bool => f.write_str("bool"),
            Self::Int | Self::NonNegInt => f.write_str("int"),
            Self::Str => f.write_str("str"),
            Self::Bytes => f.write_str("bytes"),
            Self::ByteArray => f.write_str("bytearray"),
            Self::List(item) => write!(f, "list[{item}]"),
            Self::Tuple(item) => write!(f, "tuple[{item}, ...]"),
            Self::Dict(key, value) => write!(f, "dict[{key}, {value}]"),
            Self::Iterator(item) => write!(f, "Iterator[{item}]"),
            Self::Object(class) => f.write_str(class),
        }
    }
}
