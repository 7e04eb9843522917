//! Compile-time literal values handed to the generator by the front end.

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::types::ValueType;

/// A literal of one of the seven categories the generator can materialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Literal {
    None,
    Bool(bool),
    Int(BigInt),
    Str(String),
    Bytes(Vec<u8>),
    /// Lists and tuples, lowered to VM arrays.
    Sequence(Vec<Literal>),
    /// Dict literal; pairs keep source order.
    Mapping(Vec<(Literal, Literal)>),
}

impl Literal {
    /// Shadow-stack type pushed when this literal is emitted.
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::None => ValueType::None,
            Self::Bool(_) => ValueType::Bool,
            Self::Int(value) if value.sign() == num_bigint::Sign::Minus => ValueType::Int,
            Self::Int(_) => ValueType::NonNegInt,
            Self::Str(_) => ValueType::Str,
            Self::Bytes(_) => ValueType::Bytes,
            Self::Sequence(items) => ValueType::list_of(common_type(items.iter().map(Self::value_type))),
            Self::Mapping(pairs) => ValueType::dict_of(
                common_type(pairs.iter().map(|(key, _)| key.value_type())),
                common_type(pairs.iter().map(|(_, value)| value.value_type())),
            ),
        }
    }
}

fn common_type(mut types: impl Iterator<Item = ValueType>) -> ValueType {
    let Some(first) = types.next() else {
        return ValueType::Any;
    };
    types.fold(first, |acc, ty| acc.join(&ty))
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Self::Int(BigInt::from(value))
    }
}

impl From<BigInt> for Literal {
    fn from(value: BigInt) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<Vec<u8>> for Literal {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}
