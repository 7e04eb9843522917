//! Interop services and native contracts reached from generated code.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Script hash of a contract, little-endian as it appears in scripts and tokens.
pub type ContractHash = [u8; 20];

/// StdLib native contract, `0xacce6fd80d44e1796aa0c2c625e9e4e0ce39efc0`.
pub const STDLIB_HASH: ContractHash = [
    0xc0, 0xef, 0x39, 0xce, 0xe0, 0xe4, 0xe9, 0x25, 0xc6, 0xc2, 0xa0, 0x6a, 0x79, 0xe1, 0x44, 0x0d, 0xd8, 0x6f,
    0xce, 0xac,
];

/// Interop services the generator emits `SYSCALL`s for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum Syscall {
    #[strum(serialize = "System.Contract.Call")]
    ContractCall,
    #[strum(serialize = "System.Runtime.Notify")]
    RuntimeNotify,
    #[strum(serialize = "System.Storage.GetContext")]
    StorageGetContext,
    #[strum(serialize = "System.Storage.GetReadOnlyContext")]
    StorageGetReadOnlyContext,
    #[strum(serialize = "System.Storage.Get")]
    StorageGet,
    #[strum(serialize = "System.Storage.Put")]
    StoragePut,
    #[strum(serialize = "System.Iterator.Next")]
    IteratorNext,
    #[strum(serialize = "System.Iterator.Value")]
    IteratorValue,
}

impl Syscall {
    /// `SYSCALL` operand: the first four bytes of the SHA-256 of the service name.
    #[must_use]
    pub fn operand(self) -> [u8; 4] {
        interop_operand(self.into())
    }
}

/// `SYSCALL` operand for an arbitrary service name.
#[must_use]
pub fn interop_operand(name: &str) -> [u8; 4] {
    let digest = Sha256::digest(name.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Numeric interop hash (the operand read as a little-endian `u32`).
#[must_use]
pub fn interop_hash(name: &str) -> u32 {
    u32::from_le_bytes(interop_operand(name))
}

/// Permissions granted to a called contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallFlags(u8);

impl CallFlags {
    pub const NONE: Self = Self(0x00);
    pub const READ_STATES: Self = Self(0x01);
    pub const WRITE_STATES: Self = Self(0x02);
    pub const ALLOW_CALL: Self = Self(0x04);
    pub const ALLOW_NOTIFY: Self = Self(0x08);
    pub const ALL: Self = Self(0x0F);

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for CallFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Entry of the script's method-token table, invoked through `CALLT index`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodToken {
    pub hash: ContractHash,
    pub method: String,
    pub parameters: u16,
    pub has_return_value: bool,
    pub call_flags: CallFlags,
}

impl MethodToken {
    #[must_use]
    pub fn stdlib_serialize() -> Self {
        Self::stdlib("serialize")
    }

    #[must_use]
    pub fn stdlib_deserialize() -> Self {
        Self::stdlib("deserialize")
    }

    fn stdlib(method: &str) -> Self {
        Self {
            hash: STDLIB_HASH,
            method: method.to_owned(),
            parameters: 1,
            has_return_value: true,
            call_flags: CallFlags::ALL,
        }
    }
}
