//! Deferred links waiting for the next emitted instruction.
//!
//! Every forward reference the generator produces points at "whatever is
//! emitted next": the instruction after an `if` body, the first instruction of
//! an `except` block, the entry of a method being opened. Because targets are
//! arena handles, no address-keyed bucket is needed; the whole table is the
//! single "next instruction" bucket, drained on every insert.

use ahash::AHashSet;

use crate::bytecode::CodeId;

/// One deferred link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Patch {
    /// Point a jump, call or `ENDTRY` at the next instruction.
    Jump(CodeId),
    /// Fill the except half of a `TRY`.
    TryExcept(CodeId),
    /// Fill the finally half of a `TRY`.
    TryFinally(CodeId),
    /// Record the next instruction as the entry of the named method.
    MethodEntry(String),
}

impl Patch {
    /// Instruction this patch writes into, if any.
    fn code(&self) -> Option<CodeId> {
        match self {
            Self::Jump(code) | Self::TryExcept(code) | Self::TryFinally(code) => Some(*code),
            Self::MethodEntry(_) => None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct PendingTargets {
    next: Vec<Patch>,
}

impl PendingTargets {
    pub fn defer(&mut self, patch: Patch) {
        self.next.push(patch);
    }

    /// Removes and returns every deferred patch.
    pub fn take(&mut self) -> Vec<Patch> {
        std::mem::take(&mut self.next)
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_empty()
    }

    /// Whether a jump-to-next is pending for `code`; removes it when present.
    pub fn cancel_jump(&mut self, code: CodeId) -> bool {
        let before = self.next.len();
        self.next.retain(|patch| *patch != Patch::Jump(code));
        self.next.len() != before
    }

    /// Drops patches writing into instructions that no longer exist.
    pub fn forget(&mut self, removed: &AHashSet<CodeId>) {
        self.next
            .retain(|patch| patch.code().is_none_or(|code| !removed.contains(&code)));
    }

    /// Drops the pending entry link of an abandoned method.
    pub fn forget_method(&mut self, name: &str) {
        self.next
            .retain(|patch| !matches!(patch, Patch::MethodEntry(pending) if pending == name));
    }
}
