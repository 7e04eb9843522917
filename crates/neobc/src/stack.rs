//! Shadow operand stack mirrored alongside code emission.
//!
//! Every push, pop or reorder is recorded as a snapshot keyed by the instruction
//! that caused it. Snapshots are keyed by [`CodeId`] rather than by address, so
//! they stay attached to the right instruction when the code map reflows;
//! address queries resolve the handles through the [`CodeMap`] at lookup time.

use ahash::AHashMap;

use crate::{
    bytecode::{CodeId, CodeMap},
    types::ValueType,
};

#[derive(Debug, Clone)]
struct Snapshot {
    code: CodeId,
    stack: Vec<ValueType>,
}

/// Saved position of a [`StackMemento`], restored exactly by [`StackMemento::rollback`].
#[derive(Debug, Clone)]
pub struct StackCheckpoint {
    snapshots: usize,
    current: Vec<ValueType>,
}

/// Per-instruction history of the abstract operand stack.
#[derive(Debug, Default, Clone)]
pub struct StackMemento {
    snapshots: Vec<Snapshot>,
    /// Latest snapshot index per instruction.
    by_code: AHashMap<CodeId, usize>,
    /// Stack after the most recent change; top is the last element.
    current: Vec<ValueType>,
}

impl StackMemento {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.snapshots.clear();
        self.by_code.clear();
        self.current.clear();
    }

    /// Current abstract stack, top last.
    #[must_use]
    pub fn stack(&self) -> &[ValueType] {
        &self.current
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.current.len()
    }

    /// Type `depth` items below the top (`0` is the top), `Any` when the stack is shorter.
    #[must_use]
    pub fn peek(&self, depth: usize) -> ValueType {
        self.current
            .len()
            .checked_sub(depth + 1)
            .map_or(ValueType::Any, |index| self.current[index].clone())
    }

    pub fn push(&mut self, after: Option<CodeId>, ty: ValueType) {
        self.current.push(ty);
        self.record(after);
    }

    /// Pops the top item; an empty stack yields `Any` instead of failing.
    pub fn pop(&mut self, after: Option<CodeId>) -> ValueType {
        self.remove(after, 0)
    }

    /// Removes the item `depth` places below the top.
    pub fn remove(&mut self, after: Option<CodeId>, depth: usize) -> ValueType {
        let Some(index) = self.current.len().checked_sub(depth + 1) else {
            return ValueType::Any;
        };
        let ty = self.current.remove(index);
        self.record(after);
        ty
    }

    /// Reorders the top `count` items: reversed, or with `rotate` the deepest of
    /// them moved to the top (`ROT` semantics).
    pub fn reverse(&mut self, after: Option<CodeId>, count: usize, rotate: bool) {
        let start = self.current.len().saturating_sub(count);
        let window = &mut self.current[start..];
        if rotate {
            window.rotate_left(1.min(window.len()));
        } else {
            window.reverse();
        }
        self.record(after);
    }

    /// Replaces the whole current stack, e.g. after a branch merge or an
    /// unconditional exit.
    pub fn replace(&mut self, after: Option<CodeId>, stack: Vec<ValueType>) {
        self.current = stack;
        self.record(after);
    }

    /// Stack as it was right after the instruction at `address` (or the latest
    /// live instruction before it), empty if nothing was recorded that early.
    #[must_use]
    pub fn get_snapshot(&self, address: u32, map: &CodeMap) -> Vec<ValueType> {
        // walk back from the instruction at `address` to the nearest one with a snapshot
        let mut code = map.get_by_address(address).or_else(|| map.last());
        while let Some(id) = code {
            if let Some(&index) = self.by_code.get(&id) {
                return self.snapshots[index].stack.clone();
            }
            code = map.prev_of(id);
        }
        Vec::new()
    }

    /// Discards every snapshot at or after `address` (or attached to removed
    /// code) and makes the latest remaining one current.
    pub fn restore(&mut self, address: u32, map: &CodeMap) {
        self.snapshots
            .retain(|snapshot| map.start_address(snapshot.code).is_some_and(|start| start < address));
        self.reindex();
        self.current = self.get_snapshot(address, map);
    }

    #[must_use]
    pub fn checkpoint(&self) -> StackCheckpoint {
        StackCheckpoint {
            snapshots: self.snapshots.len(),
            current: self.current.clone(),
        }
    }

    pub fn rollback(&mut self, checkpoint: StackCheckpoint) {
        self.snapshots.truncate(checkpoint.snapshots);
        self.reindex();
        self.current = checkpoint.current;
    }

    fn reindex(&mut self) {
        self.by_code.clear();
        for (index, snapshot) in self.snapshots.iter().enumerate() {
            self.by_code.insert(snapshot.code, index);
        }
    }

    /// Stores `current` as the snapshot of `after`, in place when that
    /// instruction already owns the latest snapshot.
    fn record(&mut self, after: Option<CodeId>) {
        let Some(code) = after else {
            return;
        };
        match self.snapshots.last_mut() {
            Some(last) if last.code == code => last.stack.clone_from(&self.current),
            _ => {
                self.by_code.insert(code, self.snapshots.len());
                self.snapshots.push(Snapshot {
                    code,
                    stack: self.current.clone(),
                });
            }
        }
    }
}
