//! Linear, re-addressable instruction store.
//!
//! `CodeMap` owns every emitted [`VmCode`] in an arena and keeps an ordered
//! view of the live instructions with their start addresses. Addresses are
//! always contiguous: the instruction at position `i + 1` starts exactly where
//! the one at `i` ends. Every mutation that changes sizes or order reflows the
//! addresses from the first affected position.

use std::collections::BTreeSet;

use super::{
    code::{CodeId, Target, VmCode, offset_fits},
    opcode::Opcode,
};

/// Ordered instruction store with address lookup in both directions.
#[derive(Debug, Default, Clone)]
pub struct CodeMap {
    /// Every instruction ever inserted, indexed by `CodeId`. Removed entries stay
    /// here so stale handles can still be inspected.
    arena: Vec<VmCode>,
    /// Live instructions in address order.
    order: Vec<CodeId>,
    /// Start address of `order[i]`.
    addresses: Vec<u32>,
    /// Position in `order` for each arena entry, `None` once removed.
    positions: Vec<Option<usize>>,
    /// Live instructions whose opcode carries a target.
    with_target: BTreeSet<CodeId>,
    /// Total encoded size, which is also the next instruction's address.
    size: u32,
}

impl CodeMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every instruction, returning the map to its freshly created state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Appends an instruction at the current end address.
    pub fn insert(&mut self, code: VmCode) -> CodeId {
        let id = CodeId::new(self.arena.len());
        let size = instruction_size(&code);
        if code.opcode().has_target() {
            self.with_target.insert(id);
        }
        self.arena.push(code);
        self.positions.push(Some(self.order.len()));
        self.order.push(id);
        self.addresses.push(self.size);
        self.size += size;
        id
    }

    /// Total byte length of the live instructions.
    #[must_use]
    pub fn bytecode_size(&self) -> u32 {
        self.size
    }

    /// Number of live instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Instruction behind a handle, live or removed.
    #[must_use]
    pub fn code(&self, id: CodeId) -> &VmCode {
        &self.arena[id.index()]
    }

    /// Whether the handle refers to a live instruction.
    #[must_use]
    pub fn contains(&self, id: CodeId) -> bool {
        self.position(id).is_some()
    }

    fn position(&self, id: CodeId) -> Option<usize> {
        self.positions.get(id.index()).copied().flatten()
    }

    /// Instruction starting at `address`, or the one whose span contains it.
    #[must_use]
    pub fn get_by_address(&self, address: u32) -> Option<CodeId> {
        if address >= self.size {
            return None;
        }
        let index = self.addresses.partition_point(|&start| start <= address);
        index.checked_sub(1).map(|i| self.order[i])
    }

    /// Instruction starting exactly at `address`.
    #[must_use]
    pub fn get_exact(&self, address: u32) -> Option<CodeId> {
        self.addresses
            .binary_search(&address)
            .ok()
            .map(|index| self.order[index])
    }

    #[must_use]
    pub fn start_address(&self, id: CodeId) -> Option<u32> {
        self.position(id).map(|index| self.addresses[index])
    }

    /// Address of the last byte of the instruction.
    #[must_use]
    pub fn end_address(&self, id: CodeId) -> Option<u32> {
        self.start_address(id)
            .map(|start| start + instruction_size(self.code(id)) - 1)
    }

    #[must_use]
    pub fn first(&self) -> Option<CodeId> {
        self.order.first().copied()
    }

    #[must_use]
    pub fn last(&self) -> Option<CodeId> {
        self.order.last().copied()
    }

    /// Live instruction following `id` in address order.
    #[must_use]
    pub fn next_of(&self, id: CodeId) -> Option<CodeId> {
        self.position(id).and_then(|index| self.order.get(index + 1).copied())
    }

    /// Live instruction preceding `id` in address order.
    #[must_use]
    pub fn prev_of(&self, id: CodeId) -> Option<CodeId> {
        self.position(id)
            .and_then(|index| index.checked_sub(1))
            .map(|index| self.order[index])
    }

    /// Live instructions in address order with their start addresses.
    pub fn iter(&self) -> impl Iterator<Item = (u32, CodeId, &VmCode)> + '_ {
        self.order
            .iter()
            .zip(&self.addresses)
            .map(|(&id, &address)| (address, id, self.code(id)))
    }

    /// Live instructions lying entirely inside the inclusive range `[start, end]`.
    #[must_use]
    pub fn codes_in_range(&self, start: u32, end: u32) -> Vec<CodeId> {
        let (lo, hi) = self.index_range(start, end);
        self.order[lo..hi].to_vec()
    }

    /// Live instructions carrying a target, in handle order.
    pub fn codes_with_target(&self) -> impl Iterator<Item = CodeId> + '_ {
        self.with_target.iter().copied()
    }

    pub(crate) fn set_target(&mut self, id: CodeId, target: Target) {
        self.arena[id.index()].set_target(target);
    }

    /// Deletes the instructions lying entirely inside `[start, end]` and reflows
    /// the addresses after them. Returns the removed handles.
    ///
    /// Targets pointing at removed instructions are left untouched; the caller
    /// rescans [`codes_with_target`](Self::codes_with_target) to fix them.
    pub fn remove_range(&mut self, start: u32, end: u32) -> Vec<CodeId> {
        let (lo, hi) = self.index_range(start, end);
        if lo >= hi {
            return Vec::new();
        }
        let removed: Vec<CodeId> = self.order.drain(lo..hi).collect();
        self.addresses.truncate(self.order.len());
        for &id in &removed {
            self.positions[id.index()] = None;
            self.with_target.remove(&id);
        }
        self.reflow(lo);
        removed
    }

    /// Deletes every instruction starting at or after `address`.
    pub fn truncate(&mut self, address: u32) -> Vec<CodeId> {
        if address >= self.size {
            return Vec::new();
        }
        self.remove_range(address, self.size - 1)
    }

    /// Moves the contiguous block `[first, last]` to follow the current end.
    ///
    /// Returns the new start address of the block, or `None` when the range
    /// holds no instruction.
    pub fn relocate(&mut self, first: u32, last: u32) -> Option<u32> {
        let (lo, hi) = self.index_range(first, last);
        if lo >= hi {
            return None;
        }
        let block: Vec<CodeId> = self.order.drain(lo..hi).collect();
        self.order.extend(block.iter().copied());
        self.reflow(lo);
        self.start_address(block[0])
    }

    /// Rewrites every narrow control-transfer instruction whose offset no longer
    /// fits its operand into its wide sibling, until nothing changes.
    ///
    /// Returns the widened handles.
    pub fn widen_jumps(&mut self) -> Vec<CodeId> {
        let mut widened = Vec::new();
        loop {
            let overflowing: Vec<CodeId> = self
                .with_target
                .iter()
                .copied()
                .filter(|&id| {
                    let code = self.code(id);
                    let Some(wide) = code.opcode().info().wide else {
                        return false;
                    };
                    let width = code.opcode().info().operand_size / if wide == Opcode::TryL { 2 } else { 1 };
                    self.offsets(id).into_iter().any(|offset| !offset_fits(offset, width))
                })
                .collect();
            if overflowing.is_empty() {
                return widened;
            }
            for &id in &overflowing {
                let wide = self
                    .code(id)
                    .opcode()
                    .info()
                    .wide
                    .expect("only narrow opcodes are selected for widening");
                self.arena[id.index()].set_opcode(wide);
            }
            self.reflow(0);
            widened.extend(overflowing);
        }
    }

    /// Relative offsets currently encoded by a target-bearing instruction.
    #[must_use]
    pub fn offsets(&self, id: CodeId) -> Vec<i64> {
        let Some(address) = self.start_address(id) else {
            return Vec::new();
        };
        let relative = |dest: Option<CodeId>| {
            dest.and_then(|dest| self.start_address(dest))
                .map_or(0, |dest| i64::from(dest) - i64::from(address))
        };
        match self.code(id).target() {
            Some(Target::Code(dest)) => vec![relative(Some(dest))],
            Some(Target::End) => vec![i64::from(self.size) - i64::from(address)],
            Some(Target::Try { except, finally }) => vec![relative(except), relative(finally)],
            Some(Target::Unresolved) => vec![0],
            None => Vec::new(),
        }
    }

    /// Serializes every live instruction into one flat buffer.
    ///
    /// Target-bearing operands are computed from the addresses current at the
    /// time of the call.
    ///
    /// # Panics
    ///
    /// Panics if a live instruction still targets a removed one, or if an
    /// offset overflows its operand (run [`widen_jumps`](Self::widen_jumps) first).
    #[must_use]
    pub fn result(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size as usize);
        for (address, _, code) in self.iter() {
            code.encode(
                address,
                self.size,
                |dest| {
                    self.start_address(dest)
                        .expect("jump target was removed from the code map")
                },
                &mut out,
            );
        }
        debug_assert_eq!(out.len(), self.size as usize);
        out
    }

    /// `[lo, hi)` positions of the instructions fully inside `[start, end]`.
    fn index_range(&self, start: u32, end: u32) -> (usize, usize) {
        let lo = self.addresses.partition_point(|&address| address < start);
        let mut hi = lo;
        while hi < self.order.len() {
            let code_end = self.addresses[hi] + instruction_size(self.code(self.order[hi])) - 1;
            if code_end > end {
                break;
            }
            hi += 1;
        }
        (lo, hi)
    }

    /// Recomputes addresses and positions from `from` onwards.
    fn reflow(&mut self, from: usize) {
        self.addresses.truncate(from);
        let mut address = if from == 0 {
            0
        } else {
            let prev = self.order[from - 1];
            self.addresses[from - 1] + instruction_size(self.code(prev))
        };
        for index in from..self.order.len() {
            let id = self.order[index];
            self.addresses.push(address);
            self.positions[id.index()] = Some(index);
            address += instruction_size(self.code(id));
        }
        self.size = address;
    }
}

fn instruction_size(code: &VmCode) -> u32 {
    u32::try_from(code.size()).expect("instruction size exceeds u32")
}
