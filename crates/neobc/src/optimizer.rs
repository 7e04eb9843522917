//! Reachability over a finished code map.
//!
//! The walk starts at every entry point and follows the VM's control transfer:
//! fallthrough to the next instruction unless the opcode ends the flow, plus
//! every destination of a jump, call or `TRY`. A `CALL` reaches both its
//! callee and the instruction after it, which is where the callee's `RET`
//! resumes. Branch conditions are never evaluated, so both arms of a
//! conditional jump are always reachable.

use ahash::AHashSet;
use smallvec::SmallVec;

use crate::bytecode::{CodeId, CodeMap};

/// Every instruction reachable from `entries`.
#[must_use]
pub fn reachable(map: &CodeMap, entries: impl IntoIterator<Item = CodeId>) -> AHashSet<CodeId> {
    let mut seen = AHashSet::new();
    let mut work: Vec<CodeId> = entries.into_iter().filter(|&id| map.contains(id)).collect();
    while let Some(id) = work.pop() {
        if !seen.insert(id) {
            continue;
        }
        let code = map.code(id);
        let mut next: SmallVec<[CodeId; 3]> = SmallVec::new();
        if let Some(target) = code.target() {
            next.extend(target.codes());
        }
        if !code.opcode().ends_flow()
            && let Some(following) = map.next_of(id)
        {
            next.push(following);
        }
        work.extend(next.into_iter().filter(|dest| !seen.contains(dest) && map.contains(*dest)));
    }
    seen
}

/// Maximal `[start, end]` address ranges holding only instructions outside
/// `reachable`, in address order.
#[must_use]
pub fn unreachable_ranges(map: &CodeMap, reachable: &AHashSet<CodeId>) -> Vec<(u32, u32)> {
    let mut ranges: Vec<(u32, u32)> = Vec::new();
    let mut open: Option<(u32, u32)> = None;
    for (address, id, _) in map.iter() {
        if reachable.contains(&id) {
            ranges.extend(open.take());
            continue;
        }
        let end = map.end_address(id).unwrap_or(address);
        open = Some(open.map_or((address, end), |(start, _)| (start, end)));
    }
    ranges.extend(open);
    ranges
}
