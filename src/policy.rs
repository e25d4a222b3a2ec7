use std::ffi::CStr;

use crate::header::BlockHeader;
use crate::list::BlockList;
use crate::platform::{self, ENV_VALUE_CAPACITY};
use crate::Pointer;

/// Environment variable that selects the placement strategy.
const ALGORITHM_VARIABLE: &CStr = c"ALLOCATOR_ALGORITHM";

/// Strategy for choosing which block's tail slack absorbs a new allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Placement {
    FirstFit,
    BestFit,
    WorstFit,
}

impl Placement {
    /// Reads `ALLOCATOR_ALGORITHM`. This happens on every allocation so the
    /// strategy can be switched at runtime without relinking anything. An
    /// unset variable means first fit; an unrecognized value means no
    /// strategy at all, which makes placement fail and forces the allocator
    /// to expand into a fresh region instead.
    pub fn from_env() -> Option<Self> {
        let mut value = [0; ENV_VALUE_CAPACITY];

        match platform::env_setting(ALGORITHM_VARIABLE, &mut value) {
            None => Some(Self::FirstFit),
            Some(b"first_fit") => Some(Self::FirstFit),
            Some(b"best_fit") => Some(Self::BestFit),
            Some(b"worst_fit") => Some(Self::WorstFit),
            Some(_) => None,
        }
    }
}

/// Scans the global list front to back for a block whose tail slack can
/// absorb `need` more bytes, picking among the candidates according to
/// `placement`. Returns `None` when no block qualifies.
///
/// # Safety
///
/// Every header linked in `blocks` must be valid.
pub(crate) unsafe fn find_candidate(
    blocks: &BlockList,
    need: usize,
    placement: Placement,
) -> Pointer<BlockHeader> {
    match placement {
        Placement::FirstFit => first_fit(blocks, need),
        Placement::BestFit => best_fit(blocks, need),
        Placement::WorstFit => worst_fit(blocks, need),
    }
}

/// Takes the first block that fits.
unsafe fn first_fit(blocks: &BlockList, need: usize) -> Pointer<BlockHeader> {
    for block in blocks.iter() {
        if block.as_ref().tail_slack() >= need {
            return Some(block);
        }
    }

    None
}

/// Takes the fitting block that would leave the least slack behind. Ties keep
/// the earliest candidate.
unsafe fn best_fit(blocks: &BlockList, need: usize) -> Pointer<BlockHeader> {
    let mut best: Pointer<BlockHeader> = None;

    for block in blocks.iter() {
        let slack = block.as_ref().tail_slack();
        if slack < need {
            continue;
        }

        match best {
            Some(current) if current.as_ref().tail_slack() <= slack => {}
            _ => best = Some(block),
        }
    }

    best
}

/// Takes the fitting block with the most slack. Ties keep the earliest
/// candidate.
unsafe fn worst_fit(blocks: &BlockList, need: usize) -> Pointer<BlockHeader> {
    let mut worst: Pointer<BlockHeader> = None;

    for block in blocks.iter() {
        let slack = block.as_ref().tail_slack();
        if slack < need {
            continue;
        }

        match worst {
            Some(current) if current.as_ref().tail_slack() >= slack => {}
            _ => worst = Some(block),
        }
    }

    worst
}
