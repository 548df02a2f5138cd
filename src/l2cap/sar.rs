// Handles recombination of L2CAP PDUs spanning multiple ACL frames.

use crate::packet_pool::BufferPool;

/// Per-connection recombination state. At most one PDU can be in flight per
/// connection and direction, so one slot per tracked connection suffices.
pub(crate) struct AssemblyState {
    pub handle: u16,
    pub kind: AssemblyKind,
}

#[derive(Clone, Copy)]
pub(crate) enum AssemblyKind {
    Idle,
    /// A PDU for a channel the proxy does not manage is spanning frames;
    /// its continuations are forwarded untouched until `remaining` is used up.
    Passthrough { remaining: usize },
    /// A PDU for a managed channel is being accumulated into a pool slot.
    /// `received` counts payload bytes gathered so far; the target is
    /// `pdu_len`.
    Assembling {
        channel: usize,
        slot: usize,
        received: usize,
        pdu_len: usize,
    },
}

pub(crate) enum AppendOutcome {
    Buffered,
    Complete,
    /// More payload arrived than the PDU header announced.
    Overflow,
}

impl AssemblyState {
    pub const IDLE: AssemblyState = AssemblyState {
        handle: 0,
        kind: AssemblyKind::Idle,
    };

    pub fn is_idle(&self) -> bool {
        matches!(self.kind, AssemblyKind::Idle)
    }

    /// Append a continuation frame's payload to an in-progress assembly.
    ///
    /// Only meaningful in the `Assembling` state; the caller owns the state
    /// transition on `Complete`/`Overflow` (including releasing the slot).
    pub fn append(&mut self, pool: &dyn BufferPool, data: &[u8]) -> AppendOutcome {
        let AssemblyKind::Assembling {
            slot,
            received,
            pdu_len,
            ..
        } = &mut self.kind
        else {
            return AppendOutcome::Overflow;
        };
        if *received + data.len() > *pdu_len {
            return AppendOutcome::Overflow;
        }
        copy_into_slot(pool, *slot, *received, data);
        *received += data.len();
        if *received == *pdu_len {
            AppendOutcome::Complete
        } else {
            AppendOutcome::Buffered
        }
    }
}

/// Copy `data` into a pool slot at `offset`.
///
/// The slot is exclusively owned by the assembly that reserved it, so writing
/// through the raw pointer cannot alias another owner.
pub(crate) fn copy_into_slot(pool: &dyn BufferPool, slot: usize, offset: usize, data: &[u8]) {
    debug_assert!(offset + data.len() <= pool.slot_size());
    unsafe {
        core::ptr::copy_nonoverlapping(data.as_ptr(), pool.slot_ptr(slot).add(offset), data.len());
    }
}
