//! CQE user-data encoding and the in-flight operation registry.
//!
//! Every submitted SQE carries a `UserData` value. Operations that resume a
//! task point at a slot in the `OpTable`; the slot outlives the submission
//! until its completion (or, for multi-shot, its final completion) has been
//! observed. Cancellation targets the encoded user-data value, so nothing in
//! the protocol depends on the address of caller state.

use std::collections::VecDeque;
use std::task::Waker;

use slab::Slab;

const TAG_SHIFT: u32 = 56;
const INDEX_MASK: u64 = (1 << TAG_SHIFT) - 1;

const TAG_OP: u8 = 0;
const TAG_EVENTFD: u8 = 1;
const TAG_ORPHAN: u8 = 2;

/// Encoded SQE user-data: a tag byte in the high bits plus a table index.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct UserData(u64);

impl UserData {
    pub fn op(index: usize) -> Self {
        debug_assert!((index as u64) <= INDEX_MASK);
        UserData(((TAG_OP as u64) << TAG_SHIFT) | index as u64)
    }

    pub fn eventfd() -> Self {
        UserData((TAG_EVENTFD as u64) << TAG_SHIFT)
    }

    /// Tag for completions nothing waits on (cancel SQEs, shutdown timeouts).
    pub fn orphan() -> Self {
        UserData((TAG_ORPHAN as u64) << TAG_SHIFT)
    }

    pub fn from_raw(raw: u64) -> Self {
        UserData(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    pub fn is_op(self) -> bool {
        (self.0 >> TAG_SHIFT) as u8 == TAG_OP
    }

    pub fn is_eventfd(self) -> bool {
        (self.0 >> TAG_SHIFT) as u8 == TAG_EVENTFD
    }
}

/// One observed completion.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Cqe {
    pub res: i32,
    pub flags: u32,
}

/// What kind of request an op slot tracks. Needed to release kernel-side
/// resources when a completion arrives for a detached op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpKind {
    Accept,
    Recv,
    Send,
    Splice,
}

pub(crate) enum OpPayload {
    /// Exactly one completion.
    Single(Option<Cqe>),
    /// A stream of completions (multi-shot accept). `terminated` is set when
    /// a CQE without the MORE flag arrives.
    Multi {
        queue: VecDeque<Cqe>,
        terminated: bool,
    },
}

pub(crate) struct OpState {
    pub kind: OpKind,
    pub payload: OpPayload,
    pub waker: Option<Waker>,
    /// The future that submitted this op was dropped; completions release
    /// their resources instead of waking anyone.
    pub detached: bool,
}

/// Slab of in-flight operations, indexed by the SQE user-data.
pub(crate) struct OpTable {
    ops: Slab<OpState>,
}

impl OpTable {
    pub fn new(capacity: usize) -> Self {
        OpTable {
            ops: Slab::with_capacity(capacity),
        }
    }

    pub fn insert_single(&mut self, kind: OpKind) -> usize {
        self.ops.insert(OpState {
            kind,
            payload: OpPayload::Single(None),
            waker: None,
            detached: false,
        })
    }

    pub fn insert_multi(&mut self, kind: OpKind) -> usize {
        self.ops.insert(OpState {
            kind,
            payload: OpPayload::Multi {
                queue: VecDeque::new(),
                terminated: false,
            },
            waker: None,
            detached: false,
        })
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut OpState> {
        self.ops.get_mut(id)
    }

    pub fn set_waker(&mut self, id: usize, waker: &Waker) {
        if let Some(op) = self.ops.get_mut(id) {
            op.waker = Some(waker.clone());
        }
    }

    /// Remove a single-shot op if its completion has arrived.
    pub fn try_take_single(&mut self, id: usize) -> Option<Cqe> {
        let ready = matches!(
            self.ops.get(id),
            Some(OpState {
                payload: OpPayload::Single(Some(_)),
                ..
            })
        );
        if !ready {
            return None;
        }
        match self.ops.remove(id).payload {
            OpPayload::Single(cqe) => cqe,
            OpPayload::Multi { .. } => unreachable!("single-shot op with multi payload"),
        }
    }

    /// Pop the oldest queued completion of a multi-shot op.
    pub fn pop_multi(&mut self, id: usize) -> Option<Cqe> {
        match self.ops.get_mut(id) {
            Some(OpState {
                payload: OpPayload::Multi { queue, .. },
                ..
            }) => queue.pop_front(),
            _ => None,
        }
    }

    /// Whether a multi-shot op has seen its final completion.
    pub fn multi_terminated(&self, id: usize) -> bool {
        matches!(
            self.ops.get(id),
            Some(OpState {
                payload: OpPayload::Multi {
                    terminated: true,
                    ..
                },
                ..
            })
        )
    }

    pub fn discard(&mut self, id: usize) -> Option<OpState> {
        self.ops.try_remove(id)
    }

    pub fn ids(&self) -> Vec<usize> {
        self.ops.iter().map(|(id, _)| id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_round_trip() {
        let ud = UserData::op(12345);
        let back = UserData::from_raw(ud.raw());
        assert!(back.is_op());
        assert_eq!(back.index(), 12345);

        assert!(UserData::eventfd().is_eventfd());
        assert!(!UserData::orphan().is_op());
        assert!(!UserData::orphan().is_eventfd());
    }

    #[test]
    fn single_op_lifecycle() {
        let mut table = OpTable::new(8);
        let id = table.insert_single(OpKind::Recv);
        assert!(table.try_take_single(id).is_none());

        table.get_mut(id).unwrap().payload = OpPayload::Single(Some(Cqe { res: 7, flags: 0 }));
        let cqe = table.try_take_single(id).unwrap();
        assert_eq!(cqe.res, 7);
        assert!(table.is_empty());
    }

    #[test]
    fn multi_op_queue_is_fifo() {
        let mut table = OpTable::new(8);
        let id = table.insert_multi(OpKind::Accept);
        if let Some(OpState {
            payload: OpPayload::Multi { queue, .. },
            ..
        }) = table.get_mut(id)
        {
            queue.push_back(Cqe { res: 3, flags: 0 });
            queue.push_back(Cqe { res: 4, flags: 0 });
        }
        assert_eq!(table.pop_multi(id).unwrap().res, 3);
        assert_eq!(table.pop_multi(id).unwrap().res, 4);
        assert!(table.pop_multi(id).is_none());
        assert!(!table.multi_terminated(id));
    }
}
