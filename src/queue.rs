//! Per-controller request queue.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::error::{IdeError, IdeResult};
use crate::request::Request;

/// Life-cycle state of the queue's in-flight slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueState {
    #[default]
    Idle,
    /// Request popped, first chunk being programmed
    Priming,
    /// Write data pushed ahead of the first interrupt
    Primed,
    /// Command issued, data phases running
    Transferring,
    /// Chunk finished, waiting for the device to go idle
    Waiting,
    Done,
    Resetting,
    Error,
}

/// In-flight slot. While a context drives the hardware it holds the request
/// itself and the slot only remembers which one is checked out.
#[derive(Debug)]
pub(crate) enum Slot {
    Parked(Box<Request>),
    CheckedOut { id: u32 },
}

impl Slot {
    pub(crate) fn id(&self) -> u32 {
        match self {
            Slot::Parked(req) => req.id,
            Slot::CheckedOut { id } => *id,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct IoQueue {
    pub(crate) pending: VecDeque<Box<Request>>,
    pub(crate) current: Option<Slot>,
    pub(crate) state: QueueState,
    pub(crate) open_count: u32,
    pub(crate) staging: Option<Vec<u8>>,
    pub(crate) last_error: Option<IdeError>,
}

impl IoQueue {
    pub(crate) const fn new() -> Self {
        IoQueue {
            pending: VecDeque::new(),
            current: None,
            state: QueueState::Idle,
            open_count: 0,
            staging: None,
            last_error: None,
        }
    }

    /// Append at the tail; service order is submission order.
    pub(crate) fn put(&mut self, req: Box<Request>) {
        self.pending.push_back(req);
    }

    pub(crate) fn get(&mut self) -> Option<Box<Request>> {
        self.pending.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }

    pub(crate) fn allocate_staging(&mut self, size: usize) -> IdeResult<()> {
        if self.staging.is_some() {
            return Ok(());
        }
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|_| IdeError::ResourceExhausted)?;
        buf.resize(size, 0);
        self.staging = Some(buf);
        Ok(())
    }

    /// Back to idle after the last close.
    pub(crate) fn reset(&mut self) {
        self.staging = None;
        if self.current.is_none() {
            self.state = QueueState::Idle;
        }
    }
}
