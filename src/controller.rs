//! Controller model
//!
//! One [`Controller`] per IDE channel. Its mutable state sits behind a single
//! `spin::Mutex` that is only ever held for short bookkeeping transitions;
//! register traffic and bounded waits run outside it while a context holds
//! one of the hardware ownership flags.

use spin::{Mutex, MutexGuard};

use crate::config::ControllerConfig;
use crate::consts::*;
use crate::queue::{IoQueue, QueueState, Slot};
use crate::request::Progress;
use crate::timer::TimerHandle;
use crate::types::{ControllerFlags, Drive};

/// Event counters kept per controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub polled_reads: u32,
    pub polled_writes: u32,
    pub polled_chunks: u32,
    pub polled_sectors: u32,
    pub reads: u32,
    pub writes: u32,
    pub loops: u32,
    pub sectors: u32,
    pub wait_drq_ok: u32,
    pub wait_drq_timeouts: u32,
    pub wait_bsy_timeouts: u32,
    pub errors: u32,
    pub irq_turn_on: u32,
    pub irq_turn_off: u32,
    pub irq_seen: u32,
    pub irq_handled: u32,
    pub irq_spurious: u32,
    pub irq_no_current: u32,
    pub irq_drq_service: u32,
    pub irq_end_of_chunk: u32,
    pub irq_error: u32,
    pub irq_busy_skipped: u32,
    pub irq_atapi_ignored: u32,
    pub lost_irq_rescued: u32,
    pub wd_fired: u32,
    pub wd_serviced: u32,
    pub wd_rekicked: u32,
    pub wd_armed: u32,
    pub wd_cancelled: u32,
    pub wd_resets: u32,
    pub wd_chunk: u32,
    pub eoc_polled: u32,
    pub soft_resets: u32,
    pub completed: u32,
}

/// Snapshot of the last taskfile issued, logged with stray interrupts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LastCommand {
    pub command: u8,
    pub count: u8,
    pub device: u8,
    pub lba: u32,
    pub error: u8,
    pub request_id: u32,
    pub tick: u64,
}

/// Cached drive/head register contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Selection {
    pub(crate) drive: Option<u8>,
    pub(crate) lba_mode: bool,
    pub(crate) hi4: u8,
}

/// Everything about a channel that changes at run time.
#[derive(Debug)]
pub(crate) struct ChannelState {
    pub(crate) flags: ControllerFlags,
    pub(crate) drives: [Drive; DRIVES_PER_CONTROLLER],
    pub(crate) queue: IoQueue,
    pub(crate) selection: Selection,
    pub(crate) watchdog: Option<TimerHandle>,
    pub(crate) counters: Counters,
    pub(crate) last_command: LastCommand,
}

/// One IDE channel with its two drive slots and request queue.
#[derive(Debug)]
pub struct Controller {
    index: usize,
    config: ControllerConfig,
    pub(crate) state: Mutex<ChannelState>,
}

impl Controller {
    pub(crate) fn new(index: usize, config: ControllerConfig, interrupts: bool) -> Self {
        let mut flags = ControllerFlags::empty();
        if config.present {
            flags |= ControllerFlags::PRESENT;
        }
        if interrupts {
            flags |= ControllerFlags::INTR_MODE;
        }
        Controller {
            index,
            config,
            state: Mutex::new(ChannelState {
                flags,
                drives: [Drive::new(), Drive::new()],
                queue: IoQueue::new(),
                selection: Selection::default(),
                watchdog: None,
                counters: Counters::default(),
                last_command: LastCommand::default(),
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn io_base(&self) -> u16 {
        self.config.io_base
    }

    pub fn ctl_base(&self) -> u16 {
        self.config.ctl_base()
    }

    pub fn irq(&self) -> u8 {
        self.config.irq
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock()
    }

    pub fn flags(&self) -> ControllerFlags {
        self.lock().flags
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(ControllerFlags::PRESENT)
    }

    pub fn interrupt_mode(&self) -> bool {
        self.flags().contains(ControllerFlags::INTR_MODE)
    }

    pub fn drive(&self, drive: u8) -> Option<Drive> {
        self.lock().drives.get(drive as usize).cloned()
    }

    pub fn counters(&self) -> Counters {
        self.lock().counters
    }

    pub fn last_command(&self) -> LastCommand {
        self.lock().last_command
    }

    pub fn queue_state(&self) -> QueueState {
        self.lock().queue.state
    }

    /// Requests waiting behind the one in flight.
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_busy(&self) -> bool {
        self.flags().contains(ControllerFlags::BUSY)
    }

    /// Id of the request in flight, if any.
    pub fn in_flight(&self) -> Option<u32> {
        self.lock().queue.current.as_ref().map(Slot::id)
    }

    /// Progress of the in-flight request while no context is driving it.
    pub fn progress(&self) -> Option<Progress> {
        match self.lock().queue.current.as_ref() {
            Some(Slot::Parked(req)) => Some(req.progress()),
            _ => None,
        }
    }

    pub fn watchdog_armed(&self) -> Option<TimerHandle> {
        self.lock().watchdog
    }
}
