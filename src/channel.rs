//! Hardware ownership
//!
//! A [`Channel`] is the one execution context allowed to touch a
//! controller's registers at a time. It is obtained by setting an owner flag
//! under the controller lock (`IN_ISR`, `POLL_RUNNING`, `IN_START` or
//! `IN_TIMER`). A context that finds the hardware already owned records what
//! it wanted (`PENDING_KICK`, `PENDING_IRQ`, `RESCUE_PENDING`) and leaves; the
//! owner drains those flags before it lets go, so the state machine is never
//! entered recursively and no request is left stranded.
//!
//! While owned, the in-flight request and the staging buffer are checked out
//! of the queue into the channel, so transfers and bounded waits run without
//! holding the lock.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::panic::Location;

use log::{debug, error, trace, warn};

use crate::config::EngineConfig;
use crate::consts::*;
use crate::controller::{ChannelState, Controller, Counters};
use crate::error::{IdeError, IdeResult};
use crate::port::PortIo;
use crate::queue::{QueueState, Slot};
use crate::request::{IoOutcome, Request, XferTarget};
use crate::timer::Timer;
use crate::types::{ControllerFlags, Drive, DriveFlags, Status, Unit};

pub(crate) struct Channel<'a, P: PortIo, T: Timer> {
    pub(crate) io: &'a P,
    pub(crate) timer: &'a T,
    pub(crate) config: &'a EngineConfig,
    pub(crate) ctrl: &'a Controller,
    owner: ControllerFlags,
    pub(crate) req: Option<Box<Request>>,
    pub(crate) staging: Option<Vec<u8>>,
}

impl<'a, P: PortIo, T: Timer> Channel<'a, P, T> {
    /// Take the hardware as `owner`, or record `deferred` for whoever has it.
    pub(crate) fn claim(
        io: &'a P,
        timer: &'a T,
        config: &'a EngineConfig,
        ctrl: &'a Controller,
        owner: ControllerFlags,
        deferred: ControllerFlags,
    ) -> Option<Self> {
        let mut st = ctrl.lock();
        if st.flags.intersects(ControllerFlags::OWNERS) {
            st.flags |= deferred;
            return None;
        }
        st.flags |= owner;
        let req = match st.queue.current.take() {
            Some(Slot::Parked(req)) => {
                st.queue.current = Some(Slot::CheckedOut { id: req.id });
                Some(req)
            }
            other => {
                st.queue.current = other;
                None
            }
        };
        let staging = st.queue.staging.take();
        drop(st);

        Some(Channel { io, timer, config, ctrl, owner, req, staging })
    }

    /// Claim only once the controller has nothing in flight.
    pub(crate) fn claim_idle(
        io: &'a P,
        timer: &'a T,
        config: &'a EngineConfig,
        ctrl: &'a Controller,
    ) -> IdeResult<Self> {
        for _ in 0..config.claim_spin_limit {
            {
                let mut st = ctrl.lock();
                let idle = !st.flags.intersects(ControllerFlags::OWNERS | ControllerFlags::BUSY);
                if idle {
                    st.flags |= ControllerFlags::IN_START;
                    let staging = st.queue.staging.take();
                    drop(st);
                    return Ok(Channel {
                        io,
                        timer,
                        config,
                        ctrl,
                        owner: ControllerFlags::IN_START,
                        req: None,
                        staging,
                    });
                }
                let polled = !st.flags.contains(ControllerFlags::INTR_MODE);
                drop(st);
                if polled {
                    if let Some(mut ch) = Channel::claim(
                        io,
                        timer,
                        config,
                        ctrl,
                        ControllerFlags::IN_START,
                        ControllerFlags::empty(),
                    ) {
                        ch.kick();
                    }
                }
            }
            core::hint::spin_loop();
        }
        Err(IdeError::Busy)
    }

    fn release(&mut self) {
        loop {
            self.drain_deferred();
            let mut st = self.ctrl.lock();
            if st.flags.intersects(ControllerFlags::DEFERRED) {
                continue;
            }
            st.flags.remove(self.owner | ControllerFlags::POLL_RUNNING);
            if let Some(req) = self.req.take() {
                st.queue.current = Some(Slot::Parked(req));
            }
            if st.queue.open_count > 0 && st.queue.staging.is_none() {
                st.queue.staging = self.staging.take();
            }
            break;
        }
    }

    /// Run whatever other contexts asked for while we held the hardware.
    fn drain_deferred(&mut self) {
        loop {
            let pending = {
                let mut st = self.ctrl.lock();
                let pending = st.flags & ControllerFlags::DEFERRED;
                st.flags.remove(ControllerFlags::DEFERRED);
                pending
            };
            if pending.is_empty() {
                break;
            }
            if pending.contains(ControllerFlags::RESCUE_PENDING) {
                self.rescue_current(IdeError::Aborted);
            }
            if pending.contains(ControllerFlags::PENDING_IRQ) {
                self.interrupt();
            }
            if pending.contains(ControllerFlags::PENDING_KICK) {
                self.kick();
            }
        }
    }

    /* ============================================================================
     * REGISTER ACCESS
     * ============================================================================ */

    pub(crate) fn read_reg(&self, reg: u16) -> u8 {
        self.io.inb(self.ctrl.io_base() + reg)
    }

    pub(crate) fn write_reg(&self, reg: u16, value: u8) {
        self.io.outb(self.ctrl.io_base() + reg, value)
    }

    pub(crate) fn read_data(&self) -> u16 {
        self.io.inw(self.ctrl.io_base() + ATA_REG_DATA)
    }

    pub(crate) fn write_data(&self, value: u16) {
        self.io.outw(self.ctrl.io_base() + ATA_REG_DATA, value)
    }

    /// Status register. Reading it acknowledges a pending interrupt.
    pub(crate) fn status(&self) -> Status {
        Status::from_bits_retain(self.read_reg(ATA_REG_STATUS))
    }

    /// Alternate status, no side effects.
    pub(crate) fn alt_status(&self) -> Status {
        Status::from_bits_retain(self.io.inb(self.ctrl.ctl_base() + ATA_REG_ALTSTATUS))
    }

    pub(crate) fn write_devctl(&self, value: u8) {
        self.io.outb(self.ctrl.ctl_base() + ATA_REG_DEVCTRL, value)
    }

    pub(crate) fn delay_us(&self, us: u32) {
        self.io.delay_us(us)
    }

    /* ============================================================================
     * SHARED STATE
     * ============================================================================ */

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ChannelState) -> R) -> R {
        f(&mut self.ctrl.lock())
    }

    pub(crate) fn count(&self, f: impl FnOnce(&mut Counters)) {
        f(&mut self.ctrl.lock().counters)
    }

    pub(crate) fn drive_info(&self, drive: u8) -> Drive {
        self.ctrl.lock().drives[drive as usize & 1].clone()
    }

    pub(crate) fn update_drive(&self, drive: u8, f: impl FnOnce(&mut Drive)) {
        f(&mut self.ctrl.lock().drives[drive as usize & 1])
    }

    /// Drop a pending abort before new work is issued to the drive.
    pub(crate) fn clear_abort(&self, drive: u8) {
        self.ctrl.lock().drives[drive as usize & 1]
            .flags
            .remove(DriveFlags::ABORT);
    }

    pub(crate) fn drive_aborting(&self, drive: u8) -> bool {
        self.ctrl.lock().drives[drive as usize & 1]
            .flags
            .contains(DriveFlags::ABORT)
    }

    pub(crate) fn set_queue_state(&self, state: QueueState) {
        self.ctrl.lock().queue.state = state;
    }

    pub(crate) fn intr_mode(&self) -> bool {
        self.ctrl.lock().flags.contains(ControllerFlags::INTR_MODE)
    }

    pub(crate) fn unit(&self, drive: u8) -> Unit {
        Unit::new(self.ctrl.index() as u8, drive)
    }

    /* ============================================================================
     * WATCHDOG TIMER
     * ============================================================================ */

    pub(crate) fn arm_watchdog(&self, ticks: u32) {
        let mut st = self.ctrl.lock();
        if let Some(handle) = st.watchdog.take() {
            self.timer.cancel(handle);
            st.counters.wd_cancelled += 1;
        }
        st.watchdog = Some(self.timer.arm(self.ctrl.index(), ticks));
        st.counters.wd_armed += 1;
    }

    pub(crate) fn cancel_watchdog(&self) {
        let mut st = self.ctrl.lock();
        if let Some(handle) = st.watchdog.take() {
            self.timer.cancel(handle);
            st.counters.wd_cancelled += 1;
        }
    }

    /* ============================================================================
     * QUEUE DRIVING
     * ============================================================================ */

    /// Start the next request if idle, then give the poll engine a burst.
    pub(crate) fn kick(&mut self) {
        if self.req.is_none() {
            self.start();
        }
        let ata_in_flight = self.req.as_ref().map_or(false, |r| !r.is_packet());
        if ata_in_flight && !self.intr_mode() {
            self.poll_engine();
        }
    }

    fn start(&mut self) {
        let mut req = {
            let mut st = self.ctrl.lock();
            if st.flags.intersects(ControllerFlags::BUSY | ControllerFlags::CLOSING)
                || st.queue.current.is_some()
            {
                return;
            }
            let Some(req) = st.queue.get() else {
                return;
            };
            st.flags |= ControllerFlags::BUSY;
            st.queue.current = Some(Slot::CheckedOut { id: req.id });
            st.queue.state = QueueState::Priming;
            let polled = !st.flags.contains(ControllerFlags::INTR_MODE);
            match (req.is_read(), polled) {
                (true, false) => st.counters.reads += 1,
                (false, false) => st.counters.writes += 1,
                (true, true) => st.counters.polled_reads += 1,
                (false, true) => st.counters.polled_writes += 1,
            }
            req
        };

        req.rewind(self.config.drq_budget());
        self.clear_abort(req.drive);
        debug!(
            "{}: start req {} {:?} lba {} count {}",
            self.unit(req.drive),
            req.id,
            req.direction,
            req.lba,
            req.nsec
        );
        self.req = Some(req);

        if let Err(e) = self.program_next_chunk(self.config.watchdog_ticks) {
            self.finish(Err(e));
        }
    }

    /// Size and issue the next hardware command of the request in flight.
    pub(crate) fn program_next_chunk(&mut self, arm_ticks: u32) -> IdeResult<()> {
        match self.req.as_ref() {
            Some(req) if req.is_packet() => self.atapi_request(arm_ticks),
            Some(_) => self.ata_request(arm_ticks),
            None => Ok(()),
        }
    }

    /// Complete the request in flight. Safe to call with nothing in flight.
    #[track_caller]
    pub(crate) fn finish(&mut self, result: IdeResult<()>) {
        let caller = Location::caller();
        self.cancel_watchdog();
        let req = self.req.take();

        {
            let mut st = self.ctrl.lock();
            st.flags.remove(ControllerFlags::BUSY);
            st.flags |= ControllerFlags::PENDING_KICK;
            st.queue.current = None;
            st.queue.state = QueueState::Idle;
            st.queue.last_error = result.err();
            if result.is_err() {
                st.counters.errors += 1;
            }
        }

        let Some(mut req) = req else {
            trace!("c{}: finish at {} with nothing in flight", self.ctrl.index(), caller);
            return;
        };
        if req.done {
            return;
        }
        req.done = true;

        if result.is_ok() && req.needs_copy_back {
            copy_back(self.staging.as_deref(), &mut req);
        }

        match result {
            Ok(()) => trace!(
                "{}: req {} done at {}, {} bytes",
                self.unit(req.drive),
                req.id,
                caller,
                req.bytes_done()
            ),
            Err(e) => error!(
                "{}: req {} lba {} failed at {}: {}",
                self.unit(req.drive),
                req.id,
                req.lba_cur,
                caller,
                e
            ),
        }

        let bytes = req.bytes_done();
        let residual = req.buffer.len() - bytes;
        let buffer = core::mem::take(&mut req.buffer);
        let outcome = IoOutcome { result, bytes, residual, buffer };
        if req.completion.complete(outcome) {
            self.count(|c| c.completed += 1);
        }
    }

    /// Fail the request in flight and let the queue move on.
    pub(crate) fn rescue_current(&mut self, reason: IdeError) {
        self.cancel_watchdog();
        if self.req.is_none() {
            return;
        }
        warn!("c{}: rescuing wedged request: {}", self.ctrl.index(), reason);
        self.finish(Err(reason));
    }

    /* ============================================================================
     * INTERRUPT ENTRY
     * ============================================================================ */

    /// Service one interrupt. Returns whether it belonged to this channel.
    pub(crate) fn interrupt(&mut self) -> bool {
        let status = self.status();
        let intr = {
            let mut st = self.ctrl.lock();
            st.counters.irq_seen += 1;
            let intr = st.flags.contains(ControllerFlags::INTR_MODE);
            if !intr {
                st.counters.irq_spurious += 1;
            }
            intr
        };
        if !intr {
            return false;
        }

        let packet = match self.req.as_ref() {
            Some(req) => req.is_packet(),
            None => {
                self.stray_interrupt(status);
                return true;
            }
        };

        self.count(|c| c.irq_handled += 1);
        if packet {
            self.atapi_service_irq(status);
        } else {
            self.ata_service_irq(status);
        }
        true
    }

    fn stray_interrupt(&mut self, status: Status) {
        let error = if status.failed() { self.read_reg(ATA_REG_ERROR) } else { 0 };
        let drive = (self.read_reg(ATA_REG_HDDEVSEL) >> 4) & 1;
        let mut st = self.ctrl.lock();
        st.counters.irq_no_current += 1;
        if st.drives[drive as usize].is_atapi() {
            st.counters.irq_atapi_ignored += 1;
            if status.failed() {
                st.drives[drive as usize].flags |= DriveFlags::NEEDS_SENSE;
            }
            return;
        }
        let last = st.last_command;
        drop(st);
        warn!(
            "c{}d{}: stray interrupt ST={:02x} ER={:02x} last cmd={:02x} sc={} dh={:02x} lba={} req={} tick={}",
            self.ctrl.index(),
            drive,
            status.bits(),
            error,
            last.command,
            last.count,
            last.device,
            last.lba,
            last.request_id,
            last.tick
        );
    }
}

impl<P: PortIo, T: Timer> Drop for Channel<'_, P, T> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Copy the staged part of the current chunk back into the caller's buffer.
pub(crate) fn copy_back(staging: Option<&[u8]>, req: &mut Request) {
    if req.target == XferTarget::Staging {
        if let Some(staging) = staging {
            let len = req
                .chunk_offset()
                .min(staging.len())
                .min(req.buffer.len().saturating_sub(req.chunk_start));
            let start = req.chunk_start;
            req.buffer[start..start + len].copy_from_slice(&staging[..len]);
        }
    }
    req.needs_copy_back = false;
}
