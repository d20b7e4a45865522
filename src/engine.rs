//! Engine
//!
//! The public face of the crate: a fixed registry of up to four channels,
//! the port and timer capabilities, and the entry points the host calls from
//! its own contexts (request submission, interrupt, timer expiry, admin).

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, warn};

use crate::channel::Channel;
use crate::config::{ControllerConfig, EngineConfig, DEFAULT_CONTROLLERS};
use crate::consts::*;
use crate::controller::{Controller, Counters, LastCommand};
use crate::error::{IdeError, IdeResult};
use crate::port::PortIo;
use crate::request::{
    BufferOrigin, Completion, CompletionToken, Direction, IoOutcome, IoRequest, Progress, Request,
};
use crate::sense::SenseData;
use crate::timer::{Timer, TimerHandle};
use crate::types::{ControllerFlags, Drive, DriveFlags, InquiryData, Msf, SubChannel, Unit};

pub struct Engine<P: PortIo, T: Timer> {
    io: P,
    timer: T,
    config: EngineConfig,
    controllers: heapless::Vec<Controller, MAX_CONTROLLERS>,
    next_id: AtomicU32,
}

impl<P: PortIo, T: Timer> Engine<P, T> {
    /// Engine over the four legacy channel slots.
    pub fn new(io: P, timer: T, config: EngineConfig) -> Self {
        let mut controllers = heapless::Vec::new();
        for (index, cfg) in DEFAULT_CONTROLLERS.iter().enumerate() {
            let _ = controllers.push(Controller::new(index, *cfg, config.ata_interrupts));
        }
        Engine { io, timer, config, controllers, next_id: AtomicU32::new(1) }
    }

    /// Engine over an explicit channel table of at most four entries.
    pub fn with_controllers(
        io: P,
        timer: T,
        config: EngineConfig,
        table: &[ControllerConfig],
    ) -> IdeResult<Self> {
        let mut controllers = heapless::Vec::new();
        for (index, cfg) in table.iter().enumerate() {
            controllers
                .push(Controller::new(index, *cfg, config.ata_interrupts))
                .map_err(|_| IdeError::InvalidParameter)?;
        }
        Ok(Engine { io, timer, config, controllers, next_id: AtomicU32::new(1) })
    }

    pub fn io(&self) -> &P {
        &self.io
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn controllers(&self) -> &[Controller] {
        &self.controllers
    }

    pub fn controller(&self, index: usize) -> Option<&Controller> {
        self.controllers.get(index)
    }

    fn ctrl(&self, index: usize) -> IdeResult<&Controller> {
        self.controllers.get(index).ok_or(IdeError::InvalidParameter)
    }

    fn claim(&self, index: usize, owner: ControllerFlags, deferred: ControllerFlags) -> Option<Channel<'_, P, T>> {
        let ctrl = self.controllers.get(index)?;
        Channel::claim(&self.io, &self.timer, &self.config, ctrl, owner, deferred)
    }

    /// Run `f` on an idle, present channel.
    fn admin<R>(&self, index: usize, f: impl FnOnce(&mut Channel<'_, P, T>) -> IdeResult<R>) -> IdeResult<R> {
        let ctrl = self.ctrl(index)?;
        if !ctrl.is_present() {
            return Err(IdeError::NoDevice);
        }
        let mut ch = Channel::claim_idle(&self.io, &self.timer, &self.config, ctrl)?;
        f(&mut ch)
    }

    /// Present drive behind `unit`.
    fn unit_drive(&self, unit: Unit) -> IdeResult<(&Controller, Drive)> {
        let ctrl = self.ctrl(unit.controller as usize)?;
        if unit.drive as usize >= DRIVES_PER_CONTROLLER {
            return Err(IdeError::InvalidParameter);
        }
        let drive = ctrl.drive(unit.drive).ok_or(IdeError::InvalidParameter)?;
        if !ctrl.is_present() || !drive.is_present() {
            return Err(IdeError::NoDevice);
        }
        Ok((ctrl, drive))
    }

    /* ============================================================================
     * ATTACH
     * ============================================================================ */

    /// Attach every configured channel. Returns the number of drives found.
    pub fn init(&self) -> usize {
        let mut found = 0;
        for index in 0..self.controllers.len() {
            match self.attach(index) {
                Ok(n) => found += n,
                Err(e) => debug!("c{}: not attached: {}", index, e),
            }
        }
        found
    }

    pub fn attach(&self, controller: usize) -> IdeResult<usize> {
        self.admin(controller, |ch| ch.attach())
    }

    pub fn drive_info(&self, unit: Unit) -> IdeResult<Drive> {
        self.unit_drive(unit).map(|(_, d)| d)
    }

    /* ============================================================================
     * OPEN / CLOSE
     * ============================================================================ */

    pub fn open(&self, unit: Unit, write: bool) -> IdeResult<()> {
        let (ctrl, drive) = self.unit_drive(unit)?;
        if write && drive.is_cdrom() {
            return Err(IdeError::ReadOnly);
        }
        if ctrl.flags().contains(ControllerFlags::CLOSING) {
            return Err(IdeError::Busy);
        }

        if drive.is_atapi() {
            let media = self.admin(unit.controller as usize, |ch| {
                ch.clear_abort(unit.drive);
                let media = ch.test_unit_ready(unit.drive)?;
                if media {
                    ch.read_capacity(unit.drive)?;
                }
                Ok(media)
            })?;
            if !media {
                return Err(IdeError::NoMedia);
            }
        }

        let mut st = ctrl.lock();
        if st.flags.contains(ControllerFlags::CLOSING) {
            return Err(IdeError::Busy);
        }
        if st.queue.open_count == 0 {
            st.queue.allocate_staging(self.config.staging_buffer_size)?;
        }
        st.queue.open_count += 1;
        debug!("{}: open ({} opens)", unit, st.queue.open_count);
        Ok(())
    }

    /// Drop one open. The last close frees the staging buffer.
    pub fn close(&self, unit: Unit) -> IdeResult<()> {
        let ctrl = self.ctrl(unit.controller as usize)?;
        let mut drained = false;
        for _ in 0..self.config.claim_spin_limit {
            {
                let mut st = ctrl.lock();
                if st.queue.is_drained() && !st.flags.contains(ControllerFlags::BUSY) {
                    st.flags |= ControllerFlags::CLOSING;
                    drained = true;
                }
            }
            if drained {
                break;
            }
            if !ctrl.interrupt_mode() {
                self.kick(unit.controller as usize);
            }
            core::hint::spin_loop();
        }
        if !drained {
            return Err(IdeError::Busy);
        }

        let mut st = ctrl.lock();
        st.queue.open_count = st.queue.open_count.saturating_sub(1);
        if st.queue.open_count == 0 {
            st.queue.reset();
            if let Some(handle) = st.watchdog.take() {
                self.timer.cancel(handle);
                st.counters.wd_cancelled += 1;
            }
        }
        st.flags.remove(ControllerFlags::CLOSING);
        debug!("{}: close ({} opens left)", unit, st.queue.open_count);
        Ok(())
    }

    /* ============================================================================
     * REQUESTS
     * ============================================================================ */

    /// Queue a transfer. Fails without touching the hardware when the
    /// request cannot be valid for the drive.
    pub fn submit(&self, unit: Unit, io: IoRequest) -> IdeResult<CompletionToken> {
        let (ctrl, drive) = self.unit_drive(unit)?;
        let block_size = drive.block_size();

        if drive.is_atapi() {
            if io.direction == Direction::Write && drive.is_cdrom() {
                return Err(IdeError::ReadOnly);
            }
            if io.count == 0 && io.buffer.is_empty() {
                return Err(IdeError::InvalidParameter);
            }
            let blocks = if io.count == 0 {
                io.buffer.len().div_ceil(block_size as usize) as u64
            } else {
                if io.buffer.len() < io.count as usize * block_size as usize {
                    return Err(IdeError::InvalidParameter);
                }
                io.count as u64
            };
            if drive.atapi_blocks > 0 && io.lba as u64 + blocks > drive.atapi_blocks as u64 {
                return Err(IdeError::InvalidParameter);
            }
        } else {
            if io.count == 0 || io.buffer.len() < io.count as usize * SECTOR_SIZE {
                return Err(IdeError::InvalidParameter);
            }
            let end = io.lba as u64 + io.count as u64;
            if end > LBA28_LIMIT || (drive.sectors > 0 && end > drive.sectors as u64) {
                return Err(IdeError::InvalidParameter);
            }
        }

        let cmd = match (drive.is_atapi(), io.direction) {
            (true, _) => ATA_CMD_PACKET,
            (false, Direction::Read) => ATA_CMD_READ_PIO,
            (false, Direction::Write) => ATA_CMD_WRITE_PIO,
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let completion = Arc::new(Completion::default());
        let token = CompletionToken {
            controller: unit.controller as usize,
            id,
            inner: completion.clone(),
        };
        let req = Box::new(Request::new(id, unit.drive, io, block_size, cmd, completion));

        {
            let mut st = ctrl.lock();
            if st.flags.contains(ControllerFlags::CLOSING) {
                return Err(IdeError::Busy);
            }
            st.queue
                .pending
                .try_reserve(1)
                .map_err(|_| IdeError::ResourceExhausted)?;
            st.queue.put(req);
        }
        debug!("{}: queued req {}", unit, id);
        self.kick(unit.controller as usize);
        Ok(token)
    }

    /// Try to make progress on a channel from call context.
    pub fn kick(&self, controller: usize) {
        if let Some(mut ch) = self.claim(controller, ControllerFlags::IN_START, ControllerFlags::PENDING_KICK) {
            ch.kick();
        }
    }

    /// Block until the request behind `token` completes.
    ///
    /// On interrupt-mode channels the host's interrupt and timer paths must
    /// be live while this spins.
    pub fn wait(&self, token: &CompletionToken) -> IoOutcome {
        loop {
            if token.is_complete() {
                // A clone of the token may already have taken the outcome.
                return token.try_take().unwrap_or_else(|| IoOutcome {
                    result: Err(IdeError::InvalidParameter),
                    bytes: 0,
                    residual: 0,
                    buffer: Vec::new(),
                });
            }
            let polled = self
                .controllers
                .get(token.controller)
                .map_or(false, |c| !c.interrupt_mode());
            if polled {
                self.kick(token.controller);
            }
            core::hint::spin_loop();
        }
    }

    /// Read whole blocks into `buf`; returns the bytes read.
    pub fn read_blocks(&self, unit: Unit, lba: u32, buf: &mut [u8]) -> IdeResult<usize> {
        let drive = self.drive_info(unit)?;
        let count = (buf.len() / drive.block_size() as usize) as u32;
        let io = IoRequest::read(lba, count, vec![0u8; buf.len()]).with_origin(BufferOrigin::User);
        let token = self.submit(unit, io)?;
        let outcome = self.wait(&token);
        outcome.result?;
        buf[..outcome.bytes].copy_from_slice(&outcome.buffer[..outcome.bytes]);
        Ok(outcome.bytes)
    }

    /// Write whole blocks from `data`, flushing the drive cache on ATA disks.
    pub fn write_blocks(&self, unit: Unit, lba: u32, data: &[u8]) -> IdeResult<usize> {
        let drive = self.drive_info(unit)?;
        let count = (data.len() / drive.block_size() as usize) as u32;
        let io = IoRequest::write(lba, count, data.to_vec()).with_origin(BufferOrigin::User);
        let token = self.submit(unit, io)?;
        let outcome = self.wait(&token);
        outcome.result?;
        if !drive.is_atapi() {
            self.flush_cache(unit)?;
        }
        Ok(outcome.bytes)
    }

    /* ============================================================================
     * HOST CALLBACKS
     * ============================================================================ */

    /// Interrupt entry for `irq`. Returns whether a channel claimed it.
    pub fn handle_interrupt(&self, irq: u8) -> bool {
        let mut handled = false;
        for ctrl in self.controllers.iter().filter(|c| c.irq() == irq && c.is_present()) {
            match Channel::claim(
                &self.io,
                &self.timer,
                &self.config,
                ctrl,
                ControllerFlags::IN_ISR,
                ControllerFlags::PENDING_IRQ,
            ) {
                Some(mut ch) => handled |= ch.interrupt(),
                None => handled = true,
            }
        }
        handled
    }

    /// Timer expiry for a handle armed on `controller`. Stale handles are ignored.
    pub fn watchdog_fired(&self, controller: usize, handle: TimerHandle) {
        let Some(ctrl) = self.controllers.get(controller) else {
            return;
        };
        {
            let mut st = ctrl.lock();
            if st.watchdog != Some(handle) {
                return;
            }
            st.watchdog = None;
        }
        match self.claim(controller, ControllerFlags::IN_TIMER, ControllerFlags::empty()) {
            Some(mut ch) => ch.watchdog_service(),
            None => {
                // Whoever owns the channel is making progress; look again later.
                let mut st = ctrl.lock();
                if st.watchdog.is_none() && st.flags.contains(ControllerFlags::BUSY) {
                    st.watchdog = Some(self.timer.arm(controller, self.config.service_ticks()));
                    st.counters.wd_armed += 1;
                }
            }
        }
    }

    /* ============================================================================
     * ADMINISTRATION
     * ============================================================================ */

    /// Fail the request in flight and let the queue move on. Packet loops
    /// on either drive bail out at their next checkpoint.
    pub fn rescue(&self, controller: usize) -> IdeResult<()> {
        let ctrl = self.ctrl(controller)?;
        if !ctrl.is_present() {
            return Err(IdeError::NoDevice);
        }
        {
            let mut st = ctrl.lock();
            for d in st.drives.iter_mut() {
                d.flags |= DriveFlags::ABORT;
            }
        }
        warn!("c{}: rescue requested", controller);
        if let Some(mut ch) = self.claim(controller, ControllerFlags::IN_START, ControllerFlags::RESCUE_PENDING) {
            ch.rescue_current(IdeError::Aborted);
            ch.kick();
        }
        Ok(())
    }

    pub fn soft_reset(&self, controller: usize) -> IdeResult<()> {
        self.admin(controller, |ch| ch.soft_reset())
    }

    pub fn quiesce(&self, controller: usize) -> IdeResult<()> {
        self.admin(controller, |ch| ch.quiesce())
    }

    /// Switch a channel between interrupt-driven and polled operation.
    pub fn set_interrupt_mode(&self, controller: usize, on: bool) -> IdeResult<()> {
        self.admin(controller, |ch| {
            {
                let mut st = ch.ctrl.lock();
                st.flags.set(ControllerFlags::INTR_MODE, on);
            }
            if on {
                ch.irq_on();
            } else {
                ch.irq_off();
            }
            Ok(())
        })
    }

    pub fn flush_cache(&self, unit: Unit) -> IdeResult<()> {
        let (_, drive) = self.unit_drive(unit)?;
        if drive.is_atapi() {
            return Err(IdeError::NotSupported);
        }
        self.admin(unit.controller as usize, |ch| ch.flush_cache(unit.drive))
    }

    /* ============================================================================
     * DIAGNOSTICS
     * ============================================================================ */

    pub fn counters(&self, controller: usize) -> IdeResult<Counters> {
        self.ctrl(controller).map(Controller::counters)
    }

    pub fn last_command(&self, controller: usize) -> IdeResult<LastCommand> {
        self.ctrl(controller).map(Controller::last_command)
    }

    /// Progress of the request in flight on `controller`, if any.
    pub fn progress(&self, controller: usize) -> Option<Progress> {
        self.controllers.get(controller)?.progress()
    }

    /* ============================================================================
     * ATAPI COMMANDS
     * ============================================================================ */

    fn atapi<R>(&self, unit: Unit, f: impl FnOnce(&Channel<'_, P, T>, u8) -> IdeResult<R>) -> IdeResult<R> {
        let (_, drive) = self.unit_drive(unit)?;
        if !drive.is_atapi() {
            return Err(IdeError::NotSupported);
        }
        self.admin(unit.controller as usize, |ch| {
            ch.clear_abort(unit.drive);
            f(&*ch, unit.drive)
        })
    }

    /// `Ok(false)` when the drive has no medium.
    pub fn test_unit_ready(&self, unit: Unit) -> IdeResult<bool> {
        self.atapi(unit, |ch, d| ch.test_unit_ready(d))
    }

    pub fn request_sense(&self, unit: Unit) -> IdeResult<SenseData> {
        self.atapi(unit, |ch, d| ch.request_sense_now(d))
    }

    pub fn inquiry(&self, unit: Unit) -> IdeResult<InquiryData> {
        self.atapi(unit, |ch, d| ch.inquiry(d))
    }

    /// (blocks, block size)
    pub fn read_capacity(&self, unit: Unit) -> IdeResult<(u32, u32)> {
        self.atapi(unit, |ch, d| ch.read_capacity(d))
    }

    pub fn mode_sense(&self, unit: Unit, page: u8, subpage: u8, buf: &mut [u8]) -> IdeResult<usize> {
        self.atapi(unit, |ch, d| ch.mode_sense(d, page, subpage, buf))
    }

    pub fn start_stop(&self, unit: Unit, start: bool, load_eject: bool) -> IdeResult<()> {
        self.atapi(unit, |ch, d| ch.start_stop(d, start, load_eject))
    }

    pub fn eject(&self, unit: Unit) -> IdeResult<()> {
        self.start_stop(unit, false, true)
    }

    pub fn load(&self, unit: Unit) -> IdeResult<()> {
        self.start_stop(unit, true, true)
    }

    pub fn prevent_allow(&self, unit: Unit, prevent: bool) -> IdeResult<()> {
        self.atapi(unit, |ch, d| ch.prevent_allow(d, prevent))
    }

    pub fn pause_resume(&self, unit: Unit, resume: bool) -> IdeResult<()> {
        self.atapi(unit, |ch, d| ch.pause_resume(d, resume))
    }

    pub fn play_audio_msf(&self, unit: Unit, start: Msf, end: Msf) -> IdeResult<()> {
        self.atapi(unit, |ch, d| ch.play_audio_msf(d, start, end))
    }

    pub fn read_toc(&self, unit: Unit, msf: bool, format: u8, track: u8, buf: &mut [u8]) -> IdeResult<usize> {
        self.atapi(unit, |ch, d| ch.read_toc(d, msf, format, track, buf))
    }

    pub fn read_subchannel(&self, unit: Unit, msf: bool) -> IdeResult<SubChannel> {
        self.atapi(unit, |ch, d| ch.read_subchannel(d, msf))
    }
}
