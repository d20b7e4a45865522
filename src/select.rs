//! Drive selection, bounded status waits and channel-level controls.

use log::{debug, trace, warn};

use crate::channel::Channel;
use crate::consts::*;
use crate::controller::Selection;
use crate::error::{IdeError, IdeResult};
use crate::port::PortIo;
use crate::timer::Timer;
use crate::types::{ControllerFlags, Status};

/// Status and error registers captured together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusSnapshot {
    pub status: Status,
    pub error: u8,
}

impl StatusSnapshot {
    /// Device error carrying both registers.
    pub fn to_error(self) -> IdeError {
        IdeError::Device { status: self.status.bits(), error: self.error }
    }
}

/// A bounded wait ran out; carries the last status seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeout {
    pub last: Status,
}

impl From<WaitTimeout> for IdeError {
    fn from(_: WaitTimeout) -> Self {
        IdeError::Timeout
    }
}

/// Drive/head register value for a selection.
pub(crate) fn drive_head(drive: u8, lba_mode: bool, hi4: u8) -> u8 {
    let mut dh = ATA_DH_BASE | (hi4 & 0x0F);
    if lba_mode {
        dh |= ATA_DH_LBA;
    }
    if drive & 1 != 0 {
        dh |= ATA_DH_DRIVE1;
    }
    dh
}

impl<P: PortIo, T: Timer> Channel<'_, P, T> {
    /// Four alternate-status reads, the classic 400ns settle.
    pub(crate) fn delay400(&self) {
        for _ in 0..4 {
            self.alt_status();
        }
    }

    /// Alternate status plus the error register when the device is not busy.
    pub(crate) fn read_error(&self) -> StatusSnapshot {
        let status = self.alt_status();
        let error = if status.idle() { self.read_reg(ATA_REG_ERROR) } else { 0 };
        StatusSnapshot { status, error }
    }

    /// Select `drive`, addressing `lba`. Skips the register write and the
    /// settle delay when the cached selection already matches. The slot must
    /// hold an attached unit.
    pub(crate) fn select(&self, drive: u8, lba: u32) -> IdeResult<()> {
        if drive as usize >= DRIVES_PER_CONTROLLER {
            return Err(IdeError::InvalidParameter);
        }
        if !self.ctrl.lock().drives[drive as usize].is_present() {
            return Err(IdeError::NoDevice);
        }
        self.select_raw(drive, lba)
    }

    /// `select` without the attached-unit check, for probing empty slots.
    pub(crate) fn select_raw(&self, drive: u8, lba: u32) -> IdeResult<()> {
        if drive as usize >= DRIVES_PER_CONTROLLER {
            return Err(IdeError::InvalidParameter);
        }
        let want = {
            let mut st = self.ctrl.lock();
            if !st.flags.contains(ControllerFlags::PRESENT) {
                return Err(IdeError::NoDevice);
            }
            let lba_mode = st.drives[drive as usize].lba_ok;
            let want = Selection {
                drive: Some(drive),
                lba_mode,
                hi4: if lba_mode { ((lba >> 24) & 0x0F) as u8 } else { 0 },
            };
            if st.selection == want {
                return Ok(());
            }
            st.selection = want;
            want
        };

        let snap = self.read_error();
        let dh = drive_head(drive, want.lba_mode, want.hi4);
        trace!(
            "c{}: select drive {} dh={:02x} ST={:02x} ER={:02x}",
            self.ctrl.index(),
            drive,
            dh,
            snap.status.bits(),
            snap.error
        );
        self.write_reg(ATA_REG_HDDEVSEL, dh);
        self.delay400();
        Ok(())
    }

    /// Forget the cached selection; the next `select` writes the register.
    pub(crate) fn invalidate_selection(&self) {
        self.ctrl.lock().selection = Selection::default();
    }

    /// Poll alternate status every microsecond until all of `set` are on and
    /// all of `clear` are off, for at most `usec` microseconds.
    pub(crate) fn wait_for(
        &self,
        set: Status,
        clear: Status,
        usec: u32,
    ) -> Result<StatusSnapshot, WaitTimeout> {
        let mut status = self.alt_status();
        for _ in 0..=usec {
            if status.contains(set) && !status.intersects(clear) {
                let error = if status.contains(Status::ERR) {
                    self.read_reg(ATA_REG_ERROR)
                } else {
                    0
                };
                return Ok(StatusSnapshot { status, error });
            }
            self.delay_us(1);
            status = self.alt_status();
        }
        Err(WaitTimeout { last: status })
    }

    /// After the last word of a read, wait for BSY and DRQ to drop.
    pub(crate) fn drain_final_status(&self) -> IdeResult<()> {
        self.alt_status();
        for _ in 0..DRAIN_FINAL_ITERATIONS {
            let status = self.status();
            if status.failed() {
                let error = self.read_reg(ATA_REG_ERROR);
                return Err(IdeError::Device { status: status.bits(), error });
            }
            if status.idle() {
                return Ok(());
            }
            self.delay_us(1);
        }
        self.count(|c| c.wait_bsy_timeouts += 1);
        Err(IdeError::Timeout)
    }

    /* ============================================================================
     * INTERRUPT ENABLE AND RESET
     * ============================================================================ */

    pub(crate) fn irq_on(&self) {
        self.write_devctl(0);
        let mut st = self.ctrl.lock();
        st.flags |= ControllerFlags::IRQ_ON;
        st.counters.irq_turn_on += 1;
    }

    pub(crate) fn irq_off(&self) {
        self.write_devctl(ATA_CTL_NIEN);
        let mut st = self.ctrl.lock();
        st.flags.remove(ControllerFlags::IRQ_ON);
        st.counters.irq_turn_off += 1;
    }

    /// Pulse SRST on the channel and wait for the drives to come back.
    pub(crate) fn soft_reset(&self) -> IdeResult<()> {
        let irq_was_on = self.ctrl.lock().flags.contains(ControllerFlags::IRQ_ON);
        debug!("c{}: soft reset", self.ctrl.index());

        self.write_devctl(ATA_CTL_SRST | ATA_CTL_NIEN);
        for _ in 0..16 {
            self.delay400();
        }
        self.write_devctl(ATA_CTL_NIEN);
        for _ in 0..4 {
            self.delay400();
        }
        self.ctrl.lock().flags.remove(ControllerFlags::IRQ_ON);
        self.invalidate_selection();
        self.count(|c| c.soft_resets += 1);

        let settled = self.wait_for(Status::empty(), Status::BSY, TMO_RESET_US);
        if irq_was_on {
            self.irq_on();
        }
        match settled {
            Ok(_) => Ok(()),
            Err(t) => {
                warn!(
                    "c{}: BSY stuck after reset ST={:02x}",
                    self.ctrl.index(),
                    t.last.bits()
                );
                self.count(|c| c.wait_bsy_timeouts += 1);
                Err(t.into())
            }
        }
    }

    /// Mask interrupts and let the master drain whatever it was doing.
    pub(crate) fn quiesce(&self) -> IdeResult<()> {
        self.irq_off();
        self.select_raw(0, 0)?;
        self.wait_for(Status::empty(), Status::BSY, TMO_PROGRAM_BSY_US)?;
        self.drain_final_status()
    }
}
