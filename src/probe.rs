//! Channel attach and drive probing.

use log::{debug, info, warn};

use crate::channel::Channel;
use crate::error::{IdeError, IdeResult};
use crate::port::PortIo;
use crate::timer::Timer;
use crate::types::{ControllerFlags, Drive, DriveFlags};

impl<P: PortIo, T: Timer> Channel<'_, P, T> {
    /// Reset the channel and probe both drive slots. Returns the number of
    /// drives found.
    pub(crate) fn attach(&mut self) -> IdeResult<usize> {
        if self.alt_status().bits() == 0xFF {
            debug!("c{}: floating bus", self.ctrl.index());
            self.ctrl.lock().flags.remove(ControllerFlags::PRESENT);
            return Err(IdeError::NoDevice);
        }

        self.irq_off();
        if let Err(e) = self.soft_reset() {
            warn!("c{}: reset at attach failed: {}", self.ctrl.index(), e);
        }

        let mut found = 0;
        for drive in 0..2u8 {
            match self.probe_unit(drive) {
                Ok(()) => found += 1,
                Err(e) => debug!("{}: nothing attached ({})", self.unit(drive), e),
            }
        }

        if self.intr_mode() {
            self.irq_on();
        }
        info!(
            "c{}: io {:#x} irq {}, {} drive(s), {} mode",
            self.ctrl.index(),
            self.ctrl.io_base(),
            self.ctrl.irq(),
            found,
            if self.intr_mode() { "interrupt" } else { "polled" }
        );
        Ok(found)
    }

    pub(crate) fn probe_unit(&mut self, drive: u8) -> IdeResult<()> {
        self.update_drive(drive, |d| *d = Drive::new());

        let sig = match self.read_signature(drive)? {
            Some(sig) if sig.is_known() => sig,
            _ => return Err(IdeError::NoDevice),
        };
        let atapi = sig.is_atapi();
        let ident = self.identify(drive, atapi)?;

        self.update_drive(drive, |d| {
            d.flags |= DriveFlags::PRESENT;
            if atapi {
                d.flags |= DriveFlags::ATAPI;
            }
            d.signature = Some(sig);
            d.model = ident.model();
            if !atapi {
                d.lba_ok = ident.lba_supported();
                d.sectors = ident.lba28_sectors();
            }
        });
        self.invalidate_selection();

        if atapi {
            self.probe_atapi(drive);
            return Ok(());
        }

        let d = self.drive_info(drive);
        let gib_tenths = (d.sectors as u64 * 10) >> 21;
        info!(
            "{}: ATA disk, model=\"{}\" {} ({}.{} GiB)",
            self.unit(drive),
            d.model,
            if d.lba_ok { "LBA28" } else { "CHS" },
            gib_tenths / 10,
            gib_tenths % 10
        );
        let multi = self.negotiate_pio_multiple(drive);
        info!("{}: PIO multiple {}", self.unit(drive), multi);
        Ok(())
    }
}
