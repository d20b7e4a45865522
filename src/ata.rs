//! ATA command engine
//!
//! Taskfile programming, chunk sizing and per-sector PIO for disk requests.
//! The interrupt handler and the poll engine both advance a request through
//! [`Channel::ata_step`], which looks at one status sample and says what
//! should happen next.

use log::{debug, trace, warn};

use crate::channel::{copy_back, Channel};
use crate::consts::*;
use crate::error::{IdeError, IdeResult};
use crate::port::PortIo;
use crate::queue::QueueState;
use crate::request::{BufferOrigin, Direction, XferTarget};
use crate::timer::Timer;
use crate::types::{Drive, Status};

/// Next move of the transfer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    /// More data of the current chunk may be moved right away
    Continue,
    /// Chunk done and the device idle; issue the next command
    ProgramNextChunk,
    /// Request is over
    Finish(IdeResult<()>),
    /// Nothing to do until the device signals again
    AwaitMore,
}

/// Register image of one ATA command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Taskfile {
    pub(crate) drive: u8,
    pub(crate) lba: u32,
    /// Sector count, 0 meaning 256
    pub(crate) count: u8,
    pub(crate) features: u8,
    pub(crate) command: u8,
    /// PACKET byte count limit, written to LBA1/LBA2 instead of the address
    pub(crate) byte_count: Option<u16>,
}

/// Choose the read/write opcode for a chunk of `sectors`.
pub(crate) fn multicmd(direction: Direction, sectors: u32, drive: &Drive) -> u8 {
    let multiple = sectors > 1 && drive.pio_multi > 1 && drive.multi_ok;
    match (direction, multiple) {
        (Direction::Read, true) => ATA_CMD_READ_MULTIPLE,
        (Direction::Read, false) => ATA_CMD_READ_PIO,
        (Direction::Write, true) => ATA_CMD_WRITE_MULTIPLE,
        (Direction::Write, false) => ATA_CMD_WRITE_PIO,
    }
}

/// Parsed IDENTIFY (PACKET) DEVICE data.
#[derive(Debug, Clone)]
pub struct IdentifyData {
    pub words: [u16; SECTOR_WORDS],
}

impl IdentifyData {
    /// Model number, words 27..=46, each word big-endian.
    pub fn model(&self) -> heapless::String<40> {
        let mut bytes = [0u8; 40];
        for (i, word) in self.words[ATA_IDENT_MODEL..ATA_IDENT_MODEL + ATA_IDENT_MODEL_WORDS]
            .iter()
            .enumerate()
        {
            bytes[2 * i..2 * i + 2].copy_from_slice(&word.to_be_bytes());
        }
        crate::types::ascii_field(&bytes)
    }

    pub fn lba_supported(&self) -> bool {
        self.words[ATA_IDENT_CAPABILITIES] & ATA_CAP_LBA != 0
    }

    /// LBA28 addressable sectors, words 60..=61.
    pub fn lba28_sectors(&self) -> u32 {
        (self.words[ATA_IDENT_LBA28_HI] as u32) << 16 | self.words[ATA_IDENT_LBA28_LO] as u32
    }
}

impl<P: PortIo, T: Timer> Channel<'_, P, T> {
    /// Write a taskfile and issue its command.
    pub(crate) fn issue(&self, tf: &Taskfile) -> IdeResult<()> {
        self.write_taskfile(tf, false)
    }

    fn write_taskfile(&self, tf: &Taskfile, probing: bool) -> IdeResult<()> {
        if let Err(t) = self.wait_for(Status::empty(), Status::BSY, TMO_PROGRAM_BSY_US) {
            self.count(|c| c.wait_bsy_timeouts += 1);
            warn!(
                "c{}: BSY before cmd {:02x} ST={:02x}",
                self.ctrl.index(),
                tf.command,
                t.last.bits()
            );
        }
        if probing {
            self.select_raw(tf.drive, tf.lba)?;
        } else {
            self.select(tf.drive, tf.lba)?;
        }

        self.write_reg(ATA_REG_FEATURES, tf.features);
        self.write_reg(ATA_REG_SECCOUNT, tf.count);
        match tf.byte_count {
            Some(bc) => {
                self.write_reg(ATA_REG_LBA0, 0);
                self.write_reg(ATA_REG_LBA1, (bc & 0xFF) as u8);
                self.write_reg(ATA_REG_LBA2, (bc >> 8) as u8);
            }
            None => {
                self.write_reg(ATA_REG_LBA0, tf.lba as u8);
                self.write_reg(ATA_REG_LBA1, (tf.lba >> 8) as u8);
                self.write_reg(ATA_REG_LBA2, (tf.lba >> 16) as u8);
            }
        }
        self.write_reg(ATA_REG_COMMAND, tf.command);
        self.delay400();
        Ok(())
    }

    /// Issue the current chunk of the request in flight.
    pub(crate) fn program_taskfile(&mut self) -> IdeResult<()> {
        let Some(req) = self.req.as_mut() else {
            return Ok(());
        };
        req.packet.cdb_sent = false;
        let tf = Taskfile {
            drive: req.drive,
            lba: req.lba_cur,
            count: (req.chunk_sectors.min(MAX_SECTORS_PER_COMMAND) & 0xFF) as u8,
            features: 0,
            command: req.cmd,
            byte_count: None,
        };
        let id = req.id;

        let snap = self.read_error();
        let dh = crate::select::drive_head(tf.drive, self.drive_info(tf.drive).lba_ok, (tf.lba >> 24) as u8);
        let tick = self.timer.now();
        self.with_state(|st| {
            st.last_command = crate::controller::LastCommand {
                command: tf.command,
                count: tf.count,
                device: dh,
                lba: tf.lba,
                error: snap.error,
                request_id: id,
                tick,
            };
        });
        debug!(
            "{}: cmd {:02x} lba {} sc {}",
            self.unit(tf.drive),
            tf.command,
            tf.lba,
            tf.count
        );
        self.issue(&tf)?;

        if self.intr_mode() {
            self.delay_us(INTR_ISSUE_SETTLE_US);
            if matches!(tf.command, ATA_CMD_WRITE_PIO | ATA_CMD_WRITE_MULTIPLE) {
                match self.wait_for(Status::DRQ, Status::BSY, TMO_WRITE_PRIME_US) {
                    Ok(snap) if snap.status.failed() => return Err(snap.to_error()),
                    Ok(_) => {
                        self.count(|c| c.wait_drq_ok += 1);
                        self.prime_write();
                    }
                    Err(t) => {
                        self.count(|c| c.wait_drq_timeouts += 1);
                        warn!(
                            "{}: no DRQ for write, ST={:02x}",
                            self.unit(tf.drive),
                            t.last.bits()
                        );
                        return Err(t.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Size the next chunk and program it.
    pub(crate) fn ata_request(&mut self, arm_ticks: u32) -> IdeResult<()> {
        let intr = self.intr_mode();
        let drive = match self.req.as_ref() {
            Some(req) => self.drive_info(req.drive),
            None => return Ok(()),
        };
        let staging_sectors = self
            .staging
            .as_ref()
            .map(|s| self.config.staging_sectors().min((s.len() / SECTOR_SIZE) as u32));
        let drq_budget = self.config.drq_budget();

        let Some(req) = self.req.as_mut() else {
            return Ok(());
        };
        let staged = req.origin == BufferOrigin::User && staging_sectors.is_some();

        let mut n = req.sectors_left.min(MAX_SECTORS_PER_COMMAND);
        if !intr {
            n = n.min(drive.pio_multi.max(1) as u32);
        }
        if let (true, Some(cap)) = (staged, staging_sectors) {
            if cap == 0 {
                warn!("req {}: staging buffer holds no whole sector", req.id);
                return Err(IdeError::ResourceExhausted);
            }
            n = n.min(cap);
        }
        if n == 0 {
            return Ok(());
        }

        req.lba_cur = req.lba + (req.xfer_off / SECTOR_SIZE) as u32;
        req.chunk_sectors = n;
        req.chunk_left = n;
        req.chunk_start = req.xfer_off;
        req.chunk_bytes = n as usize * SECTOR_SIZE;
        req.cmd = multicmd(req.direction, n, &drive);
        req.await_drq = drq_budget;
        req.needs_copy_back = false;
        req.target = XferTarget::Direct;

        if staged {
            req.target = XferTarget::Staging;
            if req.is_read() {
                req.needs_copy_back = true;
            } else if let Some(staging) = self.staging.as_mut() {
                let (start, len) = (req.chunk_start, req.chunk_bytes);
                staging[..len].copy_from_slice(&req.buffer[start..start + len]);
            }
        }

        self.with_state(|st| {
            st.queue.state = QueueState::Transferring;
            if !intr {
                st.counters.polled_chunks += 1;
            }
        });
        self.program_taskfile()?;
        if arm_ticks > 0 {
            self.arm_watchdog(arm_ticks);
        }
        Ok(())
    }

    /// Move exactly one sector through the data register.
    pub(crate) fn pio_one_sector(&mut self) {
        let port = self.ctrl.io_base() + ATA_REG_DATA;
        let Channel { io, req, staging, .. } = self;
        let Some(req) = req.as_mut() else {
            return;
        };
        if req.chunk_left == 0 || req.sectors_left == 0 {
            return;
        }

        let (off, chunk_off, read) = (req.xfer_off, req.chunk_offset(), req.is_read());
        let buf = match req.target {
            XferTarget::Staging => staging
                .as_mut()
                .and_then(|s| s.get_mut(chunk_off..chunk_off + SECTOR_SIZE)),
            XferTarget::Direct => req.buffer.get_mut(off..off + SECTOR_SIZE),
        };
        let Some(buf) = buf else {
            warn!("req {}: sector {} outside buffer", req.id, req.lba_cur);
            return;
        };

        if read {
            for pair in buf.chunks_exact_mut(2) {
                pair.copy_from_slice(&io.inw(port).to_le_bytes());
            }
        } else {
            for pair in buf.chunks_exact(2) {
                io.outw(port, u16::from_le_bytes([pair[0], pair[1]]));
            }
        }

        req.xfer_off += SECTOR_SIZE;
        req.chunk_left -= 1;
        req.sectors_left -= 1;
        req.lba_cur += 1;
        self.count(|c| c.sectors += 1);
    }

    /// Wait for the data phase and move one sector.
    pub(crate) fn data_phase_service(&mut self) -> IdeResult<()> {
        match self.wait_for(Status::DRQ | Status::DRDY, Status::BSY, TMO_DATA_DRQ_US) {
            Ok(snap) if snap.status.failed() => return Err(snap.to_error()),
            Ok(_) => self.count(|c| c.wait_drq_ok += 1),
            Err(t) => {
                self.count(|c| c.wait_drq_timeouts += 1);
                return Err(t.into());
            }
        }
        self.delay_us(DATA_PHASE_SETTLE_US);
        self.pio_one_sector();
        Ok(())
    }

    /// Feed the first DRQ block of a write so the device starts interrupting.
    pub(crate) fn prime_write(&mut self) {
        let block = match self.req.as_ref() {
            Some(req) if req.cmd == ATA_CMD_WRITE_MULTIPLE => {
                self.drive_info(req.drive).pio_multi.max(1) as u32
            }
            Some(_) => 1,
            None => return,
        };
        for _ in 0..block {
            self.pio_one_sector();
            let more = self.req.as_ref().map_or(false, |r| r.chunk_left > 0);
            if !more {
                break;
            }
            let status = self.alt_status();
            if !status.drq() || status.busy() {
                break;
            }
        }
        self.set_queue_state(QueueState::Primed);
    }

    /// Advance the ATA request in flight by one status sample.
    pub(crate) fn ata_step(&mut self, status: Status, chunk_end_us: u32) -> Action {
        if status.failed() {
            let error = self.read_reg(ATA_REG_ERROR);
            if let Some(req) = self.req.as_mut() {
                req.status = status;
                req.error = error;
            }
            return Action::Finish(Err(IdeError::Device { status: status.bits(), error }));
        }
        let Some(req) = self.req.as_ref() else {
            return Action::AwaitMore;
        };
        let (chunk_left, sectors_left) = (req.chunk_left, req.sectors_left);

        if status.drq() && !status.busy() {
            if chunk_left == 0 {
                return Action::Finish(Err(IdeError::Protocol { status: status.bits(), reason: 0 }));
            }
            if let Err(e) = self.data_phase_service() {
                return Action::Finish(Err(e));
            }
            let Some(req) = self.req.as_mut() else {
                return Action::AwaitMore;
            };
            if req.chunk_left > 0 {
                return Action::Continue;
            }

            if req.needs_copy_back {
                copy_back(self.staging.as_deref(), req);
            }
            let (read, sectors_left) = (req.is_read(), req.sectors_left);
            self.set_queue_state(QueueState::Waiting);

            if sectors_left == 0 {
                if read {
                    return Action::Finish(self.drain_final_status());
                }
                // Writes finish on the next idle edge.
                return Action::AwaitMore;
            }
            return match self.wait_for(Status::empty(), Status::BSY | Status::DRQ, chunk_end_us) {
                Ok(snap) if snap.status.failed() => Action::Finish(Err(snap.to_error())),
                Ok(_) => Action::ProgramNextChunk,
                Err(t) => {
                    self.count(|c| c.wait_bsy_timeouts += 1);
                    Action::Finish(Err(t.into()))
                }
            };
        }

        if status.idle() && chunk_left == 0 {
            if sectors_left == 0 {
                return Action::Finish(Ok(()));
            }
            return Action::ProgramNextChunk;
        }
        Action::AwaitMore
    }

    /// Interrupt-context driver for ATA requests.
    pub(crate) fn ata_service_irq(&mut self, status: Status) {
        let ticks = self.config.watchdog_ticks;
        let mut status = status;
        loop {
            if status.busy() {
                self.count(|c| c.irq_busy_skipped += 1);
                self.arm_watchdog(ticks);
                return;
            }
            if status.drq() {
                self.count(|c| c.irq_drq_service += 1);
            }
            match self.ata_step(status, TMO_CHUNK_END_US) {
                Action::Continue => {
                    let next = self.alt_status();
                    if next.drq() && !next.busy() {
                        status = next;
                        continue;
                    }
                    self.arm_watchdog(ticks);
                }
                Action::AwaitMore => self.arm_watchdog(ticks),
                Action::ProgramNextChunk => {
                    self.count(|c| c.irq_end_of_chunk += 1);
                    if let Err(e) = self.program_next_chunk(ticks) {
                        self.finish(Err(e));
                    }
                }
                Action::Finish(result) => {
                    if result.is_err() {
                        self.count(|c| c.irq_error += 1);
                    }
                    self.finish(result);
                }
            }
            return;
        }
    }

    /* ============================================================================
     * DEVICE COMMANDS OUTSIDE THE QUEUE
     * ============================================================================ */

    /// Read the device signature left in LBA1/LBA2 by IDENTIFY DEVICE.
    pub(crate) fn read_signature(&self, drive: u8) -> IdeResult<Option<crate::types::Signature>> {
        self.select_raw(drive, 0)?;
        self.write_reg(ATA_REG_COMMAND, ATA_CMD_IDENTIFY);
        self.delay400();

        let status = self.alt_status();
        if status.bits() == 0x00 || status.bits() == 0xFF {
            return Ok(None);
        }
        if self.wait_for(Status::empty(), Status::BSY, TMO_IDENTIFY_US).is_err() {
            return Ok(None);
        }
        let sig = (self.read_reg(ATA_REG_LBA2) as u16) << 8 | self.read_reg(ATA_REG_LBA1) as u16;
        let sig = crate::types::Signature::decode(sig);
        trace!("{}: signature {:?}", self.unit(drive), sig);
        Ok(Some(sig))
    }

    /// IDENTIFY DEVICE, or IDENTIFY PACKET DEVICE for ATAPI units.
    pub(crate) fn identify(&self, drive: u8, packet: bool) -> IdeResult<IdentifyData> {
        let command = if packet { ATA_CMD_IDENTIFY_PACKET } else { ATA_CMD_IDENTIFY };
        self.write_taskfile(&Taskfile { drive, command, ..Taskfile::default() }, true)?;

        let status = self.alt_status();
        if status.bits() == 0x00 || status.bits() == 0xFF {
            return Err(IdeError::NoDevice);
        }
        let snap = self.wait_for(Status::DRQ, Status::BSY, TMO_IDENTIFY_US)?;
        if snap.status.failed() {
            return Err(snap.to_error());
        }

        let mut words = [0u16; SECTOR_WORDS];
        self.io.insw(self.ctrl.io_base() + ATA_REG_DATA, &mut words);
        self.drain_final_status()?;
        Ok(IdentifyData { words })
    }

    pub(crate) fn enable_pio_multiple(&self, drive: u8, count: u8) -> IdeResult<()> {
        self.issue(&Taskfile {
            drive,
            count,
            command: ATA_CMD_SET_MULTIPLE,
            ..Taskfile::default()
        })?;
        let snap = self.wait_for(Status::empty(), Status::BSY, TMO_SET_MULTIPLE_US)?;
        if snap.status.failed() {
            let error = self.read_reg(ATA_REG_ERROR);
            return Err(IdeError::Device { status: snap.status.bits(), error });
        }
        Ok(())
    }

    /// Find the largest multiple count the drive accepts.
    pub(crate) fn negotiate_pio_multiple(&self, drive: u8) -> u8 {
        let mut count = if self.config.use_max_multiple { PIO_MULTIPLE_MAX } else { PIO_MULTIPLE_MAX / 2 };
        while count > 1 {
            match self.enable_pio_multiple(drive, count) {
                Ok(()) => {
                    self.update_drive(drive, |d| {
                        d.pio_multi = count;
                        d.multi_ok = true;
                    });
                    return count;
                }
                Err(e) => trace!("{}: SET MULTIPLE {} refused: {}", self.unit(drive), count, e),
            }
            count >>= 1;
        }
        self.update_drive(drive, |d| {
            d.pio_multi = 1;
            d.multi_ok = false;
        });
        1
    }

    pub(crate) fn flush_cache(&self, drive: u8) -> IdeResult<()> {
        self.issue(&Taskfile { drive, command: ATA_CMD_CACHE_FLUSH, ..Taskfile::default() })?;
        let snap = self.wait_for(Status::empty(), Status::BSY, TMO_FLUSH_US)?;
        if snap.status.failed() {
            return Err(snap.to_error());
        }
        Ok(())
    }
}
