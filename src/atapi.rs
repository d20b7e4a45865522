//! ATAPI packet engine
//!
//! Two ways through a packet command:
//!
//! * the synchronous packet loop ([`Channel::packet`]), used for probe-time
//!   and maintenance commands and for block requests when the controller is
//!   polled or ATAPI interrupts are disabled;
//! * the interrupt-driven phase machine ([`Channel::atapi_service_irq`]),
//!   which moves one data phase per interrupt and keeps pulling while DRQ
//!   stays up.
//!
//! Both fetch REQUEST SENSE on failure and reissue the command on Unit
//! Attention or Becoming Ready, at most [`ATAPI_MAX_RETRIES`] times.

use log::{debug, error, info, trace, warn};

use crate::ata::{Action, Taskfile};
use crate::cdb::Cdb;
use crate::channel::Channel;
use crate::consts::*;
use crate::error::{IdeError, IdeResult};
use crate::port::PortIo;
use crate::queue::QueueState;
use crate::request::{AtapiPhase, Request, XferTarget};
use crate::select::{StatusSnapshot, WaitTimeout};
use crate::sense::SenseData;
use crate::timer::Timer;
use crate::types::{AtapiClass, Drive, DriveFlags, InquiryData, Msf, Status, SubChannel};

/// Data stage of a synchronous packet command.
#[derive(Debug)]
pub(crate) enum PacketData<'b> {
    None,
    In(&'b mut [u8]),
    Out(&'b [u8]),
}

impl PacketData<'_> {
    fn len(&self) -> usize {
        match self {
            PacketData::None => 0,
            PacketData::In(buf) => buf.len(),
            PacketData::Out(buf) => buf.len(),
        }
    }
}

/// Byte count limit programmed with PACKET.
fn byte_count_limit(len: usize, block_size: u32) -> u16 {
    let limit = if len == 0 || len > block_size as usize { block_size as usize } else { len };
    // Odd limits are not allowed; 0xFFFF is reserved.
    (limit.min(0xFFFE) & !1).max(2) as u16
}

/// Read a device-offered phase of `bc` bytes, keeping what fits in `buf`.
fn pio_in<P: PortIo>(io: &P, port: u16, buf: &mut [u8], bc: usize) -> usize {
    let keep = buf.len().min(bc);
    for w in 0..(bc + 1) / 2 {
        let bytes = io.inw(port).to_le_bytes();
        let at = 2 * w;
        if at < keep {
            buf[at] = bytes[0];
        }
        if at + 1 < keep {
            buf[at + 1] = bytes[1];
        }
    }
    keep
}

/// Fill a device-requested phase of `bc` bytes from `buf`, padding with zeros.
fn pio_out<P: PortIo>(io: &P, port: u16, buf: &[u8], bc: usize) -> usize {
    let take = buf.len().min(bc);
    for w in 0..(bc + 1) / 2 {
        let at = 2 * w;
        let lo = if at < take { buf[at] } else { 0 };
        let hi = if at + 1 < take { buf[at + 1] } else { 0 };
        io.outw(port, u16::from_le_bytes([lo, hi]));
    }
    take
}

/// Re-derive block counters from the byte cursor.
fn account_blocks(req: &mut Request) {
    let blksz = req.block_size.max(1) as usize;
    let done = (req.xfer_off / blksz) as u32;
    let in_chunk = (req.xfer_off.saturating_sub(req.chunk_start) / blksz) as u32;
    req.sectors_left = req.nsec.saturating_sub(done);
    req.chunk_left = req.chunk_sectors.saturating_sub(in_chunk).min(req.sectors_left);
    req.lba_cur = req.lba + done;
}

impl<P: PortIo, T: Timer> Channel<'_, P, T> {
    /// Drive must be a present ATAPI unit.
    pub(crate) fn atapi_unit(&self, drive: u8) -> IdeResult<Drive> {
        if drive as usize >= DRIVES_PER_CONTROLLER {
            return Err(IdeError::InvalidParameter);
        }
        let info = self.drive_info(drive);
        if !info.is_present() {
            return Err(IdeError::NoDevice);
        }
        if !info.is_atapi() {
            return Err(IdeError::NotSupported);
        }
        Ok(info)
    }

    /// Wait for BSY to drop with either DRQ or an error showing.
    fn wait_drq_or_error(&self, usec: u32) -> Result<StatusSnapshot, WaitTimeout> {
        let mut status = self.alt_status();
        for _ in 0..=usec {
            if !status.busy() && (status.drq() || status.failed()) {
                let error = if status.failed() { self.read_reg(ATA_REG_ERROR) } else { 0 };
                return Ok(StatusSnapshot { status, error });
            }
            self.delay_us(1);
            status = self.alt_status();
        }
        Err(WaitTimeout { last: status })
    }

    fn interrupt_reason(&self) -> u8 {
        self.read_reg(ATA_REG_SECCOUNT) & (ATAPI_IR_COD | ATAPI_IR_IO)
    }

    /// Byte count the device offers for this data phase; 0 means one block.
    fn phase_byte_count(&self, block_size: u32) -> usize {
        let bc = (self.read_reg(ATA_REG_LBA2) as u16) << 8 | self.read_reg(ATA_REG_LBA1) as u16;
        if bc == 0 {
            block_size as usize
        } else {
            bc as usize
        }
    }

    pub(crate) fn send_cdb(&self, cdb: &Cdb) {
        trace!("c{}: CDB {:02x?}", self.ctrl.index(), cdb.bytes);
        self.io.outsw(self.ctrl.io_base() + ATA_REG_DATA, &cdb.words());
        self.delay_us(ATAPI_CDB_SETTLE_US);
    }

    /// One PACKET issue: program the byte count, wait for the command phase
    /// and write the CDB.
    fn start_packet(&self, drive: u8, cdb: &Cdb, byte_count: u16) -> IdeResult<()> {
        self.issue(&Taskfile {
            drive,
            command: ATA_CMD_PACKET,
            byte_count: Some(byte_count),
            ..Taskfile::default()
        })?;
        self.delay400();

        let snap = self.wait_drq_or_error(TMO_PACKET_DRQ_US)?;
        if snap.status.failed() {
            return Err(snap.to_error());
        }
        let ir = self.interrupt_reason();
        if ir & ATAPI_IR_COD == 0 || ir & ATAPI_IR_IO != 0 {
            debug!(
                "{}: PACKET phase mismatch ST={:02x} IR={:02x}",
                self.unit(drive),
                snap.status.bits(),
                ir
            );
            return Err(IdeError::Protocol { status: snap.status.bits(), reason: ir });
        }
        self.delay400();
        self.send_cdb(cdb);
        Ok(())
    }

    /// Issue PACKET and its CDB, resetting the channel once if the device
    /// does not enter the command phase.
    pub(crate) fn send_packet(&self, drive: u8, cdb: &Cdb, byte_count: u16) -> IdeResult<()> {
        let mut last = IdeError::Timeout;
        for attempt in 0..SEND_PACKET_ATTEMPTS {
            if attempt > 0 {
                warn!("{}: PACKET not accepted ({}), resetting channel", self.unit(drive), last);
                self.soft_reset()?;
            }
            match self.start_packet(drive, cdb, byte_count) {
                Ok(()) => return Ok(()),
                Err(e @ IdeError::Device { .. }) => return Err(e),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    /// REQUEST SENSE, fetched straight away with no retry of its own.
    pub(crate) fn request_sense_now(&self, drive: u8) -> IdeResult<SenseData> {
        let cdb = Cdb::request_sense(SENSE_LEN as u8);
        self.start_packet(drive, &cdb, SENSE_LEN as u16)?;

        let snap = self.wait_drq_or_error(TMO_SENSE_US)?;
        if snap.status.failed() {
            return Err(snap.to_error());
        }
        if !snap.status.drq() {
            return Err(IdeError::Protocol { status: snap.status.bits(), reason: self.interrupt_reason() });
        }
        let bc = self.phase_byte_count(SENSE_LEN as u32);
        let mut raw = [0u8; SENSE_LEN];
        pio_in(self.io, self.ctrl.io_base() + ATA_REG_DATA, &mut raw, bc);
        let _ = self.wait_for(Status::empty(), Status::BSY | Status::DRQ, TMO_SENSE_US);

        let sense = SenseData::from_bytes(&raw);
        self.update_drive(drive, |d| d.sense = sense);
        debug!("{}: sense {}", self.unit(drive), sense);
        Ok(sense)
    }

    /// One pass of a packet command through the polled data loop.
    /// Returns the bytes moved, which may be fewer than the buffer holds.
    pub(crate) fn packet_once(&self, drive: u8, cdb: &Cdb, data: &mut PacketData<'_>) -> IdeResult<usize> {
        if self.drive_aborting(drive) {
            return Err(IdeError::Aborted);
        }
        let block_size = self.drive_info(drive).block_size();
        self.send_packet(drive, cdb, byte_count_limit(data.len(), block_size))?;

        // Audio commands are accepted and then run in the background; some
        // devices never interrupt for them again.
        if data.len() == 0 && cdb.is_audio_control() {
            let snap = self.wait_for(Status::empty(), Status::BSY | Status::DRQ, TMO_ATAPI_BSY_US)?;
            if snap.status.failed() {
                return Err(snap.to_error());
            }
            return Ok(0);
        }

        let port = self.ctrl.io_base() + ATA_REG_DATA;
        let mut done = 0usize;
        loop {
            if self.drive_aborting(drive) {
                return Err(IdeError::Aborted);
            }
            let snap = self.wait_for(Status::empty(), Status::BSY, TMO_ATAPI_BSY_US)?;
            let status = snap.status;
            if !status.drq() {
                if status.failed() {
                    return Err(snap.to_error());
                }
                // Devices may deliver less than the allocation length.
                break;
            }

            let ir = self.interrupt_reason();
            let bc = self.phase_byte_count(block_size);
            match (ir, &mut *data) {
                (ATAPI_IR_IO, PacketData::In(buf)) => {
                    let start = done.min(buf.len());
                    done += pio_in(self.io, port, &mut buf[start..], bc);
                }
                (0, PacketData::Out(buf)) => {
                    let start = done.min(buf.len());
                    done += pio_out(self.io, port, &buf[start..], bc);
                }
                (ATAPI_IR_IO, PacketData::None) => {
                    pio_in(self.io, port, &mut [], bc);
                }
                (0, PacketData::None) => {
                    pio_out(self.io, port, &[], bc);
                }
                _ => {
                    warn!(
                        "{}: unexpected phase IR={:02x} ST={:02x} cmd {:02x}",
                        self.unit(drive),
                        ir,
                        status.bits(),
                        cdb.opcode()
                    );
                    return Err(IdeError::Protocol { status: status.bits(), reason: ir });
                }
            }
            trace!("{}: phase IR={:02x} bc={} total {}", self.unit(drive), ir, bc, done);
            self.alt_status();
        }

        let snap = self.wait_for(Status::empty(), Status::BSY, TMO_ATAPI_FINAL_US)?;
        if snap.status.failed() {
            return Err(snap.to_error());
        }
        Ok(done)
    }

    /// Run a packet command with the sense and retry policy.
    pub(crate) fn packet(&self, drive: u8, cdb: &Cdb, data: &mut PacketData<'_>) -> IdeResult<usize> {
        let needs_sense = {
            let mut st = self.ctrl.lock();
            let d = &mut st.drives[drive as usize & 1];
            let needs = d.flags.contains(DriveFlags::NEEDS_SENSE);
            d.flags.remove(DriveFlags::NEEDS_SENSE);
            needs
        };
        if needs_sense {
            let _ = self.request_sense_now(drive);
        }

        let mut retries = 0;
        loop {
            let err = match self.packet_once(drive, cdb, data) {
                Ok(n) => return Ok(n),
                Err(IdeError::Aborted) => return Err(IdeError::Aborted),
                Err(e) => e,
            };
            let sense = match self.request_sense_now(drive) {
                Ok(sense) if sense.is_valid() => sense,
                _ => return Err(err),
            };

            if sense.is_transient() && retries < ATAPI_MAX_RETRIES {
                retries += 1;
                warn!(
                    "{}: cmd {:02x} {}, retry {}",
                    self.unit(drive),
                    cdb.opcode(),
                    sense,
                    retries
                );
                if sense.is_becoming_ready() {
                    self.delay_us(ATAPI_BECOMING_READY_DELAY_US);
                    let _ = self.packet_once(drive, &Cdb::test_unit_ready(), &mut PacketData::None);
                }
                continue;
            }

            if sense.is_medium_not_present() {
                self.update_drive(drive, |d| d.flags.remove(DriveFlags::HAS_MEDIA));
            }
            debug!("{}: cmd {:02x} failed: {}", self.unit(drive), cdb.opcode(), sense);
            return Err(IdeError::Sense(sense));
        }
    }

    /* ============================================================================
     * BLOCK REQUESTS
     * ============================================================================ */

    /// Program the next READ(10)/WRITE(10) of the ATAPI request in flight.
    /// Without ATAPI interrupts the whole request runs here and is finished
    /// before returning.
    pub(crate) fn atapi_request(&mut self, arm_ticks: u32) -> IdeResult<()> {
        let intr = self.intr_mode() && self.config.atapi_interrupts;
        let staging_size = self.config.staging_buffer_size;
        let drq_budget = self.config.drq_budget();

        let Some(req) = self.req.as_mut() else {
            return Ok(());
        };
        let blksz = req.block_size.max(1) as usize;
        req.packet.cdb_sent = false;

        if req.nsec == 0 && req.sectors_left == 0 && !req.buffer.is_empty() {
            let n = req.buffer.len().div_ceil(blksz).max(1) as u32;
            debug!("req {}: derived {} blocks from {} bytes", req.id, n, req.buffer.len());
            req.nsec = n;
            req.sectors_left = n;
            req.lba_cur = req.lba;
        }
        let max_bytes = (staging_size.max(blksz) / blksz) * blksz;

        if !intr {
            return self.atapi_request_polled(blksz, max_bytes);
        }

        let avail = req.sectors_left as usize * blksz;
        let nblks = (avail.min(max_bytes) / blksz).min(u16::MAX as usize) as u32;
        if nblks == 0 {
            self.finish(Ok(()));
            return Ok(());
        }

        req.chunk_sectors = nblks;
        req.chunk_left = nblks;
        req.chunk_start = req.xfer_off;
        req.chunk_bytes = nblks as usize * blksz;
        req.target = XferTarget::Direct;
        req.needs_copy_back = false;
        req.await_drq = drq_budget;
        req.packet.cdb = if req.is_read() {
            Cdb::read10(req.lba_cur, nblks as u16)
        } else {
            Cdb::write10(req.lba_cur, nblks as u16)
        };
        req.packet.byte_count = byte_count_limit(req.chunk_bytes, req.block_size);
        req.packet.phase = AtapiPhase::WaitPacketDrq;
        let (drive, cdb, bc, id) = (req.drive, req.packet.cdb, req.packet.byte_count, req.id);

        self.set_queue_state(QueueState::Transferring);
        debug!("{}: req {} packet {:02x} blocks {}", self.unit(drive), id, cdb.opcode(), nblks);
        self.send_packet(drive, &cdb, bc)?;

        if let Some(req) = self.req.as_mut() {
            req.packet.cdb_sent = true;
            req.packet.phase = AtapiPhase::WaitData;
        }
        if arm_ticks > 0 {
            self.arm_watchdog(arm_ticks);
        }
        Ok(())
    }

    fn atapi_request_polled(&mut self, blksz: usize, max_bytes: usize) -> IdeResult<()> {
        let Some(req) = self.req.as_mut() else {
            return Ok(());
        };
        let mut buffer = core::mem::take(&mut req.buffer);
        let (drive, read) = (req.drive, req.is_read());
        let mut lba = req.lba_cur;
        let mut left = req.sectors_left;
        let mut off = req.xfer_off;
        self.set_queue_state(QueueState::Transferring);

        let mut result = Ok(());
        while left > 0 {
            let nblks = ((left as usize * blksz).min(max_bytes) / blksz).min(u16::MAX as usize);
            if nblks == 0 {
                break;
            }
            let end = (off + nblks * blksz).min(buffer.len());
            let expected = end.saturating_sub(off);
            let cdb = if read {
                Cdb::read10(lba, nblks as u16)
            } else {
                Cdb::write10(lba, nblks as u16)
            };

            let moved = if read {
                self.packet(drive, &cdb, &mut PacketData::In(&mut buffer[off..end]))
            } else {
                self.packet(drive, &cdb, &mut PacketData::Out(&buffer[off..end]))
            };
            let moved = match moved {
                Ok(n) => n,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };

            off += moved;
            if moved < expected || end == buffer.len() {
                if moved < expected {
                    debug!("{}: short transfer, {} of {} bytes", self.unit(drive), moved, expected);
                }
                left = 0;
            } else {
                left -= nblks as u32;
                lba += nblks as u32;
            }
            if let Some(req) = self.req.as_mut() {
                req.xfer_off = off;
                req.sectors_left = left;
                req.chunk_left = 0;
                req.lba_cur = lba;
            }
        }

        if let Some(req) = self.req.as_mut() {
            req.buffer = buffer;
        }
        self.finish(result);
        Ok(())
    }

    /// Interrupt-context driver for ATAPI requests.
    pub(crate) fn atapi_service_irq(&mut self, status: Status) {
        let Some(phase) = self.req.as_ref().map(|r| r.packet.phase) else {
            return;
        };
        if status.busy() {
            self.count(|c| c.irq_busy_skipped += 1);
            self.arm_watchdog(self.config.watchdog_ticks);
            return;
        }
        if status.failed() {
            let action = self.atapi_error(status);
            self.atapi_apply(action);
            return;
        }

        if !status.drq() {
            let action = match phase {
                AtapiPhase::WaitComplete | AtapiPhase::PioIn | AtapiPhase::PioOut | AtapiPhase::WaitData => {
                    self.maybe_finish()
                }
                _ => {
                    warn!("c{}: DRQ clear in phase {:?} ST={:02x}", self.ctrl.index(), phase, status.bits());
                    Action::Finish(Err(IdeError::Protocol { status: status.bits(), reason: self.interrupt_reason() }))
                }
            };
            self.atapi_apply(action);
            return;
        }

        let ir = self.interrupt_reason();
        let action = match (ir & ATAPI_IR_COD != 0, ir & ATAPI_IR_IO != 0) {
            (true, false) => self.handle_command_phase(status, ir),
            (false, _) => self.handle_data_phase(status, ir),
            (true, true) => {
                warn!("c{}: DRQ with status phase IR={:02x} in {:?}", self.ctrl.index(), ir, phase);
                Action::Finish(Err(IdeError::Protocol { status: status.bits(), reason: ir }))
            }
        };
        self.atapi_apply(action);
    }

    pub(crate) fn atapi_apply(&mut self, action: Action) {
        let ticks = self.config.watchdog_ticks;
        match action {
            Action::Continue | Action::AwaitMore => self.arm_watchdog(ticks),
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
    }

    /// Device asks for the CDB. Normally already sent when PACKET was issued.
    fn handle_command_phase(&mut self, status: Status, ir: u8) -> Action {
        let Some(req) = self.req.as_mut() else {
            return Action::AwaitMore;
        };
        if req.packet.cdb_sent {
            return Action::Finish(Err(IdeError::Protocol { status: status.bits(), reason: ir }));
        }
        req.packet.phase = AtapiPhase::SendPacket;
        let cdb = req.packet.cdb;
        self.send_cdb(&cdb);
        if let Some(req) = self.req.as_mut() {
            req.packet.cdb_sent = true;
            req.packet.phase = AtapiPhase::WaitData;
        }
        Action::AwaitMore
    }

    /// Move data phases for as long as the device keeps DRQ up.
    fn handle_data_phase(&mut self, status: Status, ir: u8) -> Action {
        let port = self.ctrl.io_base() + ATA_REG_DATA;
        let io = self.io;
        let (mut status, mut ir) = (status, ir);

        loop {
            let Some(block_size) = self.req.as_ref().map(|r| r.block_size) else {
                return Action::AwaitMore;
            };
            let bc = self.phase_byte_count(block_size);
            let device_to_host = ir & ATAPI_IR_IO != 0;

            let Some(req) = self.req.as_mut() else {
                return Action::AwaitMore;
            };
            if device_to_host != req.is_read() {
                return Action::Finish(Err(IdeError::Protocol { status: status.bits(), reason: ir }));
            }
            if !matches!(
                req.packet.phase,
                AtapiPhase::WaitData | AtapiPhase::PioIn | AtapiPhase::PioOut
            ) {
                debug!("req {}: data phase in {:?}", req.id, req.packet.phase);
            }
            req.packet.phase = if device_to_host { AtapiPhase::PioIn } else { AtapiPhase::PioOut };

            let end = req.chunk_end().min(req.buffer.len());
            let want = end.saturating_sub(req.xfer_off).min(bc);
            let off = req.xfer_off;
            if device_to_host {
                pio_in(io, port, &mut req.buffer[off..off + want], bc);
            } else {
                pio_out(io, port, &req.buffer[off..off + want], bc);
            }
            if want < bc {
                debug!(
                    "req {}: {} bytes past the buffer {}",
                    req.id,
                    bc - want,
                    if device_to_host { "discarded" } else { "padded" }
                );
            }
            req.xfer_off += want;
            account_blocks(req);
            trace!("req {}: {} bytes, {} blocks left", req.id, want, req.sectors_left);
            self.count(|c| c.irq_drq_service += 1);

            status = self.alt_status();
            if status.failed() {
                return self.atapi_error(status);
            }
            if status.idle() {
                return self.maybe_finish();
            }
            if !status.drq() {
                if let Some(req) = self.req.as_mut() {
                    req.packet.phase = AtapiPhase::WaitData;
                }
                return Action::AwaitMore;
            }
            ir = self.interrupt_reason();
            if ir & ATAPI_IR_COD != 0 {
                return Action::Finish(Err(IdeError::Protocol { status: status.bits(), reason: ir }));
            }
        }
    }

    /// The device dropped DRQ. Either move to the next chunk or finish,
    /// accepting short delivery.
    pub(crate) fn maybe_finish(&mut self) -> Action {
        let Some(req) = self.req.as_mut() else {
            return Action::AwaitMore;
        };
        let end = req.chunk_end().min(req.buffer.len());
        let delivered = req.xfer_off >= end;
        if delivered && req.sectors_left > 0 && req.xfer_off < req.buffer.len() {
            req.packet.phase = AtapiPhase::Idle;
            return Action::ProgramNextChunk;
        }
        if !delivered {
            debug!(
                "req {}: device stopped at {} of {} bytes",
                req.id,
                req.xfer_off,
                req.buffer.len()
            );
        }
        req.sectors_left = 0;
        req.chunk_left = 0;
        req.packet.phase = AtapiPhase::Idle;
        Action::Finish(Ok(()))
    }

    /// Error status in interrupt context: fetch sense and decide between a
    /// reissue of the chunk and failure.
    fn atapi_error(&mut self, status: Status) -> Action {
        let Some(drive) = self.req.as_ref().map(|r| r.drive) else {
            return Action::AwaitMore;
        };
        let error = self.read_reg(ATA_REG_ERROR);
        let sense = self.request_sense_now(drive);

        let Some(req) = self.req.as_mut() else {
            return Action::AwaitMore;
        };
        req.status = status;
        req.error = error;
        req.packet.phase = AtapiPhase::Error;
        let opcode = req.packet.cdb.opcode();

        let sense = match sense {
            Ok(sense) if sense.is_valid() => sense,
            _ => {
                error!(
                    "{}: ATAPI error cmd {:02x} ST={:02x} ER={:02x} (no sense)",
                    self.unit(drive),
                    opcode,
                    status.bits(),
                    error
                );
                return Action::Finish(Err(IdeError::Device { status: status.bits(), error }));
            }
        };
        req.packet.sense = sense;

        if sense.is_transient() && req.packet.retries < ATAPI_MAX_RETRIES {
            req.packet.retries += 1;
            let retries = req.packet.retries;
            req.xfer_off = req.chunk_start;
            req.chunk_sectors = 0;
            account_blocks(req);
            req.packet.phase = AtapiPhase::Idle;
            warn!("{}: cmd {:02x} {}, retry {}", self.unit(drive), opcode, sense, retries);
            if sense.is_becoming_ready() {
                self.delay_us(ATAPI_BECOMING_READY_DELAY_US);
                let _ = self.packet_once(drive, &Cdb::test_unit_ready(), &mut PacketData::None);
            }
            return Action::ProgramNextChunk;
        }

        if sense.is_medium_not_present() {
            self.update_drive(drive, |d| d.flags.remove(DriveFlags::HAS_MEDIA));
        }
        error!(
            "{}: ATAPI error cmd {:02x} ST={:02x} ER={:02x} {}",
            self.unit(drive),
            opcode,
            status.bits(),
            error,
            sense
        );
        Action::Finish(Err(IdeError::Sense(sense)))
    }

    /* ============================================================================
     * COMMAND SET
     * ============================================================================ */

    /// TEST UNIT READY. `Ok(false)` when the drive reports no medium.
    pub(crate) fn test_unit_ready(&self, drive: u8) -> IdeResult<bool> {
        self.atapi_unit(drive)?;
        match self.packet(drive, &Cdb::test_unit_ready(), &mut PacketData::None) {
            Ok(_) => {
                self.update_drive(drive, |d| d.flags |= DriveFlags::HAS_MEDIA);
                Ok(true)
            }
            Err(IdeError::Sense(sense)) if sense.is_medium_not_present() => {
                self.update_drive(drive, |d| d.flags.remove(DriveFlags::HAS_MEDIA));
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn inquiry(&self, drive: u8) -> IdeResult<InquiryData> {
        self.atapi_unit(drive)?;
        let mut buf = [0u8; INQUIRY_LEN];
        let n = self.packet(drive, &Cdb::inquiry(INQUIRY_LEN as u16), &mut PacketData::In(&mut buf))?;
        if n < 8 {
            return Err(IdeError::Protocol { status: 0, reason: 0 });
        }

        let data = InquiryData {
            peripheral_type: buf[0] & 0x1F,
            removable: buf[1] & 0x80 != 0,
            vendor: crate::types::ascii_field(&buf[8..16.min(n).max(8)]),
            product: crate::types::ascii_field(&buf[16.min(n)..32.min(n)]),
        };
        let class = AtapiClass::from_inquiry(data.peripheral_type, data.removable);
        self.update_drive(drive, |d| {
            d.class = Some(class);
            d.vendor = data.vendor.clone();
            d.product = data.product.clone();
            d.flags.remove(DriveFlags::CDROM | DriveFlags::MOZIP | DriveFlags::REMOVABLE);
            if data.removable {
                d.flags |= DriveFlags::REMOVABLE;
            }
            match class {
                AtapiClass::CdDvd => d.flags |= DriveFlags::CDROM,
                AtapiClass::DirectAccess { removable: true } | AtapiClass::OpticalMemory => {
                    d.flags |= DriveFlags::MOZIP
                }
                _ => {}
            }
        });
        Ok(data)
    }

    /// READ CAPACITY: (blocks, block size). Updates the drive descriptor.
    pub(crate) fn read_capacity(&self, drive: u8) -> IdeResult<(u32, u32)> {
        self.atapi_unit(drive)?;
        let mut buf = [0u8; 8];
        let n = self.packet(drive, &Cdb::read_capacity(), &mut PacketData::In(&mut buf))?;
        if n < buf.len() {
            return Err(IdeError::Protocol { status: 0, reason: 0 });
        }
        let last = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let reported = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let blocks = if reported == 0 { 0 } else { last.wrapping_add(1) };
        let block_size = match reported {
            0 => ATAPI_DEFAULT_BLOCK_SIZE,
            n if n < SECTOR_SIZE as u32 => SECTOR_SIZE as u32,
            n => n,
        };
        self.update_drive(drive, |d| {
            d.atapi_blocks = blocks;
            d.atapi_block_size = block_size;
        });
        Ok((blocks, block_size))
    }

    /// MODE SENSE(10) into `buf`; returns the bytes delivered.
    pub(crate) fn mode_sense(&self, drive: u8, page: u8, subpage: u8, buf: &mut [u8]) -> IdeResult<usize> {
        self.atapi_unit(drive)?;
        let alloc = buf.len().min(u16::MAX as usize) as u16;
        self.packet(drive, &Cdb::mode_sense10(page, subpage, alloc), &mut PacketData::In(buf))
    }

    pub(crate) fn start_stop(&self, drive: u8, start: bool, load_eject: bool) -> IdeResult<()> {
        self.atapi_unit(drive)?;
        self.packet(drive, &Cdb::start_stop(start, load_eject), &mut PacketData::None)?;
        if load_eject && !start {
            self.update_drive(drive, |d| d.flags.remove(DriveFlags::HAS_MEDIA));
        }
        Ok(())
    }

    pub(crate) fn prevent_allow(&self, drive: u8, prevent: bool) -> IdeResult<()> {
        self.atapi_unit(drive)?;
        self.packet(drive, &Cdb::prevent_allow(prevent), &mut PacketData::None)
            .map(|_| ())
    }

    pub(crate) fn pause_resume(&self, drive: u8, resume: bool) -> IdeResult<()> {
        self.atapi_unit(drive)?;
        self.packet(drive, &Cdb::pause_resume(resume), &mut PacketData::None)
            .map(|_| ())
    }

    pub(crate) fn play_audio_msf(&self, drive: u8, start: Msf, end: Msf) -> IdeResult<()> {
        self.atapi_unit(drive)?;
        self.packet(drive, &Cdb::play_audio_msf(start, end), &mut PacketData::None)
            .map(|_| ())
    }

    pub(crate) fn read_toc(&self, drive: u8, msf: bool, format: u8, track: u8, buf: &mut [u8]) -> IdeResult<usize> {
        self.atapi_unit(drive)?;
        let alloc = buf.len().min(u16::MAX as usize) as u16;
        self.packet(drive, &Cdb::read_toc(msf, format, track, alloc), &mut PacketData::In(buf))
    }

    /// READ SUB-CHANNEL, current position.
    pub(crate) fn read_subchannel(&self, drive: u8, msf: bool) -> IdeResult<SubChannel> {
        self.atapi_unit(drive)?;
        let mut buf = [0u8; 16];
        let n = self.packet(drive, &Cdb::read_subchannel(msf, buf.len() as u16), &mut PacketData::In(&mut buf))?;
        if n < buf.len() {
            return Err(IdeError::Protocol { status: 0, reason: 0 });
        }
        Ok(SubChannel {
            audio_status: buf[1],
            track: buf[6],
            index: buf[7],
            absolute: Msf::new(buf[9], buf[10], buf[11]),
            relative: Msf::new(buf[13], buf[14], buf[15]),
        })
    }

    /// Inquiry, capacity and media state of a freshly probed ATAPI unit.
    pub(crate) fn probe_atapi(&self, drive: u8) {
        if let Err(e) = self.inquiry(drive) {
            warn!("{}: INQUIRY failed: {}", self.unit(drive), e);
        }
        if let Err(e) = self.read_capacity(drive) {
            debug!("{}: no capacity yet: {}", self.unit(drive), e);
            self.update_drive(drive, |d| {
                d.atapi_blocks = 0;
                d.atapi_block_size = ATAPI_DEFAULT_BLOCK_SIZE;
            });
        }
        let _ = self.test_unit_ready(drive);

        let d = self.drive_info(drive);
        let media = if d.is_cdrom() || d.flags.contains(DriveFlags::MOZIP) {
            if d.has_media() {
                "inserted"
            } else {
                "empty"
            }
        } else {
            ""
        };
        info!(
            "{}: ATAPI {}, model=\"{}\" {} (block size {})",
            self.unit(drive),
            d.class.map_or("Unknown ATAPI", AtapiClass::name),
            d.model,
            media,
            d.block_size()
        );
    }
}
