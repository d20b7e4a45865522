//! Simulated IDE channels
//!
//! A register-level model of an ATA disk and ATAPI drives sitting behind the
//! legacy command and control blocks. INTRQ is a latch cleared by a status
//! read or a new command and gated by nIEN; SRST puts the signatures back.
//! Fault knobs let the recovery paths be driven on purpose.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use crate::consts::*;
use crate::engine::Engine;
use crate::port::PortIo;
use crate::timer::{Timer, TimerHandle};

pub(crate) const SIM_IO: u16 = 0x1F0;
pub(crate) const SIM_IRQ: u8 = 14;

const ST_IDLE: u8 = ATA_SR_DRDY | ATA_SR_DSC;
const ST_DATA: u8 = ST_IDLE | ATA_SR_DRQ;
const ST_ERROR: u8 = ATA_SR_DRDY | ATA_SR_ERR;

/// Factory contents of byte `i` of block `lba`.
pub(crate) fn pattern(lba: u32, i: usize) -> u8 {
    (lba.wrapping_mul(31) as usize).wrapping_add(i.wrapping_mul(7)) as u8
}

fn be16(b: &[u8], at: usize) -> usize {
    u16::from_be_bytes([b[at], b[at + 1]]) as usize
}

fn be32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn le_word(data: &[u8], pos: usize) -> u16 {
    let lo = data.get(pos).copied().unwrap_or(0);
    let hi = data.get(pos + 1).copied().unwrap_or(0);
    u16::from_le_bytes([lo, hi])
}

/// What the device does with INTRQ after a register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Irq {
    None,
    /// Data phase ready
    Data,
    /// Command complete (or failed)
    Done,
}

/* ============================================================================
 * MEDIA
 * ============================================================================ */

pub(crate) struct Disk {
    pub(crate) capacity: u32,
    /// Largest count SET MULTIPLE accepts; 0 refuses every count
    pub(crate) max_multiple: u8,
    pub(crate) multiple: u8,
    sectors: HashMap<u32, Vec<u8>>,
    pub(crate) bad_sector: Option<u32>,
    pub(crate) flushes: u32,
}

impl Disk {
    pub(crate) fn sector(&self, lba: u32) -> Vec<u8> {
        self.sectors
            .get(&lba)
            .cloned()
            .unwrap_or_else(|| (0..SECTOR_SIZE).map(|i| pattern(lba, i)).collect())
    }
}

pub(crate) struct AtapiDrive {
    pub(crate) peripheral_type: u8,
    pub(crate) removable: bool,
    pub(crate) block_size: u32,
    pub(crate) blocks: u32,
    data: HashMap<u32, Vec<u8>>,
    pub(crate) media: bool,
    /// key, ASC, ASCQ of the last check condition
    sense: [u8; 3],
    pub(crate) unit_attention: bool,
    pub(crate) becoming_ready: u32,
    pub(crate) medium_error: Option<u32>,
    /// Deliver at most this many bytes for READ(10)
    pub(crate) short_read: Option<usize>,
    /// Filler bytes sent after the blocks READ(10) asked for
    pub(crate) over_read: usize,
    pub(crate) opcodes: Vec<u8>,
    pub(crate) audio_status: u8,
    pub(crate) locked: bool,
}

/// Outcome of one CDB.
enum Reply {
    Done,
    In(Vec<u8>),
    Out { lba: u32, len: usize },
    Check,
}

impl AtapiDrive {
    pub(crate) fn block(&self, lba: u32) -> Vec<u8> {
        self.data
            .get(&lba)
            .cloned()
            .unwrap_or_else(|| (0..self.block_size as usize).map(|i| pattern(lba, i)).collect())
    }

    pub(crate) fn count(&self, opcode: u8) -> usize {
        self.opcodes.iter().filter(|&&op| op == opcode).count()
    }

    fn check(&mut self, key: u8, asc: u8, ascq: u8) -> Reply {
        self.sense = [key, asc, ascq];
        Reply::Check
    }

    fn respond(&mut self, cdb: &[u8]) -> Reply {
        let op = cdb[0];
        self.opcodes.push(op);
        let exempt = matches!(op, SCSI_REQUEST_SENSE | SCSI_INQUIRY);
        if !exempt && self.unit_attention {
            self.unit_attention = false;
            return self.check(SENSE_UNIT_ATTENTION, 0x28, 0);
        }
        if !exempt && self.becoming_ready > 0 {
            self.becoming_ready -= 1;
            return self.check(SENSE_NOT_READY, ASC_BECOMING_READY, 0x01);
        }
        let needs_media = matches!(
            op,
            SCSI_TEST_UNIT_READY | SCSI_READ_CAPACITY | SCSI_READ10 | SCSI_WRITE10 | SCSI_READ_TOC | SCSI_PLAY_AUDIO_MSF
        );
        if needs_media && !self.media {
            return self.check(SENSE_NOT_READY, ASC_MEDIUM_NOT_PRESENT, 0);
        }

        match op {
            SCSI_TEST_UNIT_READY => Reply::Done,
            SCSI_REQUEST_SENSE => {
                let mut s = vec![0u8; SENSE_LEN];
                s[0] = 0x70;
                s[2] = self.sense[0];
                s[7] = 10;
                s[12] = self.sense[1];
                s[13] = self.sense[2];
                self.sense = [0; 3];
                s.truncate(cdb[4] as usize);
                Reply::In(s)
            }
            SCSI_INQUIRY => {
                let mut d = vec![b' '; INQUIRY_LEN];
                d[0] = self.peripheral_type;
                d[1] = if self.removable { 0x80 } else { 0 };
                d[2] = 0;
                d[3] = 0x21;
                d[4] = (INQUIRY_LEN - 5) as u8;
                d[5..8].fill(0);
                d[8..15].copy_from_slice(b"SIMVEND");
                let product: &[u8] = if self.peripheral_type == 0x05 { b"SIM CD-ROM" } else { b"SIM ZIP" };
                d[16..16 + product.len()].copy_from_slice(product);
                d[32..36].copy_from_slice(b"1.00");
                d.truncate(be16(cdb, 3));
                Reply::In(d)
            }
            SCSI_READ_CAPACITY => {
                let mut d = Vec::with_capacity(8);
                d.extend_from_slice(&self.blocks.saturating_sub(1).to_be_bytes());
                d.extend_from_slice(&self.block_size.to_be_bytes());
                Reply::In(d)
            }
            SCSI_READ10 => {
                let (lba, n) = (be32(cdb, 2), be16(cdb, 7) as u32);
                if lba as u64 + n as u64 > self.blocks as u64 {
                    return self.check(SENSE_ILLEGAL_REQUEST, 0x21, 0);
                }
                if self.medium_error.map_or(false, |bad| bad >= lba && bad < lba + n) {
                    return self.check(SENSE_MEDIUM_ERROR, 0x11, 0);
                }
                let mut d: Vec<u8> = (lba..lba + n).flat_map(|b| self.block(b)).collect();
                if let Some(short) = self.short_read {
                    d.truncate(short);
                }
                d.resize(d.len() + self.over_read, 0xEE);
                Reply::In(d)
            }
            SCSI_WRITE10 => {
                if self.peripheral_type == 0x05 {
                    return self.check(SENSE_DATA_PROTECT, 0x27, 0);
                }
                let (lba, n) = (be32(cdb, 2), be16(cdb, 7));
                if lba as u64 + n as u64 > self.blocks as u64 {
                    return self.check(SENSE_ILLEGAL_REQUEST, 0x21, 0);
                }
                Reply::Out { lba, len: n * self.block_size as usize }
            }
            SCSI_MODE_SENSE10 => {
                let mut d = vec![0u8; 8 + 20];
                let len = (d.len() - 2) as u16;
                d[0..2].copy_from_slice(&len.to_be_bytes());
                d[8] = cdb[2] & 0x3F;
                d[9] = 18;
                d.truncate(be16(cdb, 7));
                Reply::In(d)
            }
            SCSI_READ_TOC => {
                let msf = cdb[1] & 0x02 != 0;
                let addr = |lba: u32| -> [u8; 4] {
                    if msf {
                        let f = lba + 150;
                        [0, (f / (60 * 75)) as u8, ((f / 75) % 60) as u8, (f % 75) as u8]
                    } else {
                        lba.to_be_bytes()
                    }
                };
                let mut d = vec![0, 18, 1, 1];
                d.extend_from_slice(&[0, 0x14, 1, 0]);
                d.extend_from_slice(&addr(0));
                d.extend_from_slice(&[0, 0x14, 0xAA, 0]);
                d.extend_from_slice(&addr(self.blocks));
                d.truncate(be16(cdb, 7));
                Reply::In(d)
            }
            SCSI_READ_SUBCHANNEL => {
                let mut d = vec![0, self.audio_status, 0, 12, 0x01, 0x14, 1, 1];
                d.extend_from_slice(&[0, 0, 2, 0, 0, 0, 0, 5]);
                d.truncate(be16(cdb, 7));
                Reply::In(d)
            }
            SCSI_PLAY_AUDIO_MSF => {
                self.audio_status = 0x11;
                Reply::Done
            }
            SCSI_PAUSE_RESUME => {
                self.audio_status = if cdb[8] & 1 != 0 { 0x11 } else { 0x12 };
                Reply::Done
            }
            SCSI_START_STOP => {
                if cdb[4] & 0x02 != 0 {
                    self.media = cdb[4] & 0x01 != 0;
                }
                Reply::Done
            }
            SCSI_PREVENT_ALLOW => {
                self.locked = cdb[4] & 0x01 != 0;
                Reply::Done
            }
            _ => self.check(SENSE_ILLEGAL_REQUEST, 0x20, 0),
        }
    }
}

pub(crate) enum Kind {
    Disk(Disk),
    Atapi(AtapiDrive),
}

/* ============================================================================
 * DEVICE
 * ============================================================================ */

struct AtaXfer {
    lba: u32,
    left: u32,
    block: u32,
    in_block: u32,
    buf: Vec<u8>,
    pos: usize,
}

struct PacketIn {
    data: Vec<u8>,
    pos: usize,
    phase_left: usize,
    limit: usize,
}

struct PacketOut {
    lba: u32,
    expected: usize,
    buf: Vec<u8>,
    phase_left: usize,
    limit: usize,
}

#[derive(Default)]
enum Xfer {
    #[default]
    Idle,
    Identify { data: Vec<u8>, pos: usize },
    AtaRead(AtaXfer),
    AtaWrite(AtaXfer),
    Cdb { bytes: Vec<u8>, limit: usize },
    PacketIn(PacketIn),
    PacketOut(PacketOut),
}

pub(crate) struct Device {
    pub(crate) kind: Kind,
    status: u8,
    /// Registers as the device presents them, by command block offset
    regs: [u8; 8],
    xfer: Xfer,
}

impl Device {
    fn new(kind: Kind) -> Self {
        let mut dev = Device { kind, status: 0, regs: [0; 8], xfer: Xfer::Idle };
        dev.reset();
        dev
    }

    pub(crate) fn disk(capacity: u32, max_multiple: u8) -> Self {
        Device::new(Kind::Disk(Disk {
            capacity,
            max_multiple,
            multiple: 0,
            sectors: HashMap::new(),
            bad_sector: None,
            flushes: 0,
        }))
    }

    fn atapi(peripheral_type: u8, block_size: u32, blocks: u32) -> Self {
        Device::new(Kind::Atapi(AtapiDrive {
            peripheral_type,
            removable: true,
            block_size,
            blocks,
            data: HashMap::new(),
            media: true,
            sense: [0; 3],
            unit_attention: false,
            becoming_ready: 0,
            medium_error: None,
            short_read: None,
            over_read: 0,
            opcodes: Vec::new(),
            audio_status: 0x15,
            locked: false,
        }))
    }

    pub(crate) fn cdrom(blocks: u32) -> Self {
        Device::atapi(0x05, 2048, blocks)
    }

    /// Removable direct-access ATAPI drive with 512-byte blocks.
    pub(crate) fn zip(blocks: u32) -> Self {
        Device::atapi(0x00, 512, blocks)
    }

    fn is_atapi(&self) -> bool {
        matches!(self.kind, Kind::Atapi(_))
    }

    fn reset(&mut self) {
        self.xfer = Xfer::Idle;
        self.regs = [0; 8];
        self.regs[ATA_REG_ERROR as usize] = 0x01;
        self.regs[ATA_REG_SECCOUNT as usize] = 0x01;
        self.regs[ATA_REG_LBA0 as usize] = 0x01;
        if self.is_atapi() {
            self.regs[ATA_REG_LBA1 as usize] = (SIG_ATAPI_PATA & 0xFF) as u8;
            self.regs[ATA_REG_LBA2 as usize] = (SIG_ATAPI_PATA >> 8) as u8;
            self.status = 0;
        } else {
            self.status = ST_IDLE;
        }
    }

    fn complete(&mut self) -> Irq {
        self.xfer = Xfer::Idle;
        self.status = ST_IDLE;
        if self.is_atapi() {
            self.regs[ATA_REG_SECCOUNT as usize] = ATAPI_IR_COD | ATAPI_IR_IO;
        }
        Irq::Done
    }

    fn fail(&mut self, error: u8) -> Irq {
        self.complete();
        self.status = ST_ERROR;
        self.regs[ATA_REG_ERROR as usize] = error;
        Irq::Done
    }

    fn geometry(&self) -> Option<(u32, u8)> {
        match &self.kind {
            Kind::Disk(d) => Some((d.capacity, d.multiple)),
            Kind::Atapi(_) => None,
        }
    }

    fn identify_data(&self) -> Vec<u8> {
        let mut w = [0u16; SECTOR_WORDS];
        let model: &[u8] = match &self.kind {
            Kind::Disk(d) => {
                w[0] = 0x0040;
                w[47] = 0x8000 | d.max_multiple as u16;
                w[60] = (d.capacity & 0xFFFF) as u16;
                w[61] = (d.capacity >> 16) as u16;
                b"SIM ATA DISK"
            }
            Kind::Atapi(a) => {
                w[0] = 0x8080 | (a.peripheral_type as u16) << 8;
                b"SIM ATAPI DRIVE"
            }
        };
        w[ATA_IDENT_CAPABILITIES] = ATA_CAP_LBA;
        let mut text = [b' '; 40];
        text[..model.len()].copy_from_slice(model);
        for (i, pair) in text.chunks(2).enumerate() {
            w[ATA_IDENT_MODEL + i] = (pair[0] as u16) << 8 | pair[1] as u16;
        }
        w.iter().flat_map(|x| x.to_le_bytes()).collect()
    }

    fn command(&mut self, cmd: u8, lba: u32, count: u32, bc: usize) -> Irq {
        self.regs[ATA_REG_ERROR as usize] = 0;
        self.xfer = Xfer::Idle;
        let atapi = self.is_atapi();

        match cmd {
            ATA_CMD_IDENTIFY if atapi => {
                self.fail(ATA_ER_ABRT);
                self.regs[ATA_REG_LBA1 as usize] = (SIG_ATAPI_PATA & 0xFF) as u8;
                self.regs[ATA_REG_LBA2 as usize] = (SIG_ATAPI_PATA >> 8) as u8;
                Irq::Done
            }
            ATA_CMD_IDENTIFY | ATA_CMD_IDENTIFY_PACKET if atapi == (cmd == ATA_CMD_IDENTIFY_PACKET) => {
                if !atapi {
                    self.regs[ATA_REG_LBA1 as usize] = 0;
                    self.regs[ATA_REG_LBA2 as usize] = 0;
                }
                self.xfer = Xfer::Identify { data: self.identify_data(), pos: 0 };
                self.status = ST_DATA;
                Irq::Data
            }
            ATA_CMD_READ_PIO | ATA_CMD_READ_MULTIPLE | ATA_CMD_WRITE_PIO | ATA_CMD_WRITE_MULTIPLE if !atapi => {
                self.start_rw(cmd, lba, count)
            }
            ATA_CMD_SET_MULTIPLE => match &mut self.kind {
                Kind::Disk(d) if count <= d.max_multiple as u32 && count.is_power_of_two() && count < 256 => {
                    d.multiple = count as u8;
                    self.complete()
                }
                _ => self.fail(ATA_ER_ABRT),
            },
            ATA_CMD_CACHE_FLUSH if !atapi => {
                if let Kind::Disk(d) = &mut self.kind {
                    d.flushes += 1;
                }
                self.complete()
            }
            ATA_CMD_PACKET if atapi => {
                self.xfer = Xfer::Cdb { bytes: Vec::new(), limit: bc.max(2) };
                self.regs[ATA_REG_SECCOUNT as usize] = ATAPI_IR_COD;
                self.status = ST_DATA;
                Irq::None
            }
            _ => self.fail(ATA_ER_ABRT),
        }
    }

    fn start_rw(&mut self, cmd: u8, lba: u32, count: u32) -> Irq {
        let Some((capacity, multiple)) = self.geometry() else {
            return self.fail(ATA_ER_ABRT);
        };
        let block = if matches!(cmd, ATA_CMD_READ_MULTIPLE | ATA_CMD_WRITE_MULTIPLE) {
            multiple as u32
        } else {
            1
        };
        if block == 0 {
            return self.fail(ATA_ER_ABRT);
        }
        if lba as u64 + count as u64 > capacity as u64 {
            return self.fail(ATA_ER_IDNF);
        }
        let xfer = AtaXfer { lba, left: count, block, in_block: 0, buf: Vec::new(), pos: 0 };
        if matches!(cmd, ATA_CMD_READ_PIO | ATA_CMD_READ_MULTIPLE) {
            self.xfer = Xfer::AtaRead(xfer);
            self.next_read_block()
        } else {
            self.xfer = Xfer::AtaWrite(xfer);
            self.status = ST_DATA;
            Irq::None
        }
    }

    fn next_read_block(&mut self) -> Irq {
        let Xfer::AtaRead(r) = &self.xfer else {
            return Irq::None;
        };
        let (lba, n) = (r.lba, r.block.min(r.left));
        let (bad, buf) = match &self.kind {
            Kind::Disk(d) => (d.bad_sector.map_or(false, |b| b >= lba && b < lba + n), d.sector(lba)),
            Kind::Atapi(_) => (true, Vec::new()),
        };
        if bad {
            return self.fail(ATA_ER_UNC);
        }
        if let Xfer::AtaRead(r) = &mut self.xfer {
            r.buf = buf;
            r.pos = 0;
            r.in_block = 0;
        }
        self.status = ST_DATA;
        Irq::Data
    }

    fn next_in_phase(&mut self) -> Irq {
        let Xfer::PacketIn(p) = &mut self.xfer else {
            return Irq::None;
        };
        let n = (p.data.len() - p.pos).min(p.limit);
        p.phase_left = n;
        self.regs[ATA_REG_SECCOUNT as usize] = ATAPI_IR_IO;
        self.regs[ATA_REG_LBA1 as usize] = n as u8;
        self.regs[ATA_REG_LBA2 as usize] = (n >> 8) as u8;
        self.status = ST_DATA;
        Irq::Data
    }

    fn next_out_phase(&mut self) -> Irq {
        let Xfer::PacketOut(p) = &mut self.xfer else {
            return Irq::None;
        };
        let n = (p.expected - p.buf.len()).min(p.limit);
        p.phase_left = n;
        self.regs[ATA_REG_SECCOUNT as usize] = 0;
        self.regs[ATA_REG_LBA1 as usize] = n as u8;
        self.regs[ATA_REG_LBA2 as usize] = (n >> 8) as u8;
        self.status = ST_DATA;
        Irq::Data
    }

    fn execute_cdb(&mut self, cdb: &[u8], limit: usize) -> Irq {
        let reply = match &mut self.kind {
            Kind::Atapi(a) => a.respond(cdb),
            Kind::Disk(_) => return self.fail(ATA_ER_ABRT),
        };
        match reply {
            Reply::Done => self.complete(),
            Reply::In(data) if data.is_empty() => self.complete(),
            Reply::In(data) => {
                self.xfer = Xfer::PacketIn(PacketIn { data, pos: 0, phase_left: 0, limit });
                self.next_in_phase()
            }
            Reply::Out { len: 0, .. } => self.complete(),
            Reply::Out { lba, len } => {
                self.xfer = Xfer::PacketOut(PacketOut { lba, expected: len, buf: Vec::new(), phase_left: 0, limit });
                self.next_out_phase()
            }
            Reply::Check => {
                let key = match &self.kind {
                    Kind::Atapi(a) => a.sense[0],
                    Kind::Disk(_) => 0,
                };
                self.fail(key << 4 | ATA_ER_ABRT)
            }
        }
    }

    fn data_in(&mut self) -> (u16, Irq) {
        match std::mem::take(&mut self.xfer) {
            Xfer::Identify { data, pos } => {
                let word = le_word(&data, pos);
                if pos + 2 >= data.len() {
                    self.status = ST_IDLE;
                } else {
                    self.xfer = Xfer::Identify { data, pos: pos + 2 };
                }
                (word, Irq::None)
            }
            Xfer::AtaRead(mut r) => {
                let word = le_word(&r.buf, r.pos);
                r.pos += 2;
                if r.pos < SECTOR_SIZE {
                    self.xfer = Xfer::AtaRead(r);
                    return (word, Irq::None);
                }
                r.lba += 1;
                r.left -= 1;
                r.in_block += 1;
                if r.left == 0 {
                    self.status = ST_IDLE;
                    return (word, Irq::None);
                }
                if r.in_block == r.block {
                    self.xfer = Xfer::AtaRead(r);
                    return (word, self.next_read_block());
                }
                if let Kind::Disk(d) = &self.kind {
                    r.buf = d.sector(r.lba);
                }
                r.pos = 0;
                self.xfer = Xfer::AtaRead(r);
                (word, Irq::None)
            }
            Xfer::PacketIn(mut p) => {
                let word = le_word(&p.data, p.pos);
                let step = p.phase_left.min(2);
                p.pos += step;
                p.phase_left -= step;
                if p.phase_left > 0 {
                    self.xfer = Xfer::PacketIn(p);
                    return (word, Irq::None);
                }
                if p.pos >= p.data.len() {
                    return (word, self.complete());
                }
                self.xfer = Xfer::PacketIn(p);
                (word, self.next_in_phase())
            }
            other => {
                self.xfer = other;
                (0xFFFF, Irq::None)
            }
        }
    }

    fn data_out(&mut self, word: u16) -> Irq {
        match std::mem::take(&mut self.xfer) {
            Xfer::AtaWrite(mut w) => {
                w.buf.extend_from_slice(&word.to_le_bytes());
                if w.buf.len() < SECTOR_SIZE {
                    self.xfer = Xfer::AtaWrite(w);
                    return Irq::None;
                }
                if let Kind::Disk(d) = &mut self.kind {
                    d.sectors.insert(w.lba, std::mem::take(&mut w.buf));
                }
                w.buf.clear();
                w.lba += 1;
                w.left -= 1;
                w.in_block += 1;
                if w.left == 0 {
                    return self.complete();
                }
                let block_done = w.in_block == w.block;
                if block_done {
                    w.in_block = 0;
                }
                self.xfer = Xfer::AtaWrite(w);
                if block_done {
                    Irq::Data
                } else {
                    Irq::None
                }
            }
            Xfer::Cdb { mut bytes, limit } => {
                bytes.extend_from_slice(&word.to_le_bytes());
                if bytes.len() < ATAPI_CDB_LEN {
                    self.xfer = Xfer::Cdb { bytes, limit };
                    return Irq::None;
                }
                self.execute_cdb(&bytes, limit)
            }
            Xfer::PacketOut(mut p) => {
                let take = p.phase_left.min(2);
                p.buf.extend_from_slice(&word.to_le_bytes()[..take]);
                p.phase_left -= take;
                if p.phase_left > 0 {
                    self.xfer = Xfer::PacketOut(p);
                    return Irq::None;
                }
                if p.buf.len() >= p.expected {
                    if let Kind::Atapi(a) = &mut self.kind {
                        let bs = a.block_size as usize;
                        for (i, chunk) in p.buf.chunks(bs).enumerate() {
                            a.data.insert(p.lba + i as u32, chunk.to_vec());
                        }
                    }
                    return self.complete();
                }
                self.xfer = Xfer::PacketOut(p);
                self.next_out_phase()
            }
            other => {
                self.xfer = other;
                Irq::None
            }
        }
    }
}

/* ============================================================================
 * CHANNEL AND BUS
 * ============================================================================ */

pub(crate) struct SimChannel {
    io_base: u16,
    devctl: u8,
    devsel: u8,
    tf: [u8; 8],
    devices: [Option<Device>; 2],
    intrq: bool,
    busy_reads: u32,

    /// Never assert INTRQ
    pub(crate) stall_irqs: bool,
    /// Swallow the completion edge; ATAPI drives also show BSY once more
    pub(crate) drop_completion_irq: bool,
    /// Status reads that report BSY after every command
    pub(crate) busy_after_command: u32,

    pub(crate) devsel_writes: u32,
    pub(crate) commands: Vec<u8>,
}

impl SimChannel {
    fn new(io_base: u16, master: Option<Device>, slave: Option<Device>) -> Self {
        SimChannel {
            io_base,
            devctl: 0,
            devsel: 0,
            tf: [0; 8],
            devices: [master, slave],
            intrq: false,
            busy_reads: 0,
            stall_irqs: false,
            drop_completion_irq: false,
            busy_after_command: 0,
            devsel_writes: 0,
            commands: Vec::new(),
        }
    }

    fn selected(&self) -> usize {
        ((self.devsel & ATA_DH_DRIVE1) != 0) as usize
    }

    pub(crate) fn disk(&mut self, drive: usize) -> &mut Disk {
        match self.devices[drive].as_mut().map(|d| &mut d.kind) {
            Some(Kind::Disk(d)) => d,
            _ => panic!("drive {} is not a disk", drive),
        }
    }

    pub(crate) fn atapi(&mut self, drive: usize) -> &mut AtapiDrive {
        match self.devices[drive].as_mut().map(|d| &mut d.kind) {
            Some(Kind::Atapi(a)) => a,
            _ => panic!("drive {} is not an ATAPI drive", drive),
        }
    }

    fn reset(&mut self) {
        self.intrq = false;
        self.busy_reads = 0;
        self.devsel = 0;
        for dev in self.devices.iter_mut().flatten() {
            dev.reset();
        }
    }

    fn raise(&mut self, irq: Irq) {
        let atapi = self.devices[self.selected()]
            .as_ref()
            .map_or(false, Device::is_atapi);
        match irq {
            Irq::None => {}
            _ if self.stall_irqs => {}
            Irq::Done if self.drop_completion_irq => {
                if atapi {
                    self.busy_reads = 1;
                }
            }
            _ => self.intrq = true,
        }
    }

    fn status(&mut self, ack: bool) -> u8 {
        if self.busy_reads > 0 {
            self.busy_reads -= 1;
            return ATA_SR_BSY;
        }
        if ack {
            self.intrq = false;
        }
        self.devices[self.selected()].as_ref().map_or(0, |d| d.status)
    }

    fn command(&mut self, cmd: u8) {
        self.intrq = false;
        self.commands.push(cmd);
        let tf = self.tf;
        let lba = ((self.devsel & 0x0F) as u32) << 24
            | (tf[ATA_REG_LBA2 as usize] as u32) << 16
            | (tf[ATA_REG_LBA1 as usize] as u32) << 8
            | tf[ATA_REG_LBA0 as usize] as u32;
        let count = match tf[ATA_REG_SECCOUNT as usize] {
            0 if cmd != ATA_CMD_SET_MULTIPLE => 256,
            n => n as u32,
        };
        let bc = (tf[ATA_REG_LBA2 as usize] as usize) << 8 | tf[ATA_REG_LBA1 as usize] as usize;
        let sel = self.selected();
        let irq = match self.devices[sel].as_mut() {
            Some(dev) => {
                self.busy_reads = self.busy_after_command;
                dev.command(cmd, lba, count, bc)
            }
            None => Irq::None,
        };
        self.raise(irq);
    }

    fn inb(&mut self, reg: u16) -> u8 {
        match reg {
            ATA_REG_STATUS => self.status(true),
            ATA_REG_HDDEVSEL => self.devsel,
            ATA_REG_DATA => self.inw() as u8,
            r => {
                let sel = self.selected();
                self.devices[sel].as_ref().map_or(0, |d| d.regs[r as usize])
            }
        }
    }

    fn outb(&mut self, reg: u16, value: u8) {
        match reg {
            ATA_REG_HDDEVSEL => {
                self.devsel = value;
                self.devsel_writes += 1;
            }
            ATA_REG_COMMAND => self.command(value),
            r @ 1..=5 => {
                self.tf[r as usize] = value;
                if r >= ATA_REG_SECCOUNT {
                    for dev in self.devices.iter_mut().flatten() {
                        dev.regs[r as usize] = value;
                    }
                }
            }
            _ => {}
        }
    }

    fn inw(&mut self) -> u16 {
        let sel = self.selected();
        let Some(dev) = self.devices[sel].as_mut() else {
            return 0xFFFF;
        };
        let (word, irq) = dev.data_in();
        self.raise(irq);
        word
    }

    fn outw(&mut self, value: u16) {
        let sel = self.selected();
        let Some(dev) = self.devices[sel].as_mut() else {
            return;
        };
        let irq = dev.data_out(value);
        self.raise(irq);
    }

    fn write_devctl(&mut self, value: u8) {
        if value & ATA_CTL_SRST != 0 && self.devctl & ATA_CTL_SRST == 0 {
            self.reset();
        }
        self.devctl = value;
    }
}

enum Port {
    Command(u16),
    Control,
}

/// A set of simulated channels answering on their port ranges. Unclaimed
/// ports float high.
pub(crate) struct SimBus {
    channels: RefCell<Vec<SimChannel>>,
    io_ops: Cell<u64>,
}

impl SimBus {
    pub(crate) fn new() -> Self {
        SimBus { channels: RefCell::new(Vec::new()), io_ops: Cell::new(0) }
    }

    pub(crate) fn attach(self, io_base: u16, master: Option<Device>, slave: Option<Device>) -> Self {
        self.channels
            .borrow_mut()
            .push(SimChannel::new(io_base, master, slave));
        self
    }

    pub(crate) fn with<R>(&self, channel: usize, f: impl FnOnce(&mut SimChannel) -> R) -> R {
        f(&mut self.channels.borrow_mut()[channel])
    }

    /// INTRQ asserted and not masked by nIEN.
    pub(crate) fn irq_pending(&self, channel: usize) -> bool {
        self.with(channel, |ch| ch.intrq && ch.devctl & ATA_CTL_NIEN == 0)
    }

    /// Register accesses of any width seen so far.
    pub(crate) fn io_ops(&self) -> u64 {
        self.io_ops.get()
    }

    fn route<R>(&self, port: u16, f: impl FnOnce(&mut SimChannel, Port) -> R) -> Option<R> {
        self.io_ops.set(self.io_ops.get() + 1);
        let mut channels = self.channels.borrow_mut();
        let ch = channels.iter_mut().find(|ch| {
            (ch.io_base..ch.io_base + 8).contains(&port) || port == ch.io_base + ATA_CTL_OFFSET
        })?;
        let which = if port == ch.io_base + ATA_CTL_OFFSET {
            Port::Control
        } else {
            Port::Command(port - ch.io_base)
        };
        Some(f(ch, which))
    }
}

impl PortIo for SimBus {
    fn inb(&self, port: u16) -> u8 {
        self.route(port, |ch, p| match p {
            Port::Command(reg) => ch.inb(reg),
            Port::Control => ch.status(false),
        })
        .unwrap_or(0xFF)
    }

    fn outb(&self, port: u16, value: u8) {
        self.route(port, |ch, p| match p {
            Port::Command(reg) => ch.outb(reg, value),
            Port::Control => ch.write_devctl(value),
        });
    }

    fn inw(&self, port: u16) -> u16 {
        self.route(port, |ch, p| match p {
            Port::Command(ATA_REG_DATA) => ch.inw(),
            _ => 0xFFFF,
        })
        .unwrap_or(0xFFFF)
    }

    fn outw(&self, port: u16, value: u16) {
        self.route(port, |ch, p| {
            if let Port::Command(ATA_REG_DATA) = p {
                ch.outw(value);
            }
        });
    }

    fn delay_us(&self, _us: u32) {}
}

/* ============================================================================
 * TIMER
 * ============================================================================ */

/// Timer whose timeouts only expire when a test says so.
#[derive(Default)]
pub(crate) struct ManualTimer {
    armed: RefCell<Vec<(usize, TimerHandle)>>,
    next: Cell<u32>,
    ticks: Cell<u64>,
}

impl ManualTimer {
    pub(crate) fn armed(&self) -> usize {
        self.armed.borrow().len()
    }

    /// Expire everything armed so far. Returns false when nothing was.
    pub(crate) fn fire<P: PortIo, T: Timer>(&self, engine: &Engine<P, T>) -> bool {
        let due: Vec<_> = self.armed.borrow_mut().drain(..).collect();
        self.ticks.set(self.ticks.get() + 1);
        for &(controller, handle) in &due {
            engine.watchdog_fired(controller, handle);
        }
        !due.is_empty()
    }
}

impl Timer for ManualTimer {
    fn arm(&self, controller: usize, _ticks: u32) -> TimerHandle {
        let id = self.next.get() + 1;
        self.next.set(id);
        let handle = TimerHandle(id);
        self.armed.borrow_mut().push((controller, handle));
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        self.armed.borrow_mut().retain(|&(_, h)| h != handle);
    }

    fn now(&self) -> u64 {
        self.ticks.get()
    }
}
