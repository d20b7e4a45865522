//! ATAPI command descriptor blocks.
//!
//! Every field is stored byte by byte from a typed argument, so multi-byte
//! values never depend on how an integer happens to pack.

use crate::consts::*;
use crate::types::Msf;

/// A 12-byte packet command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cdb {
    pub bytes: [u8; ATAPI_CDB_LEN],
}

impl Cdb {
    fn op(opcode: u8) -> Self {
        let mut bytes = [0u8; ATAPI_CDB_LEN];
        bytes[0] = opcode;
        Cdb { bytes }
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }

    /// Packet as the six little-endian words written to the data register.
    pub fn words(&self) -> [u16; ATAPI_CDB_LEN / 2] {
        let mut words = [0u16; ATAPI_CDB_LEN / 2];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u16::from_le_bytes([self.bytes[2 * i], self.bytes[2 * i + 1]]);
        }
        words
    }

    /// Audio commands the device accepts and then runs in the background.
    pub fn is_audio_control(&self) -> bool {
        matches!(
            self.opcode(),
            SCSI_PLAY_AUDIO10 | SCSI_PLAY_AUDIO_MSF | SCSI_PAUSE_RESUME
        )
    }

    fn put_be16(&mut self, at: usize, value: u16) {
        self.bytes[at..at + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn put_be32(&mut self, at: usize, value: u32) {
        self.bytes[at..at + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn put_msf(&mut self, at: usize, msf: Msf) {
        self.bytes[at] = msf.minute;
        self.bytes[at + 1] = msf.second;
        self.bytes[at + 2] = msf.frame;
    }

    pub fn test_unit_ready() -> Self {
        Cdb::op(SCSI_TEST_UNIT_READY)
    }

    pub fn request_sense(alloc: u8) -> Self {
        let mut cdb = Cdb::op(SCSI_REQUEST_SENSE);
        cdb.bytes[4] = alloc;
        cdb
    }

    pub fn inquiry(alloc: u16) -> Self {
        let mut cdb = Cdb::op(SCSI_INQUIRY);
        cdb.put_be16(3, alloc);
        cdb
    }

    pub fn read_capacity() -> Self {
        Cdb::op(SCSI_READ_CAPACITY)
    }

    pub fn read10(lba: u32, blocks: u16) -> Self {
        let mut cdb = Cdb::op(SCSI_READ10);
        cdb.put_be32(2, lba);
        cdb.put_be16(7, blocks);
        cdb
    }

    pub fn write10(lba: u32, blocks: u16) -> Self {
        let mut cdb = Cdb::op(SCSI_WRITE10);
        cdb.put_be32(2, lba);
        cdb.put_be16(7, blocks);
        cdb
    }

    pub fn mode_sense6(page: u8, subpage: u8, alloc: u8) -> Self {
        let mut cdb = Cdb::op(SCSI_MODE_SENSE6);
        cdb.bytes[2] = page & 0x3F;
        cdb.bytes[3] = subpage;
        cdb.bytes[4] = alloc;
        cdb
    }

    pub fn mode_sense10(page: u8, subpage: u8, alloc: u16) -> Self {
        let mut cdb = Cdb::op(SCSI_MODE_SENSE10);
        cdb.bytes[2] = page & 0x3F;
        cdb.bytes[3] = subpage;
        cdb.put_be16(7, alloc);
        cdb
    }

    /// START STOP UNIT. `load_eject` with `start == false` ejects the tray.
    pub fn start_stop(start: bool, load_eject: bool) -> Self {
        let mut cdb = Cdb::op(SCSI_START_STOP);
        cdb.bytes[4] = ((load_eject as u8) << 1) | start as u8;
        cdb
    }

    pub fn prevent_allow(prevent: bool) -> Self {
        let mut cdb = Cdb::op(SCSI_PREVENT_ALLOW);
        cdb.bytes[4] = prevent as u8;
        cdb
    }

    pub fn pause_resume(resume: bool) -> Self {
        let mut cdb = Cdb::op(SCSI_PAUSE_RESUME);
        cdb.bytes[8] = resume as u8;
        cdb
    }

    pub fn play_audio10(lba: u32, blocks: u16) -> Self {
        let mut cdb = Cdb::op(SCSI_PLAY_AUDIO10);
        cdb.put_be32(2, lba);
        cdb.put_be16(7, blocks);
        cdb
    }

    pub fn play_audio_msf(start: Msf, end: Msf) -> Self {
        let mut cdb = Cdb::op(SCSI_PLAY_AUDIO_MSF);
        cdb.put_msf(3, start);
        cdb.put_msf(6, end);
        cdb
    }

    /// READ TOC/PMA/ATIP with the format in byte 2 (MMC layout).
    pub fn read_toc(msf: bool, format: u8, track: u8, alloc: u16) -> Self {
        let mut cdb = Cdb::op(SCSI_READ_TOC);
        cdb.bytes[1] = if msf { 0x02 } else { 0x00 };
        cdb.bytes[2] = format & 0x0F;
        cdb.bytes[6] = track;
        cdb.put_be16(7, alloc);
        cdb
    }

    /// READ SUB-CHANNEL, Q sub-channel, current position format.
    pub fn read_subchannel(msf: bool, alloc: u16) -> Self {
        let mut cdb = Cdb::op(SCSI_READ_SUBCHANNEL);
        cdb.bytes[1] = if msf { 0x02 } else { 0x00 };
        cdb.bytes[2] = 0x40;
        cdb.bytes[3] = 0x01;
        cdb.put_be16(7, alloc);
        cdb
    }
}
