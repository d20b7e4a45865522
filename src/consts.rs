#![allow(unused)]

// Command block register offsets (from the controller I/O base)
pub const ATA_REG_DATA: u16 = 0x00;      // Data register (16-bit PIO)
pub const ATA_REG_ERROR: u16 = 0x01;     // Error register (read)
pub const ATA_REG_FEATURES: u16 = 0x01;  // Features register (write)
pub const ATA_REG_SECCOUNT: u16 = 0x02;  // Sector count / ATAPI interrupt reason
pub const ATA_REG_LBA0: u16 = 0x03;      // LBA bits 0-7 / sector number
pub const ATA_REG_LBA1: u16 = 0x04;      // LBA bits 8-15 / cylinder low / ATAPI byte count low
pub const ATA_REG_LBA2: u16 = 0x05;      // LBA bits 16-23 / cylinder high / ATAPI byte count high
pub const ATA_REG_HDDEVSEL: u16 = 0x06;  // Drive/head select
pub const ATA_REG_COMMAND: u16 = 0x07;   // Command register (write)
pub const ATA_REG_STATUS: u16 = 0x07;    // Status register (read, acknowledges INTRQ)

// Control block lives at io_base + 0x206 (0x3F6 for 0x1F0)
pub const ATA_CTL_OFFSET: u16 = 0x206;
pub const ATA_REG_ALTSTATUS: u16 = 0x00; // Alternate status (read, no side effects)
pub const ATA_REG_DEVCTRL: u16 = 0x00;   // Device control (write)

// Status register bits
pub const ATA_SR_BSY: u8 = 0x80;    // Busy
pub const ATA_SR_DRDY: u8 = 0x40;   // Drive ready
pub const ATA_SR_DF: u8 = 0x20;     // Drive write fault
pub const ATA_SR_DSC: u8 = 0x10;    // Drive seek complete
pub const ATA_SR_DRQ: u8 = 0x08;    // Data request ready
pub const ATA_SR_CORR: u8 = 0x04;   // Corrected data
pub const ATA_SR_IDX: u8 = 0x02;    // Index
pub const ATA_SR_ERR: u8 = 0x01;    // Error

// Error register bits
pub const ATA_ER_BBK: u8 = 0x80;    // Bad block
pub const ATA_ER_UNC: u8 = 0x40;    // Uncorrectable data
pub const ATA_ER_MC: u8 = 0x20;     // Media changed
pub const ATA_ER_IDNF: u8 = 0x10;   // ID mark not found
pub const ATA_ER_MCR: u8 = 0x08;    // Media change request
pub const ATA_ER_ABRT: u8 = 0x04;   // Command aborted
pub const ATA_ER_TK0NF: u8 = 0x02;  // Track 0 not found
pub const ATA_ER_AMNF: u8 = 0x01;   // No address mark

// Device control register bits
pub const ATA_CTL_SRST: u8 = 0x04;  // Software reset
pub const ATA_CTL_NIEN: u8 = 0x02;  // Interrupts disabled

// Drive/head register layout
pub const ATA_DH_BASE: u8 = 0xA0;   // Obsolete bits that must read as one
pub const ATA_DH_LBA: u8 = 0x40;    // LBA addressing
pub const ATA_DH_DRIVE1: u8 = 0x10; // Slave select

// ATAPI interrupt reason bits (sector count register during PACKET)
pub const ATAPI_IR_COD: u8 = 0x01;  // Command (1) or data (0)
pub const ATAPI_IR_IO: u8 = 0x02;   // Device to host (1) or host to device (0)

// ATA commands
pub const ATA_CMD_READ_PIO: u8 = 0x20;
pub const ATA_CMD_READ_MULTIPLE: u8 = 0xC4;
pub const ATA_CMD_WRITE_PIO: u8 = 0x30;
pub const ATA_CMD_WRITE_MULTIPLE: u8 = 0xC5;
pub const ATA_CMD_SET_MULTIPLE: u8 = 0xC6;
pub const ATA_CMD_CACHE_FLUSH: u8 = 0xE7;
pub const ATA_CMD_PACKET: u8 = 0xA0;
pub const ATA_CMD_IDENTIFY_PACKET: u8 = 0xA1;
pub const ATA_CMD_IDENTIFY: u8 = 0xEC;

// ATAPI (SCSI) operation codes
pub const SCSI_TEST_UNIT_READY: u8 = 0x00;
pub const SCSI_REQUEST_SENSE: u8 = 0x03;
pub const SCSI_INQUIRY: u8 = 0x12;
pub const SCSI_MODE_SENSE6: u8 = 0x1A;
pub const SCSI_START_STOP: u8 = 0x1B;
pub const SCSI_PREVENT_ALLOW: u8 = 0x1E;
pub const SCSI_READ_CAPACITY: u8 = 0x25;
pub const SCSI_READ10: u8 = 0x28;
pub const SCSI_WRITE10: u8 = 0x2A;
pub const SCSI_READ_SUBCHANNEL: u8 = 0x42;
pub const SCSI_READ_TOC: u8 = 0x43;
pub const SCSI_PLAY_AUDIO10: u8 = 0x45;
pub const SCSI_PLAY_AUDIO_MSF: u8 = 0x47;
pub const SCSI_PAUSE_RESUME: u8 = 0x4B;
pub const SCSI_MODE_SENSE10: u8 = 0x5A;

// Sense keys
pub const SENSE_NO_SENSE: u8 = 0x00;
pub const SENSE_RECOVERED_ERROR: u8 = 0x01;
pub const SENSE_NOT_READY: u8 = 0x02;
pub const SENSE_MEDIUM_ERROR: u8 = 0x03;
pub const SENSE_HARDWARE_ERROR: u8 = 0x04;
pub const SENSE_ILLEGAL_REQUEST: u8 = 0x05;
pub const SENSE_UNIT_ATTENTION: u8 = 0x06;
pub const SENSE_DATA_PROTECT: u8 = 0x07;
pub const SENSE_BLANK_CHECK: u8 = 0x08;
pub const SENSE_ABORTED_COMMAND: u8 = 0x0B;

pub const ASC_BECOMING_READY: u8 = 0x04;
pub const ASC_MEDIUM_NOT_PRESENT: u8 = 0x3A;

// Device signatures (cylinder high << 8 | cylinder low after reset/IDENTIFY)
pub const SIG_ATA_PATA: u16 = 0x0000;
pub const SIG_ATA_PATA_ALT: u16 = 0x0800;
pub const SIG_ATA_SATA: u16 = 0xC33C;
pub const SIG_ATAPI_PATA: u16 = 0xEB14;
pub const SIG_ATAPI_SATA: u16 = 0x9669;

// IDENTIFY data word offsets
pub const ATA_IDENT_CAPABILITIES: usize = 49;
pub const ATA_IDENT_MODEL: usize = 27;
pub const ATA_IDENT_MODEL_WORDS: usize = 20;
pub const ATA_IDENT_LBA28_LO: usize = 60;
pub const ATA_IDENT_LBA28_HI: usize = 61;
pub const ATA_CAP_LBA: u16 = 1 << 9;

// Geometry and limits
pub const MAX_CONTROLLERS: usize = 4;
pub const DRIVES_PER_CONTROLLER: usize = 2;
pub const SECTOR_SIZE: usize = 512;
pub const SECTOR_WORDS: usize = SECTOR_SIZE / 2;
pub const MAX_SECTORS_PER_COMMAND: u32 = 256;
pub const LBA28_LIMIT: u64 = 1 << 28;
pub const ATAPI_DEFAULT_BLOCK_SIZE: u32 = 2048;
pub const ATAPI_CDB_LEN: usize = 12;
pub const SENSE_LEN: usize = 18;
pub const INQUIRY_LEN: usize = 36;
pub const STAGING_BUFFER_SIZE: usize = 64 * 1024;
pub const PIO_MULTIPLE_MAX: u8 = 16;

// Scheduler policy
pub const ATAPI_MAX_RETRIES: u32 = 3;
pub const POLL_BURST_SECTORS: u32 = 32;
pub const WATCHDOG_STUCK_DRQ: u32 = 5;
pub const WATCHDOG_STUCK_LIMIT: u32 = 50;
pub const SEND_PACKET_ATTEMPTS: u32 = 2;

// Wait budgets, in microseconds
pub const TMO_PROGRAM_BSY_US: u32 = 500_000;    // BSY clear before issuing a taskfile
pub const TMO_WRITE_PRIME_US: u32 = 200_000;    // DRQ before the first write sector
pub const TMO_DATA_DRQ_US: u32 = 10_000;        // DRQ inside a data phase
pub const TMO_CHUNK_END_US: u32 = 200_000;      // BSY/DRQ clear after a chunk (interrupt path)
pub const TMO_POLL_CHUNK_END_US: u32 = 50_000;  // BSY/DRQ clear after a chunk (poll path)
pub const DRAIN_FINAL_ITERATIONS: u32 = 1_000;  // 1us apart
pub const TMO_FLUSH_US: u32 = 2_000_000;
pub const TMO_SET_MULTIPLE_US: u32 = 1_000_000;
pub const TMO_IDENTIFY_US: u32 = 500_000;
pub const TMO_RESET_US: u32 = 2_000_000;
pub const TMO_ATAPI_BSY_US: u32 = 1_000_000;    // BSY clear inside the packet loop
pub const TMO_ATAPI_FINAL_US: u32 = 100_000;
pub const TMO_PACKET_DRQ_US: u32 = 200_000;
pub const TMO_SENSE_US: u32 = 500_000;
pub const ATAPI_BECOMING_READY_DELAY_US: u32 = 50_000;
pub const ATAPI_CDB_SETTLE_US: u32 = 40;
pub const INTR_ISSUE_SETTLE_US: u32 = 20;
pub const DATA_PHASE_SETTLE_US: u32 = 10;
pub const POLL_YIELD_US: u32 = 2;
pub const POLL_BUSY_LIMIT: u32 = 500_000;       // BSY observations per poll run

// Default tick rate of the host timer facility
pub const DEFAULT_HZ: u32 = 100;
