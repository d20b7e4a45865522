use core::fmt;

use bitflags::bitflags;
use heapless::String;

use crate::consts::*;
use crate::sense::SenseData;

/// Address of one drive: controller index plus master (0) / slave (1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Unit {
    pub controller: u8,
    pub drive: u8,
}

impl Unit {
    pub const fn new(controller: u8, drive: u8) -> Self {
        Unit { controller, drive }
    }

    /// Flat unit number, two drives per controller.
    pub const fn from_index(index: usize) -> Self {
        Unit {
            controller: (index / DRIVES_PER_CONTROLLER) as u8,
            drive: (index % DRIVES_PER_CONTROLLER) as u8,
        }
    }

    pub const fn index(&self) -> usize {
        self.controller as usize * DRIVES_PER_CONTROLLER + self.drive as usize
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}d{}", self.controller, self.drive)
    }
}

bitflags! {
    /// ATA status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Status: u8 {
        const ERR = ATA_SR_ERR;
        const IDX = ATA_SR_IDX;
        const CORR = ATA_SR_CORR;
        const DRQ = ATA_SR_DRQ;
        const DSC = ATA_SR_DSC;
        const DF = ATA_SR_DF;
        const DRDY = ATA_SR_DRDY;
        const BSY = ATA_SR_BSY;
    }
}

impl Status {
    pub fn busy(self) -> bool {
        self.contains(Status::BSY)
    }

    pub fn drq(self) -> bool {
        self.contains(Status::DRQ)
    }

    /// ERR or device fault.
    pub fn failed(self) -> bool {
        self.intersects(Status::ERR | Status::DF)
    }

    /// Neither BSY nor DRQ: the device has finished the command.
    pub fn idle(self) -> bool {
        !self.intersects(Status::BSY | Status::DRQ)
    }
}

bitflags! {
    /// Operating flags of a controller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ControllerFlags: u32 {
        /// Channel configured and attached
        const PRESENT = 0x0001;
        /// Progress is driven by device interrupts
        const INTR_MODE = 0x0002;
        /// Interrupt context owns the hardware
        const IN_ISR = 0x0004;
        /// Poll engine owns the hardware
        const POLL_RUNNING = 0x0008;
        /// A context wanted to start work while the hardware was owned
        const PENDING_KICK = 0x0010;
        /// A request is in flight
        const BUSY = 0x0020;
        /// Last close is tearing the queue down
        const CLOSING = 0x0040;
        /// nIEN clear on the device control register
        const IRQ_ON = 0x0080;
        /// Call context (submit, kick, admin) owns the hardware
        const IN_START = 0x0100;
        /// Watchdog owns the hardware
        const IN_TIMER = 0x0200;
        /// An interrupt arrived while the hardware was owned
        const PENDING_IRQ = 0x0400;
        /// Administrative rescue arrived while the hardware was owned
        const RESCUE_PENDING = 0x0800;
    }
}

impl ControllerFlags {
    /// Any context currently driving the hardware.
    pub const OWNERS: ControllerFlags = ControllerFlags::IN_ISR
        .union(ControllerFlags::POLL_RUNNING)
        .union(ControllerFlags::IN_START)
        .union(ControllerFlags::IN_TIMER);

    /// Deferred work the owner drains before letting go.
    pub const DEFERRED: ControllerFlags = ControllerFlags::PENDING_KICK
        .union(ControllerFlags::PENDING_IRQ)
        .union(ControllerFlags::RESCUE_PENDING);
}

bitflags! {
    /// Capability and state flags of a drive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DriveFlags: u32 {
        const PRESENT = 0x0001;
        const ATAPI = 0x0002;
        const CDROM = 0x0004;
        const MOZIP = 0x0008;
        const HAS_MEDIA = 0x0010;
        const REMOVABLE = 0x0020;
        /// ATAPI error seen with no request in flight
        const NEEDS_SENSE = 0x0040;
        /// Administrative rescue asked packet loops to bail out
        const ABORT = 0x0080;
    }
}

/// What a drive signature says is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    AtaParallel,
    AtaSerial,
    AtapiParallel,
    AtapiSerial,
    Unknown(u16),
}

impl Signature {
    pub fn decode(sig: u16) -> Self {
        match sig {
            SIG_ATA_PATA | SIG_ATA_PATA_ALT => Signature::AtaParallel,
            SIG_ATA_SATA => Signature::AtaSerial,
            SIG_ATAPI_PATA => Signature::AtapiParallel,
            SIG_ATAPI_SATA => Signature::AtapiSerial,
            other => Signature::Unknown(other),
        }
    }

    pub fn is_atapi(self) -> bool {
        matches!(self, Signature::AtapiParallel | Signature::AtapiSerial)
    }

    pub fn is_known(self) -> bool {
        !matches!(self, Signature::Unknown(_))
    }
}

/// Peripheral device type reported by INQUIRY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtapiClass {
    DirectAccess { removable: bool },
    Tape,
    Worm,
    CdDvd,
    OpticalMemory,
    SimplifiedDirect,
    Unknown(u8),
}

impl AtapiClass {
    pub fn from_inquiry(pdt: u8, removable: bool) -> Self {
        match pdt {
            0x00 => AtapiClass::DirectAccess { removable },
            0x01 => AtapiClass::Tape,
            0x04 => AtapiClass::Worm,
            0x05 => AtapiClass::CdDvd,
            0x07 => AtapiClass::OpticalMemory,
            0x0E => AtapiClass::SimplifiedDirect,
            other => AtapiClass::Unknown(other),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AtapiClass::DirectAccess { removable: true } => "Removable Disk (ZIP/MO)",
            AtapiClass::DirectAccess { removable: false } => "Direct-Access Disk",
            AtapiClass::Tape => "Tape",
            AtapiClass::Worm => "WORM",
            AtapiClass::CdDvd => "CD/DVD",
            AtapiClass::OpticalMemory => "Optical Memory",
            AtapiClass::SimplifiedDirect => "Simplified Direct-Access",
            AtapiClass::Unknown(_) => "Unknown ATAPI",
        }
    }
}

/// Drive descriptor, populated at probe time and refreshed by the
/// identify, inquiry and media-state paths.
#[derive(Debug, Clone)]
pub struct Drive {
    pub flags: DriveFlags,
    pub signature: Option<Signature>,
    /// Model string from IDENTIFY, trimmed
    pub model: String<40>,
    /// INQUIRY vendor and product (ATAPI only)
    pub vendor: String<8>,
    pub product: String<16>,
    pub class: Option<AtapiClass>,
    /// LBA28 capacity in sectors (ATA)
    pub sectors: u32,
    /// Device supports LBA addressing
    pub lba_ok: bool,
    /// Negotiated PIO multiple count (1 = single sector)
    pub pio_multi: u8,
    /// SET MULTIPLE was accepted at `pio_multi`
    pub multi_ok: bool,
    /// ATAPI capacity in blocks and block size
    pub atapi_blocks: u32,
    pub atapi_block_size: u32,
    /// Last sense data fetched for this drive
    pub sense: SenseData,
}

impl Drive {
    pub const fn new() -> Self {
        Drive {
            flags: DriveFlags::empty(),
            signature: None,
            model: String::new(),
            vendor: String::new(),
            product: String::new(),
            class: None,
            sectors: 0,
            lba_ok: false,
            pio_multi: 1,
            multi_ok: false,
            atapi_blocks: 0,
            atapi_block_size: ATAPI_DEFAULT_BLOCK_SIZE,
            sense: SenseData::empty(),
        }
    }

    pub fn is_present(&self) -> bool {
        self.flags.contains(DriveFlags::PRESENT)
    }

    pub fn is_atapi(&self) -> bool {
        self.flags.contains(DriveFlags::ATAPI)
    }

    pub fn is_cdrom(&self) -> bool {
        self.flags.contains(DriveFlags::CDROM)
    }

    pub fn has_media(&self) -> bool {
        self.flags.contains(DriveFlags::HAS_MEDIA)
    }

    /// Native transfer block size in bytes.
    pub fn block_size(&self) -> u32 {
        if self.is_atapi() {
            if self.atapi_block_size == 0 {
                ATAPI_DEFAULT_BLOCK_SIZE
            } else {
                self.atapi_block_size
            }
        } else {
            SECTOR_SIZE as u32
        }
    }

    /// Capacity in native blocks.
    pub fn capacity(&self) -> u32 {
        if self.is_atapi() {
            self.atapi_blocks
        } else {
            self.sectors
        }
    }
}

impl Default for Drive {
    fn default() -> Self {
        Drive::new()
    }
}

/// CD audio address in minutes/seconds/frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Msf {
    pub minute: u8,
    pub second: u8,
    pub frame: u8,
}

impl Msf {
    pub const fn new(minute: u8, second: u8, frame: u8) -> Self {
        Msf { minute, second, frame }
    }
}

/// Current-position data from READ SUB-CHANNEL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubChannel {
    pub audio_status: u8,
    pub track: u8,
    pub index: u8,
    pub absolute: Msf,
    pub relative: Msf,
}

/// Data returned by INQUIRY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InquiryData {
    pub peripheral_type: u8,
    pub removable: bool,
    pub vendor: String<8>,
    pub product: String<16>,
}

/// Copy printable ASCII into a fixed string, trimming trailing blanks.
pub(crate) fn ascii_field<const N: usize>(bytes: &[u8]) -> String<N> {
    let mut out = String::new();
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map_or(0, |p| p + 1);
    let start = bytes[..end].iter().position(|&b| b != b' ').unwrap_or(end);
    for &b in &bytes[start..end] {
        let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' };
        if out.push(c).is_err() {
            break;
        }
    }
    out
}
