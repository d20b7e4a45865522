//! Engine and channel configuration.

use crate::consts::*;

/// Port and interrupt assignment of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Command block base port
    pub io_base: u16,
    /// Interrupt line the channel raises
    pub irq: u8,
    /// Attach and probe this channel at init
    pub present: bool,
}

impl ControllerConfig {
    pub const fn new(io_base: u16, irq: u8, present: bool) -> Self {
        ControllerConfig { io_base, irq, present }
    }

    /// Control block base (alternate status / device control).
    pub const fn ctl_base(&self) -> u16 {
        self.io_base + ATA_CTL_OFFSET
    }
}

/// The four legacy channel slots.
pub const DEFAULT_CONTROLLERS: [ControllerConfig; MAX_CONTROLLERS] = [
    ControllerConfig::new(0x1F0, 14, true),
    ControllerConfig::new(0x170, 15, true),
    ControllerConfig::new(0x1E8, 11, false),
    ControllerConfig::new(0x168, 10, false),
];

/// Engine-wide tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Drive ATA transfers from device interrupts instead of the poll engine
    pub ata_interrupts: bool,
    /// Let ATAPI requests use the interrupt path on interrupt-mode channels
    pub atapi_interrupts: bool,
    /// Staging buffer allocated on first open, caps interrupt-mode chunks
    pub staging_buffer_size: usize,
    /// Tick rate of the host timer
    pub hz: u32,
    /// Watchdog timeout after a chunk is programmed, in ticks
    pub watchdog_ticks: u32,
    /// Start PIO multiple negotiation at 16 instead of 8
    pub use_max_multiple: bool,
    /// Attempts an administrative call makes to claim an idle channel
    pub claim_spin_limit: u32,
}

impl EngineConfig {
    /// Re-arm interval while a chunk is still moving.
    pub fn service_ticks(&self) -> u32 {
        (self.hz / 10).max(1)
    }

    /// Poll-engine iterations allowed without DRQ before a chunk fails.
    pub fn drq_budget(&self) -> u32 {
        self.hz * 2
    }

    pub fn staging_sectors(&self) -> u32 {
        (self.staging_buffer_size / SECTOR_SIZE) as u32
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            ata_interrupts: true,
            atapi_interrupts: true,
            staging_buffer_size: STAGING_BUFFER_SIZE,
            hz: DEFAULT_HZ,
            watchdog_ticks: (DEFAULT_HZ / 8).max(1),
            use_max_multiple: true,
            claim_spin_limit: 1_000_000,
        }
    }
}
