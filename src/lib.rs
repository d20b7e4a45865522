//! ATA/ATAPI PIO block storage for legacy dual-drive IDE channels.
//!
//! Each channel owns a request queue with at most one request on the
//! hardware. Transfers run from the device interrupt or from a bounded poll
//! engine, and a per-channel watchdog recovers lost interrupts and wedged
//! devices. Port access and timeouts are supplied by the host through
//! [`PortIo`] and [`Timer`].
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod consts;

mod ata;
mod atapi;
mod cdb;
mod channel;
mod config;
mod controller;
mod engine;
mod error;
mod poll;
mod port;
mod probe;
mod queue;
mod request;
mod select;
mod sense;
mod timer;
mod types;
mod watchdog;

#[cfg(test)]
mod sim;

pub use ata::IdentifyData;
pub use cdb::Cdb;
pub use config::{ControllerConfig, EngineConfig, DEFAULT_CONTROLLERS};
pub use controller::{Controller, Counters, LastCommand};
pub use engine::Engine;
pub use error::{ErrorSeverity, IdeError, IdeResult};
#[cfg(target_arch = "x86_64")]
pub use port::X86PortIo;
pub use port::PortIo;
pub use queue::QueueState;
pub use request::{AtapiPhase, BufferOrigin, CompletionToken, Direction, IoOutcome, IoRequest, Progress};
pub use select::{StatusSnapshot, WaitTimeout};
pub use sense::SenseData;
pub use timer::{Timer, TimerHandle};
pub use types::{AtapiClass, ControllerFlags, Drive, DriveFlags, InquiryData, Msf, Signature, Status, SubChannel, Unit};
