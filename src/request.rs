//! Requests and their completion tokens.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use crate::cdb::Cdb;
use crate::error::IdeResult;
use crate::sense::SenseData;
use crate::types::Status;

/// Transfer direction of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Where the caller's buffer came from.
///
/// `User` buffers are bounced through the controller staging buffer when one
/// is allocated; `Kernel` buffers are transferred in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferOrigin {
    #[default]
    Kernel,
    User,
}

/// ATAPI packet phase of the request in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AtapiPhase {
    #[default]
    Idle,
    WaitPacketDrq,
    SendPacket,
    WaitData,
    PioIn,
    PioOut,
    WaitComplete,
    Error,
}

impl AtapiPhase {
    /// A packet command has been issued and not yet completed.
    pub fn is_active(self) -> bool {
        !matches!(self, AtapiPhase::Idle | AtapiPhase::Error)
    }
}

/// Which buffer the current chunk moves data through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum XferTarget {
    Direct,
    Staging,
}

/// A block transfer handed to [`Engine::submit`](crate::Engine::submit).
#[derive(Debug)]
pub struct IoRequest {
    pub direction: Direction,
    /// First block, in the drive's native block size
    pub lba: u32,
    /// Block count; zero on ATAPI drives derives it from the buffer length
    pub count: u32,
    pub buffer: Vec<u8>,
    pub origin: BufferOrigin,
}

impl IoRequest {
    pub fn read(lba: u32, count: u32, buffer: Vec<u8>) -> Self {
        IoRequest { direction: Direction::Read, lba, count, buffer, origin: BufferOrigin::Kernel }
    }

    pub fn write(lba: u32, count: u32, buffer: Vec<u8>) -> Self {
        IoRequest { direction: Direction::Write, lba, count, buffer, origin: BufferOrigin::Kernel }
    }

    pub fn with_origin(mut self, origin: BufferOrigin) -> Self {
        self.origin = origin;
        self
    }
}

/// What the caller gets back once a request completes.
#[derive(Debug)]
pub struct IoOutcome {
    pub result: IdeResult<()>,
    /// Bytes moved between the device and the buffer
    pub bytes: usize,
    /// Buffer bytes left untouched
    pub residual: usize,
    pub buffer: Vec<u8>,
}

/// Completion slot shared between the engine and the caller.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    done: AtomicBool,
    reports: AtomicU32,
    outcome: Mutex<Option<IoOutcome>>,
}

impl Completion {
    /// Publish the outcome. Only the first call has any effect.
    pub(crate) fn complete(&self, outcome: IoOutcome) -> bool {
        self.reports.fetch_add(1, Ordering::Relaxed);
        if self
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.outcome.lock() = Some(outcome);
        true
    }
}

/// Handle returned by `submit`; resolves exactly once.
#[derive(Debug, Clone)]
pub struct CompletionToken {
    pub(crate) controller: usize,
    pub(crate) id: u32,
    pub(crate) inner: Arc<Completion>,
}

impl CompletionToken {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn controller(&self) -> usize {
        self.controller
    }

    pub fn is_complete(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    /// Take the outcome if the request has finished.
    pub fn try_take(&self) -> Option<IoOutcome> {
        if !self.is_complete() {
            return None;
        }
        self.inner.outcome.lock().take()
    }

    /// How many times the engine tried to report completion.
    pub fn report_count(&self) -> u32 {
        self.inner.reports.load(Ordering::Relaxed)
    }
}

/// Packet state carried by ATAPI requests.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PacketState {
    pub(crate) cdb: Cdb,
    pub(crate) phase: AtapiPhase,
    pub(crate) cdb_sent: bool,
    pub(crate) sense: SenseData,
    pub(crate) byte_count: u16,
    /// Transient-sense reissues spent on this request
    pub(crate) retries: u32,
}

/// Progress of the request in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub request_id: u32,
    pub sectors_left: u32,
    pub chunk_left: u32,
    pub bytes_done: usize,
}

/// The unit of work, owned by the queue until `finish` consumes it.
#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) id: u32,
    pub(crate) drive: u8,
    pub(crate) direction: Direction,
    pub(crate) origin: BufferOrigin,
    pub(crate) lba: u32,
    pub(crate) nsec: u32,
    pub(crate) block_size: u32,
    pub(crate) buffer: Vec<u8>,
    pub(crate) completion: Arc<Completion>,

    /// Outstanding opcode: an ATA command or PACKET
    pub(crate) cmd: u8,
    pub(crate) lba_cur: u32,
    pub(crate) sectors_left: u32,
    pub(crate) chunk_left: u32,
    pub(crate) chunk_sectors: u32,
    pub(crate) chunk_start: usize,
    pub(crate) chunk_bytes: usize,
    pub(crate) xfer_off: usize,
    pub(crate) target: XferTarget,
    pub(crate) needs_copy_back: bool,
    pub(crate) done: bool,

    pub(crate) status: Status,
    pub(crate) error: u8,
    pub(crate) await_drq: u32,

    pub(crate) prev_chunk_left: u32,
    pub(crate) prev_sectors_left: u32,
    pub(crate) stuck: u32,

    pub(crate) packet: PacketState,
}

impl Request {
    pub(crate) fn new(
        id: u32,
        drive: u8,
        io: IoRequest,
        block_size: u32,
        cmd: u8,
        completion: Arc<Completion>,
    ) -> Self {
        Request {
            id,
            drive,
            direction: io.direction,
            origin: io.origin,
            lba: io.lba,
            nsec: io.count,
            block_size,
            buffer: io.buffer,
            completion,
            cmd,
            lba_cur: io.lba,
            sectors_left: io.count,
            chunk_left: 0,
            chunk_sectors: 0,
            chunk_start: 0,
            chunk_bytes: 0,
            xfer_off: 0,
            target: XferTarget::Direct,
            needs_copy_back: false,
            done: false,
            status: Status::empty(),
            error: 0,
            await_drq: 0,
            prev_chunk_left: 0,
            prev_sectors_left: 0,
            stuck: 0,
            packet: PacketState::default(),
        }
    }

    pub(crate) fn is_read(&self) -> bool {
        self.direction == Direction::Read
    }

    pub(crate) fn is_packet(&self) -> bool {
        self.cmd == crate::consts::ATA_CMD_PACKET
    }

    /// Reset the running counters before the first chunk is programmed.
    pub(crate) fn rewind(&mut self, drq_budget: u32) {
        self.lba_cur = self.lba;
        self.sectors_left = self.nsec;
        self.chunk_left = 0;
        self.chunk_sectors = 0;
        self.chunk_start = 0;
        self.chunk_bytes = 0;
        self.xfer_off = 0;
        self.target = XferTarget::Direct;
        self.needs_copy_back = false;
        self.await_drq = drq_budget;
        self.prev_chunk_left = 0;
        self.prev_sectors_left = self.nsec;
        self.stuck = 0;
        self.packet.phase = AtapiPhase::Idle;
        self.packet.cdb_sent = false;
        self.packet.retries = 0;
    }

    /// Bytes actually moved, bounded by the buffer.
    pub(crate) fn bytes_done(&self) -> usize {
        self.xfer_off.min(self.buffer.len())
    }

    /// Offset of the transfer cursor inside the current chunk.
    pub(crate) fn chunk_offset(&self) -> usize {
        self.xfer_off - self.chunk_start
    }

    pub(crate) fn chunk_end(&self) -> usize {
        self.chunk_start + self.chunk_bytes
    }

    pub(crate) fn progress(&self) -> Progress {
        Progress {
            request_id: self.id,
            sectors_left: self.sectors_left,
            chunk_left: self.chunk_left,
            bytes_done: self.bytes_done(),
        }
    }
}
