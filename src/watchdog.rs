//! Watchdog
//!
//! Runs when the timer armed after a chunk program expires. Progress is
//! judged from `chunk_left`/`sectors_left` against the snapshot taken on the
//! previous expiry.

use log::{debug, error, warn};

use crate::channel::Channel;
use crate::consts::*;
use crate::error::IdeError;
use crate::port::PortIo;
use crate::request::AtapiPhase;
use crate::timer::Timer;

impl<P: PortIo, T: Timer> Channel<'_, P, T> {
    pub(crate) fn watchdog_service(&mut self) {
        if self.req.is_none() {
            return;
        }
        self.count(|c| c.wd_fired += 1);
        let snap = self.read_error();
        let status = snap.status;

        let Some(req) = self.req.as_mut() else {
            return;
        };
        if req.prev_chunk_left != req.chunk_left || req.prev_sectors_left != req.sectors_left {
            req.stuck = 0;
            req.prev_chunk_left = req.chunk_left;
            req.prev_sectors_left = req.sectors_left;
        } else {
            req.stuck += 1;
        }
        let (id, lba, stuck) = (req.id, req.lba_cur, req.stuck);
        let (chunk_left, sectors_left) = (req.chunk_left, req.sectors_left);
        let packet = req.is_packet();
        let phase = req.packet.phase;

        if stuck > WATCHDOG_STUCK_LIMIT {
            error!(
                "c{}: req {} timed out at lba {} ST={:02x} ER={:02x}",
                self.ctrl.index(),
                id,
                lba,
                status.bits(),
                snap.error
            );
            self.rescue_current(IdeError::Timeout);
            return;
        }
        if stuck > WATCHDOG_STUCK_DRQ && status.drq() && !status.busy() && !status.failed() {
            warn!(
                "c{}: req {} device holding DRQ, resetting channel",
                self.ctrl.index(),
                id
            );
            self.count(|c| c.wd_resets += 1);
            if let Err(e) = self.soft_reset() {
                warn!("c{}: reset after stuck DRQ failed: {}", self.ctrl.index(), e);
            }
            self.rescue_current(IdeError::Timeout);
            return;
        }

        if packet && phase.is_active() {
            // Completion edge lost after the data phases.
            let awaiting = matches!(
                phase,
                AtapiPhase::WaitData | AtapiPhase::PioIn | AtapiPhase::PioOut | AtapiPhase::WaitComplete
            );
            if stuck > 0 && awaiting && status.idle() && !status.failed() {
                debug!("c{}: req {} completion seen by watchdog", self.ctrl.index(), id);
                self.count(|c| c.lost_irq_rescued += 1);
                let action = self.maybe_finish();
                self.atapi_apply(action);
                return;
            }
            self.count(|c| c.wd_chunk += 1);
            self.arm_watchdog(self.config.service_ticks());
            return;
        }

        if chunk_left > 0 && sectors_left > 0 {
            self.count(|c| c.wd_chunk += 1);
            self.arm_watchdog(self.config.service_ticks());
            if !self.intr_mode() {
                self.count(|c| c.wd_serviced += 1);
                self.poll_engine();
            }
            return;
        }

        if sectors_left > 0 {
            self.count(|c| c.wd_rekicked += 1);
            if let Err(e) = self.program_next_chunk(self.config.watchdog_ticks) {
                self.finish(Err(e));
            }
            return;
        }

        if status.busy() {
            self.arm_watchdog(self.config.service_ticks());
            return;
        }
        if status.failed() {
            self.finish(Err(snap.to_error()));
            return;
        }
        self.count(|c| {
            c.eoc_polled += 1;
            c.lost_irq_rescued += 1;
        });
        self.finish(Ok(()));
    }
}
