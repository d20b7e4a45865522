//! Poll engine
//!
//! Stands in for the interrupt handler when a controller runs without
//! interrupts. Each call services at most [`POLL_BURST_SECTORS`] sectors of
//! the ATA request in flight; whatever is left is picked up by the next kick
//! or by the watchdog.

use log::{trace, warn};

use crate::ata::Action;
use crate::channel::Channel;
use crate::consts::*;
use crate::error::IdeError;
use crate::port::PortIo;
use crate::timer::Timer;
use crate::types::ControllerFlags;

impl<P: PortIo, T: Timer> Channel<'_, P, T> {
    pub(crate) fn poll_engine(&mut self) {
        {
            let mut st = self.ctrl.lock();
            if st.flags.contains(ControllerFlags::INTR_MODE) {
                return;
            }
            st.flags |= ControllerFlags::POLL_RUNNING;
        }

        let ticks = self.config.watchdog_ticks;
        let drq_budget = self.config.drq_budget();
        let mut burst = 0;
        let mut busy_spins = 0;

        loop {
            match self.req.as_ref() {
                Some(req) if !req.is_packet() => {}
                _ => return,
            }
            self.delay_us(POLL_YIELD_US);
            self.count(|c| c.loops += 1);

            let status = self.alt_status();
            if status.busy() {
                busy_spins += 1;
                if busy_spins > POLL_BUSY_LIMIT {
                    warn!("c{}: poll: BSY stuck ST={:02x}", self.ctrl.index(), status.bits());
                    self.count(|c| c.wait_bsy_timeouts += 1);
                    self.finish(Err(IdeError::Timeout));
                    return;
                }
                continue;
            }
            busy_spins = 0;

            let data_phase = status.drq() && !status.failed();
            if data_phase {
                if let Some(req) = self.req.as_mut() {
                    req.await_drq = drq_budget;
                }
            }

            match self.ata_step(status, TMO_POLL_CHUNK_END_US) {
                Action::Continue => {
                    burst += 1;
                    self.count(|c| c.polled_sectors += 1);
                    if burst >= POLL_BURST_SECTORS {
                        trace!("c{}: poll burst done", self.ctrl.index());
                        return;
                    }
                }
                Action::ProgramNextChunk => {
                    if data_phase {
                        burst += 1;
                        self.count(|c| c.polled_sectors += 1);
                    }
                    if let Err(e) = self.program_next_chunk(ticks) {
                        self.finish(Err(e));
                        return;
                    }
                }
                Action::Finish(result) => {
                    if data_phase {
                        self.count(|c| c.polled_sectors += 1);
                    }
                    self.finish(result);
                    return;
                }
                Action::AwaitMore => {
                    if data_phase {
                        // Last sector of a write; the idle edge comes next.
                        self.count(|c| c.polled_sectors += 1);
                        continue;
                    }
                    let Some(req) = self.req.as_mut() else {
                        return;
                    };
                    if req.await_drq == 0 {
                        let (lba, left, chunk) = (req.lba_cur, req.sectors_left, req.chunk_left);
                        warn!(
                            "c{}: poll: no DRQ ST={:02x} lba={} left={} chunk={}",
                            self.ctrl.index(),
                            status.bits(),
                            lba,
                            left,
                            chunk
                        );
                        self.count(|c| c.wait_drq_timeouts += 1);
                        self.finish(Err(IdeError::Timeout));
                        return;
                    }
                    req.await_drq -= 1;
                }
            }
        }
    }
}
