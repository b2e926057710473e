//! Poll sessions.
//!
//! A session services one port: link events, TX completions, then RX within
//! a packet budget. Its [`PollOutcome`] tells the caller whether to run
//! again right away or to wait for the next interrupt.

use std::sync::atomic::Ordering;

use tracing::{debug, trace};

use crate::device::Command;
use crate::port::Port;
use crate::port::rxq::DrainCtx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// All work done, interrupts re-enabled.
    Idle,
    /// Budget exhausted, poll again.
    MoreWork,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    pub outcome: PollOutcome,
    pub rx_done: usize,
    pub tx_done: usize,
}

impl PollSummary {
    fn idle() -> Self {
        Self {
            outcome: PollOutcome::Idle,
            rx_done: 0,
            tx_done: 0,
        }
    }
}

pub struct PollSession<'a> {
    port: &'a Port,
    budget: usize,
    force_tx_done: bool,
}

impl<'a> PollSession<'a> {
    pub fn new(port: &'a Port, budget: usize) -> Self {
        Self {
            port,
            budget,
            force_tx_done: false,
        }
    }

    /// Reclaim TX on every queue even without a TX-done cause, as the
    /// fallback timer does.
    pub fn force_tx_done(mut self) -> Self {
        self.force_tx_done = true;
        self
    }

    pub fn run(self) -> PollSummary {
        let port = self.port;
        let hooks = port.hooks();
        let mut events = Vec::new();
        let mut deferred = false;

        let (summary, epoch) = {
            let mut guard = port.lock();
            let st = &mut *guard;
            if !st.flags.started {
                port.scheduled.store(false, Ordering::Release);
                return PollSummary::idle();
            }
            st.counters.polls += 1;

            let cause = st.device.read_cause();

            if cause.link_change {
                let up = st.device.link_is_up();
                if up != st.flags.link_up {
                    debug!(port = %port.id(), link = up, "Link changed");
                    st.link_changed(up, &mut events);
                }
                st.device.write_command(Command::ClearMiscCause);
            }

            let mut tx_done = 0;
            if cause.tx_done != 0 || self.force_tx_done {
                for idx in 0..st.txqs.len() {
                    if st.txqs[idx].live() == 0 {
                        continue;
                    }
                    let id = st.txqs[idx].id();
                    let sent = st.device.tx_sent(id);
                    if sent > 0 {
                        tx_done += st.reclaim_txq(idx, sent, &mut events);
                    }
                }
                st.counters.tx_done_poll += tx_done as u64;
            }

            let mut budget = self.budget;
            let mut rx_done = 0;
            let mut pending = cause.rx;
            if let Some(pool) = st.pool.clone() {
                let ctx = DrainCtx {
                    port: port.id(),
                    special_hook: !hooks.rx_special.is_none(),
                    debug: st.flags.debug_rx,
                };
                while budget > 0 && pending != 0 {
                    let Some(idx) = pick_rxq(pending, st.rxqs.iter().map(|q| q.priority())) else {
                        break;
                    };
                    pending &= !(1u64 << idx);
                    let out = st.rxqs[idx].drain(st.device.as_mut(), &pool, budget, &ctx, &mut events);
                    deferred |= out.deferred;
                    budget -= out.processed;
                    rx_done += out.processed;
                }
            }

            let outcome = if budget == 0 {
                PollOutcome::MoreWork
            } else {
                st.counters.poll_idle += 1;
                st.device.write_command(Command::UnmaskInterrupts);
                port.scheduled.store(false, Ordering::Release);
                PollOutcome::Idle
            };
            trace!(port = %port.id(), rx_done, tx_done, ?outcome, "Poll session");

            (
                PollSummary {
                    outcome,
                    rx_done,
                    tx_done,
                },
                port.epoch(),
            )
        };

        if deferred {
            port.retry.arm();
        }
        port.dispatch(&hooks, epoch, events);
        summary
    }
}

/// Index of the RX queue to service next among the `pending` bits: highest
/// priority first, lowest index on ties. Bits without a queue are ignored.
pub fn pick_rxq(pending: u64, priorities: impl Iterator<Item = u8>) -> Option<usize> {
    priorities
        .enumerate()
        .take(u64::BITS as usize)
        .filter(|(i, _)| pending & (1u64 << i) != 0)
        .fold(None, |best: Option<(usize, u8)>, (i, prio)| match best {
            Some((_, p)) if p >= prio => best,
            _ => Some((i, prio)),
        })
        .map(|(i, _)| i)
}

impl Port {
    /// Run one interrupt-driven session.
    pub fn poll(&self, budget: usize) -> PollSummary {
        PollSession::new(self, budget).run()
    }

    /// Run one fallback-timer session, reclaiming TX unconditionally.
    pub fn poll_fallback(&self, budget: usize) -> PollSummary {
        PollSession::new(self, budget).force_tx_done().run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_highest_priority() {
        assert_eq!(pick_rxq(0b1011, [0, 1, 2, 3].into_iter()), Some(3));
        assert_eq!(pick_rxq(0b0011, [0, 1, 2, 3].into_iter()), Some(1));
        assert_eq!(pick_rxq(0, [0, 1].into_iter()), None);
    }

    #[test]
    fn test_pick_ties_lowest_index() {
        assert_eq!(pick_rxq(0b110, [5, 2, 2].into_iter()), Some(1));
        assert_eq!(pick_rxq(0b111, [7, 2, 7].into_iter()), Some(0));
    }

    #[test]
    fn test_pick_ignores_unknown_bits() {
        assert_eq!(pick_rxq(0b100, [0, 1].into_iter()), None);
    }
}
