//! Scheduler (spec.md 4.8). Two variants sharing no state, chosen at
//! compile time (`lottery` feature) — 9, "polymorphism across schedulers
//! is a compile-time choice", no dynamic dispatch at run time.

pub mod mt19937;

use crate::env::{EnvId, EnvStatus, EnvTable};
use mt19937::Mt19937;

#[derive(Debug, PartialEq, Eq)]
pub enum SchedDecision {
    Run(EnvId),
    /// The previous runner is still Running and nothing else is
    /// Runnable; re-dispatch it.
    KeepCurrent(EnvId),
    Halt,
}

pub trait Scheduler {
    fn pick_next(&mut self, envs: &EnvTable, current: Option<EnvId>) -> SchedDecision;
}

/// Scans starting immediately after the previously running slot, wraps,
/// and picks the first Runnable task.
pub struct RoundRobin;

impl Scheduler for RoundRobin {
    fn pick_next(&mut self, envs: &EnvTable, current: Option<EnvId>) -> SchedDecision {
        let n = envs.slot_count();
        let start = current.map(|c| (c.index() + 1) % n).unwrap_or(0);

        for offset in 0..n {
            let idx = (start + offset) % n;
            let slot = envs.slot(idx);
            if slot.status == EnvStatus::Runnable {
                return SchedDecision::Run(slot.id);
            }
        }

        if let Some(current) = current {
            if let Some(env) = envs.get(current) {
                if env.status == EnvStatus::Running {
                    return SchedDecision::KeepCurrent(current);
                }
            }
        }
        SchedDecision::Halt
    }
}

/// Proportional-share: sums ticket counts over every Runnable task and
/// draws a uniform index into the combined range.
pub struct Lottery {
    rng: Mt19937,
}

impl Lottery {
    pub fn new(seed: u32) -> Self {
        Lottery { rng: Mt19937::new(seed) }
    }

    /// `seconds + minutes*60 + hours*3600`, the exact seed formula (4.8).
    pub fn seed_from_wallclock(hours: u32, minutes: u32, seconds: u32) -> u32 {
        seconds + minutes * 60 + hours * 3600
    }
}

impl Scheduler for Lottery {
    fn pick_next(&mut self, envs: &EnvTable, current: Option<EnvId>) -> SchedDecision {
        let total: u32 = envs.iter().filter(|e| e.status == EnvStatus::Runnable).map(|e| e.tickets).sum();
        if total == 0 {
            return RoundRobin.pick_next(envs, current);
        }

        let mut draw = self.rng.next_below(total);
        for env in envs.iter() {
            if env.status != EnvStatus::Runnable {
                continue;
            }
            if draw < env.tickets {
                return SchedDecision::Run(env.id);
            }
            draw -= env.tickets;
        }
        unreachable!("draw must land within the summed ticket range")
    }
}

#[cfg(feature = "lottery")]
pub type ActiveScheduler = Lottery;
#[cfg(not(feature = "lottery"))]
pub type ActiveScheduler = RoundRobin;

/// Builds whichever `ActiveScheduler` is compiled in. The wall-clock seed
/// only matters for `Lottery`; `RoundRobin` ignores it.
#[cfg(feature = "lottery")]
pub fn new_scheduler(seed: u32) -> ActiveScheduler {
    Lottery::new(seed)
}
#[cfg(not(feature = "lottery"))]
pub fn new_scheduler(_seed: u32) -> ActiveScheduler {
    RoundRobin
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::FrameAllocator;
    use crate::mm::phys::SimMemory;

    fn setup() -> (FrameAllocator, SimMemory, EnvTable) {
        (FrameAllocator::new(16, |_| false), SimMemory::new(16), EnvTable::new(0x1b, 0x23))
    }

    #[test]
    fn round_robin_wraps_and_skips_non_runnable() {
        let (mut frames, mut phys, mut envs) = setup();
        let a = envs.alloc(&mut frames, &mut phys, None, EnvId::NONE).unwrap();
        let b = envs.alloc(&mut frames, &mut phys, None, EnvId::NONE).unwrap();
        envs.set_status(a, EnvStatus::Runnable).unwrap();
        envs.set_status(b, EnvStatus::Runnable).unwrap();

        let mut sched = RoundRobin;
        assert_eq!(sched.pick_next(&envs, None), SchedDecision::Run(a));
        assert_eq!(sched.pick_next(&envs, Some(a)), SchedDecision::Run(b));
        assert_eq!(sched.pick_next(&envs, Some(b)), SchedDecision::Run(a));
    }

    #[test]
    fn round_robin_halts_when_nothing_runnable() {
        let (_frames, _phys, envs) = setup();
        let mut sched = RoundRobin;
        assert_eq!(sched.pick_next(&envs, None), SchedDecision::Halt);
    }

    #[test]
    fn lottery_weighting_matches_ticket_ratio_over_many_draws() {
        let (mut frames, mut phys, mut envs) = setup();
        let a = envs.alloc(&mut frames, &mut phys, None, EnvId::NONE).unwrap();
        let b = envs.alloc(&mut frames, &mut phys, None, EnvId::NONE).unwrap();
        let c = envs.alloc(&mut frames, &mut phys, None, EnvId::NONE).unwrap();
        for id in [a, b, c] {
            envs.set_status(id, EnvStatus::Runnable).unwrap();
        }
        envs.slot_mut(a.index()).tickets = 1;
        envs.slot_mut(b.index()).tickets = 1;
        envs.slot_mut(c.index()).tickets = 2;

        let mut sched = Lottery::new(0xC0FFEE);
        let mut c_wins = 0u32;
        for _ in 0..10_000 {
            if sched.pick_next(&envs, None) == SchedDecision::Run(c) {
                c_wins += 1;
            }
        }
        assert!(c_wins >= 4500 && c_wins <= 5500, "c_wins={c_wins}");
    }
}
