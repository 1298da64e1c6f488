use crate::sync::spin_loop;

/// Waiting hint for CAS-retry loops.
///
/// `spin` is for a retry that is expected to succeed right away,
/// it only ever busy-spins with exponentially growing rounds.
/// `snooze` is for waiting on a peer, which may be descheduled in the middle of its transition.
/// It switches to yielding the thread once spinning stops paying off, when "std" feature is enabled.
/// When the step count exceeds the yield limit it advises caller that blocking would be better.
#[derive(Debug, Default)]
pub struct BackOff {
    step: u32,
}

impl BackOff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 10;

    #[inline(always)]
    #[must_use]
    pub const fn new() -> Self {
        BackOff { step: 0 }
    }

    #[inline(always)]
    pub fn reset(&mut self) {
        self.step = 0;
    }

    #[inline(always)]
    pub fn spin(&mut self) {
        spin_rounds(self.step.min(Self::SPIN_LIMIT));

        if self.step <= Self::SPIN_LIMIT {
            self.step += 1;
        }
    }

    #[inline(always)]
    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            spin_rounds(self.step);
        } else {
            #[cfg(feature = "std")]
            crate::sync::yield_now();

            #[cfg(not(feature = "std"))]
            spin_rounds(Self::SPIN_LIMIT);
        }

        if self.step <= Self::YIELD_LIMIT {
            self.step += 1;
        }
    }

    /// Returns true once yielding has stopped paying off.
    ///
    /// The queue itself never blocks. Wrappers that park a thread on an empty or full queue
    /// can use this as the point to switch from retrying to parking.
    #[must_use]
    pub fn should_block(&self) -> bool {
        self.step > Self::YIELD_LIMIT
    }
}

#[inline(always)]
fn spin_rounds(step: u32) {
    // Every loom spin is a scheduling point, one is enough for the model.
    #[cfg(loom)]
    let rounds = {
        let _ = step;
        1
    };

    #[cfg(not(loom))]
    let rounds = 1u32 << step;

    for _ in 0..rounds {
        spin_loop();
    }
}

#[test]
#[cfg(not(loom))]
fn test_backoff_escalates() {
    let mut backoff = BackOff::new();
    for _ in 0..=BackOff::SPIN_LIMIT {
        backoff.spin();
    }
    // Spinning alone never suggests blocking.
    assert!(!backoff.should_block());

    for _ in 0..=BackOff::YIELD_LIMIT {
        backoff.snooze();
    }
    assert!(backoff.should_block());

    backoff.reset();
    assert!(!backoff.should_block());
}
