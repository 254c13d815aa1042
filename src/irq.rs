use std::sync::atomic::{AtomicU32, Ordering};

use crate::hal::InterruptController;

/// Interrupts masked for as long as the guard lives.
///
/// The previous mask state is restored on drop, so an early `return` out of a
/// polling loop can never leave interrupts disabled.
pub struct CriticalSection<'a, I: InterruptController> {
    irq: &'a mut I,
    were_enabled: bool,
}

impl<'a, I: InterruptController> CriticalSection<'a, I> {
    pub fn enter(irq: &'a mut I) -> Self {
        let were_enabled = irq.disable_interrupts();
        Self { irq, were_enabled }
    }
}

impl<I: InterruptController> Drop for CriticalSection<'_, I> {
    fn drop(&mut self) {
        if self.were_enabled {
            self.irq.enable_interrupts();
        }
    }
}

/// Interrupts still to be generated in a periodic session.
///
/// The session arms it before the timer interrupt is enabled; from then on
/// only [`crate::periodic::on_match_interrupt`] writes it.
#[derive(Debug, Default)]
pub struct InterruptCounter {
    remaining: AtomicU32,
}

impl InterruptCounter {
    pub const fn new() -> Self {
        Self {
            remaining: AtomicU32::new(0),
        }
    }

    pub fn arm(&self, count: u32) {
        self.remaining.store(count, Ordering::Release);
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Takes one interrupt off the count and returns what is left. Never
    /// wraps below zero.
    pub fn decrement(&self) -> u32 {
        match self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeIrq {
        enabled: bool,
        disables: u32,
    }

    impl InterruptController for FakeIrq {
        fn disable_interrupts(&mut self) -> bool {
            self.disables += 1;
            std::mem::replace(&mut self.enabled, false)
        }
        fn enable_interrupts(&mut self) {
            self.enabled = true;
        }
        fn enable_timer_interrupt(&mut self) {}
        fn disable_timer_interrupt(&mut self) {}
    }

    fn masked_then_bail(irq: &mut FakeIrq, bail: bool) -> u32 {
        let _cs = CriticalSection::enter(irq);
        if bail {
            return 1;
        }
        2
    }

    #[test]
    fn guard_restores_on_early_return() {
        let mut irq = FakeIrq {
            enabled: true,
            ..Default::default()
        };
        assert_eq!(masked_then_bail(&mut irq, true), 1);
        assert!(irq.enabled);
        assert_eq!(masked_then_bail(&mut irq, false), 2);
        assert!(irq.enabled);
        assert_eq!(irq.disables, 2);
    }

    #[test]
    fn nested_guard_leaves_outer_mask_alone() {
        let mut irq = FakeIrq::default();
        {
            let _cs = CriticalSection::enter(&mut irq);
        }
        assert!(!irq.enabled);
    }

    #[test]
    fn counter_stops_at_zero() {
        let counter = InterruptCounter::new();
        counter.arm(2);
        assert_eq!(counter.decrement(), 1);
        assert_eq!(counter.decrement(), 0);
        assert_eq!(counter.decrement(), 0);
        assert_eq!(counter.remaining(), 0);
    }
}
