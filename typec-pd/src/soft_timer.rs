//! One-shot software timers multiplexed onto a single hardware tick.
//!
//! A [`SoftTimerPool`] holds a fixed number of slots, each identified by a
//! [`TimerId`]. The platform calls [`SoftTimerPool::tick`] from its periodic
//! tick handler; expired slots fire their callbacks in scan order. The pool
//! is the building block for implementing [`crate::timers::Timer`] on bare
//! metal, and the bank that the port hands to the application for its own
//! timers.
//!
//! Timer IDs are partitioned per port and component, so that concurrent
//! policy-engine, Type-C and protocol activity on multiple ports can never
//! collide. [`TimerId::new`] is the only place that computes the layout.

/// Identifier of a software timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimerId(pub u16);

/// Component banks inside a port's timer ID window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerBank {
    /// Policy engine timers.
    PolicyEngine,
    /// Type-C connection timers.
    TypeC,
    /// Protocol layer timers.
    Protocol,
    /// Application-owned timers.
    Application,
}

impl TimerBank {
    const fn base(self) -> u16 {
        match self {
            TimerBank::PolicyEngine => 0x00,
            TimerBank::TypeC => 0x10,
            TimerBank::Protocol => 0x20,
            TimerBank::Application => 0x80,
        }
    }

    const fn size(self) -> u16 {
        match self {
            TimerBank::PolicyEngine | TimerBank::TypeC | TimerBank::Protocol => 0x10,
            TimerBank::Application => 0x80,
        }
    }
}

impl TimerId {
    /// Width of one port's ID window.
    pub const PORT_STRIDE: u16 = 0x100;

    /// Compute the ID of timer `index` in `bank` for `port`.
    ///
    /// Port 0's policy engine occupies 0x100..=0x10F, port 1's 0x200..=0x20F,
    /// with the Type-C, protocol and application banks at fixed offsets
    /// above.
    pub const fn new(port: u8, bank: TimerBank, index: u16) -> TimerId {
        assert!(index < bank.size());
        TimerId(Self::PORT_STRIDE * (port as u16 + 1) + bank.base() + index)
    }
}

/// Timer expiry callback; receives the caller context and the expired ID.
pub type TimerCallback<CTX> = fn(&mut CTX, TimerId);

struct Slot<CTX> {
    id: TimerId,
    remaining_ms: u32,
    callback: Option<TimerCallback<CTX>>,
}

// Derived impls would bound CTX, which only appears behind a fn pointer.
impl<CTX> Clone for Slot<CTX> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<CTX> Copy for Slot<CTX> {}

/// A fixed pool of one-shot millisecond timers, driven by one tick source.
///
/// `N` is the slot capacity; the scan per tick is linear, which stays cheap
/// because the active count is small in practice.
pub struct SoftTimerPool<CTX, const N: usize = 63> {
    slots: [Option<Slot<CTX>>; N],
    ticks_per_ms: u32,
    tick_phase: u32,
    sleeping: bool,
}

impl<CTX, const N: usize> SoftTimerPool<CTX, N> {
    /// Create an empty pool for a tick source of the given frequency.
    ///
    /// Frequencies below 1 kHz are rejected at the type level by rounding to
    /// at least one tick per millisecond.
    pub const fn new(tick_hz: u32) -> Self {
        let ticks_per_ms = tick_hz / 1000;
        Self {
            slots: [None; N],
            ticks_per_ms: if ticks_per_ms == 0 { 1 } else { ticks_per_ms },
            tick_phase: 0,
            sleeping: false,
        }
    }

    fn find(&self, id: TimerId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Some(slot) if slot.id == id))
    }

    /// Start a one-shot timer.
    ///
    /// Returns `false` if no slot is free, or if a timer with the same ID is
    /// already running. A running timer is never silently overwritten; stop
    /// it first to rearm.
    pub fn start(&mut self, id: TimerId, period_ms: u16, callback: Option<TimerCallback<CTX>>) -> bool {
        if self.find(id).is_some() {
            return false;
        }

        let Some(free) = self.slots.iter().position(Option::is_none) else {
            return false;
        };

        self.slots[free] = Some(Slot {
            id,
            remaining_ms: period_ms as u32,
            callback,
        });
        true
    }

    /// Start a timer without a callback; poll it with [`Self::is_running`].
    pub fn start_no_callback(&mut self, id: TimerId, period_ms: u16) -> bool {
        self.start(id, period_ms, None)
    }

    /// Stop a timer. Stopping an inactive ID is a no-op.
    pub fn stop(&mut self, id: TimerId) {
        if let Some(index) = self.find(id) {
            self.slots[index] = None;
        }
    }

    /// Stop all timers with IDs in `lo..=hi`.
    pub fn stop_range(&mut self, lo: TimerId, hi: TimerId) {
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(s) if s.id >= lo && s.id <= hi) {
                *slot = None;
            }
        }
    }

    /// Stop every timer.
    pub fn stop_all(&mut self) {
        self.slots = [None; N];
    }

    /// Whether a timer with the given ID is running.
    pub fn is_running(&self, id: TimerId) -> bool {
        self.find(id).is_some()
    }

    /// Whether any timer with an ID in `lo..=hi` is running.
    pub fn range_active(&self, lo: TimerId, hi: TimerId) -> bool {
        self.slots
            .iter()
            .any(|slot| matches!(slot, Some(s) if s.id >= lo && s.id <= hi))
    }

    /// Remaining time of a timer in milliseconds, or 0 if it is not running.
    pub fn remaining(&self, id: TimerId) -> u16 {
        match self.find(id) {
            Some(index) => self.slots[index].as_ref().map(|s| s.remaining_ms as u16).unwrap_or(0),
            None => 0,
        }
    }

    /// Number of running timers.
    pub fn num_active(&self) -> u8 {
        self.slots.iter().filter(|slot| slot.is_some()).count() as u8
    }

    /// Prepare for tickless deep sleep.
    ///
    /// The caller programs its wakeup source, sleeps, and reports the
    /// elapsed time through [`Self::resume`].
    pub fn enter_sleep(&mut self) {
        self.sleeping = true;
    }

    /// Shortest remaining period, for programming the wakeup source.
    pub fn next_expiry_ms(&self) -> Option<u16> {
        self.slots
            .iter()
            .flatten()
            .map(|slot| slot.remaining_ms as u16)
            .min()
    }

    /// Catch up after tickless sleep, dispatching everything that expired.
    pub fn resume(&mut self, ctx: &mut CTX, elapsed_ms: u32) {
        self.sleeping = false;
        self.advance(ctx, elapsed_ms);
    }

    /// Advance time by one hardware tick and dispatch expiries.
    ///
    /// Must be called from the platform's tick handler. Expiries are
    /// dispatched in slot-scan order, not in expiry-time order; callers that
    /// depend on ordering must not arm two timers expiring on the same tick.
    pub fn tick(&mut self, ctx: &mut CTX) {
        if self.sleeping {
            return;
        }

        self.tick_phase += 1;
        if self.tick_phase < self.ticks_per_ms {
            return;
        }
        self.tick_phase = 0;

        self.advance(ctx, 1);
    }

    fn advance(&mut self, ctx: &mut CTX, elapsed_ms: u32) {
        for index in 0..N {
            let Some(slot) = self.slots[index].as_mut() else {
                continue;
            };

            if slot.remaining_ms > elapsed_ms {
                slot.remaining_ms -= elapsed_ms;
                continue;
            }

            // Free the slot before the callback, so the callback may rearm
            // the same ID.
            let expired = self.slots[index].take();
            if let Some(Slot {
                id,
                callback: Some(callback),
                ..
            }) = expired
            {
                callback(ctx, id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SoftTimerPool, TimerBank, TimerId};

    #[derive(Default)]
    struct Fired(Vec<TimerId>);

    fn record(ctx: &mut Fired, id: TimerId) {
        ctx.0.push(id);
    }

    fn tick_ms(pool: &mut SoftTimerPool<Fired, 8>, ctx: &mut Fired, ms: u32) {
        for _ in 0..ms {
            pool.tick(ctx);
        }
    }

    #[test]
    fn id_partitioning() {
        assert_eq!(TimerId::new(0, TimerBank::PolicyEngine, 0), TimerId(0x100));
        assert_eq!(TimerId::new(0, TimerBank::PolicyEngine, 0xF), TimerId(0x10F));
        assert_eq!(TimerId::new(1, TimerBank::PolicyEngine, 0), TimerId(0x200));
        assert_eq!(TimerId::new(0, TimerBank::TypeC, 2), TimerId(0x112));
        assert_eq!(TimerId::new(1, TimerBank::Application, 0), TimerId(0x280));
    }

    #[test]
    fn expiry_dispatches_callback() {
        let mut pool: SoftTimerPool<Fired, 8> = SoftTimerPool::new(1000);
        let mut fired = Fired::default();
        let id = TimerId::new(0, TimerBank::Application, 1);

        assert!(pool.start(id, 3, Some(record)));
        assert_eq!(pool.num_active(), 1);

        tick_ms(&mut pool, &mut fired, 2);
        assert!(fired.0.is_empty());
        assert_eq!(pool.remaining(id), 1);

        tick_ms(&mut pool, &mut fired, 1);
        assert_eq!(fired.0, [id]);
        assert!(!pool.is_running(id));
        assert_eq!(pool.num_active(), 0);
    }

    #[test]
    fn duplicate_start_is_rejected() {
        let mut pool: SoftTimerPool<Fired, 8> = SoftTimerPool::new(1000);
        let id = TimerId::new(0, TimerBank::Application, 0);

        assert!(pool.start_no_callback(id, 10));
        assert!(!pool.start_no_callback(id, 20));
        assert_eq!(pool.remaining(id), 10);
    }

    #[test]
    fn stop_then_start_uses_the_new_period() {
        let mut pool: SoftTimerPool<Fired, 8> = SoftTimerPool::new(1000);
        let mut fired = Fired::default();
        let id = TimerId::new(0, TimerBank::Application, 0);

        assert!(pool.start(id, 2, Some(record)));
        tick_ms(&mut pool, &mut fired, 1);

        pool.stop(id);
        assert!(pool.start(id, 5, Some(record)));

        // The old instance must not fire.
        tick_ms(&mut pool, &mut fired, 4);
        assert!(fired.0.is_empty());

        tick_ms(&mut pool, &mut fired, 1);
        assert_eq!(fired.0, [id]);
    }

    #[test]
    fn range_operations() {
        let mut pool: SoftTimerPool<Fired, 8> = SoftTimerPool::new(1000);
        let pe0 = TimerId::new(0, TimerBank::PolicyEngine, 0);
        let pe1 = TimerId::new(0, TimerBank::PolicyEngine, 1);
        let app = TimerId::new(0, TimerBank::Application, 0);

        assert!(pool.start_no_callback(pe0, 10));
        assert!(pool.start_no_callback(pe1, 10));
        assert!(pool.start_no_callback(app, 10));

        assert!(pool.range_active(pe0, TimerId::new(0, TimerBank::PolicyEngine, 0xF)));
        pool.stop_range(pe0, TimerId::new(0, TimerBank::PolicyEngine, 0xF));
        assert!(!pool.range_active(pe0, TimerId::new(0, TimerBank::PolicyEngine, 0xF)));
        assert!(pool.is_running(app));
        assert_eq!(pool.num_active(), 1);
    }

    #[test]
    fn capacity_exhaustion_fails_cleanly() {
        let mut pool: SoftTimerPool<Fired, 8> = SoftTimerPool::new(1000);

        for index in 0..8 {
            assert!(pool.start_no_callback(TimerId::new(0, TimerBank::Application, index), 100));
        }
        assert!(!pool.start_no_callback(TimerId::new(0, TimerBank::Application, 8), 100));
        assert_eq!(pool.num_active(), 8);
    }

    #[test]
    fn tickless_resume_catches_up() {
        let mut pool: SoftTimerPool<Fired, 8> = SoftTimerPool::new(1000);
        let mut fired = Fired::default();
        let short = TimerId::new(0, TimerBank::Application, 0);
        let long = TimerId::new(0, TimerBank::Application, 1);

        assert!(pool.start(short, 20, Some(record)));
        assert!(pool.start(long, 100, Some(record)));

        pool.enter_sleep();
        assert_eq!(pool.next_expiry_ms(), Some(20));

        // Ticks during sleep are suppressed.
        pool.tick(&mut fired);
        assert_eq!(pool.remaining(short), 20);

        pool.resume(&mut fired, 50);
        assert_eq!(fired.0, [short]);
        assert_eq!(pool.remaining(long), 50);
    }
}
