/// Default CPU speed, in cycles per second.
pub const DEFAULT_CYCLES_PER_SECOND: u32 = 2_000_000;

/// Host ticks per second.
pub const DEFAULT_TICKS_PER_SECOND: u32 = 20;

/// Splits a per-second cycle rate into per-tick budgets.
///
/// When the rate does not divide evenly the remainder is spread over the
/// ticks of each second, so every `ticks_per_second` ticks hand out exactly
/// `cycles_per_second` cycles.
#[derive(Debug, Clone)]
pub struct Clock {
    cycles_per_second: u32,
    ticks_per_second: u32,

    /// Ticks handed out so far
    tick_count: u64,

    /// Sum of every budget handed out
    total_cycles: u64,

    /// Remainder accumulator, always below `ticks_per_second`
    fraction: u32,
}

impl Clock {
    pub fn new(cycles_per_second: u32, ticks_per_second: u32) -> Self {
        Self {
            cycles_per_second,
            ticks_per_second: ticks_per_second.max(1),
            tick_count: 0,
            total_cycles: 0,
            fraction: 0,
        }
    }

    pub fn reset(&mut self) {
        self.tick_count = 0;
        self.total_cycles = 0;
        self.fraction = 0;
    }

    /// Budget for the next tick.
    pub fn next_budget(&mut self) -> u32 {
        let base = self.cycles_per_second / self.ticks_per_second;
        let remainder = self.cycles_per_second % self.ticks_per_second;

        self.fraction += remainder;
        let mut budget = base;
        if self.fraction >= self.ticks_per_second {
            self.fraction -= self.ticks_per_second;
            budget += 1;
        }

        self.tick_count += 1;
        self.total_cycles += budget as u64;
        budget
    }

    pub fn cycles_per_second(&self) -> u32 {
        self.cycles_per_second
    }

    pub fn ticks_per_second(&self) -> u32 {
        self.ticks_per_second
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Simulated time elapsed, in seconds.
    pub fn elapsed_seconds(&self) -> f64 {
        self.tick_count as f64 / self.ticks_per_second as f64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(DEFAULT_CYCLES_PER_SECOND, DEFAULT_TICKS_PER_SECOND)
    }
}
