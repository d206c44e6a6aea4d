use std::fmt;

/// A point on the monotonic "when" axis that conditions are keyed by.
///
/// The cache itself only ever compares time points; it never does arithmetic on them.
pub trait TimePoint: Copy + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// The smallest representable time point, used as the start of infinite intervals.
    const MIN: Self;
}

impl TimePoint for u32 {
    const MIN: Self = 0;
}

impl TimePoint for u64 {
    const MIN: Self = 0;
}

impl TimePoint for i64 {
    const MIN: Self = i64::MIN;
}

/// A run number paired with a luminosity block.
///
/// Orders by run first, then by luminosity block, which matches the order of the packed
/// [`key`](Self::key) representation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RunLumi {
    pub run: u32,
    pub lumi_block: u32,
}

impl RunLumi {
    pub const fn new(run: u32, lumi_block: u32) -> Self {
        Self { run, lumi_block }
    }

    /// The first luminosity block of the given run.
    pub const fn start_of_run(run: u32) -> Self {
        Self::new(run, 0)
    }

    /// Collapses this pair into a single `u64`, with the run in the upper 32 bits.
    pub const fn key(self) -> u64 {
        ((self.run as u64) << 32) | self.lumi_block as u64
    }

    /// Unpacks a key previously created by [`key`](Self::key).
    pub const fn from_key(key: u64) -> Self {
        Self::new((key >> 32) as u32, key as u32)
    }
}

impl From<RunLumi> for u64 {
    fn from(value: RunLumi) -> Self {
        value.key()
    }
}

impl From<u64> for RunLumi {
    fn from(key: u64) -> Self {
        Self::from_key(key)
    }
}

impl fmt::Display for RunLumi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.run, self.lumi_block)
    }
}

impl TimePoint for RunLumi {
    const MIN: Self = RunLumi::new(0, 0);
}
