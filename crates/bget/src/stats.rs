use core::fmt;

/// Allocation statistics of a pool set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MallocStats {
    pub desc: &'static str,
    /// Bytes currently allocated, headers included.
    pub allocated: usize,
    /// Highest value `allocated` reached since the last reset.
    pub max_allocated: usize,
    /// Total size of the registered pools.
    pub size: usize,
    pub num_alloc_fail: usize,
    /// Largest request that failed.
    pub biggest_alloc_fail: usize,
    /// Value of `allocated` when the largest failed request happened.
    pub biggest_alloc_fail_used: usize,
}

impl MallocStats {
    pub const fn new(desc: &'static str) -> Self {
        Self {
            desc,
            allocated: 0,
            max_allocated: 0,
            size: 0,
            num_alloc_fail: 0,
            biggest_alloc_fail: 0,
            biggest_alloc_fail_used: 0,
        }
    }

    /// Records the outcome of an allocation request, `allocated` is the pool set total after it.
    pub(crate) fn record(&mut self, success: bool, requested: usize, allocated: usize) {
        if allocated > self.max_allocated {
            self.max_allocated = allocated;
        }
        if !success {
            self.num_alloc_fail += 1;
            if requested > self.biggest_alloc_fail {
                self.biggest_alloc_fail = requested;
                self.biggest_alloc_fail_used = allocated;
            }
        }
    }

    /// Clears the maxima and failure counters.
    pub(crate) fn reset(&mut self) {
        self.max_allocated = 0;
        self.num_alloc_fail = 0;
        self.biggest_alloc_fail = 0;
        self.biggest_alloc_fail_used = 0;
    }
}

impl fmt::Display for MallocStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pool:                {}", self.desc)?;
        writeln!(f, "Bytes allocated:     {}", self.allocated)?;
        writeln!(f, "Max bytes allocated: {}", self.max_allocated)?;
        writeln!(f, "Size of pool:        {}", self.size)?;
        writeln!(f, "Number of failed allocations: {}", self.num_alloc_fail)?;
        writeln!(f, "Size of largest allocation failure: {}", self.biggest_alloc_fail)?;
        write!(
            f,
            "Total bytes allocated at that failure: {}",
            self.biggest_alloc_fail_used
        )
    }
}
