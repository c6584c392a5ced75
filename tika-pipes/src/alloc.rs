//! Process-wide allocator selection.
//!
//! jemalloc measurably reduces RSS under the worker pool's bursty
//! subprocess-spawning workload versus the system allocator. No
//! flamegraph/pprof wiring here; this service has no route for it.

#[cfg(target_env = "msvc")]
pub use std::alloc::System as DefaultAllocator;
#[cfg(not(target_env = "msvc"))]
pub use tikv_jemallocator::Jemalloc as DefaultAllocator;

#[macro_export]
macro_rules! use_default_allocator {
    () => {
        #[global_allocator]
        static GLOBAL: $crate::alloc::DefaultAllocator = $crate::alloc::DefaultAllocator;
    };
}
