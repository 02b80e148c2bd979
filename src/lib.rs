#[cfg(not(target_pointer_width = "64"))]
compile_error!("binmalloc supports only 64-bit targets.");

pub(crate) mod sync;

// implementation details (hidden via pub(crate))
pub mod memory;

// allocator
pub use memory::binned::{BinAllocator, BinAllocatorConfig, MAX_WALK_HOPS, ThreadArena};
#[cfg(not(loom))]
pub use memory::binned::GlobalBinAllocator;
pub use memory::registry::ThreadToken;

// stats
pub use memory::stats::BinStats;

// errors
pub use memory::vm::VmError;
