use super::arena::{
    Arena, MAX_SMALL_SIZE, acquire_chunk, class_of_chunk_size, select_class, select_class_aligned,
};
use super::bin::{Bin, CHUNK_ALIGN, Reclaim};
use super::registry::{ArenaRegistry, ThreadToken};
use super::stats::{BinStats, StatCounters};
use super::vm::VmError;
use std::fmt::{self, Write as _};
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Upper bound accepted for [`BinAllocatorConfig::max_walk_hops`].
pub const MAX_WALK_HOPS: usize = 64;

/// Configuration for `BinAllocator`.
/// Set at init time via `BinAllocator::with_config()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BinAllocatorConfig {
    /// Bins past the head inspected (with a non-blocking lock) before a
    /// fresh bin is mapped. Bounds allocation latency under contention at
    /// the cost of missing free chunks deeper in the list.
    /// Valid range `1..=MAX_WALK_HOPS`. Default: 10.
    pub max_walk_hops: usize,
}

impl BinAllocatorConfig {
    pub const DEFAULT: Self = Self { max_walk_hops: 10 };

    fn validate(&self) -> Result<(), VmError> {
        if !(1..=MAX_WALK_HOPS).contains(&self.max_walk_hops) {
            return Err(VmError::InvalidConfig(format!(
                "max_walk_hops {} outside 1..={MAX_WALK_HOPS}",
                self.max_walk_hops
            )));
        }
        Ok(())
    }
}

impl Default for BinAllocatorConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Fixed-size message buffer for reporting without the heap. Output past
/// the end is dropped.
struct StackMessage {
    buf: [u8; 256],
    len: usize,
}

impl StackMessage {
    const fn new() -> Self {
        Self { buf: [0; 256], len: 0 }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl fmt::Write for StackMessage {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let n = s.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// Render the fatal allocation report into `out`.
///
/// OS errors go through `strerror_r`: `io::Error`'s own `Display` builds a
/// `String` for them.
fn describe_failure(bytes: usize, err: &VmError, out: &mut StackMessage) -> fmt::Result {
    write!(out, "binmalloc: allocation of {bytes} bytes failed: ")?;
    let os_code = match err {
        VmError::MapFailed(e) | VmError::ReleaseFailed(e) => e.raw_os_error(),
        VmError::InvalidConfig(_) | VmError::UnsupportedLayout(_) => None,
    };
    match os_code {
        Some(code) => {
            let mut text = [0u8; 128];
            // Safety: FFI call; `text` is writable for its whole length.
            let rc = unsafe { libc::strerror_r(code, text.as_mut_ptr().cast(), text.len()) };
            let text = std::ffi::CStr::from_bytes_until_nul(&text)
                .ok()
                .and_then(|c| c.to_str().ok())
                .filter(|_| rc == 0);
            match text {
                Some(text) => write!(out, "{text} (os error {code})")?,
                None => write!(out, "os error {code}")?,
            }
        }
        None => write!(out, "{err}")?,
    }
    out.write_str("\n")
}

/// Write all of `bytes` to stderr with raw `write(2)` calls.
fn write_stderr(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // Safety: FFI call; the slice is valid for its length.
        let n = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        match usize::try_from(n) {
            Ok(n) if n > 0 => bytes = &bytes[n..],
            _ => return,
        }
    }
}

/// Mapping failure on the infallible path. Nothing sensible can continue
/// without backing memory. The stderr report does not touch the heap, so it
/// is printed even when no tracing subscriber is installed or the heap is the
/// thing that failed.
#[cold]
fn abort_on_map_failure(bytes: usize, err: &VmError) -> ! {
    let mut message = StackMessage::new();
    // `StackMessage` never reports an error.
    let _ = describe_failure(bytes, err, &mut message);
    write_stderr(message.as_bytes());
    tracing::error!(bytes, error = %err, "allocation failed; aborting");
    std::process::abort()
}

// ---------------------------------------------------------------------------
// Global allocator
// ---------------------------------------------------------------------------

#[cfg(not(loom))]
static GLOBAL_BIN_INSTANCE: BinAllocator = BinAllocator::new();

#[cfg(not(loom))]
thread_local! {
    // Plain pointer without a destructor: usable from inside `GlobalAlloc`
    // at any point of the thread's life, including TLS teardown.
    static GLOBAL_THREAD_ARENA: std::cell::Cell<Option<NonNull<Arena>>> =
        const { std::cell::Cell::new(None) };
}

/// Process-wide allocator backed by a static [`BinAllocator`].
///
/// Each thread's arena is resolved once and then cached in thread-local
/// storage, so the registry lock is only taken on a thread's first call and
/// for cross-thread frees.
///
/// ```ignore
/// #[global_allocator]
/// static ALLOC: binmalloc::GlobalBinAllocator = binmalloc::GlobalBinAllocator;
/// ```
#[cfg(not(loom))]
pub struct GlobalBinAllocator;

#[cfg(not(loom))]
impl GlobalBinAllocator {
    /// The static allocator instance behind this façade.
    pub fn get() -> &'static BinAllocator {
        &GLOBAL_BIN_INSTANCE
    }

    /// Calling thread's arena, created and registered on first use.
    ///
    /// # Errors
    ///
    /// Returns `VmError::MapFailed` if the arena cannot be mapped.
    pub fn arena() -> Result<ThreadArena<'static>, VmError> {
        if let Some(arena) = GLOBAL_THREAD_ARENA.with(std::cell::Cell::get) {
            // Safety: cached arenas are registered and never unmapped.
            return Ok(ThreadArena::new(&GLOBAL_BIN_INSTANCE, unsafe { arena.as_ref() }));
        }
        let handle = GLOBAL_BIN_INSTANCE.ensure_arena()?;
        GLOBAL_THREAD_ARENA.with(|cell| cell.set(Some(NonNull::from(handle.arena))));
        Ok(handle)
    }

    /// Allocate at least `bytes` bytes. Aborts the process if pages cannot
    /// be mapped.
    pub fn allocate(bytes: usize) -> NonNull<u8> {
        match Self::arena() {
            Ok(arena) => arena.allocate(bytes),
            Err(e) => abort_on_map_failure(bytes, &e),
        }
    }

    /// Fallible form of [`allocate`](Self::allocate).
    ///
    /// # Errors
    ///
    /// Returns `VmError::MapFailed` if pages cannot be mapped.
    pub fn try_allocate(bytes: usize) -> Result<NonNull<u8>, VmError> {
        Self::arena()?.try_allocate(bytes)
    }

    /// Free a pointer from any thread.
    ///
    /// # Safety
    /// `ptr` was returned by this allocator and has not been freed.
    pub unsafe fn free(ptr: NonNull<u8>) {
        match Self::arena() {
            // Safety: forwarded from caller.
            Ok(arena) => unsafe { arena.free(ptr) },
            // Freeing never needs the caller's own arena; fall back to the
            // owner's bookkeeping directly.
            Err(_) => {
                // Safety: forwarded from caller.
                let _ = unsafe { GLOBAL_BIN_INSTANCE.free_foreign(ptr, None) };
            }
        }
    }

    /// See [`ThreadArena::resize`].
    ///
    /// # Safety
    /// `ptr` was returned by this allocator and has not been freed.
    pub unsafe fn resize(ptr: NonNull<u8>, new_bytes: usize) -> NonNull<u8> {
        match Self::arena() {
            // Safety: forwarded from caller.
            Ok(arena) => unsafe { arena.resize(ptr, new_bytes) },
            Err(e) => abort_on_map_failure(new_bytes, &e),
        }
    }

    /// Release the calling thread's empty non-head bins. Returns bins
    /// unmapped. Other threads' arenas are left alone.
    pub fn trim() -> usize {
        GLOBAL_THREAD_ARENA.with(std::cell::Cell::get).map_or(0, |arena| {
            // Safety: cached arenas are registered and never unmapped.
            ThreadArena::new(&GLOBAL_BIN_INSTANCE, unsafe { arena.as_ref() }).trim()
        })
    }

    pub fn stats() -> BinStats {
        GLOBAL_BIN_INSTANCE.stats()
    }
}

// Safety: every pointer handed out is at least `layout.size()` bytes and
// aligned to `layout.align()`. Alignments above half a page are refused.
#[cfg(not(loom))]
unsafe impl std::alloc::GlobalAlloc for GlobalBinAllocator {
    unsafe fn alloc(&self, layout: std::alloc::Layout) -> *mut u8 {
        match Self::arena().and_then(|arena| arena.try_allocate_layout(layout)) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => std::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: std::alloc::Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // Safety: GlobalAlloc contract: ptr came from `alloc`.
            unsafe { GlobalBinAllocator::free(ptr) }
        }
    }

    unsafe fn realloc(
        &self,
        ptr: *mut u8,
        layout: std::alloc::Layout,
        new_size: usize,
    ) -> *mut u8 {
        let Some(nn) = NonNull::new(ptr) else {
            return std::ptr::null_mut();
        };
        // Non-shrinking policy: a block that already fits is kept as is.
        // Safety: GlobalAlloc contract: ptr came from `alloc`.
        if new_size <= unsafe { usable_size_of(nn) } {
            return ptr;
        }
        let Ok(new_layout) = std::alloc::Layout::from_size_align(new_size, layout.align()) else {
            return std::ptr::null_mut();
        };
        // Safety: forwarded from caller.
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            // Safety: both blocks are live and at least `layout.size()` bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(ptr, new_ptr, layout.size());
                self.dealloc(ptr, layout);
            }
        }
        new_ptr
    }
}

/// Recorded capacity of a live pointer.
///
/// # Safety
/// `ptr` was returned by a `BinAllocator` and has not been freed.
#[inline]
unsafe fn usable_size_of(ptr: NonNull<u8>) -> usize {
    // Safety: forwarded from caller.
    unsafe { Bin::owner_of(ptr) }.usable_size()
}

// ---------------------------------------------------------------------------
// Allocator instance
// ---------------------------------------------------------------------------

/// Thread-aware size-class allocator.
///
/// Every thread that allocates gets its own [`Arena`] of bin lists, so
/// threads working on their own memory only ever contend on a single bin
/// mutex. Arenas and their head bins live for the rest of the process, even
/// after the thread exits or the `BinAllocator` is dropped.
pub struct BinAllocator {
    config: BinAllocatorConfig,
    registry: ArenaRegistry,
    stats: StatCounters,
}

impl BinAllocator {
    /// Allocator with the default configuration.
    #[cfg(not(loom))]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            config: BinAllocatorConfig::DEFAULT,
            registry: ArenaRegistry::new(),
            stats: StatCounters::new(),
        }
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            config: BinAllocatorConfig::DEFAULT,
            registry: ArenaRegistry::new(),
            stats: StatCounters::new(),
        }
    }

    /// Create a new `BinAllocator` with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns `VmError::InvalidConfig` if `max_walk_hops` is outside
    /// `1..=MAX_WALK_HOPS`.
    pub fn with_config(config: BinAllocatorConfig) -> Result<Self, VmError> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new()
        })
    }

    #[must_use]
    pub fn config(&self) -> &BinAllocatorConfig {
        &self.config
    }

    /// Calling thread's arena, created and registered on first call.
    /// Idempotent per thread.
    ///
    /// # Errors
    ///
    /// Returns `VmError::MapFailed` if the arena cannot be mapped.
    pub fn ensure_arena(&self) -> Result<ThreadArena<'_>, VmError> {
        self.arena_for(ThreadToken::current())
    }

    /// Arena registered for `token`, creating it if missing.
    ///
    /// Only the thread holding `token` registers under it, so a lookup miss
    /// cannot race with another registration for the same token.
    pub(crate) fn arena_for(&self, token: ThreadToken) -> Result<ThreadArena<'_>, VmError> {
        if let Some(arena) = self.registry.lookup(token) {
            // Safety: registered arenas live forever.
            return Ok(ThreadArena::new(self, unsafe { arena.as_ref() }));
        }
        let arena = Arena::create(token, &self.stats)?;
        // Safety: freshly created, never registered, never unmapped.
        unsafe { self.registry.register(arena) };
        self.stats.arenas.incr();
        tracing::debug!(thread = token.get(), arena = ?arena, "registered thread arena");
        // Safety: see above.
        Ok(ThreadArena::new(self, unsafe { arena.as_ref() }))
    }

    /// Threads that have registered an arena with this allocator.
    pub fn arena_count(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self) -> BinStats {
        self.stats.snapshot()
    }

    /// Allocate `bytes` from `arena`, either as a chunk of `class` or, when
    /// `class` is `None`, as a dedicated large bin with an `align`-aligned
    /// payload.
    fn allocate_in(
        &self,
        arena: &Arena,
        bytes: usize,
        align: usize,
        class: Option<usize>,
    ) -> Result<NonNull<u8>, VmError> {
        if let Some(class) = class {
            return acquire_chunk(arena.list(class), self.config.max_walk_hops, &self.stats);
        }
        let bin = Bin::create_large(bytes, align, arena.owner(), &self.stats)?;
        self.stats.chunks_allocated.incr();
        Ok(bin.large_payload())
    }

    /// Free `ptr`, resolving its owner's bookkeeping. `local` is the caller's
    /// arena if it has one; a chunk owned by it skips the registry.
    ///
    /// Returns what happened to the chunk's bin, or `None` for a large
    /// allocation (always unmapped).
    ///
    /// # Safety
    /// `ptr` was returned by this allocator and has not been freed.
    pub(crate) unsafe fn free_foreign(&self, ptr: NonNull<u8>, local: Option<&Arena>) -> Option<Reclaim> {
        // Safety: forwarded from caller.
        let bin = unsafe { Bin::owner_of(ptr) };
        if bin.is_large() {
            // Safety: the payload is dead by the caller's contract.
            unsafe { bin.reclaim_large(&self.stats) };
            return None;
        }

        let owner = bin.owner();
        let arena = match local {
            Some(arena) if arena.owner() == owner => NonNull::from(arena),
            _ => match self.registry.lookup(owner) {
                Some(arena) => arena,
                None => {
                    debug_assert!(false, "pointer {ptr:p} owned by unregistered thread");
                    return None;
                }
            },
        };
        let Some(class) = class_of_chunk_size(bin.bin_size()) else {
            debug_assert!(false, "pointer {ptr:p} has no size class");
            return None;
        };
        // Safety: registered arenas live forever.
        let list = unsafe { arena.as_ref() }.list(class);
        let index = bin.chunk_index(ptr);
        // Safety: `bin` is linked into its owner's list for `class` (only
        // empty bins are unlinked, and this one holds `ptr`).
        Some(unsafe { bin.reclaim_small(index, list, &self.stats) })
    }
}

impl Default for BinAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Per-thread handle
// ---------------------------------------------------------------------------

/// A thread's view of a [`BinAllocator`]: the allocation entry points bound
/// to that thread's arena.
///
/// Not `Send`: allocations made through it are recorded as owned by the
/// thread that called [`BinAllocator::ensure_arena`]. Pointers themselves may
/// be freed through any thread's handle.
#[derive(Clone, Copy)]
pub struct ThreadArena<'a> {
    allocator: &'a BinAllocator,
    arena: &'a Arena,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ThreadArena<'a> {
    fn new(allocator: &'a BinAllocator, arena: &'a Arena) -> Self {
        Self {
            allocator,
            arena,
            _not_send: PhantomData,
        }
    }

    #[must_use]
    pub fn owner(&self) -> ThreadToken {
        self.arena.owner()
    }

    /// Allocate at least `bytes` bytes. Requests up to the largest size class
    /// (3072 bytes) get a chunk of the smallest fitting class; larger ones a
    /// dedicated mapping. Aborts the process if pages cannot be mapped.
    pub fn allocate(&self, bytes: usize) -> NonNull<u8> {
        match self.try_allocate(bytes) {
            Ok(ptr) => ptr,
            Err(e) => abort_on_map_failure(bytes, &e),
        }
    }

    /// Fallible form of [`allocate`](Self::allocate).
    ///
    /// # Errors
    ///
    /// Returns `VmError::MapFailed` if pages cannot be mapped, or
    /// `VmError::UnsupportedLayout` if `bytes` overflows the mapping size.
    pub fn try_allocate(&self, bytes: usize) -> Result<NonNull<u8>, VmError> {
        self.allocator
            .allocate_in(self.arena, bytes, CHUNK_ALIGN, select_class(bytes))
    }

    /// Allocate for a [`Layout`](std::alloc::Layout).
    ///
    /// With `align` up to 64, small requests go to the smallest class that is
    /// a multiple of the alignment and large payloads are 64-byte aligned.
    /// Alignments up to half a page get a dedicated mapping whose payload is
    /// placed at the first aligned offset past the bin header.
    ///
    /// # Errors
    ///
    /// Returns `VmError::MapFailed` if pages cannot be mapped, or
    /// `VmError::UnsupportedLayout` if the alignment exceeds half a page.
    pub fn try_allocate_layout(&self, layout: std::alloc::Layout) -> Result<NonNull<u8>, VmError> {
        let bytes = layout.size();
        let align = layout.align();
        let class = if align <= CHUNK_ALIGN && bytes <= MAX_SMALL_SIZE {
            select_class_aligned(bytes, align)
        } else {
            None
        };
        self.allocator
            .allocate_in(self.arena, bytes, align.max(CHUNK_ALIGN), class)
    }

    /// Free a pointer allocated by any thread of the same allocator.
    ///
    /// A small chunk's bit is cleared in its bin; a bin that becomes empty is
    /// unmapped unless it is its class's head or a lock on the way is busy.
    /// Large allocations are unmapped.
    ///
    /// # Safety
    /// `ptr` was returned by this allocator and has not been freed.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        // Safety: forwarded from caller.
        let _ = unsafe { self.allocator.free_foreign(ptr, Some(self.arena)) };
    }

    /// Bytes usable at `ptr`: its chunk size, or the payload size of a large
    /// allocation.
    ///
    /// # Safety
    /// `ptr` was returned by this allocator and has not been freed.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        // Safety: forwarded from caller.
        unsafe { usable_size_of(ptr) }
    }

    /// Resize `ptr` to `new_bytes`.
    ///
    /// A new block is allocated first. If the old block's capacity is smaller
    /// than `new_bytes`, the old content is copied over, the old block freed
    /// and the new one returned. Otherwise the new block is freed and `ptr`
    /// returned unchanged, so shrinking never releases memory. Aborts the
    /// process if pages cannot be mapped.
    ///
    /// # Safety
    /// `ptr` was returned by this allocator and has not been freed. On a
    /// move, `ptr` is dead afterwards.
    pub unsafe fn resize(&self, ptr: NonNull<u8>, new_bytes: usize) -> NonNull<u8> {
        // Safety: forwarded from caller.
        match unsafe { self.try_resize(ptr, new_bytes) } {
            Ok(ptr) => ptr,
            Err(e) => abort_on_map_failure(new_bytes, &e),
        }
    }

    /// Fallible form of [`resize`](Self::resize). On error `ptr` is untouched.
    ///
    /// # Errors
    ///
    /// Returns `VmError::MapFailed` if the new block cannot be mapped.
    ///
    /// # Safety
    /// Same as [`resize`](Self::resize).
    pub unsafe fn try_resize(&self, ptr: NonNull<u8>, new_bytes: usize) -> Result<NonNull<u8>, VmError> {
        let fresh = self.try_allocate(new_bytes)?;
        // Safety: forwarded from caller.
        let old_capacity = unsafe { usable_size_of(ptr) };
        if old_capacity < new_bytes {
            // Safety: both blocks are live, distinct, and hold at least
            // `old_capacity` bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_capacity);
                self.free(ptr);
            }
            Ok(fresh)
        } else {
            // Safety: `fresh` was just allocated and never shared.
            unsafe { self.free(fresh) };
            Ok(ptr)
        }
    }

    /// Unmap every empty non-head bin of this arena that can be unlinked
    /// without blocking. Picks up bins left behind by abandoned unlinks.
    /// Returns the number of bins unmapped.
    pub fn trim(&self) -> usize {
        let released = self.arena.trim(&self.allocator.stats);
        tracing::debug!(thread = self.owner().get(), released, "trimmed thread arena");
        released
    }

    /// Bins currently linked in the class serving `bytes`, head included.
    /// `None` for large requests.
    pub fn bins_for(&self, bytes: usize) -> Option<usize> {
        select_class(bytes).map(|class| self.arena.bins_in_class(class))
    }

    /// Chunks this arena currently has handed out in the class serving
    /// `bytes`, whichever thread allocated them. `None` for large requests.
    pub fn live_chunks_for(&self, bytes: usize) -> Option<usize> {
        select_class(bytes).map(|class| self.arena.live_chunks_in_class(class))
    }
}
