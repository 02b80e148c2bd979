use super::bitmap::{BITMAP_CAPACITY, Bitmap};
use super::registry::ThreadToken;
use super::stats::StatCounters;
use super::vm::{PlatformVmOps, VmError, VmOps, pages_for};
use crate::sync::atomic::{AtomicPtr, Ordering};
use crate::sync::{self, MutexGuard, RwLock};
use std::ptr::NonNull;

/// Header at the base of every bin mapping.
///
/// Small bins are exactly one page: header, then `capacity()` chunks of
/// `bin_size` bytes. Large bins are one custom-sized mapping holding a single
/// allocation that starts `payload_offset` bytes in: right after the header,
/// or further along for alignments above `CHUNK_ALIGN`. The payload always
/// starts inside the first page.
///
/// The 64-byte alignment makes `HEADER_SIZE` a multiple of 64, so every chunk
/// of a class whose size is a multiple of `a <= 64` is `a`-aligned.
#[repr(C, align(64))]
pub(crate) struct BinHeader {
    /// Occupancy of the chunks. The mutex also serialises the unlink splice
    /// when this bin is someone's predecessor. Unused for large bins.
    bitmap: crate::sync::Mutex<Bitmap>,
    bin_size: usize,
    owner: ThreadToken,
    /// Next bin of the same size class for the same thread. Written only
    /// under this bin's mutex (or before the bin is published).
    next: AtomicPtr<BinHeader>,
    is_large: bool,
    size_large: usize,
    payload_offset: usize,
}

pub(crate) const HEADER_SIZE: usize = std::mem::size_of::<BinHeader>();

/// Strongest alignment any chunk or large payload is guaranteed to have.
pub(crate) const CHUNK_ALIGN: usize = std::mem::align_of::<BinHeader>();

/// Page base of the bin holding `addr`.
///
/// Precondition: `addr` was handed out by this allocator, so it lies inside a
/// bin mapping past the header, and `page_size` is a power of two. Bins are
/// page-aligned and a small bin never spans two pages; a large bin's payload
/// pointer sits at most half a page into its first page. Both make the page
/// mask land on the header.
#[inline]
pub(crate) fn bin_base(addr: usize, page_size: usize) -> usize {
    debug_assert!(page_size.is_power_of_two());
    let base = addr & !(page_size - 1);
    debug_assert!(
        addr - base >= HEADER_SIZE,
        "address {addr:#x} lies inside a bin header; not a chunk pointer"
    );
    base
}

/// Handle to a mapped bin.
///
/// A `Bin` is a plain address: copies do not keep the mapping alive. A handle
/// is valid from `create_*` until the single `release` of that mapping.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Bin(NonNull<BinHeader>);

// Safety: header fields are immutable after creation except the bitmap
// (behind its mutex) and `next` (atomic). Chunk contents are the caller's.
unsafe impl Send for Bin {}
// Safety: see above.
unsafe impl Sync for Bin {}

/// Outcome of freeing one chunk of a small bin.
#[must_use]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Reclaim {
    /// Bit cleared; the bin stays linked (non-empty, or the class head).
    Cleared,
    /// Bin became empty, was unlinked and unmapped.
    Unmapped,
    /// Bin became empty but a lock was busy; it stays linked and reusable.
    Abandoned,
}

impl Bin {
    /// Map one page and initialise it as an empty small bin of `chunk_size`.
    pub fn create_small(
        chunk_size: usize,
        owner: ThreadToken,
        stats: &StatCounters,
    ) -> Result<Self, VmError> {
        debug_assert!(chunk_size > 0 && chunk_size <= PlatformVmOps::page_size() - HEADER_SIZE);
        let page_size = PlatformVmOps::page_size();
        // Safety: FFI call to map memory.
        let base = unsafe { PlatformVmOps::map(page_size)? };
        stats.pages_mapped.incr();
        // Safety: fresh mapping of at least HEADER_SIZE bytes, page aligned.
        Ok(unsafe { Self::init(base, chunk_size, owner, false, 0, HEADER_SIZE) })
    }

    /// Largest payload alignment a large bin can serve: the payload must start
    /// inside the first page for `owner_of` to find the header.
    #[inline]
    pub fn max_large_align() -> usize {
        PlatformVmOps::page_size() / 2
    }

    /// Map a large bin holding `bytes` of payload aligned to `align`.
    ///
    /// Returns `VmError::UnsupportedLayout` if `align` is not a power of two
    /// above [`max_large_align`](Self::max_large_align) or the mapping size
    /// overflows.
    pub fn create_large(
        bytes: usize,
        align: usize,
        owner: ThreadToken,
        stats: &StatCounters,
    ) -> Result<Self, VmError> {
        if !align.is_power_of_two() || align > Self::max_large_align() {
            return Err(VmError::UnsupportedLayout(format!(
                "alignment {align} exceeds supported {}",
                Self::max_large_align()
            )));
        }
        let payload_offset = HEADER_SIZE.next_multiple_of(align);
        let total_size = payload_offset.checked_add(bytes.max(1)).ok_or_else(|| {
            VmError::UnsupportedLayout(format!("allocation of {bytes} bytes overflows"))
        })?;
        // Safety: FFI call to map memory.
        let base = unsafe { PlatformVmOps::map(total_size)? };
        stats.pages_mapped.add(pages_for(total_size));
        stats.large_allocations.incr();
        tracing::trace!(size = total_size, align, base = ?base, "mapped large bin");
        // Safety: fresh mapping of total_size > payload_offset bytes, page aligned.
        Ok(unsafe { Self::init(base, 0, owner, true, total_size, payload_offset) })
    }

    unsafe fn init(
        base: NonNull<u8>,
        bin_size: usize,
        owner: ThreadToken,
        is_large: bool,
        size_large: usize,
        payload_offset: usize,
    ) -> Self {
        let header = base.cast::<BinHeader>();
        // Safety: caller passes a fresh, writable, suitably aligned mapping.
        unsafe {
            header.as_ptr().write(BinHeader {
                bitmap: crate::sync::Mutex::new(Bitmap::new()),
                bin_size,
                owner,
                next: AtomicPtr::new(std::ptr::null_mut()),
                is_large,
                size_large,
                payload_offset,
            });
        }
        Self(header)
    }

    /// Recover the bin that handed out `ptr` from its address alone.
    ///
    /// # Safety
    /// `ptr` must have been returned by this allocator and not freed.
    pub unsafe fn owner_of(ptr: NonNull<u8>) -> Self {
        let base = bin_base(ptr.as_ptr() as usize, PlatformVmOps::page_size());
        let header = ptr.as_ptr().with_addr(base).cast::<BinHeader>();
        // Safety: base is a non-zero page address inside the same mapping.
        Self(unsafe { NonNull::new_unchecked(header) })
    }

    #[inline]
    fn header(&self) -> &BinHeader {
        // Safety: a `Bin` handle is only used while its mapping is live.
        unsafe { self.0.as_ref() }
    }

    #[inline]
    pub fn as_ptr(self) -> *mut BinHeader {
        self.0.as_ptr()
    }

    #[inline]
    pub fn is_large(&self) -> bool {
        self.header().is_large
    }

    #[inline]
    pub fn bin_size(&self) -> usize {
        self.header().bin_size
    }

    #[inline]
    pub fn owner(&self) -> ThreadToken {
        self.header().owner
    }

    /// Chunks a small bin of `chunk_size` holds on this platform.
    #[inline]
    pub fn capacity_for(chunk_size: usize) -> usize {
        ((PlatformVmOps::page_size() - HEADER_SIZE) / chunk_size).min(BITMAP_CAPACITY)
    }

    /// Chunk count of a small bin. Large bins hold a single implicit chunk.
    #[inline]
    pub fn capacity(&self) -> usize {
        if self.is_large() {
            1
        } else {
            Self::capacity_for(self.bin_size())
        }
    }

    /// Bytes the caller may use at a pointer handed out by this bin.
    #[inline]
    pub fn usable_size(&self) -> usize {
        let header = self.header();
        if header.is_large {
            header.size_large - header.payload_offset
        } else {
            header.bin_size
        }
    }

    /// Address of chunk `index`: base + header + index * chunk size.
    #[inline]
    pub fn chunk_address(self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.capacity(), "chunk index {index} out of bin capacity");
        let offset = HEADER_SIZE + index * self.usable_size();
        // Safety: offset stays inside the mapping for index < capacity.
        unsafe { self.0.cast::<u8>().add(offset) }
    }

    /// Payload pointer of a large bin.
    #[inline]
    pub fn large_payload(self) -> NonNull<u8> {
        debug_assert!(self.is_large());
        // Safety: the mapping is larger than the payload offset.
        unsafe { self.0.cast::<u8>().add(self.header().payload_offset) }
    }

    /// Inverse of [`chunk_address`](Self::chunk_address).
    #[inline]
    pub fn chunk_index(self, ptr: NonNull<u8>) -> usize {
        let offset = ptr.as_ptr() as usize - self.as_ptr() as usize - HEADER_SIZE;
        let bin_size = self.bin_size();
        debug_assert!(
            offset.is_multiple_of(bin_size),
            "pointer {ptr:p} is not aligned to a chunk of size {bin_size}"
        );
        offset / bin_size
    }

    #[inline]
    pub fn next(&self) -> Option<Bin> {
        NonNull::new(self.header().next.load(Ordering::Acquire)).map(Bin)
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, Bitmap> {
        sync::lock(&self.header().bitmap)
    }

    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, Bitmap>> {
        sync::try_lock(&self.header().bitmap)
    }

    /// Claim the lowest free chunk under the lock already held in `bitmap`.
    #[inline]
    pub fn claim(self, bitmap: &mut Bitmap, capacity: usize) -> Option<NonNull<u8>> {
        let index = bitmap.first_free(capacity)?;
        bitmap.set(index);
        Some(self.chunk_address(index))
    }

    /// Link `new` right after `self`. Caller holds `self`'s lock and `new`
    /// is not yet reachable by any other thread.
    #[inline]
    pub fn splice_after(self, new: Bin) {
        let header = self.header();
        new.header()
            .next
            .store(header.next.load(Ordering::Acquire), Ordering::Release);
        header.next.store(new.as_ptr(), Ordering::Release);
    }

    /// Free chunk `index`. If that empties a non-head bin, try to unlink it
    /// from `list` and unmap it.
    ///
    /// # Safety
    /// `self` is a small bin linked into `list`, and chunk `index` is live.
    pub unsafe fn reclaim_small(self, index: usize, list: &BinList, stats: &StatCounters) -> Reclaim {
        debug_assert!(!self.is_large());
        let capacity = self.capacity();
        let mut bitmap = self.lock();
        debug_assert!(bitmap.get(index), "double free of chunk {index} in bin {:p}", self.0);
        bitmap.clear(index);
        stats.chunks_freed.incr();

        if self == list.head() || bitmap.first_occupied(capacity).is_some() {
            return Reclaim::Cleared;
        }

        // Exclusive gate: no walker can be holding a pointer to this bin.
        let Some(gate) = sync::try_write(&list.gate) else {
            stats.unlinks_abandoned.incr();
            tracing::trace!(bin = ?self.0, "unlink abandoned: list busy");
            return Reclaim::Abandoned;
        };
        // Safety: we hold the gate exclusively and this bin's lock.
        let unlinked = unsafe { list.unlink(self) };
        drop(bitmap);
        drop(gate);

        if !unlinked {
            stats.unlinks_abandoned.incr();
            tracing::trace!(bin = ?self.0, "unlink abandoned: predecessor busy");
            return Reclaim::Abandoned;
        }
        // Safety: unlinked, empty, and unreachable from the list.
        unsafe { self.release(stats) };
        Reclaim::Unmapped
    }

    /// Unmap a large bin.
    ///
    /// # Safety
    /// `self` is a large bin whose payload is no longer used.
    pub unsafe fn reclaim_large(self, stats: &StatCounters) {
        debug_assert!(self.is_large());
        stats.chunks_freed.incr();
        tracing::trace!(size = self.header().size_large, bin = ?self.0, "unmapping large bin");
        // Safety: forwarded from caller.
        unsafe { self.release(stats) };
    }

    /// Unmap the bin's whole region. The handle (and every copy) is dead
    /// afterwards.
    ///
    /// # Safety
    /// No other thread can reach this bin, and no lock on it is held.
    pub unsafe fn release(self, stats: &StatCounters) {
        let size = if self.is_large() {
            self.header().size_large
        } else {
            PlatformVmOps::page_size()
        };
        // Safety: the mapping was created with exactly `size` bytes.
        if let Err(e) = unsafe { PlatformVmOps::release(self.0.cast::<u8>(), size) } {
            tracing::error!(error = %e, bin = ?self.0, "failed to unmap bin");
            return;
        }
        stats.pages_unmapped.add(pages_for(size));
    }
}

/// One size class's bin list for one thread.
///
/// `gate` is the reclaim gate: walkers past the head hold it shared, an unlink
/// holds it exclusively (acquired without blocking). An unlinked bin can
/// therefore be unmapped as soon as the gate is released.
#[repr(C)]
pub(crate) struct BinList {
    head: Bin,
    chunk_size: usize,
    capacity: usize,
    pub(crate) gate: RwLock<()>,
}

impl BinList {
    pub fn new(head: Bin) -> Self {
        let chunk_size = head.bin_size();
        Self {
            head,
            chunk_size,
            capacity: Bin::capacity_for(chunk_size),
            gate: RwLock::new(()),
        }
    }

    #[inline]
    pub fn head(&self) -> Bin {
        self.head
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Predecessor of `bin`, walking from the head.
    ///
    /// # Safety
    /// Caller holds `gate` exclusively, so no bin in the list can be unmapped
    /// underneath the walk.
    unsafe fn predecessor_of(&self, bin: Bin) -> Option<Bin> {
        let mut prev = self.head;
        let mut cur = self.head.next();
        while let Some(c) = cur {
            if c == bin {
                return Some(prev);
            }
            prev = c;
            cur = c.next();
        }
        None
    }

    /// Splice `bin` out of the list. Returns `false` without touching anything
    /// if the predecessor's lock is busy or the predecessor no longer links to
    /// `bin` (the owner inserted a new bin after the head meanwhile).
    ///
    /// # Safety
    /// Caller holds `gate` exclusively and `bin`'s lock; `bin` is not the head.
    unsafe fn unlink(&self, bin: Bin) -> bool {
        // Safety: forwarded from caller.
        let Some(prev) = (unsafe { self.predecessor_of(bin) }) else {
            return false;
        };
        let Some(_prev_guard) = prev.try_lock() else {
            return false;
        };
        let prev_next = &prev.header().next;
        if prev_next.load(Ordering::Acquire) != bin.as_ptr() {
            return false;
        }
        prev_next.store(bin.header().next.load(Ordering::Acquire), Ordering::Release);
        true
    }

    /// Unlink and unmap every empty non-head bin that can be locked without
    /// blocking. Returns the number of bins unmapped.
    ///
    /// # Safety
    /// Every bin in the list is live (the list belongs to a registered arena).
    pub unsafe fn trim(&self, stats: &StatCounters) -> usize {
        let _gate = sync::write(&self.gate);
        let mut released = 0;
        let mut prev = self.head;
        let mut cur = self.head.next();
        while let Some(bin) = cur {
            // Stable under the exclusive gate: `bin` is not the head and only
            // an unlink (which needs the gate) rewrites a non-head link.
            let next = bin.next();
            let mut removed = false;
            if let Some(bitmap) = bin.try_lock() {
                if bitmap.first_occupied(self.capacity).is_none()
                    && let Some(_prev_guard) = prev.try_lock()
                {
                    let prev_next = &prev.header().next;
                    if prev_next.load(Ordering::Acquire) == bin.as_ptr() {
                        prev_next.store(
                            next.map_or(std::ptr::null_mut(), Bin::as_ptr),
                            Ordering::Release,
                        );
                        removed = true;
                    }
                }
                drop(bitmap);
            }
            if removed {
                // Safety: unlinked under the gate; no guard on it remains.
                unsafe { bin.release(stats) };
                released += 1;
            } else {
                prev = bin;
            }
            cur = next;
        }
        released
    }

    /// Number of bins in the list, head included.
    ///
    /// # Safety
    /// Same as [`trim`](Self::trim).
    pub unsafe fn len(&self) -> usize {
        let _gate = sync::read(&self.gate);
        let mut count = 1;
        let mut cur = self.head.next();
        while let Some(bin) = cur {
            count += 1;
            cur = bin.next();
        }
        count
    }

    /// Chunks currently handed out across the whole list.
    ///
    /// # Safety
    /// Same as [`trim`](Self::trim).
    pub unsafe fn live_chunks(&self) -> usize {
        let _gate = sync::read(&self.gate);
        let mut live = 0;
        let mut cur = Some(self.head);
        while let Some(bin) = cur {
            live += bin.lock().count_occupied(self.capacity);
            cur = bin.next();
        }
        live
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn token() -> ThreadToken {
        ThreadToken::current()
    }

    #[test]
    fn test_header_fits_and_is_aligned() {
        assert!(HEADER_SIZE < PlatformVmOps::page_size());
        assert_eq!(HEADER_SIZE % CHUNK_ALIGN, 0);
        assert_eq!(CHUNK_ALIGN, 64);
    }

    #[test]
    fn test_bin_base_masks_page_offset() {
        let page = 4096;
        assert_eq!(bin_base(0x7000 + HEADER_SIZE, page), 0x7000);
        assert_eq!(bin_base(0x7000 + page - 1, page), 0x7000);
    }

    #[test]
    fn test_capacity_for_reference_sizes() {
        let page = PlatformVmOps::page_size();
        assert_eq!(Bin::capacity_for(3072), (page - HEADER_SIZE) / 3072);
        assert!(Bin::capacity_for(4) <= BITMAP_CAPACITY);
        if page == 4096 {
            assert_eq!(Bin::capacity_for(4), (4096 - HEADER_SIZE) / 4);
            assert_eq!(Bin::capacity_for(3072), 1);
        }
    }

    #[test]
    fn test_small_bin_chunk_addressing() {
        let stats = StatCounters::new();
        let bin = Bin::create_small(24, token(), &stats).unwrap();
        assert!(!bin.is_large());
        assert_eq!(bin.bin_size(), 24);
        assert_eq!(bin.owner(), token());
        assert_eq!(bin.as_ptr() as usize % PlatformVmOps::page_size(), 0);
        assert_eq!(stats.pages_mapped.get(), 1);

        for index in [0, 1, 7, bin.capacity() - 1] {
            let ptr = bin.chunk_address(index);
            // Safety: Test code; ptr lies in a live bin.
            let owner = unsafe { Bin::owner_of(ptr) };
            assert_eq!(owner, bin);
            assert_eq!(owner.chunk_index(ptr), index);
        }

        // Safety: Test code.
        unsafe { bin.release(&stats) };
        assert_eq!(stats.pages_unmapped.get(), 1);
    }

    #[test]
    fn test_claim_until_full() {
        let stats = StatCounters::new();
        let bin = Bin::create_small(1024, token(), &stats).unwrap();
        let capacity = bin.capacity();
        let mut seen = Vec::new();
        {
            let mut bitmap = bin.lock();
            while let Some(ptr) = bin.claim(&mut bitmap, capacity) {
                seen.push(ptr);
            }
        }
        assert_eq!(seen.len(), capacity);
        seen.dedup();
        assert_eq!(seen.len(), capacity);
        // Safety: Test code.
        unsafe { bin.release(&stats) };
    }

    #[test]
    fn test_large_bin_payload() {
        let stats = StatCounters::new();
        let bin = Bin::create_large(10_000, CHUNK_ALIGN, token(), &stats).unwrap();
        assert!(bin.is_large());
        assert_eq!(bin.usable_size(), 10_000);
        let payload = bin.large_payload();
        assert_eq!(payload.as_ptr() as usize - bin.as_ptr() as usize, HEADER_SIZE);
        // Safety: Test code.
        unsafe {
            payload.as_ptr().write_bytes(0xAB, 10_000);
            assert_eq!(Bin::owner_of(payload), bin);
            assert_eq!(Bin::owner_of(payload).usable_size(), 10_000);
            bin.reclaim_large(&stats);
        }
        assert_eq!(stats.pages_mapped.get(), stats.pages_unmapped.get());
        assert_eq!(stats.large_allocations.get(), 1);
    }

    #[test]
    fn test_large_bin_over_aligned_payload() {
        let stats = StatCounters::new();
        let max = Bin::max_large_align();
        for align in [128, 256, 1024, max] {
            let bin = Bin::create_large(512, align, token(), &stats).unwrap();
            let payload = bin.large_payload();
            let offset = payload.as_ptr() as usize - bin.as_ptr() as usize;
            assert_eq!(payload.as_ptr() as usize % align, 0);
            assert_eq!(offset, HEADER_SIZE.next_multiple_of(align));
            assert!(offset < PlatformVmOps::page_size());
            assert!(bin.usable_size() >= 512);
            // Safety: Test code.
            unsafe {
                payload.as_ptr().write_bytes(0xCD, bin.usable_size());
                assert_eq!(Bin::owner_of(payload), bin);
                bin.reclaim_large(&stats);
            }
        }
        assert_eq!(stats.pages_mapped.get(), stats.pages_unmapped.get());
        assert_eq!(stats.large_allocations.get(), 4);
    }

    #[test]
    fn test_large_bin_rejects_unservable_layouts() {
        let stats = StatCounters::new();
        let too_wide = Bin::create_large(64, PlatformVmOps::page_size(), token(), &stats);
        assert!(matches!(too_wide, Err(VmError::UnsupportedLayout(_))));
        let overflow = Bin::create_large(usize::MAX, CHUNK_ALIGN, token(), &stats);
        assert!(matches!(overflow, Err(VmError::UnsupportedLayout(_))));
        assert_eq!(stats.pages_mapped.get(), 0);
    }

    fn list_with_extra_bins(stats: &StatCounters, chunk: usize, extra: usize) -> (BinList, Vec<Bin>) {
        let head = Bin::create_small(chunk, token(), stats).unwrap();
        let list = BinList::new(head);
        let mut bins = Vec::new();
        for _ in 0..extra {
            let bin = Bin::create_small(chunk, token(), stats).unwrap();
            let _guard = head.lock();
            head.splice_after(bin);
            bins.push(bin);
        }
        (list, bins)
    }

    #[test]
    fn test_reclaim_small_unmaps_empty_non_head() {
        let stats = StatCounters::new();
        let (list, bins) = list_with_extra_bins(&stats, 64, 2);
        // Safety: Test code.
        unsafe { assert_eq!(list.len(), 3) };

        let victim = bins[0];
        {
            let mut bitmap = victim.lock();
            bitmap.set(3);
        }
        // Safety: Test code; chunk 3 is live.
        let outcome = unsafe { victim.reclaim_small(3, &list, &stats) };
        assert_eq!(outcome, Reclaim::Unmapped);
        // Safety: Test code.
        unsafe { assert_eq!(list.len(), 2) };
        assert_eq!(stats.pages_unmapped.get(), 1);
    }

    #[test]
    fn test_reclaim_small_keeps_head() {
        let stats = StatCounters::new();
        let (list, _) = list_with_extra_bins(&stats, 64, 0);
        let head = list.head();
        head.lock().set(0);
        // Safety: Test code.
        let outcome = unsafe { head.reclaim_small(0, &list, &stats) };
        assert_eq!(outcome, Reclaim::Cleared);
        assert_eq!(stats.pages_unmapped.get(), 0);
    }

    #[test]
    fn test_reclaim_small_nonempty_stays() {
        let stats = StatCounters::new();
        let (list, bins) = list_with_extra_bins(&stats, 64, 1);
        {
            let mut bitmap = bins[0].lock();
            bitmap.set(0);
            bitmap.set(1);
        }
        // Safety: Test code.
        let outcome = unsafe { bins[0].reclaim_small(0, &list, &stats) };
        assert_eq!(outcome, Reclaim::Cleared);
        // Safety: Test code.
        unsafe {
            assert_eq!(list.len(), 2);
            assert_eq!(list.live_chunks(), 1);
        }
    }

    #[test]
    fn test_reclaim_abandoned_when_predecessor_locked() {
        let stats = StatCounters::new();
        let (list, bins) = list_with_extra_bins(&stats, 64, 1);
        let victim = bins[0];
        victim.lock().set(5);

        let head = list.head();
        let head_guard = head.lock();
        // Safety: Test code.
        let outcome = unsafe { victim.reclaim_small(5, &list, &stats) };
        drop(head_guard);

        assert_eq!(outcome, Reclaim::Abandoned);
        assert_eq!(stats.unlinks_abandoned.get(), 1);
        // Still linked, empty, and reusable.
        // Safety: Test code.
        unsafe { assert_eq!(list.len(), 2) };
        let mut bitmap = victim.lock();
        assert_eq!(bitmap.first_occupied(victim.capacity()), None);
        assert!(victim.claim(&mut bitmap, list.capacity()).is_some());
    }

    #[test]
    fn test_reclaim_abandoned_when_gate_held() {
        let stats = StatCounters::new();
        let (list, bins) = list_with_extra_bins(&stats, 128, 1);
        bins[0].lock().set(0);
        let walker = sync::read(&list.gate);
        // Safety: Test code.
        let outcome = unsafe { bins[0].reclaim_small(0, &list, &stats) };
        drop(walker);
        assert_eq!(outcome, Reclaim::Abandoned);
    }

    #[test]
    fn test_trim_releases_empty_bins_only() {
        let stats = StatCounters::new();
        let (list, bins) = list_with_extra_bins(&stats, 256, 3);
        bins[1].lock().set(2);
        // Safety: Test code.
        unsafe {
            assert_eq!(list.trim(&stats), 2);
            assert_eq!(list.len(), 2);
        }
        assert_eq!(list.head().next(), Some(bins[1]));
        assert_eq!(stats.pages_unmapped.get(), 2);
    }
}
