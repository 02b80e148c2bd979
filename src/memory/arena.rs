use super::bin::{Bin, BinList};
use super::registry::ThreadToken;
use super::stats::StatCounters;
use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::atomic::{AtomicPtr, Ordering};
use crate::sync;
use std::ptr::NonNull;

/// Chunk sizes of the small bins, ascending.
pub(crate) const SIZE_CLASSES: &[usize] = &[
    4, 8, 12, 16, 24, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 1536, 2048, 3072,
];

pub(crate) const NUM_SIZE_CLASSES: usize = 19;

/// Requests above this many bytes get a dedicated mapping.
pub(crate) const MAX_SMALL_SIZE: usize = SIZE_CLASSES[NUM_SIZE_CLASSES - 1];

const _: () = assert!(SIZE_CLASSES.len() == NUM_SIZE_CLASSES);

/// Smallest class that fits `bytes`, or `None` if the request is oversized.
#[inline]
pub(crate) fn select_class(bytes: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&size| bytes <= size)
}

/// Smallest class that fits `bytes` and whose chunk size is a multiple of
/// `align`. Chunks start at a 64-byte aligned offset, so such a class yields
/// `align`-aligned chunks for any power-of-two `align <= 64`.
#[inline]
pub(crate) fn select_class_aligned(bytes: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    SIZE_CLASSES
        .iter()
        .position(|&size| bytes <= size && size.is_multiple_of(align))
}

/// Class index of an exact chunk size read back from a bin header.
#[inline]
pub(crate) fn class_of_chunk_size(chunk_size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&size| size == chunk_size)
}

/// A thread's bin table: one bin list per size class.
///
/// The arena doubles as its own registry record (`owner` and `registry_next`).
/// It lives in its own page mapping and is never unmapped, so `&Arena` obtained
/// from a registered arena is valid for the rest of the process.
#[repr(C)]
pub(crate) struct Arena {
    owner: ThreadToken,
    /// Next registered arena. Written only under the registry lock.
    registry_next: AtomicPtr<Arena>,
    lists: [BinList; NUM_SIZE_CLASSES],
}

impl Arena {
    /// Map a new arena for `owner` with one empty head bin per size class.
    pub fn create(owner: ThreadToken, stats: &StatCounters) -> Result<NonNull<Arena>, VmError> {
        let size = std::mem::size_of::<Arena>();
        // Safety: FFI call to map memory.
        let base = unsafe { PlatformVmOps::map(size)? };
        stats.pages_mapped.add(super::vm::pages_for(size));
        let arena = base.cast::<Arena>();

        let mut heads = [None::<Bin>; NUM_SIZE_CLASSES];
        for (slot, &chunk_size) in heads.iter_mut().zip(SIZE_CLASSES) {
            match Bin::create_small(chunk_size, owner, stats) {
                Ok(bin) => *slot = Some(bin),
                Err(e) => {
                    // Nothing is published yet; give every page back.
                    for bin in heads.iter().flatten() {
                        // Safety: unpublished bins, no locks held.
                        unsafe { bin.release(stats) };
                    }
                    // Safety: the mapping was created above with `size` bytes.
                    if unsafe { PlatformVmOps::release(base, size) }.is_ok() {
                        stats.pages_unmapped.add(super::vm::pages_for(size));
                    }
                    return Err(e);
                }
            }
        }

        let arena_ptr = arena.as_ptr();
        // Safety: fresh, writable mapping large enough for an `Arena`; fields
        // are written in place before the arena is shared.
        unsafe {
            std::ptr::addr_of_mut!((*arena_ptr).owner).write(owner);
            std::ptr::addr_of_mut!((*arena_ptr).registry_next)
                .write(AtomicPtr::new(std::ptr::null_mut()));
            let lists = std::ptr::addr_of_mut!((*arena_ptr).lists).cast::<BinList>();
            for (i, head) in heads.into_iter().flatten().enumerate() {
                lists.add(i).write(BinList::new(head));
            }
        }
        Ok(arena)
    }

    #[inline]
    pub fn owner(&self) -> ThreadToken {
        self.owner
    }

    #[inline]
    pub fn list(&self, class: usize) -> &BinList {
        &self.lists[class]
    }

    pub(crate) fn registry_next(&self) -> Option<NonNull<Arena>> {
        NonNull::new(self.registry_next.load(Ordering::Acquire))
    }

    pub(crate) fn set_registry_next(&self, next: Option<NonNull<Arena>>) {
        self.registry_next
            .store(next.map_or(std::ptr::null_mut(), NonNull::as_ptr), Ordering::Release);
    }

    /// Unmap empty non-head bins in every class. Returns bins released.
    pub fn trim(&self, stats: &StatCounters) -> usize {
        self.lists
            .iter()
            // Safety: lists of a live arena only link live bins.
            .map(|list| unsafe { list.trim(stats) })
            .sum()
    }

    /// Bins currently linked in `class`, head included.
    pub fn bins_in_class(&self, class: usize) -> usize {
        // Safety: lists of a live arena only link live bins.
        unsafe { self.lists[class].len() }
    }

    /// Chunks of `class` currently handed out.
    pub fn live_chunks_in_class(&self, class: usize) -> usize {
        // Safety: lists of a live arena only link live bins.
        unsafe { self.lists[class].live_chunks() }
    }
}

/// Hand out one chunk from `list`.
///
/// Tries the head under its lock, then walks at most `max_hops` further bins
/// with non-blocking locks (busy bins are skipped). If that finds nothing, a
/// fresh bin is mapped, spliced in right after the head, and its first chunk
/// returned. A free chunk deeper than `max_hops` is deliberately not searched
/// for.
pub(crate) fn acquire_chunk(
    list: &BinList,
    max_hops: usize,
    stats: &StatCounters,
) -> Result<NonNull<u8>, VmError> {
    let head = list.head();
    let capacity = list.capacity();

    {
        let mut bitmap = head.lock();
        if let Some(ptr) = head.claim(&mut bitmap, capacity) {
            stats.chunks_allocated.incr();
            return Ok(ptr);
        }
    }

    {
        let _walk = sync::read(&list.gate);
        let mut cur = head.next();
        let mut hops = 0;
        while let Some(bin) = cur
            && hops < max_hops
        {
            if let Some(mut bitmap) = bin.try_lock()
                && let Some(ptr) = bin.claim(&mut bitmap, capacity)
            {
                stats.chunks_allocated.incr();
                return Ok(ptr);
            }
            cur = bin.next();
            hops += 1;
        }
    }

    let fresh = Bin::create_small(list.chunk_size(), head.owner(), stats)?;
    let ptr = {
        // Unpublished: nobody else can see this bin yet.
        let mut bitmap = fresh.lock();
        fresh.claim(&mut bitmap, capacity)
    };
    let Some(ptr) = ptr else {
        // Safety: unpublished bin, lock released.
        unsafe { fresh.release(stats) };
        return Err(VmError::InvalidConfig(format!(
            "size class {} holds no chunks on this page size",
            list.chunk_size()
        )));
    };
    {
        let _head_guard = head.lock();
        head.splice_after(fresh);
    }
    stats.chunks_allocated.incr();
    Ok(ptr)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_size_classes_ascending() {
        assert!(SIZE_CLASSES.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(MAX_SMALL_SIZE, 3072);
    }

    #[test]
    fn test_select_class_smallest_fit() {
        assert_eq!(select_class(0), Some(0));
        assert_eq!(select_class(1), Some(0));
        assert_eq!(select_class(4), Some(0));
        assert_eq!(select_class(5), Some(1));
        assert_eq!(select_class(8), Some(1));
        assert_eq!(select_class(100), Some(9)); // 128
        assert_eq!(select_class(3072), Some(NUM_SIZE_CLASSES - 1));
        assert_eq!(select_class(3073), None);
    }

    #[test]
    fn test_select_class_aligned() {
        // 12 is not a multiple of 8, 16 is.
        assert_eq!(select_class_aligned(12, 8).map(|c| SIZE_CLASSES[c]), Some(16));
        assert_eq!(select_class_aligned(1, 16).map(|c| SIZE_CLASSES[c]), Some(16));
        assert_eq!(select_class_aligned(65, 64).map(|c| SIZE_CLASSES[c]), Some(128));
        assert_eq!(select_class_aligned(3000, 64).map(|c| SIZE_CLASSES[c]), Some(3072));
        assert_eq!(select_class_aligned(3073, 1), None);
    }

    #[test]
    fn test_class_of_chunk_size() {
        assert_eq!(class_of_chunk_size(4), Some(0));
        assert_eq!(class_of_chunk_size(3072), Some(NUM_SIZE_CLASSES - 1));
        assert_eq!(class_of_chunk_size(5), None);
    }

    fn new_arena(stats: &StatCounters) -> &'static Arena {
        let token = ThreadToken::current();
        let arena = Arena::create(token, stats).unwrap();
        // Safety: Test code; arenas are never unmapped.
        unsafe { arena.as_ref() }
    }

    #[test]
    fn test_arena_has_one_head_per_class() {
        let stats = StatCounters::new();
        let arena = new_arena(&stats);
        assert_eq!(arena.owner(), ThreadToken::current());
        for (class, &size) in SIZE_CLASSES.iter().enumerate() {
            assert_eq!(arena.list(class).chunk_size(), size);
            assert_eq!(arena.list(class).head().bin_size(), size);
            assert_eq!(arena.bins_in_class(class), 1);
        }
        // Arena page plus one head page per class.
        assert_eq!(stats.pages_mapped.get(), 1 + NUM_SIZE_CLASSES as u64);
    }

    #[test]
    fn test_acquire_fills_head_then_extends() {
        let stats = StatCounters::new();
        let arena = new_arena(&stats);
        let class = select_class(1024).unwrap();
        let list = arena.list(class);
        let capacity = list.capacity();

        let mut ptrs = Vec::new();
        for _ in 0..capacity {
            let ptr = acquire_chunk(list, 10, &stats).unwrap();
            // Safety: Test code.
            assert_eq!(unsafe { Bin::owner_of(ptr) }, list.head());
            ptrs.push(ptr);
        }
        assert_eq!(arena.bins_in_class(class), 1);

        let overflow = acquire_chunk(list, 10, &stats).unwrap();
        assert_eq!(arena.bins_in_class(class), 2);
        // Safety: Test code.
        let fresh = unsafe { Bin::owner_of(overflow) };
        assert_ne!(fresh, list.head());
        assert_eq!(list.head().next(), Some(fresh));
        assert_eq!(fresh.chunk_index(overflow), 0);
    }

    #[test]
    fn test_acquire_reuses_bins_within_hop_limit() {
        let stats = StatCounters::new();
        let arena = new_arena(&stats);
        let class = select_class(3072).unwrap();
        let list = arena.list(class);
        let capacity = list.capacity();

        let total = capacity * 3;
        let ptrs: Vec<_> = (0..total)
            .map(|_| acquire_chunk(list, 10, &stats).unwrap())
            .collect();
        assert_eq!(arena.bins_in_class(class), 3);

        // Free a chunk in the last bin of the list, then allocate again: the
        // walk finds it instead of mapping a fourth bin.
        let mut tail = list.head();
        while let Some(next) = tail.next() {
            tail = next;
        }
        let victim = ptrs
            .iter()
            .copied()
            // Safety: Test code.
            .find(|&p| unsafe { Bin::owner_of(p) } == tail)
            .unwrap();
        tail.lock().clear(tail.chunk_index(victim));

        let again = acquire_chunk(list, 10, &stats).unwrap();
        assert_eq!(again, victim);
        assert_eq!(arena.bins_in_class(class), 3);
    }

    #[test]
    fn test_acquire_hop_limit_bounds_search() {
        let stats = StatCounters::new();
        let arena = new_arena(&stats);
        let class = select_class(3072).unwrap();
        let list = arena.list(class);
        let capacity = list.capacity();

        // head + 2 more full bins
        let ptrs: Vec<_> = (0..capacity * 3)
            .map(|_| acquire_chunk(list, 10, &stats).unwrap())
            .collect();
        let mut tail = list.head();
        while let Some(next) = tail.next() {
            tail = next;
        }
        let victim = ptrs
            .iter()
            .copied()
            // Safety: Test code.
            .find(|&p| unsafe { Bin::owner_of(p) } == tail)
            .unwrap();
        tail.lock().clear(tail.chunk_index(victim));

        // With one hop only the bin right after the head is inspected.
        let ptr = acquire_chunk(list, 1, &stats).unwrap();
        assert_ne!(ptr, victim);
        assert_eq!(arena.bins_in_class(class), 4);
    }

    #[test]
    fn test_acquire_skips_busy_bin() {
        let stats = StatCounters::new();
        let arena = new_arena(&stats);
        let class = select_class(3072).unwrap();
        let list = arena.list(class);
        let capacity = list.capacity();
        let ptrs: Vec<_> = (0..capacity * 2)
            .map(|_| acquire_chunk(list, 10, &stats).unwrap())
            .collect();
        let second = list.head().next().unwrap();
        let victim = ptrs
            .iter()
            .copied()
            // Safety: Test code.
            .find(|&p| unsafe { Bin::owner_of(p) } == second)
            .unwrap();

        let mut guard = second.lock();
        guard.clear(second.chunk_index(victim));
        // `second` has room but is locked: the walk skips it and extends.
        let ptr = acquire_chunk(list, 10, &stats).unwrap();
        drop(guard);
        assert_ne!(ptr, victim);
        assert_eq!(arena.bins_in_class(class), 3);
    }

    #[test]
    fn test_arena_trim_keeps_heads() {
        let stats = StatCounters::new();
        let arena = new_arena(&stats);
        let class = select_class(2048).unwrap();
        let list = arena.list(class);
        let capacity = list.capacity();
        let ptrs: Vec<_> = (0..capacity * 3)
            .map(|_| acquire_chunk(list, 10, &stats).unwrap())
            .collect();
        for ptr in ptrs {
            // Safety: Test code.
            let bin = unsafe { Bin::owner_of(ptr) };
            bin.lock().clear(bin.chunk_index(ptr));
        }
        assert_eq!(arena.bins_in_class(class), 3);
        assert_eq!(arena.trim(&stats), 2);
        assert_eq!(arena.bins_in_class(class), 1);
    }
}
