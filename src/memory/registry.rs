//! Thread identity and the arena registry.
//!
//! The registry maps a thread token to that thread's [`Arena`]. It is only
//! consulted when an arena is first created and when one thread frees a chunk
//! owned by another; a thread working on its own arena never touches it.

use super::arena::Arena;
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::{self, Mutex};
use std::cell::Cell;
use std::num::NonZeroU64;
use std::ptr::NonNull;

crate::sync::static_atomic! {
    static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(0);
}

thread_local! {
    // No destructor, so reading it never allocates or registers TLS dtors,
    // which keeps it usable from inside `GlobalAlloc`.
    static CURRENT_TOKEN: Cell<Option<NonZeroU64>> = const { Cell::new(None) };
}

/// Process-unique identity of a thread, as recorded in bin headers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct ThreadToken(NonZeroU64);

impl ThreadToken {
    /// Token of the calling thread, assigned on first use.
    pub fn current() -> Self {
        Self(CURRENT_TOKEN.with(|cell| match cell.get() {
            Some(token) => token,
            None => {
                let token = NonZeroU64::MIN
                    .saturating_add(NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed));
                cell.set(Some(token));
                token
            }
        }))
    }

    /// Token with an explicit value, for driving several "threads" from one
    /// OS thread in model-checked tests.
    #[cfg(any(test, loom))]
    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

struct RegistryList {
    head: Option<NonNull<Arena>>,
    tail: Option<NonNull<Arena>>,
    len: usize,
}

// Safety: the list only links arenas, which are never unmapped; every access
// goes through the registry mutex.
unsafe impl Send for RegistryList {}

pub(crate) struct ArenaRegistry {
    list: Mutex<RegistryList>,
}

impl ArenaRegistry {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            list: Mutex::new(RegistryList {
                head: None,
                tail: None,
                len: 0,
            }),
        }
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            list: Mutex::new(RegistryList {
                head: None,
                tail: None,
                len: 0,
            }),
        }
    }

    /// Append `arena` to the registry.
    ///
    /// # Safety
    /// `arena` is fully initialised, never unmapped, and not registered yet.
    pub unsafe fn register(&self, arena: NonNull<Arena>) {
        let mut list = sync::lock(&self.list);
        match list.tail {
            // Safety: registered arenas live forever.
            Some(tail) => unsafe { tail.as_ref().set_registry_next(Some(arena)) },
            None => list.head = Some(arena),
        }
        list.tail = Some(arena);
        list.len += 1;
    }

    /// Arena owned by `token`, if that thread has registered one.
    pub fn lookup(&self, token: ThreadToken) -> Option<NonNull<Arena>> {
        let list = sync::lock(&self.list);
        let mut cur = list.head;
        while let Some(arena) = cur {
            // Safety: registered arenas live forever.
            let record = unsafe { arena.as_ref() };
            if record.owner() == token {
                return Some(arena);
            }
            cur = record.registry_next();
        }
        None
    }

    pub fn len(&self) -> usize {
        sync::lock(&self.list).len
    }
}
