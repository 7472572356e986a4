//! Context pool (C2): a bounded, preallocated free-list allocator of
//! `Context` slots.
//!
//! An index-based arena: contexts live in a `Vec`, the free list is a
//! `Vec` of free indices, and each live slot is addressed by a
//! `Handle` (index + generation) that a stale reference fails to
//! resolve instead of silently aliasing a different connection.
use crate::context::{Context, Liveness, ReleaseMask};

/// Minimum pool size.
pub const MIN_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: usize,
    generation: u32,
}

impl Handle {
    pub fn index(self) -> usize {
        self.index
    }
}

struct Slot {
    generation: u32,
    context: Option<Context>,
}

pub struct ContextPool {
    slots: Vec<Slot>,
    free: Vec<usize>,
    max_size: usize,
    used_size: usize,
}

impl ContextPool {
    /// Preallocates `max.max(MIN_SIZE)` slot *metadata* entries; each
    /// slot's buffers and crypto state are lazily created on its first
    /// `acquire` and then kept (not freed) across releases, so
    /// steady-state load causes no further allocator traffic.
    pub fn new(max: usize) -> Self {
        let max = max.max(MIN_SIZE);
        let slots = (0..max)
            .map(|_| Slot {
                generation: 0,
                context: None,
            })
            .collect();
        ContextPool {
            slots,
            free: (0..max).rev().collect(),
            max_size: max,
            used_size: 0,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn used_size(&self) -> usize {
        self.used_size
    }

    /// Pops a slot off the free list and marks it live with `initial`.
    /// Returns `None` when the pool is exhausted; the caller must close
    /// the fresh fd it was about to hand to this context.
    pub fn acquire(&mut self, initial: Liveness) -> Option<Handle> {
        let index = self.free.pop()?;
        let slot = &mut self.slots[index];
        match &mut slot.context {
            Some(ctx) => ctx.liveness = initial,
            None => {
                let mut ctx = Context::new();
                ctx.liveness = initial;
                slot.context = Some(ctx);
            }
        }
        self.used_size += 1;
        Some(Handle {
            index,
            generation: slot.generation,
        })
    }

    pub fn get(&self, handle: Handle) -> Option<&Context> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.context.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Context> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.context.as_mut()
    }

    /// Closes the fds named by `which` (intersected with whichever
    /// halves are actually alive) and, once the context reaches
    /// `Dead`, resets its buffers and returns the slot to the free
    /// list, bumping its generation so any handle still held by a
    /// caller stops resolving. A stale or already-fully-released
    /// handle is a silent no-op.
    pub fn release(&mut self, handle: Handle, which: ReleaseMask) {
        let Some(slot) = self.slots.get_mut(handle.index) else {
            return;
        };
        if slot.generation != handle.generation {
            return;
        }
        let Some(ctx) = slot.context.as_mut() else {
            return;
        };
        if ctx.release_halves(which) {
            ctx.reset();
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(handle.index);
            self.used_size -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_returns_slot_to_free_list() {
        let mut pool = ContextPool::new(MIN_SIZE);
        assert_eq!(pool.used_size(), 0);
        let h = pool.acquire(Liveness::ClientOnly).unwrap();
        assert_eq!(pool.used_size(), 1);
        pool.release(h, ReleaseMask::CLIENT);
        assert_eq!(pool.used_size(), 0);
    }

    #[test]
    fn stale_handle_after_release_does_not_resolve() {
        let mut pool = ContextPool::new(MIN_SIZE);
        let h = pool.acquire(Liveness::Both).unwrap();
        pool.release(h, ReleaseMask::BOTH);
        assert!(pool.get(h).is_none());
        assert!(pool.get_mut(h).is_none());
        // Releasing again through the stale handle must not panic or
        // double-count.
        pool.release(h, ReleaseMask::BOTH);
        assert_eq!(pool.used_size(), 0);
    }

    #[test]
    fn pool_never_exceeds_capacity() {
        let mut pool = ContextPool::new(MIN_SIZE);
        let mut handles = Vec::new();
        for _ in 0..pool.max_size() {
            handles.push(pool.acquire(Liveness::ClientOnly).unwrap());
        }
        assert!(pool.acquire(Liveness::ClientOnly).is_none());
        assert_eq!(pool.used_size(), pool.max_size());
    }

    #[test]
    fn released_slot_is_reused_without_growing() {
        let mut pool = ContextPool::new(MIN_SIZE);
        let h1 = pool.acquire(Liveness::Both).unwrap();
        pool.release(h1, ReleaseMask::BOTH);
        let h2 = pool.acquire(Liveness::Both).unwrap();
        assert_eq!(h1.index(), h2.index());
        assert_ne!(h1, h2); // generation bumped, so the old handle is stale
    }

    #[test]
    fn minimum_size_is_enforced() {
        let pool = ContextPool::new(4);
        assert_eq!(pool.max_size(), MIN_SIZE);
    }
}
