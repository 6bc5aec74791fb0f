//! The per-thread typed pool cache.
//!
//! A [`Context`] is the per-thread entry point of a [`Pools`] runtime: it
//! resolves one pool per object type for its thread, preferring pools
//! recycled from exited threads over building fresh ones, and parks every
//! cached pool for the next thread when it drops.

use core::{any::TypeId, cell::RefCell, marker::PhantomData, ptr::NonNull};
use std::collections::HashMap;

use crate::{
    Error,
    base::{BaseAlloc, Sys},
    pool::{Pool, PoolBox},
    runtime::{PoolMgr, Pools},
    thread_tag,
};

/// A cached per-type pool plus the hook that parks it on exit.
///
/// The hook is monomorphized together with the two pointers, so the cache
/// itself can stay type-erased.
struct CachedPool {
    pool: NonNull<()>,
    mgr: NonNull<()>,
    park: unsafe fn(NonNull<()>, NonNull<()>),
}

/// The per-thread entry point of a [`Pools`] runtime.
///
/// Contexts are not sendable: each thread creates its own through
/// [`Pools::context`] and the pools it resolves are owned by that thread
/// until the context drops. Handles ([`PoolBox`]) are free to cross
/// threads; contexts are not.
pub struct Context<'p, B: BaseAlloc = Sys> {
    pools: &'p Pools<B>,
    tag: u64,
    cache: RefCell<HashMap<TypeId, CachedPool>>,
    _not_send: PhantomData<*mut ()>,
}

impl<'p, B: BaseAlloc> Context<'p, B> {
    pub(crate) fn new(pools: &'p Pools<B>) -> Self {
        Context {
            pools,
            tag: thread_tag(),
            cache: RefCell::new(HashMap::new()),
            _not_send: PhantomData,
        }
    }

    /// Moves `value` into the calling thread's pool of `T`, resolving or
    /// creating the pool on first use. O(1) amortized.
    ///
    /// # Errors
    ///
    /// Fails only when the pool has to grow and the base allocator
    /// reports exhaustion.
    pub fn alloc<T: Send + 'static>(&self, value: T) -> Result<PoolBox<'p, T, B>, Error<B>> {
        let pool = self.pool_for::<T>()?;
        // SAFETY: the pool was claimed by this thread and lives until the
        // runtime tears down.
        let ptr = unsafe { pool.as_ref().alloc(value) }?;
        Ok(PoolBox::new(ptr))
    }

    /// Like [`alloc`](Self::alloc), producing the value only after its
    /// slot is reserved. `f` may itself allocate from or release into
    /// this context.
    pub fn alloc_with<T: Send + 'static>(
        &self,
        f: impl FnOnce() -> T,
    ) -> Result<PoolBox<'p, T, B>, Error<B>> {
        let pool = self.pool_for::<T>()?;
        // SAFETY: as in `alloc`.
        let ptr = unsafe { pool.as_ref().alloc_with(f) }?;
        Ok(PoolBox::new(ptr))
    }

    /// Drains the releases other threads deferred to this thread's pool
    /// of `T`.
    ///
    /// Draining also happens opportunistically whenever an allocation
    /// finds its shard full, so calling this is never required; it only
    /// tightens the bound on how long reclaimed slots stay in flight.
    pub fn collect<T: Send + 'static>(&self) {
        if let Some(pool) = self.cached::<T>() {
            // SAFETY: cached pools are owned by this thread.
            unsafe { pool.as_ref().collect() };
        }
    }

    /// Finalizes every live `T` in this thread's pool and resets all of
    /// its shards.
    ///
    /// This is an O(pool capacity) sweep, unlike `alloc` and release
    /// which are O(1) amortized — keep it out of hot loops.
    ///
    /// # Safety
    ///
    /// No [`PoolBox`] or raw payload pointer into this thread's pool of
    /// `T` may be live.
    pub unsafe fn clear<T: Send + 'static>(&self) {
        if let Some(pool) = self.cached::<T>() {
            // SAFETY: cached pools are owned by this thread; the rest of
            // the contract is forwarded.
            unsafe { pool.as_ref().clear() };
        }
    }

    fn cached<T: Send + 'static>(&self) -> Option<NonNull<Pool<T, B>>> {
        let cache = self.cache.borrow();
        Some(cache.get(&TypeId::of::<T>())?.pool.cast())
    }

    /// Resolves the calling thread's pool of `T`: cached, else adopted
    /// from the type's recycle queue, else built fresh with one
    /// default-sized shard.
    fn pool_for<T: Send + 'static>(&self) -> Result<NonNull<Pool<T, B>>, Error<B>> {
        let mut cache = self.cache.borrow_mut();
        if let Some(cached) = cache.get(&TypeId::of::<T>()) {
            return Ok(cached.pool.cast());
        }
        let mgr = self.pools.manager::<T>();
        // SAFETY: managers live until the runtime tears down.
        let pool = unsafe { mgr.as_ref() }.adopt(self.tag, self.pools)?;
        cache.insert(TypeId::of::<T>(), CachedPool {
            pool: pool.cast(),
            mgr: mgr.cast(),
            park: PoolMgr::<T, B>::park_erased,
        });
        Ok(pool)
    }
}

impl<B: BaseAlloc> Drop for Context<'_, B> {
    fn drop(&mut self) {
        // Pools are handed to the next thread instead of dying with this
        // one, amortizing shard allocation across thread lifetimes.
        for cached in self.cache.get_mut().values() {
            // SAFETY: `park` was monomorphized together with `pool` and
            // `mgr`, and the pool is owned by this thread until parked.
            unsafe { (cached.park)(cached.mgr, cached.pool) };
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Pools;

    #[test]
    fn pools_are_cached_per_type() {
        let pools = Pools::new();
        let cx = pools.context();
        let a = cx.alloc(1u32).unwrap();
        let b = cx.alloc(2u32).unwrap();
        let c = cx.alloc(3u64).unwrap();
        assert_eq!(cx.cache.borrow().len(), 2);
        drop((a, b, c));
    }

    #[test]
    fn collect_without_a_pool_is_a_no_op() {
        let pools = Pools::new();
        let cx = pools.context();
        cx.collect::<String>();
        assert!(cx.cache.borrow().is_empty());
    }

    #[test]
    fn reentrant_allocation_is_allowed() {
        let pools = Pools::new();
        let cx = pools.context();
        let outer = cx
            .alloc_with(|| {
                let inner = cx.alloc(41u32).unwrap();
                *inner + 1
            })
            .unwrap();
        assert_eq!(*outer, 42);
    }
}
