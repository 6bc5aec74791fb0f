//! The process-wide pool runtime.
//!
//! [`Pools`] owns everything with a process lifetime: the base allocator
//! and configuration every pool is built from, one recycling manager per
//! object type, and the teardown registry those managers append
//! themselves to. Dropping the runtime is the deterministic final pass
//! that reclaims every outstanding deferred free and releases every shard
//! of every type.

use core::{any::TypeId, marker::PhantomData, ptr::NonNull};
use std::{
    collections::{HashMap, hash_map::Entry},
    sync::Mutex,
};

use crossbeam_queue::SegQueue;

use crate::{
    Config, Error,
    base::{BaseAlloc, Sys},
    context::Context,
    pool::Pool,
};

/// A parked pool traveling through a recycle queue.
struct RawPool(NonNull<()>);

// SAFETY: a parked pool has no owner; popping it off the queue grants
// exclusive adoption rights to the popping thread.
unsafe impl Send for RawPool {}

/// The per-type pool manager.
///
/// Holds the recycle queue pools are parked on when their thread exits,
/// so a newly started thread can reuse their shards instead of paying the
/// allocation cost again. Whatever is still parked at process shutdown is
/// destroyed by [`teardown`](Self::teardown).
pub(crate) struct PoolMgr<T, B: BaseAlloc> {
    recycle: SegQueue<RawPool>,
    _marker: PhantomData<(fn() -> T, B)>,
}

impl<T: Send + 'static, B: BaseAlloc> PoolMgr<T, B> {
    fn new() -> Self {
        PoolMgr {
            recycle: SegQueue::new(),
            _marker: PhantomData,
        }
    }

    /// Hands out a pool owned by the calling thread: a recycled one when
    /// available, else a fresh one with a single default-sized shard.
    pub(crate) fn adopt(
        &self,
        tag: u64,
        pools: &Pools<B>,
    ) -> Result<NonNull<Pool<T, B>>, Error<B>> {
        if let Some(RawPool(raw)) = self.recycle.pop() {
            let pool = raw.cast::<Pool<T, B>>();
            // SAFETY: popping granted exclusive adoption rights.
            let adopted = unsafe { pool.as_ref() };
            adopted.claim(tag);
            // The previous owner may have parked it full; reclaim what
            // foreign threads freed in the meantime, and grow by one
            // shard if there is still no capacity at all.
            // SAFETY: just claimed by this thread.
            unsafe { adopted.collect() };
            if !adopted.has_spare() {
                if let Err(err) = adopted.add_shard() {
                    adopted.release_ownership();
                    self.recycle.push(RawPool(raw));
                    return Err(err);
                }
            }
            log::trace!("adopted a recycled pool");
            return Ok(pool);
        }
        let pool = Pool::<T, B>::new(pools.base().clone(), pools.config().shard_slots)?;
        pool.claim(tag);
        Ok(NonNull::from(Box::leak(pool)))
    }

    /// Parks `pool` for the next thread. Type-erased so contexts can keep
    /// one hook per cached pool.
    ///
    /// # Safety
    ///
    /// `mgr` and `pool` must be the manager and a pool of these exact
    /// type parameters, and the calling thread must own the pool and hand
    /// it over for good.
    pub(crate) unsafe fn park_erased(mgr: NonNull<()>, pool: NonNull<()>) {
        let pool = pool.cast::<Pool<T, B>>();
        // SAFETY: the caller owns the pool; parking happens before the
        // push, so whoever pops observes an unowned pool.
        unsafe { pool.as_ref() }.release_ownership();
        log::trace!("parked a pool for recycling");
        // SAFETY: managers outlive every context of their runtime.
        unsafe { mgr.cast::<Self>().as_ref() }
            .recycle
            .push(RawPool(pool.cast()));
    }

    /// Destroys every parked pool of this type, then the manager itself.
    ///
    /// # Safety
    ///
    /// Called exactly once per manager, by the runtime teardown, after
    /// every context and handle is gone.
    unsafe fn teardown(mgr: NonNull<()>) {
        // SAFETY: exclusive per the contract.
        let mgr = unsafe { Box::from_raw(mgr.cast::<Self>().as_ptr()) };
        let mut count = 0usize;
        while let Some(RawPool(raw)) = mgr.recycle.pop() {
            // SAFETY: parked pools are exclusively owned, leaked boxes;
            // dropping one drains its channel and sweeps its leftovers.
            drop(unsafe { Box::from_raw(raw.cast::<Pool<T, B>>().as_ptr()) });
            count += 1;
        }
        log::debug!(
            "tore down {count} pool(s) of `{}`",
            core::any::type_name::<T>()
        );
    }
}

/// A registered manager and its teardown routine.
struct MgrEntry {
    mgr: NonNull<()>,
    teardown: unsafe fn(NonNull<()>),
}

// SAFETY: the entry is a teardown token for a shareable manager.
unsafe impl Send for MgrEntry {}

/// The process-wide pool runtime.
///
/// Create one before spawning the threads that allocate, hand each of
/// them a reference, and drop it after all of them are joined:
///
/// ```
/// use slotpool::Pools;
///
/// let pools = Pools::new();
/// std::thread::scope(|s| {
///     let cx = pools.context();
///     let greeting = cx.alloc(String::from("hello")).unwrap();
///     // Handles may cross threads; the slot travels back to its owner
///     // through a lock-free channel.
///     s.spawn(move || assert_eq!(greeting.len(), 5));
/// });
/// drop(pools); // the final, process-wide reclaim pass
/// ```
///
/// Contexts and handles borrow the runtime, so using a pool after the
/// teardown is a compile error rather than a runtime hazard. The converse
/// ordering duty remains with the caller: the drop must happen on the
/// controlling thread, after every allocating thread is joined.
pub struct Pools<B: BaseAlloc = Sys> {
    base: B,
    config: Config,
    /// Append-only until teardown; drained exactly once, by `drop`.
    registry: SegQueue<MgrEntry>,
    by_type: Mutex<HashMap<TypeId, NonNull<()>>>,
}

// SAFETY: the interior pointers are per-type managers, themselves
// shareable across threads; the index over them is lock-protected.
unsafe impl<B: BaseAlloc> Send for Pools<B> {}
unsafe impl<B: BaseAlloc> Sync for Pools<B> {}

impl Pools<Sys> {
    /// Creates a runtime over the system allocator with the default
    /// configuration.
    pub fn new() -> Self {
        Self::with_base(Sys)
    }
}

impl Default for Pools<Sys> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: BaseAlloc> Pools<B> {
    /// Creates a runtime over `base` with the default configuration.
    pub fn with_base(base: B) -> Self {
        Self::with_config(base, Config::default())
    }

    /// Creates a runtime over `base` with explicit tuning knobs.
    ///
    /// # Panics
    ///
    /// Panics if `config.shard_slots` is zero.
    pub fn with_config(base: B, config: Config) -> Self {
        assert!(config.shard_slots > 0, "shards must have at least one slot");
        Pools {
            base,
            config,
            registry: SegQueue::new(),
            by_type: Mutex::new(HashMap::new()),
        }
    }

    /// Enters the runtime from the calling thread.
    ///
    /// Every thread that allocates needs its own context; see [`Context`].
    pub fn context(&self) -> Context<'_, B> {
        Context::new(self)
    }

    pub(crate) fn base(&self) -> &B {
        &self.base
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    /// Resolves the per-type manager for `T`, creating and registering it
    /// the first time any thread touches the type.
    ///
    /// This is a cold path: contexts cache the result, so each (type,
    /// thread) pair pays for it once.
    pub(crate) fn manager<T: Send + 'static>(&self) -> NonNull<PoolMgr<T, B>> {
        let mut by_type = self
            .by_type
            .lock()
            .expect("a thread panicked while registering a pool type");
        match by_type.entry(TypeId::of::<T>()) {
            Entry::Occupied(entry) => entry.get().cast(),
            Entry::Vacant(entry) => {
                let mgr = NonNull::from(Box::leak(Box::new(PoolMgr::<T, B>::new())));
                self.registry.push(MgrEntry {
                    mgr: mgr.cast(),
                    teardown: PoolMgr::<T, B>::teardown,
                });
                entry.insert(mgr.cast());
                mgr
            }
        }
    }
}

impl<B: BaseAlloc> Drop for Pools<B> {
    fn drop(&mut self) {
        // Contexts and handles borrow the runtime, so reaching this point
        // means no thread can allocate or release anymore; the final pass
        // is single-threaded by construction.
        let mut count = 0usize;
        while let Some(entry) = self.registry.pop() {
            // SAFETY: registry entries are unique and drained exactly
            // once, here.
            unsafe { (entry.teardown)(entry.mgr) };
            count += 1;
        }
        if count > 0 {
            log::debug!("pool runtime torn down ({count} type(s))");
        }
    }
}
