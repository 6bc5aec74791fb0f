//! Per-type growable pools and their owning handles.
//!
//! A [`Pool`] owns an expanding sequence of [`Shard`]s and tracks which
//! of them currently have capacity through an intrusive singly-linked
//! chain, so finding a shard with a free slot stays O(1) amortized even
//! as shards fill and drain in arbitrary order. Shards are never removed,
//! only linked in and out of the chain.
//!
//! Exactly one thread owns and mutates a pool at any time. Every other
//! thread interacts with it exclusively through [`PoolHeader`]: an atomic
//! owner tag and a lock-free channel of deferred frees. This is what
//! removes the need for locks: one mutator, many enqueuers.

use core::{
    cell::{Cell, UnsafeCell},
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    ptr::{self, NonNull},
    sync::atomic::{AtomicU64, Ordering::*},
};
use std::alloc::Layout;

use crossbeam_queue::SegQueue;

use crate::{
    COLLECT_BATCH, Error, slab,
    base::{BaseAlloc, Sys},
    slab::Slab,
    thread_tag,
};

/// A raw payload pointer traveling through a deallocation channel.
///
/// The payload's finalizer has already run on the freeing thread; the
/// owner only reclaims the slot.
struct RemoteSlot(NonNull<u8>);

// SAFETY: a remote slot is an exclusively owned, already finalized slot;
// the channel transfers that ownership back to the pool's thread.
unsafe impl Send for RemoteSlot {}

/// The type-agnostic head of a pool, reachable from any thread.
///
/// Everything else in [`Pool`] is single-mutator state; this header is
/// the only part foreign threads may touch.
pub(crate) struct PoolHeader {
    /// Tag of the thread currently owning the pool, or zero while the
    /// pool is parked in a recycle queue.
    owner: AtomicU64,
    /// Slots released by foreign threads, awaiting reclamation.
    remote_free: SegQueue<RemoteSlot>,
}

/// A slab plus its links in the owning pool.
///
/// Shards are heap-pinned so that their address doubles as the identity
/// stamped into their slots' headers.
pub(crate) struct Shard<B: BaseAlloc> {
    /// Position in the pool's shard sequence.
    index: usize,
    /// Next shard in the intrusive "has space" chain.
    next_spare: Cell<Option<usize>>,
    /// Whether this shard is currently linked into that chain.
    in_spare: Cell<bool>,
    /// The owning pool's header; the field cross-thread releases consult.
    owner: NonNull<PoolHeader>,
    slab: Slab<B>,
}

/// A growable pool of `T` slots.
///
/// # Invariant
///
/// The head of the spare chain always designates a shard with free
/// capacity, except transiently within an allocation, right before a new
/// shard is appended. Shards past the head only ever gain capacity, since
/// allocations happen at the head alone.
#[repr(C)]
pub(crate) struct Pool<T, B: BaseAlloc> {
    /// Must stay the first field: shards point here, and the typed pool
    /// is recovered from a header pointer by casting back.
    header: PoolHeader,
    shards: UnsafeCell<Vec<NonNull<Shard<B>>>>,
    spare_head: Cell<Option<usize>>,
    base: B,
    shard_slots: usize,
    _marker: PhantomData<T>,
}

// SAFETY: foreign threads are restricted to `header` (an atomic and a
// lock-free queue); the owner-tag protocol keeps every `Cell` and
// `UnsafeCell` on one thread at a time. `T: Send` because values may be
// finalized on a thread other than the allocating one.
unsafe impl<T: Send, B: BaseAlloc> Sync for Pool<T, B> {}

impl<T, B: BaseAlloc> Pool<T, B> {
    /// Creates a pool with one default-sized shard, owned by nobody.
    pub(crate) fn new(base: B, shard_slots: usize) -> Result<Box<Self>, Error<B>> {
        let pool = Box::new(Pool {
            header: PoolHeader {
                owner: AtomicU64::new(0),
                remote_free: SegQueue::new(),
            },
            shards: UnsafeCell::new(Vec::new()),
            spare_head: Cell::new(None),
            base,
            shard_slots,
            _marker: PhantomData,
        });
        pool.add_shard()?;
        Ok(pool)
    }

    /// Recovers the typed pool owning `payload` from its slot header.
    ///
    /// # Safety
    ///
    /// `payload` must be a live payload produced by a `Pool<T, B>` with
    /// these exact type parameters.
    pub(crate) unsafe fn of(payload: NonNull<u8>) -> NonNull<Self> {
        // SAFETY: live payloads carry their shard identity.
        let shard = unsafe { slab::owner_of(payload) }.cast::<Shard<B>>();
        debug_assert!(!shard.is_null());
        // SAFETY: shard identities point at live shards whose `owner`
        // leads to the pool header, the pool's first field.
        unsafe { (*shard).owner.cast() }
    }

    /// Whether the calling thread currently owns this pool.
    pub(crate) fn is_local(&self) -> bool {
        self.header.owner.load(Acquire) == thread_tag()
    }

    /// Takes ownership for the calling context. The pool must be parked.
    pub(crate) fn claim(&self, tag: u64) {
        debug_assert_ne!(tag, 0);
        debug_assert_eq!(self.header.owner.load(Relaxed), 0);
        self.header.owner.store(tag, Release);
    }

    /// Parks the pool: after this, every release takes the deferred path
    /// until another thread adopts it.
    pub(crate) fn release_ownership(&self) {
        self.header.owner.store(0, Release);
    }

    pub(crate) fn has_spare(&self) -> bool {
        self.spare_head.get().is_some()
    }

    /// # Safety
    ///
    /// Owner-thread only; `index` must be in bounds.
    unsafe fn shard(&self, index: usize) -> &Shard<B> {
        // SAFETY: shards are never removed before the pool dies.
        unsafe { (&(*self.shards.get()))[index].as_ref() }
    }

    /// Links shard `index` at the head of the spare chain unless it is
    /// already linked.
    fn link_spare(&self, index: usize) {
        // SAFETY: only called on the owning thread.
        let shard = unsafe { self.shard(index) };
        if shard.in_spare.get() {
            return;
        }
        shard.next_spare.set(self.spare_head.get());
        shard.in_spare.set(true);
        self.spare_head.set(Some(index));
    }

    /// Appends a brand-new shard and links it at the head of the spare
    /// chain.
    pub(crate) fn add_shard(&self) -> Result<(), Error<B>> {
        // SAFETY: only the owning thread grows the pool.
        let shards = unsafe { &mut *self.shards.get() };
        let index = shards.len();
        let shard = Box::new(Shard {
            index,
            next_spare: Cell::new(None),
            in_spare: Cell::new(false),
            owner: NonNull::from(&self.header),
            slab: Slab::new(&self.base, Layout::new::<T>(), self.shard_slots)?,
        });
        let shard = NonNull::from(Box::leak(shard));
        // SAFETY: freshly leaked, exclusively ours.
        unsafe { shard.as_ref() }.slab.bind(shard.as_ptr().cast());
        shards.push(shard);
        log::debug!(
            "pool grows to {} shard(s) of {} slots",
            index + 1,
            self.shard_slots
        );
        self.link_spare(index);
        Ok(())
    }

    /// Resolves the shard the next allocation should use.
    ///
    /// The head of the spare chain is used as long as it has capacity.
    /// When it looks full, the deallocation channel is drained once and
    /// the head rechecked, so the synchronization cost is only paid under
    /// contention. Only then does the chain advance, appending a
    /// brand-new shard if it ran empty.
    #[cold]
    fn active_shard_contended(&self) -> Result<&Shard<B>, Error<B>> {
        // Foreign frees may have landed since the head last looked full.
        // SAFETY: only reachable through `alloc`, whose contract says the
        // calling thread owns the pool.
        unsafe { self.collect() };
        // Reclaiming may have relinked shards at the head of the chain,
        // so re-resolve it: the head is now either such a relinked shard
        // (which has space) or still the full one.
        let head = self
            .spare_head
            .get()
            .expect("the chain cannot empty out while draining");
        // SAFETY: the pool is owned by the calling thread.
        let shard = unsafe { self.shard(head) };
        if shard.slab.has_free() {
            return Ok(shard);
        }
        self.spare_head.set(shard.next_spare.take());
        shard.in_spare.set(false);

        if let Some(next) = self.spare_head.get() {
            // SAFETY: as above.
            let shard = unsafe { self.shard(next) };
            // Chained shards past the head only ever gain capacity.
            debug_assert!(shard.slab.has_free());
            return Ok(shard);
        }

        self.add_shard()?;
        let head = self.spare_head.get().expect("a fresh shard must be chained");
        // SAFETY: as above.
        Ok(unsafe { self.shard(head) })
    }

    fn active_shard(&self) -> Result<&Shard<B>, Error<B>> {
        if let Some(head) = self.spare_head.get() {
            // SAFETY: the pool is owned by the calling thread.
            let shard = unsafe { self.shard(head) };
            if shard.slab.has_free() {
                return Ok(shard);
            }
            return self.active_shard_contended();
        }
        self.active_shard_contended_empty()
    }

    #[cold]
    fn active_shard_contended_empty(&self) -> Result<&Shard<B>, Error<B>> {
        self.add_shard()?;
        let head = self.spare_head.get().expect("a fresh shard must be chained");
        // SAFETY: the pool is owned by the calling thread.
        Ok(unsafe { self.shard(head) })
    }

    /// Moves `value` into a free slot. O(1) amortized.
    ///
    /// # Safety
    ///
    /// The calling thread must own the pool.
    pub(crate) unsafe fn alloc(&self, value: T) -> Result<NonNull<T>, Error<B>> {
        let shard = self.active_shard()?;
        let ptr = shard
            .slab
            .allocate()
            .expect("the active shard must have capacity")
            .cast::<T>();
        // SAFETY: the slot is freshly reserved, properly aligned, and
        // exactly `size_of::<T>()` bytes.
        unsafe { ptr.write(value) };
        Ok(ptr)
    }

    /// Like [`alloc`](Self::alloc), but the value is produced only after
    /// its slot is reserved.
    ///
    /// # Safety
    ///
    /// The calling thread must own the pool.
    pub(crate) unsafe fn alloc_with(&self, f: impl FnOnce() -> T) -> Result<NonNull<T>, Error<B>> {
        let shard = self.active_shard()?;
        let ptr = shard
            .slab
            .allocate()
            .expect("the active shard must have capacity")
            .cast::<T>();
        // SAFETY: as in `alloc`; the slot state is settled before `f`
        // runs, so `f` may freely allocate from or release into this
        // pool.
        unsafe { ptr.write(f()) };
        Ok(ptr)
    }

    /// Finalizes `ptr` and returns its slot to its shard. The owner-side
    /// half of a release.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live payload of this pool, nothing may reference
    /// it afterwards, and the calling thread must own the pool.
    pub(crate) unsafe fn dealloc_local(&self, ptr: NonNull<T>) {
        // SAFETY: `ptr` is a live payload nothing else references.
        unsafe { ptr::drop_in_place(ptr.as_ptr()) };
        // SAFETY: finalized above; the slot itself is still occupied.
        unsafe { self.reclaim_slot(ptr.cast()) };
    }

    /// Returns an already finalized slot to its shard, relinking the
    /// shard into the spare chain if it had dropped out.
    ///
    /// # Safety
    ///
    /// Owner-thread only; `payload` must be an occupied, finalized slot
    /// of one of this pool's shards.
    unsafe fn reclaim_slot(&self, payload: NonNull<u8>) {
        // SAFETY: occupied slots carry their shard identity.
        let shard = unsafe { slab::owner_of(payload) }.cast::<Shard<B>>();
        // SAFETY: shard identities always point at live shards.
        let shard = unsafe { &*shard };
        debug_assert!(ptr::addr_eq(shard.owner.as_ptr(), &self.header));
        // SAFETY: the payload belongs to this shard's slab.
        unsafe { shard.slab.deallocate(payload) };
        self.link_spare(shard.index);
    }

    /// Defers reclamation of an already finalized slot to the owning
    /// thread. The only pool operation foreign threads may perform.
    pub(crate) fn push_remote(&self, payload: NonNull<u8>) {
        self.header.remote_free.push(RemoteSlot(payload));
    }

    /// Drains the deallocation channel in bounded batches, reclaiming
    /// each slot. The finalizers already ran on the freeing threads.
    ///
    /// # Safety
    ///
    /// The calling thread must own the pool.
    pub(crate) unsafe fn collect(&self) {
        loop {
            let mut batch = 0;
            while let Some(RemoteSlot(payload)) = self.header.remote_free.pop() {
                // SAFETY: the freeing thread finalized the payload and
                // handed the slot back through the channel.
                unsafe { self.reclaim_slot(payload) };
                batch += 1;
                if batch == COLLECT_BATCH {
                    break;
                }
            }
            if batch < COLLECT_BATCH {
                return;
            }
        }
    }

    /// Finalizes and reclaims every occupied slot of shard `index`.
    ///
    /// Occupancy is re-read per slot, so finalizers that recursively
    /// release into this pool do not get their slots finalized twice.
    ///
    /// # Safety
    ///
    /// Owner-thread only; nothing may reference the shard's payloads.
    unsafe fn sweep_shard(&self, index: usize) {
        // SAFETY: in bounds, on the owning thread.
        let shard = unsafe { self.shard(index) };
        for slot in 0..shard.slab.slot_count() {
            if shard.slab.is_occupied(slot) {
                let payload = shard.slab.payload_ptr(slot);
                // SAFETY: occupancy is exact; the slot holds a live `T`.
                unsafe { ptr::drop_in_place(payload.cast::<T>().as_ptr()) };
                // SAFETY: finalized above.
                unsafe { shard.slab.deallocate(payload) };
            }
        }
    }

    /// Drains the channel, finalizes every live payload and resets every
    /// shard, relinking the whole chain.
    ///
    /// O(total shard capacity), unlike `alloc`/release which are O(1)
    /// amortized — keep it out of hot loops. Calling it twice in a row is
    /// a no-op the second time.
    ///
    /// # Safety
    ///
    /// Owner-thread only, and no handle or raw payload pointer into this
    /// pool may be live.
    pub(crate) unsafe fn clear(&self) {
        // SAFETY: forwarded contract.
        unsafe { self.collect() };
        // SAFETY: owner-thread only.
        let count = unsafe { (*self.shards.get()).len() };
        for index in (0..count).rev() {
            // SAFETY: forwarded contract.
            unsafe { self.sweep_shard(index) };
            // SAFETY: in bounds, on the owning thread.
            let shard = unsafe { self.shard(index) };
            shard.slab.reclaim_all();
            self.link_spare(index);
        }
    }

    #[cfg(test)]
    fn shard_count(&self) -> usize {
        // SAFETY: tests run on the owning thread.
        unsafe { (*self.shards.get()).len() }
    }
}

impl<T, B: BaseAlloc> Drop for Pool<T, B> {
    fn drop(&mut self) {
        // Claim the pool for the final pass, so finalizers that
        // recursively release into it take the local path and mark their
        // slots as reclaimed.
        self.header.owner.store(thread_tag(), Relaxed);
        // SAFETY: exclusive access; remote slots are reclaimed first so
        // the sweep below cannot finalize them a second time.
        unsafe { self.collect() };
        let count = self.shards.get_mut().len();
        for index in 0..count {
            // SAFETY: dropping the pool means nothing references it.
            unsafe { self.sweep_shard(index) };
        }
        for shard in self.shards.get_mut().drain(..) {
            // SAFETY: shards are exclusively owned, leaked boxes.
            drop(unsafe { Box::from_raw(shard.as_ptr()) });
        }
    }
}

/// An owning handle to a pool-allocated `T`.
///
/// Dropping the handle releases the object. On the pool's owning thread
/// the slot is reclaimed immediately; on any other thread the value is
/// finalized in place — so the dropping thread observes it as destroyed —
/// and the raw slot is pushed onto the owner's deallocation channel, to
/// be reclaimed the next time the owner drains it. Consequently a slot
/// freed from a foreign thread is not necessarily reusable before the
/// owner's next allocation.
#[must_use = "dropping a pool box immediately releases the object"]
pub struct PoolBox<'p, T, B: BaseAlloc = Sys> {
    ptr: NonNull<T>,
    _marker: PhantomData<&'p Pool<T, B>>,
}

// SAFETY: the handle owns its `T`; releasing from another thread goes
// through the owner's lock-free channel.
unsafe impl<T: Send, B: BaseAlloc> Send for PoolBox<'_, T, B> {}
// SAFETY: shared access only exposes `&T`.
unsafe impl<T: Sync, B: BaseAlloc> Sync for PoolBox<'_, T, B> {}

impl<'p, T, B: BaseAlloc> PoolBox<'p, T, B> {
    pub(crate) fn new(ptr: NonNull<T>) -> Self {
        PoolBox { ptr, _marker: PhantomData }
    }

    /// Releases ownership of the slot without finalizing or reclaiming
    /// it. The object stays live until [`from_raw`](Self::from_raw)
    /// rebuilds the handle, the pool is cleared, or the runtime teardown
    /// sweep finalizes whatever is left.
    pub fn into_raw(this: Self) -> NonNull<T> {
        let ptr = this.ptr;
        core::mem::forget(this);
        ptr
    }

    /// Rebuilds a handle from [`into_raw`](Self::into_raw).
    ///
    /// # Safety
    ///
    /// `ptr` must come from `into_raw` of a handle with identical generic
    /// parameters, the object must still be live, and ownership must not
    /// be duplicated.
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        PoolBox { ptr, _marker: PhantomData }
    }
}

impl<T, B: BaseAlloc> Deref for PoolBox<'_, T, B> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the handle owns a live payload.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T, B: BaseAlloc> DerefMut for PoolBox<'_, T, B> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the handle owns a live payload exclusively.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T: fmt::Debug, B: BaseAlloc> fmt::Debug for PoolBox<'_, T, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

impl<T, B: BaseAlloc> Drop for PoolBox<'_, T, B> {
    fn drop(&mut self) {
        // SAFETY: the payload was produced by `Pool::<T, B>::alloc`, and
        // the pool outlives `'p`.
        let pool = unsafe { Pool::<T, B>::of(self.ptr.cast()).as_ref() };
        if pool.is_local() {
            // SAFETY: a live payload of a pool owned by this thread.
            unsafe { pool.dealloc_local(self.ptr) };
        } else {
            // Finalize immediately so the freeing thread observes the
            // object as destroyed; only the slot travels back home.
            // SAFETY: the handle exclusively owns the payload.
            unsafe { ptr::drop_in_place(self.ptr.as_ptr()) };
            pool.push_remote(self.ptr.cast());
        }
    }
}
