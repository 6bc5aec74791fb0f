//! Typed slot pools: per-type object allocation on fixed-size shards.
//!
//! High-churn object types pay the general-purpose allocator dearly. This
//! crate gives each (type, thread) pair its own growable pool of
//! fixed-size shards: allocation and release are O(1) amortized pointer
//! pushes, and an object created on one thread may be released on any
//! other — the value is finalized where it is dropped, while the slot
//! itself travels back to its owner through a lock-free channel.
//!
//! The moving parts, bottom up:
//!
//! - a *slab* carves one chunk of backing memory (see [`base`]) into
//!   equal slots threaded on an intrusive free list;
//! - a *pool* grows a per-type sequence of slabs ("shards"), chained so
//!   that a shard with capacity is found in O(1), and drains its
//!   deferred-free channel when an allocation finds the chain contended;
//! - a [`Context`] caches one pool per type for its thread, adopting
//!   pools recycled from exited threads and parking its own on exit;
//! - a [`Pools`] runtime registers every per-type manager and tears all
//!   of them down in one deterministic pass when dropped.
//!
//! # Examples
//!
//! ```
//! use slotpool::Pools;
//!
//! let pools = Pools::new();
//! let cx = pools.context();
//!
//! let mut message = cx.alloc(String::from("hello"))?;
//! message.push_str(", pool");
//! assert_eq!(&*message, "hello, pool");
//!
//! drop(message); // the slot is immediately reusable on this thread
//! # Ok::<(), slotpool::Error<slotpool::base::Sys>>(())
//! ```
//!
//! Handles are ordinary owners and may cross threads freely:
//!
//! ```
//! use slotpool::Pools;
//!
//! let pools = Pools::new();
//! std::thread::scope(|s| {
//!     let cx = pools.context();
//!     let value = cx.alloc(vec![1, 2, 3]).unwrap();
//!     s.spawn(move || drop(value)); // released from a foreign thread
//! });
//! drop(pools);
//! ```

pub mod base;
mod context;
mod pool;
mod runtime;
mod slab;

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

pub use self::{context::Context, pool::PoolBox, runtime::Pools};
use self::base::BaseAlloc;

/// The default number of slots carved into each new shard.
pub const DEFAULT_SHARD_SLOTS: usize = 64;

/// The minimum alignment every slot payload satisfies, regardless of the
/// payload type's own alignment.
pub const MIN_SLOT_ALIGN: usize = 4;

/// How many deferred frees are reclaimed per batch when a pool drains its
/// deallocation channel.
pub(crate) const COLLECT_BATCH: usize = 16;

/// Tuning knobs of a [`Pools`] runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// The number of slots carved into each new shard.
    pub shard_slots: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config { shard_slots: DEFAULT_SHARD_SLOTS }
    }
}

/// The error type of pool operations.
pub enum Error<B: BaseAlloc> {
    /// The base error returned when allocating shard memory failed.
    Alloc(B::Error),
}

impl<B: BaseAlloc> fmt::Debug for Error<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Alloc(err) => f.debug_tuple("Alloc").field(err).finish(),
        }
    }
}

impl<B: BaseAlloc> fmt::Display for Error<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Alloc(err) => write!(f, "base allocation failed: {err}"),
        }
    }
}

impl<B: BaseAlloc> std::error::Error for Error<B> {}

/// A process-unique identity of the calling thread.
///
/// Pools record the tag of their owning thread; a release compares that
/// record against the dropping thread's tag to classify itself as local
/// or foreign. Zero is reserved for "parked, no owner".
pub(crate) fn thread_tag() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TAG: u64 = NEXT.fetch_add(1, Relaxed);
    }
    TAG.with(|tag| *tag)
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering::Relaxed},
    };
    use std::thread;

    use crate::{Config, PoolBox, Pools, base::Sys};

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Relaxed);
        }
    }

    fn addr<T>(value: &T) -> usize {
        value as *const T as usize
    }

    #[test]
    fn foreign_release_finalizes_once_and_the_slot_comes_home() {
        let drops = Arc::new(AtomicUsize::new(0));
        // One-slot shards force the next allocation to drain the channel.
        let pools = Pools::with_config(Sys, Config { shard_slots: 1 });
        let cx = pools.context();

        let handle = cx.alloc(Counted(drops.clone())).unwrap();
        let vacated = addr(&*handle);

        thread::scope(|s| {
            s.spawn(move || drop(handle));
        });
        // The finalizer ran exactly once, on the foreign thread.
        assert_eq!(drops.load(Relaxed), 1);

        // The slot is reusable here once the owner reclaims it.
        let next = cx.alloc(Counted(drops.clone())).unwrap();
        assert_eq!(addr(&*next), vacated);
        drop(next);
        assert_eq!(drops.load(Relaxed), 2);
    }

    #[test]
    fn objects_move_across_threads_and_back() {
        let pools = Pools::with_config(Sys, Config { shard_slots: 2 });
        let cx = pools.context();

        let first = cx.alloc(String::from("first")).unwrap();
        let second = cx.alloc(String::from("second")).unwrap();
        let (a, b) = (addr(&*first), addr(&*second));

        thread::scope(|s| {
            s.spawn(move || {
                drop(first);
                drop(second);
            });
        });

        // Both vacated slots are reused once the shard looks full.
        let third = cx.alloc(String::from("third")).unwrap();
        let fourth = cx.alloc(String::from("fourth")).unwrap();
        let reused = [addr(&*third), addr(&*fourth)];
        assert!(reused.contains(&a) && reused.contains(&b));
    }

    #[test]
    fn exited_threads_donate_their_pools() {
        let pools = Pools::new();
        let donated = thread::scope(|s| {
            s.spawn(|| {
                let cx = pools.context();
                let value = cx.alloc(11u64).unwrap();
                let donated = addr(&*value);
                drop(value);
                donated
                // The context drops here, parking its pool.
            })
            .join()
            .unwrap()
        });

        // A fresh thread context adopts the parked pool instead of
        // building one: the very same slot address comes back.
        let cx = pools.context();
        let value = cx.alloc(17u64).unwrap();
        assert_eq!(addr(&*value), donated);
    }

    #[test]
    fn teardown_finalizes_leaked_objects_of_every_type() {
        struct Other(Counted);

        let drops = Arc::new(AtomicUsize::new(0));
        let pools = Pools::new();
        {
            let cx = pools.context();
            for _ in 0..5 {
                PoolBox::into_raw(cx.alloc(Counted(drops.clone())).unwrap());
            }
            PoolBox::into_raw(cx.alloc(Other(Counted(drops.clone()))).unwrap());
        }
        assert_eq!(drops.load(Relaxed), 0);
        drop(pools);
        assert_eq!(drops.load(Relaxed), 6);
    }

    #[test]
    fn raw_round_trips_release_normally() {
        let drops = Arc::new(AtomicUsize::new(0));
        let pools = Pools::new();
        let cx = pools.context();

        let raw = PoolBox::into_raw(cx.alloc(Counted(drops.clone())).unwrap());
        assert_eq!(drops.load(Relaxed), 0);
        // SAFETY: `raw` came from `into_raw` and is still live.
        drop(unsafe { PoolBox::<'_, Counted, Sys>::from_raw(raw) });
        assert_eq!(drops.load(Relaxed), 1);
        drop(cx);
        drop(pools);
        assert_eq!(drops.load(Relaxed), 1);
    }

    #[test]
    fn clearing_a_pool_finalizes_everything_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let pools = Pools::with_config(Sys, Config { shard_slots: 4 });
        let cx = pools.context();

        for _ in 0..9 {
            PoolBox::into_raw(cx.alloc(Counted(drops.clone())).unwrap());
        }
        // SAFETY: every handle was surrendered via `into_raw` above.
        unsafe { cx.clear::<Counted>() };
        assert_eq!(drops.load(Relaxed), 9);
        // SAFETY: as above; nothing is live anymore.
        unsafe { cx.clear::<Counted>() };
        assert_eq!(drops.load(Relaxed), 9);
    }

    #[test]
    fn primitive_and_zero_sized_payloads() {
        let pools = Pools::new();
        let cx = pools.context();

        let int = cx.alloc(12i32).unwrap();
        let ch = cx.alloc('E').unwrap();
        let unit = cx.alloc(()).unwrap();
        assert_eq!((*int, *ch), (12, 'E'));
        assert_eq!(addr(&*int) % align_of::<i32>(), 0);
        drop((int, ch, unit));
    }

    #[test]
    fn randomized_cross_thread_churn() {
        const THREADS: usize = 4;
        const ITERS: usize = if cfg!(miri) { 200 } else { 5_000 };
        const MAILBOXES: usize = 32;

        struct Payload {
            value: u64,
            cookie: u64,
        }

        const COOKIE: u64 = 0xbf58476d1ce4e5b9;

        impl Payload {
            fn new(value: u64) -> Self {
                Payload { value, cookie: value ^ COOKIE }
            }
        }

        impl Drop for Payload {
            fn drop(&mut self) {
                assert_eq!(self.cookie, self.value ^ COOKIE, "payload corrupted");
            }
        }

        let pools = Pools::with_config(Sys, Config { shard_slots: 8 });
        let mailboxes: Vec<Mutex<Option<PoolBox<Payload>>>> =
            (0..MAILBOXES).map(|_| Mutex::new(None)).collect();

        thread::scope(|s| {
            for tid in 0..THREADS {
                let pools = &pools;
                let mailboxes = &mailboxes;
                s.spawn(move || {
                    let mut rng = fastrand::Rng::with_seed(0x5eed + tid as u64);
                    let cx = pools.context();
                    let mut local = Vec::new();
                    for i in 0..ITERS {
                        let value = (tid * ITERS + i) as u64;
                        local.push(cx.alloc(Payload::new(value)).unwrap());

                        if rng.u8(..100) < 60 && !local.is_empty() {
                            let index = rng.usize(..local.len());
                            local.swap_remove(index);
                        }
                        if rng.u8(..100) < 25 && !local.is_empty() {
                            // Trade a local object against whatever some
                            // other thread left in the mailbox.
                            let index = rng.usize(..local.len());
                            let slot = &mailboxes[rng.usize(..MAILBOXES)];
                            let outgoing = local.swap_remove(index);
                            if let Some(incoming) =
                                slot.lock().unwrap().replace(outgoing)
                            {
                                drop(incoming);
                            }
                        }
                        if rng.u8(..100) < 5 {
                            cx.collect::<Payload>();
                        }
                    }
                });
            }
        });

        drop(mailboxes);
        drop(pools);
    }

    #[test]
    fn handles_are_plain_owners() {
        let pools = Pools::new();
        let cx = pools.context();
        let mut value = cx.alloc(vec![1u8, 2, 3]).unwrap();
        value.push(4);
        assert_eq!(value.len(), 4);
        assert_eq!(format!("{value:?}"), "[1, 2, 3, 4]");

        let raw: NonNull<Vec<u8>> = PoolBox::into_raw(value);
        // SAFETY: freshly surrendered, still live.
        let value = unsafe { PoolBox::<'_, Vec<u8>, Sys>::from_raw(raw) };
        assert_eq!(*value, [1, 2, 3, 4]);
    }

    #[cfg(feature = "base-mmap")]
    #[test]
    fn pools_run_on_the_mmap_base() {
        use crate::base::Mmap;

        let pools = Pools::with_base(Mmap);
        let cx = pools.context();
        let value = cx.alloc([7u64; 16]).unwrap();
        assert_eq!(value[15], 7);
        let vacated = addr(&*value);
        drop(value);
        let next = cx.alloc([9u64; 16]).unwrap();
        assert_eq!(addr(&*next), vacated);
    }
}
