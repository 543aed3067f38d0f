//! A mutex container like `std::sync::Mutex<T>`, parameterized over any `L`
//! implementing [`Lock`] so the arena works without `std`.

use core::{
    cell::{Cell, UnsafeCell},
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// A trait for providing mutual exclusion.
///
/// For an arena that never leaves its thread, use [`SingleThreadedLock`],
/// the moral equivalent of a `RefCell`. To share an arena between an injector
/// and a reporter thread, use [`SpinLock`].
///
/// # Safety
///
/// * If the implementation type is `Sync`, then an arena using this lock will
///   be `Sync`, and therefore this must provide actual mutual exclusion.
///
/// * Even in single-threaded contexts, this type must prevent re-entering the
///   lock while it is held. The prevention may be a panic, abort, infinite
///   loop, or etc...
pub unsafe trait Lock {
    /// Lock this mutex.
    ///
    /// If it is already locked, this must not succeed until it is unlocked,
    /// or never.
    fn lock(&self);

    /// Unlock this mutex.
    fn unlock(&self);
}

/// A single-threaded implementation of [`Lock`] that panics on re-entry.
#[derive(Debug)]
pub struct SingleThreadedLock {
    locked: Cell<bool>,
}

unsafe impl Lock for SingleThreadedLock {
    #[inline]
    fn lock(&self) {
        assert!(!self.locked.get(), "arena lock re-entered");
        self.locked.set(true);
    }

    #[inline]
    fn unlock(&self) {
        assert!(self.locked.get());
        self.locked.set(false);
    }
}

impl Default for SingleThreadedLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl SingleThreadedLock {
    /// Construct a new `SingleThreadedLock`.
    #[inline]
    pub const fn new() -> Self {
        SingleThreadedLock {
            locked: Cell::new(false),
        }
    }
}

/// A test-and-test-and-set spin lock.
///
/// Re-entering it from the thread that holds it spins forever.
#[derive(Debug, Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    /// Construct a new, unlocked `SpinLock`.
    #[inline]
    pub const fn new() -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
        }
    }
}

unsafe impl Lock for SpinLock {
    #[inline]
    fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    #[inline]
    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

pub(super) struct Mutex<T, L> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: if `T` and `L` can be sent between threads, then the mutex can as
// well.
unsafe impl<T, L> Send for Mutex<T, L>
where
    T: Send,
    L: Send,
{
}

// Safety: upheld by the `Lock` trait's implementation contract. `T` must be
// `Send` because a guard taken on another thread hands out `&mut T`.
unsafe impl<T, L> Sync for Mutex<T, L>
where
    T: Send,
    L: Sync + Lock,
{
}

impl<T, L> Mutex<T, L>
where
    L: Lock,
{
    pub(super) const fn new(value: T, lock: L) -> Self {
        let value = UnsafeCell::new(value);
        Mutex { lock, value }
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, T, L> {
        self.lock.lock();
        MutexGuard { mutex: self }
    }
}

pub(super) struct MutexGuard<'a, T, L>
where
    L: Lock,
{
    mutex: &'a Mutex<T, L>,
}

impl<T, L> Drop for MutexGuard<'_, T, L>
where
    L: Lock,
{
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

impl<T, L> Deref for MutexGuard<'_, T, L>
where
    L: Lock,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // Safety: the lock is held for the guard's lifetime.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, L> DerefMut for MutexGuard<'_, T, L>
where
    L: Lock,
{
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: the lock is held for the guard's lifetime, and the guard is
        // borrowed mutably.
        unsafe { &mut *self.mutex.value.get() }
    }
}
