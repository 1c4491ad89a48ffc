//! Global allocator hook that charges every heap allocation to the calling
//! thread's active tracker.
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOC: TrackingAllocator = TrackingAllocator::new(std::alloc::System);
//! ```
//!
//! Rust aborts the process when a global allocator returns null, so a budget
//! violation never fails the allocation itself. The memory is handed out, the
//! debit stays on the tracker until it is freed, and the violation is parked for
//! the thread's next [`check_budget`](crate::context::check_budget).
//!
//! While a tracker is being charged it is taken out of the thread slot (via
//! [`TrackingPause`]), so anything the accounting path allocates on its own is
//! not charged to anyone.

#![allow(unsafe_code)]

use std::alloc::{GlobalAlloc, Layout, System};

use crate::context;
use crate::guard::TrackingPause;

pub struct TrackingAllocator<A = System> {
    inner: A,
}

impl<A> TrackingAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

#[inline]
fn account_alloc(size: i64) {
    let pause = TrackingPause::new();
    if let Some(tracker) = pause.paused_tracker() {
        if let Err(err) = tracker.alloc(size) {
            context::park_exceeded(err);
        }
    }
}

#[inline]
fn account_free(size: i64) {
    let pause = TrackingPause::new();
    if let Some(tracker) = pause.paused_tracker() {
        tracker.free(size);
    }
}

#[inline]
fn account_realloc(old_size: i64, new_size: i64) {
    let pause = TrackingPause::new();
    if let Some(tracker) = pause.paused_tracker() {
        if let Err(err) = tracker.realloc(old_size, new_size) {
            context::park_exceeded(err);
        }
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for TrackingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size() as i64;
        account_alloc(size);
        let ptr = unsafe { self.inner.alloc(layout) };
        if ptr.is_null() {
            account_free(size);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let size = layout.size() as i64;
        account_alloc(size);
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };
        if ptr.is_null() {
            account_free(size);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { self.inner.dealloc(ptr, layout) };
        account_free(layout.size() as i64);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let (old_size, new_size_i) = (layout.size() as i64, new_size as i64);
        account_realloc(old_size, new_size_i);
        let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };
        if new_ptr.is_null() {
            // The old block is still live; take back only the delta.
            account_free(new_size_i - old_size);
        }
        new_ptr
    }
}
