//! Lock-free LIFO free list
//!
//! A Treiber stack: the head pointer is swapped with CAS on both push and pop.
//! Popped nodes are handed to the epoch collector instead of being freed in
//! place, so a thread that loaded the old head can still read its `next`
//! safely and a recycled address cannot satisfy a stale CAS.

use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::Ordering;

use crossbeam::epoch::{self, Atomic, Owned};

struct Node<T> {
    item: ManuallyDrop<T>,
    next: Atomic<Node<T>>,
}

pub struct FreeList<T> {
    head: Atomic<Node<T>>,
}

impl<T> Default for FreeList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FreeList<T> {
    pub fn new() -> Self {
        Self {
            head: Atomic::null(),
        }
    }

    pub fn push(&self, item: T) {
        let mut node = Owned::new(Node {
            item: ManuallyDrop::new(item),
            next: Atomic::null(),
        });
        let guard = epoch::pin();
        loop {
            let head = self.head.load(Ordering::Relaxed, &guard);
            node.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange(head, node, Ordering::Release, Ordering::Relaxed, &guard)
            {
                Ok(_) => return,
                Err(e) => node = e.new,
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let guard = epoch::pin();
        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            // SAFETY: nodes are only destroyed through `defer_destroy`, so a
            // pointer loaded under this guard stays valid until it is dropped
            let node = unsafe { head.as_ref() }?;
            let next = node.next.load(Ordering::Relaxed, &guard);
            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed, &guard)
                .is_ok()
            {
                // SAFETY: the successful CAS unlinked `head`, so this thread is
                // the only one that will take the item out; the node itself is
                // freed later without dropping the item again
                unsafe {
                    let item = ptr::read(&*node.item);
                    guard.defer_destroy(head);
                    return Some(item);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        self.head.load(Ordering::Acquire, &guard).is_null()
    }
}

impl<T> Drop for FreeList<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}
