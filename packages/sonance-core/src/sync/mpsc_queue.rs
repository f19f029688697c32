//! Intrusive multi-producer single-consumer queue.
//!
//! Based on Dmitry Vyukov's non-blocking MPSC algorithm: producers exchange
//! the tail pointer and link the previous node, the consumer walks the list
//! from the head. Provides sequential consistency.
//!
//! Nodes are embedded in the carried objects ([`MpscNode`] field exposed via
//! [`HasMpscNode`]), so a push never allocates. The queue holds one strong
//! reference to every queued object and releases it on pop or drop. Each node
//! tracks its owning queue with a pointer CAS, which doubles as a double-push
//! detector.
//!
//! `push` is lock-free (wait-free on architectures with a native atomic
//! exchange). `try_pop` is wait-free but may miss a node while a concurrent
//! push is between its two stores; `pop` spins for that store instead. Pop
//! methods must only be called from one thread at a time.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, Ordering};
use std::sync::Arc;

/// How long `pop` busy-spins on a half-finished push before yielding the
/// thread. The window between the two stores of a push is a few instructions,
/// so this is expected to be microsecond-range at worst. Tunable.
const SPINS_BEFORE_YIELD: usize = 1024;

/// Queue hook embedded into objects carried by [`MpscQueue`].
#[derive(Debug)]
pub struct MpscNode {
    next: AtomicPtr<MpscNode>,
    /// Queue this node is currently linked into, null when detached.
    owner: AtomicPtr<()>,
    /// Pointer back to the object containing this node, set on push.
    container: AtomicPtr<()>,
}

impl MpscNode {
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            owner: AtomicPtr::new(ptr::null_mut()),
            container: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl Default for MpscNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Implemented by objects that can be linked into an [`MpscQueue`].
pub trait HasMpscNode: Send + Sync {
    /// Returns the embedded queue hook.
    fn mpsc_node(&self) -> &MpscNode;
}

/// Thread-safe intrusive MPSC queue of `Arc<T>`.
pub struct MpscQueue<T: HasMpscNode> {
    tail: AtomicPtr<MpscNode>,
    head: AtomicPtr<MpscNode>,
    /// Keeps `head` non-null when the queue is empty. Boxed for a stable
    /// address.
    stub: Box<MpscNode>,
    _marker: PhantomData<fn(Arc<T>) -> Arc<T>>,
}

unsafe impl<T: HasMpscNode> Send for MpscQueue<T> {}
unsafe impl<T: HasMpscNode> Sync for MpscQueue<T> {}

impl<T: HasMpscNode> MpscQueue<T> {
    pub fn new() -> Self {
        let stub = Box::new(MpscNode::new());
        let stub_ptr = &*stub as *const MpscNode as *mut MpscNode;
        Self {
            tail: AtomicPtr::new(stub_ptr),
            head: AtomicPtr::new(stub_ptr),
            stub,
            _marker: PhantomData,
        }
    }

    fn stub_ptr(&self) -> *mut MpscNode {
        &*self.stub as *const MpscNode as *mut MpscNode
    }

    /// Adds an object to the end of the queue.
    ///
    /// Can be called concurrently from any number of threads. After this call
    /// returns, any subsequent `pop` is guaranteed to observe a non-empty
    /// queue (`try_pop` can still give up if it races a concurrent push).
    ///
    /// Panics if the object is already linked into a queue.
    pub fn push(&self, obj: Arc<T>) {
        let obj_ptr = Arc::into_raw(obj);
        let node = unsafe { (*obj_ptr).mpsc_node() as *const MpscNode as *mut MpscNode };

        unsafe {
            if (*node)
                .owner
                .compare_exchange(
                    ptr::null_mut(),
                    self as *const Self as *mut (),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                panic!("mpsc queue: attempt to push node that is already in a queue");
            }
            (*node)
                .container
                .store(obj_ptr as *mut (), Ordering::Relaxed);

            self.push_node(node);
        }
    }

    /// Removes the object at the head of the queue, non-blocking.
    ///
    /// Returns `None` when the queue is empty, and may return `None` even on
    /// a non-empty queue if a concurrent push has not finished publishing.
    /// Must not be called concurrently with another pop.
    pub fn try_pop(&self) -> Option<Arc<T>> {
        unsafe { self.pop_node(false).map(|node| self.detach(node)) }
    }

    /// Removes the object at the head of the queue, spinning through any
    /// half-finished concurrent push.
    ///
    /// Returns `None` only when the queue is empty. Must not be called
    /// concurrently with another pop.
    pub fn pop(&self) -> Option<Arc<T>> {
        unsafe { self.pop_node(true).map(|node| self.detach(node)) }
    }

    unsafe fn detach(&self, node: *mut MpscNode) -> Arc<T> {
        if (*node)
            .owner
            .compare_exchange(
                self as *const Self as *mut (),
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            panic!("mpsc queue: unexpected node owner on pop");
        }

        let obj_ptr = (*node).container.load(Ordering::Relaxed) as *const T;
        Arc::from_raw(obj_ptr)
    }

    unsafe fn push_node(&self, node: *mut MpscNode) {
        (*node).next.store(ptr::null_mut(), Ordering::Relaxed);

        let prev = self.tail.swap(node, Ordering::SeqCst);

        (*prev).next.store(node, Ordering::Release);
    }

    unsafe fn pop_node(&self, can_spin: bool) -> Option<*mut MpscNode> {
        let mut head = self.head.load(Ordering::Relaxed);
        let mut next = (*head).next.load(Ordering::Acquire);

        if head == self.stub_ptr() {
            if next.is_null() {
                if self.tail.load(Ordering::SeqCst) == head {
                    // queue is empty
                    return None;
                }
                // non-empty with a null next: a push is in progress
                next = if can_spin {
                    self.wait_next(head)
                } else {
                    self.try_wait_next(head)?
                };
            }
            // unlink the stub from the beginning of the list
            self.head.store(next, Ordering::Relaxed);
            head = next;
            next = (*next).next.load(Ordering::Acquire);
        }

        if next.is_null() {
            if self.tail.load(Ordering::SeqCst) == head {
                // queue is about to become empty: re-add the stub so that
                // head always has a successor and never becomes null
                self.push_node(self.stub_ptr());
            }

            next = if can_spin {
                self.wait_next(head)
            } else {
                match self.try_wait_next(head) {
                    Some(next) => next,
                    None => return None,
                }
            };
        }

        self.head.store(next, Ordering::Relaxed);

        Some(head)
    }

    unsafe fn wait_next(&self, node: *mut MpscNode) -> *mut MpscNode {
        if let Some(next) = self.try_wait_next(node) {
            return next;
        }
        let mut spins = 0usize;
        loop {
            let next = (*node).next.load(Ordering::SeqCst);
            if !next.is_null() {
                return next;
            }
            spins += 1;
            if spins % SPINS_BEFORE_YIELD == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    unsafe fn try_wait_next(&self, node: *mut MpscNode) -> Option<*mut MpscNode> {
        for _ in 0..3 {
            let next = (*node).next.load(Ordering::Acquire);
            if !next.is_null() {
                return Some(next);
            }
        }
        fence(Ordering::SeqCst);
        None
    }
}

impl<T: HasMpscNode> Default for MpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: HasMpscNode> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        // release the queue's reference to every remaining object
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Item {
        value: usize,
        node: MpscNode,
    }

    impl Item {
        fn new(value: usize) -> Arc<Self> {
            Arc::new(Self {
                value,
                node: MpscNode::new(),
            })
        }
    }

    impl HasMpscNode for Item {
        fn mpsc_node(&self) -> &MpscNode {
            &self.node
        }
    }

    #[test]
    fn push_pop_fifo() {
        let queue = MpscQueue::new();
        for i in 0..100 {
            queue.push(Item::new(i));
        }
        for i in 0..100 {
            assert_eq!(queue.pop().expect("non-empty").value, i);
        }
        assert!(queue.pop().is_none());
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn pop_empty_then_refill() {
        let queue = MpscQueue::new();
        assert!(queue.pop().is_none());
        queue.push(Item::new(7));
        assert_eq!(queue.pop().unwrap().value, 7);
        assert!(queue.pop().is_none());
        queue.push(Item::new(8));
        assert_eq!(queue.pop().unwrap().value, 8);
    }

    #[test]
    fn queue_holds_reference_until_pop() {
        let queue = MpscQueue::new();
        let item = Item::new(3);
        queue.push(Arc::clone(&item));
        assert_eq!(Arc::strong_count(&item), 2);
        let popped = queue.pop().unwrap();
        assert!(Arc::ptr_eq(&item, &popped));
        drop(popped);
        assert_eq!(Arc::strong_count(&item), 1);
    }

    #[test]
    fn drop_releases_queued_objects() {
        let item = Item::new(1);
        {
            let queue = MpscQueue::new();
            queue.push(Arc::clone(&item));
            assert_eq!(Arc::strong_count(&item), 2);
        }
        assert_eq!(Arc::strong_count(&item), 1);
    }

    #[test]
    #[should_panic(expected = "already in a queue")]
    fn double_push_panics() {
        let queue = MpscQueue::new();
        let item = Item::new(1);
        queue.push(Arc::clone(&item));
        queue.push(item);
    }

    #[test]
    fn concurrent_producers_single_consumer() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 2000;

        let queue = Arc::new(MpscQueue::new());
        let popped = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for p in 0..PRODUCERS {
                let queue = Arc::clone(&queue);
                scope.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.push(Item::new(p * PER_PRODUCER + i));
                    }
                });
            }

            let consumer_queue = Arc::clone(&queue);
            let consumer_popped = Arc::clone(&popped);
            scope.spawn(move || {
                let mut last_seen = vec![None::<usize>; PRODUCERS];
                let mut count = 0;
                while count < PRODUCERS * PER_PRODUCER {
                    if let Some(item) = consumer_queue.pop() {
                        let producer = item.value / PER_PRODUCER;
                        let seq = item.value % PER_PRODUCER;
                        // per-producer order must be preserved
                        if let Some(prev) = last_seen[producer] {
                            assert!(seq > prev, "per-producer order violated");
                        }
                        last_seen[producer] = Some(seq);
                        count += 1;
                    } else {
                        std::hint::spin_loop();
                    }
                }
                consumer_popped.store(count, Ordering::SeqCst);
            });
        });

        assert_eq!(popped.load(Ordering::SeqCst), PRODUCERS * PER_PRODUCER);
        assert!(queue.pop().is_none());
    }
}
