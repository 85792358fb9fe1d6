use crate::latch::Latch;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

struct ListenerNode {
    latch: Arc<Latch>,
    next: *mut ListenerNode,
}

/// Latches of transactions blocked on a reference.
///
/// Registration pushes onto an immutable linked list; a committing writer
/// detaches the whole list with one swap and becomes its only owner, so nodes
/// are never shared after they leave the list.
pub(crate) struct Listeners {
    head: AtomicPtr<ListenerNode>,
}

impl Listeners {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Register `latch`, freeing latches that were opened since they were pushed.
    ///
    /// The still waiting latches are off the list while they are filtered, so
    /// a writer detaching it meanwhile misses them. Callers re-check the
    /// version after pushing and open everything when it moved.
    pub(crate) fn push(&self, latch: Arc<Latch>) {
        let mut waiting = self.take();
        waiting.prune_opened();
        let node = Box::into_raw(Box::new(ListenerNode {
            latch,
            next: std::mem::replace(&mut waiting.0, ptr::null_mut()),
        }));

        let mut tail = node;
        // SAFETY: the chain from `node` is exclusively ours until the CAS publishes it.
        unsafe {
            while !(*tail).next.is_null() {
                tail = (*tail).next;
            }
        }

        let mut current = self.head.load(Ordering::SeqCst);
        loop {
            // SAFETY: see above.
            unsafe { (*tail).next = current };
            match self
                .head
                .compare_exchange_weak(current, node, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Detach every registered latch.
    pub(crate) fn take(&self) -> DetachedListeners {
        if self.head.load(Ordering::SeqCst).is_null() {
            return DetachedListeners(ptr::null_mut());
        }
        DetachedListeners(self.head.swap(ptr::null_mut(), Ordering::SeqCst))
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::SeqCst).is_null()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let mut len = 0;
        let mut node = self.head.load(Ordering::SeqCst);
        while !node.is_null() {
            len += 1;
            // SAFETY: tests only walk a list no other thread touches.
            node = unsafe { (*node).next };
        }
        len
    }
}

impl Drop for Listeners {
    fn drop(&mut self) {
        drop(self.take());
    }
}

/// Listener chain removed from a reference, owned by the remover.
pub(crate) struct DetachedListeners(*mut ListenerNode);

// SAFETY: the chain is exclusively owned once detached and `Arc<Latch>` is Send.
unsafe impl Send for DetachedListeners {}

impl DetachedListeners {
    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_null()
    }

    fn prune_opened(&mut self) {
        let mut link: *mut *mut ListenerNode = &mut self.0;
        // SAFETY: the chain is exclusively owned and every node came from `Box::into_raw`.
        unsafe {
            while !(*link).is_null() {
                let node = *link;
                if (*node).latch.is_open() {
                    *link = (*node).next;
                    drop(Box::from_raw(node));
                } else {
                    link = &mut (*node).next;
                }
            }
        }
    }

    /// Open every latch in the chain and free it.
    pub(crate) fn open_all(mut self) -> usize {
        let mut opened = 0;
        let mut node = std::mem::replace(&mut self.0, ptr::null_mut());
        while !node.is_null() {
            // SAFETY: nodes come from `Box::into_raw` in `push` and are owned by this chain.
            let boxed = unsafe { Box::from_raw(node) };
            boxed.latch.open();
            opened += 1;
            node = boxed.next;
        }
        opened
    }
}

impl Drop for DetachedListeners {
    fn drop(&mut self) {
        let mut node = self.0;
        while !node.is_null() {
            // SAFETY: see `open_all`.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
        }
    }
}
