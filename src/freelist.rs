//! Two-tier LIFO free lists.
//!
//! Free objects are threaded through `ListNode` carriers kept separate from
//! the payloads, so a bulk transfer between tiers never touches payload
//! memory. The global tier of every pool is a mutex-guarded `FreeList`
//! carrying the authoritative count; the per-thread tier is a plain
//! `FreeList` owned by the thread handle. Carriers come from a per-handle
//! `NodeCache` reservoir and are only returned to the heap when the owner is
//! dropped.
//!
use std::ptr;

/// Linked-list carrier for one free payload slot.
pub struct ListNode {
    pub payload: *mut u8,
    pub next: *mut ListNode,
}

/// Drop every carrier in the chain starting at `head` back to the heap.
pub fn free_nodes(mut head: *mut ListNode) {
    while !head.is_null() {
        unsafe {
            let next = (*head).next;
            drop(Box::from_raw(head));
            head = next;
        }
    }
}

/// Per-owner reservoir of carriers.
///
/// Popping an empty reservoir falls through to the heap; carriers pushed back
/// stay cached until the reservoir is dropped. Not `Send`: a reservoir
/// belongs to the thread (or worker) that owns it.
pub struct NodeCache {
    head: *mut ListNode,
}

impl NodeCache {
    pub fn new() -> NodeCache {
        NodeCache {
            head: ptr::null_mut(),
        }
    }

    /// Pop a carrier, heap-allocating a fresh one when the reservoir is
    /// empty.
    pub fn alloc(&mut self) -> *mut ListNode {
        if self.head.is_null() {
            return Box::into_raw(Box::new(ListNode {
                payload: ptr::null_mut(),
                next: ptr::null_mut(),
            }));
        }

        let node = self.head;
        unsafe {
            self.head = (*node).next;
            (*node).next = ptr::null_mut();
        }
        node
    }

    /// Return a carrier to the reservoir.
    pub fn free(&mut self, node: *mut ListNode) {
        unsafe {
            (*node).payload = ptr::null_mut();
            (*node).next = self.head;
        }
        self.head = node;
    }
}

impl Drop for NodeCache {
    fn drop(&mut self) {
        free_nodes(self.head);
        self.head = ptr::null_mut();
    }
}

/// A detached run of carriers, head through tail.
pub struct Chain {
    pub head: *mut ListNode,
    pub tail: *mut ListNode,
    pub len: u64,
}

impl Chain {
    pub fn empty() -> Chain {
        Chain {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }
}

/// Singly-linked LIFO stack of free objects of one kind.
///
/// `count` always equals the number of carriers reachable from `head`.
pub struct FreeList {
    head: *mut ListNode,
    count: u64,
}

unsafe impl Send for FreeList {}

impl FreeList {
    pub fn new() -> FreeList {
        FreeList {
            head: ptr::null_mut(),
            count: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Push one carrier onto the head.
    pub fn push(&mut self, node: *mut ListNode) {
        unsafe {
            (*node).next = self.head;
        }
        self.head = node;
        self.count += 1;
    }

    /// Pop the head carrier.
    pub fn pop(&mut self) -> Option<*mut ListNode> {
        if self.head.is_null() {
            return None;
        }

        let node = self.head;
        unsafe {
            self.head = (*node).next;
            (*node).next = ptr::null_mut();
        }
        self.count -= 1;
        Some(node)
    }

    /// Splice a detached chain onto the head.
    pub fn push_chain(&mut self, chain: Chain) {
        if chain.len == 0 {
            return;
        }

        unsafe {
            (*chain.tail).next = self.head;
        }
        self.head = chain.head;
        self.count += chain.len;
    }

    /// Detach up to `n` carriers from the head as one contiguous prefix.
    pub fn take_chain(&mut self, n: u64) -> Chain {
        let n = n.min(self.count);
        if n == 0 {
            return Chain::empty();
        }

        let head = self.head;
        let mut tail = head;
        unsafe {
            for _ in 1..n {
                tail = (*tail).next;
            }
            self.head = (*tail).next;
            (*tail).next = ptr::null_mut();
        }
        self.count -= n;

        Chain {
            head,
            tail,
            len: n,
        }
    }

    /// Detach the whole list. The carrier reached after `count` hops must
    /// terminate the chain.
    pub fn take_all(&mut self) -> Chain {
        let count = self.count;
        if count == 0 {
            return Chain::empty();
        }

        let head = self.head;
        let mut tail = head;
        unsafe {
            for _ in 1..count {
                tail = (*tail).next;
            }
            if !(*tail).next.is_null() {
                fatal!("free list tail has a successor, the stored count is stale");
            }
        }
        self.head = ptr::null_mut();
        self.count = 0;

        Chain {
            head,
            tail,
            len: count,
        }
    }

    /// Length by walking the links, for count-coherence audits.
    pub fn walk_len(&self) -> u64 {
        let mut len = 0;
        let mut node = self.head;
        while !node.is_null() {
            len += 1;
            node = unsafe { (*node).next };
        }
        len
    }

    /// True if some carrier in the list references `payload`.
    pub fn contains(&self, payload: *const u8) -> bool {
        let mut node = self.head;
        while !node.is_null() {
            unsafe {
                if (*node).payload as *const u8 == payload {
                    return true;
                }
                node = (*node).next;
            }
        }
        false
    }

    /// Release every carrier back to the heap, leaving the list empty. The
    /// payloads are untouched; their region owns them.
    pub fn clear(&mut self) {
        free_nodes(self.head);
        self.head = ptr::null_mut();
        self.count = 0;
    }
}

/// Thread a fresh free list over `count` objects of `stride` bytes starting
/// at `base`. Slots are pushed in address order, leaving the highest slot at
/// the head.
pub fn carve(base: *mut u8, stride: usize, count: u64, nodes: &mut NodeCache) -> Chain {
    let mut chain = Chain::empty();

    for i in 0..count {
        let node = nodes.alloc();
        unsafe {
            (*node).payload = base.add(i as usize * stride);
            (*node).next = chain.head;
        }
        if chain.tail.is_null() {
            chain.tail = node;
        }
        chain.head = node;
        chain.len += 1;
    }

    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payloads(list: &FreeList) -> Vec<usize> {
        let mut out = Vec::new();
        let mut node = list.head;
        while !node.is_null() {
            unsafe {
                out.push((*node).payload as usize);
                node = (*node).next;
            }
        }
        out
    }

    fn push_payload(list: &mut FreeList, nodes: &mut NodeCache, payload: usize) {
        let node = nodes.alloc();
        unsafe {
            (*node).payload = payload as *mut u8;
        }
        list.push(node);
    }

    #[test]
    fn test_lifo_order() {
        let mut nodes = NodeCache::new();
        let mut list = FreeList::new();

        for p in 1..=4 {
            push_payload(&mut list, &mut nodes, p);
        }
        assert_eq!(list.count(), 4);
        assert_eq!(list.walk_len(), 4);

        for expected in (1..=4).rev() {
            let node = list.pop().unwrap();
            assert_eq!(unsafe { (*node).payload } as usize, expected);
            nodes.free(node);
        }
        assert!(list.pop().is_none());
        assert!(list.is_empty());

        list.clear();
    }

    #[test]
    fn test_node_cache_recycles() {
        let mut nodes = NodeCache::new();

        let first = nodes.alloc();
        nodes.free(first);
        let second = nodes.alloc();

        assert_eq!(first, second);
        assert!(unsafe { (*second).payload }.is_null());
        nodes.free(second);
    }

    #[test]
    fn test_take_and_splice() {
        let mut nodes = NodeCache::new();
        let mut src = FreeList::new();
        let mut dst = FreeList::new();

        for p in 1..=6 {
            push_payload(&mut src, &mut nodes, p);
        }

        // head prefix [6, 5] moves, order preserved
        let chain = src.take_chain(2);
        assert_eq!(chain.len, 2);
        assert_eq!(src.count(), 4);
        assert_eq!(src.walk_len(), 4);

        dst.push_chain(chain);
        assert_eq!(payloads(&dst), vec![6, 5]);

        // taking more than available caps at the remainder
        let rest = src.take_chain(100);
        assert_eq!(rest.len, 4);
        dst.push_chain(rest);
        assert_eq!(payloads(&dst), vec![4, 3, 2, 1, 6, 5]);
        assert_eq!(dst.count(), dst.walk_len());

        let all = dst.take_all();
        assert_eq!(all.len, 6);
        assert!(dst.is_empty());
        free_nodes(all.head);
    }

    #[test]
    fn test_carve_addresses() {
        let mut nodes = NodeCache::new();
        let mut list = FreeList::new();
        let base = 0x1000 as *mut u8;

        list.push_chain(carve(base, 64, 4, &mut nodes));

        assert_eq!(list.count(), 4);
        // highest slot first, tail is the base slot
        assert_eq!(payloads(&list), vec![0x10c0, 0x1080, 0x1040, 0x1000]);
        assert!(list.contains(0x1040 as *const u8));
        assert!(!list.contains(0x1100 as *const u8));

        list.clear();
    }
}
