use crate::entry::CachedEntry;
use crate::key::RequestKey;
use std::sync::Arc;

/// Sentinel value indicating "no node" (null pointer equivalent).
pub const NIL: u32 = u32::MAX;

/// A node in the arena-allocated doubly-linked list.
pub struct Node {
    pub key: RequestKey,
    pub value: Arc<CachedEntry>,
    pub prev: u32,
    pub next: u32,
}

impl Node {
    pub fn new(key: RequestKey, value: CachedEntry) -> Self {
        Self {
            key,
            value: Arc::new(value),
            prev: NIL,
            next: NIL,
        }
    }
}

/// Arena-allocated doubly-linked list ordered by insertion.
///
/// Nodes live in a `Vec<Option<Node>>` and `u32` indices serve as pointers.
/// New nodes go to the head, so walking from the tail yields the oldest entry
/// first. Slots freed by `remove` are recycled through a free list; when the
/// free list is empty the arena grows.
pub struct Arena {
    slots: Vec<Option<Node>>,
    free_list: Vec<u32>,
    pub head: u32,
    pub tail: u32,
    len: usize,
}

impl Arena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn get(&self, index: u32) -> Option<&Node> {
        self.slots.get(index as usize).and_then(|s| s.as_ref())
    }

    #[inline]
    fn get_mut(&mut self, index: u32) -> Option<&mut Node> {
        self.slots.get_mut(index as usize).and_then(|s| s.as_mut())
    }

    /// Insert a node at the head (newest position) and return its index.
    pub fn push_head(&mut self, mut node: Node) -> u32 {
        node.prev = NIL;
        node.next = self.head;

        let index = match self.free_list.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(node);
                index
            }
            None => {
                self.slots.push(Some(node));
                (self.slots.len() - 1) as u32
            }
        };

        let old_head = self.head;
        if let Some(old) = self.get_mut(old_head) {
            old.prev = index;
        }

        self.head = index;
        if self.tail == NIL {
            self.tail = index;
        }
        self.len += 1;
        index
    }

    /// Unlink and free the node at `index`.
    pub fn remove(&mut self, index: u32) -> Option<Node> {
        let node = self.slots.get_mut(index as usize)?.take()?;

        if node.prev != NIL {
            if let Some(prev) = self.get_mut(node.prev) {
                prev.next = node.next;
            }
        } else {
            self.head = node.next;
        }

        if node.next != NIL {
            if let Some(next) = self.get_mut(node.next) {
                next.prev = node.prev;
            }
        } else {
            self.tail = node.prev;
        }

        self.free_list.push(index);
        self.len -= 1;
        Some(node)
    }

    /// Iterate nodes from oldest (tail) to newest (head).
    pub fn iter_oldest_first(&self) -> OldestFirst<'_> {
        OldestFirst {
            arena: self,
            cursor: self.tail,
        }
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

pub struct OldestFirst<'a> {
    arena: &'a Arena,
    cursor: u32,
}

impl<'a> Iterator for OldestFirst<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.arena.get(self.cursor)?;
        self.cursor = node.prev;
        Some(node)
    }
}
