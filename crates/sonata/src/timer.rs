// src/timer.rs
//! Idle-connection timers kept in a list sorted by ascending expiry.
//!
//! Nodes live in an arena and are linked by index, so unlinking is O(1) and
//! handles stay valid while other timers come and go. Each slot carries a
//! generation counter; a handle to a slot that has since been freed (or
//! reused) is simply ignored.

use std::os::unix::io::RawFd;
use std::time::Instant;

/// Stable reference to a timer in a [`TimerList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId {
    index: usize,
    generation: u32,
}

#[derive(Debug)]
struct Node {
    expire: Instant,
    /// Descriptor of the connection this timer guards.
    fd: RawFd,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Debug, Default)]
pub struct TimerList {
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a timer, keeping ascending order. Equal expiries keep insertion order.
    ///
    /// New timers almost always expire last, so the scan starts at the tail.
    pub fn add(&mut self, expire: Instant, fd: RawFd) -> TimerId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: None,
                });
                self.slots.len() - 1
            }
        };
        let generation = self.slots[index].generation;
        self.slots[index].node = Some(Node {
            expire,
            fd,
            prev: None,
            next: None,
        });

        let mut after = self.tail;
        while let Some(cur) = after {
            if self.node(cur).expire <= expire {
                break;
            }
            after = self.node(cur).prev;
        }
        self.link_after(index, after);
        self.len += 1;

        TimerId { index, generation }
    }

    /// Push a timer's expiry forward and restore order by walking toward the tail.
    ///
    /// An earlier expiry is accepted too; the timer is then re-inserted from the tail.
    pub fn adjust(&mut self, id: TimerId, expire: Instant) {
        let Some(index) = self.live_index(id) else {
            return;
        };

        let old = self.node(index).expire;
        self.node_mut(index).expire = expire;

        if expire < old {
            self.unlink(index);
            let mut after = self.tail;
            while let Some(cur) = after {
                if self.node(cur).expire <= expire {
                    break;
                }
                after = self.node(cur).prev;
            }
            self.link_after(index, after);
            return;
        }

        let mut after = None;
        let mut cursor = self.node(index).next;
        while let Some(cur) = cursor {
            if self.node(cur).expire > expire {
                break;
            }
            after = Some(cur);
            cursor = self.node(cur).next;
        }

        if let Some(after) = after {
            self.unlink(index);
            self.link_after(index, Some(after));
        }
    }

    /// Remove a timer. Stale handles are ignored.
    pub fn delete(&mut self, id: TimerId) {
        let Some(index) = self.live_index(id) else {
            return;
        };
        self.unlink(index);
        self.release(index);
    }

    /// Expire every timer whose deadline is at or before `now`, head first,
    /// calling `on_expire` with the guarded descriptor. Returns how many fired.
    pub fn tick<F: FnMut(RawFd)>(&mut self, now: Instant, mut on_expire: F) -> usize {
        let mut fired = 0;
        while let Some(head) = self.head {
            let node = self.node(head);
            if node.expire > now {
                break;
            }
            let fd = node.fd;
            self.unlink(head);
            self.release(head);
            on_expire(fd);
            fired += 1;
        }
        fired
    }

    pub fn expire_of(&self, id: TimerId) -> Option<Instant> {
        self.live_index(id).map(|index| self.node(index).expire)
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.live_index(id).is_some()
    }

    /// Iterate `(expiry, fd)` pairs from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = (Instant, RawFd)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let index = cursor?;
            let node = self.node(index);
            cursor = node.next;
            Some((node.expire, node.fd))
        })
    }

    fn live_index(&self, id: TimerId) -> Option<usize> {
        let slot = self.slots.get(id.index)?;
        (slot.generation == id.generation && slot.node.is_some()).then_some(id.index)
    }

    // Indices handed to these helpers always point at occupied slots.
    fn node(&self, index: usize) -> &Node {
        match &self.slots[index].node {
            Some(node) => node,
            None => unreachable!("timer slot {index} is vacant"),
        }
    }

    fn node_mut(&mut self, index: usize) -> &mut Node {
        match &mut self.slots[index].node {
            Some(node) => node,
            None => unreachable!("timer slot {index} is vacant"),
        }
    }

    /// Link a detached node after `after`, or at the head when `after` is `None`.
    fn link_after(&mut self, index: usize, after: Option<usize>) {
        let next = match after {
            Some(a) => self.node(a).next,
            None => self.head,
        };
        {
            let node = self.node_mut(index);
            node.prev = after;
            node.next = next;
        }
        match after {
            Some(a) => self.node_mut(a).next = Some(index),
            None => self.head = Some(index),
        }
        match next {
            Some(n) => self.node_mut(n).prev = Some(index),
            None => self.tail = Some(index),
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let node = self.node(index);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(index);
        node.prev = None;
        node.next = None;
    }

    fn release(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.node = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.len -= 1;
    }
}
