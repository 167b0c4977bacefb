//! Per-CPU ready queue
//!
//! One circular ring of ready contexts per priority level. The rings are
//! intrusive: the links are the `ready_next`/`ready_prev` fields of each
//! [`Context`], and a NULL `ready_next` means "not enqueued".
//!
//! `prio_next[p]` is the head of ring `p` (the context that runs next at
//! that priority), `prio_highest` the highest non-empty ring. Insertion,
//! removal and selection are O(1) apart from the downward walk of
//! `prio_highest` on removal.

use rtk_core::{Context, ContextRef, ObjectTable, PRIO_LEVELS, Priority};

use crate::Kernel;
use crate::hal::Platform;

/// Priority-indexed ready rings.
pub struct ReadyQueue {
    prio_next: [ContextRef; PRIO_LEVELS],
    prio_highest: Priority,
}

impl ReadyQueue {
    /// Create an empty ready queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            prio_next: [ContextRef::NULL; PRIO_LEVELS],
            prio_highest: 0,
        }
    }

    /// Highest priority with a non-empty ring (0 when all are empty).
    #[inline]
    #[must_use]
    pub const fn prio_highest(&self) -> Priority {
        self.prio_highest
    }

    /// Next context to run at `prio` (NULL if the ring is empty).
    #[inline]
    #[must_use]
    pub const fn head(&self, prio: Priority) -> ContextRef {
        self.prio_next[prio as usize]
    }

    /// Next context to run overall.
    #[inline]
    #[must_use]
    pub const fn first(&self) -> ContextRef {
        self.head(self.prio_highest)
    }

    /// Move the head of ring `prio` to `ctx`.
    pub(crate) fn set_head(&mut self, prio: Priority, ctx: ContextRef) {
        self.prio_next[prio as usize] = ctx;
    }

    /// Link `ctx` into ring `prio`.
    ///
    /// The context goes in front of the current head, i.e. at the end of the
    /// round-robin order. With `as_head` it becomes the head instead.
    pub fn insert(
        &mut self,
        contexts: &mut ObjectTable<ContextRef, Context>,
        ctx: ContextRef,
        prio: Priority,
        as_head: bool,
    ) {
        let head = self.head(prio);

        if head.is_null() {
            let c = &mut contexts[ctx];
            c.ready_next = ctx;
            c.ready_prev = ctx;
            self.set_head(prio, ctx);
        } else {
            let tail = contexts[head].ready_prev;
            {
                let c = &mut contexts[ctx];
                c.ready_next = head;
                c.ready_prev = tail;
            }
            contexts[head].ready_prev = ctx;
            contexts[tail].ready_next = ctx;

            if as_head {
                self.set_head(prio, ctx);
            }
        }

        if prio > self.prio_highest {
            self.prio_highest = prio;
        }
    }

    /// Unlink `ctx` from ring `prio`.
    pub fn remove(
        &mut self,
        contexts: &mut ObjectTable<ContextRef, Context>,
        ctx: ContextRef,
        prio: Priority,
    ) {
        let (next, prev) = {
            let c = &contexts[ctx];
            (c.ready_next, c.ready_prev)
        };

        if self.head(prio) == ctx {
            self.set_head(prio, if next == ctx { ContextRef::NULL } else { next });
        }

        contexts[prev].ready_next = next;
        contexts[next].ready_prev = prev;
        contexts[ctx].ready_next = ContextRef::NULL;

        while self.prio_highest > 0 && self.head(self.prio_highest).is_null() {
            self.prio_highest -= 1;
        }
    }

    /// Contexts of ring `prio` in round-robin order, starting at the head.
    pub fn ring<'a>(
        &self,
        contexts: &'a ObjectTable<ContextRef, Context>,
        prio: Priority,
    ) -> impl Iterator<Item = ContextRef> + 'a {
        let head = self.head(prio);
        let mut cur = head;
        core::iter::from_fn(move || {
            if cur.is_null() {
                return None;
            }
            let out = cur;
            cur = contexts[cur].ready_next;
            if cur == head {
                cur = ContextRef::NULL;
            }
            Some(out)
        })
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

// -- Kernel entry points

impl<P: Platform> Kernel<P> {
    /// Check if `ctx` sits in its CPU's ready queue.
    #[must_use]
    pub fn in_ready_list(&self, ctx: ContextRef) -> bool {
        self.contexts[ctx].in_ready_list()
    }

    /// Put `ctx` into its CPU's ready queue.
    ///
    /// No-op if it is already enqueued, not ready, or its active timeslice
    /// has no budget left. The running context is enqueued as the head of
    /// its ring so it stays next in its own band.
    ///
    /// # Panics
    ///
    /// Panics if the CPU lock is not held.
    pub fn ready_enqueue(&mut self, ctx: ContextRef) {
        let c = &self.contexts[ctx];
        let cpu = c.cpu;
        self.cpus[cpu].lock.held();

        if c.in_ready_list() || !c.is_ready() {
            return;
        }

        let sched = &self.scheds[c.sched];
        if sched.left == 0 {
            return;
        }
        let prio = sched.prio;

        let as_head = self.cpus[cpu].current == ctx;
        self.cpus[cpu].ready.insert(&mut self.contexts, ctx, prio, as_head);
        log::trace!("cpu{}: enqueue {} at prio {}", cpu, ctx, prio);
    }

    /// Take `ctx` out of its CPU's ready queue. No-op if not enqueued.
    ///
    /// # Panics
    ///
    /// Panics if the CPU lock is not held.
    pub fn ready_dequeue(&mut self, ctx: ContextRef) {
        let c = &self.contexts[ctx];
        let cpu = c.cpu;
        self.cpus[cpu].lock.held();

        if !c.in_ready_list() {
            return;
        }

        let prio = self.scheds[c.sched].prio;
        self.cpus[cpu].ready.remove(&mut self.contexts, ctx, prio);
        log::trace!("cpu{}: dequeue {} from prio {}", cpu, ctx, prio);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtk_core::SpaceId;

    fn table(n: u32) -> (ObjectTable<ContextRef, Context>, Vec<ContextRef>) {
        let mut t = ObjectTable::new();
        let refs = (0..n)
            .map(|_| t.insert_with(|me| Context::new(me, 0, SpaceId(0), 255)).unwrap())
            .collect();
        (t, refs)
    }

    fn ring_of(q: &ReadyQueue, t: &ObjectTable<ContextRef, Context>, p: Priority) -> Vec<ContextRef> {
        q.ring(t, p).collect()
    }

    #[test]
    fn test_insert_before_head() {
        let (mut t, c) = table(3);
        let mut q = ReadyQueue::new();

        q.insert(&mut t, c[0], 5, false);
        q.insert(&mut t, c[1], 5, false);
        q.insert(&mut t, c[2], 5, false);

        assert_eq!(q.head(5), c[0]);
        assert_eq!(ring_of(&q, &t, 5), vec![c[0], c[1], c[2]]);
        assert_eq!(q.prio_highest(), 5);
    }

    #[test]
    fn test_insert_as_head() {
        let (mut t, c) = table(3);
        let mut q = ReadyQueue::new();

        q.insert(&mut t, c[0], 5, false);
        q.insert(&mut t, c[1], 5, false);
        q.insert(&mut t, c[2], 5, true);

        assert_eq!(ring_of(&q, &t, 5), vec![c[2], c[0], c[1]]);
    }

    #[test]
    fn test_remove_advances_head_and_lowers_highest() {
        let (mut t, c) = table(3);
        let mut q = ReadyQueue::new();

        q.insert(&mut t, c[0], 3, false);
        q.insert(&mut t, c[1], 9, false);
        q.insert(&mut t, c[2], 9, false);
        assert_eq!(q.prio_highest(), 9);

        q.remove(&mut t, c[1], 9);
        assert_eq!(q.head(9), c[2]);
        assert!(!t[c[1]].in_ready_list());
        assert_eq!(q.prio_highest(), 9);

        q.remove(&mut t, c[2], 9);
        assert!(q.head(9).is_null());
        assert_eq!(q.prio_highest(), 3);

        q.remove(&mut t, c[0], 3);
        assert_eq!(q.prio_highest(), 0);
        assert!(q.first().is_null());
    }

    #[test]
    fn test_remove_middle_keeps_ring() {
        let (mut t, c) = table(3);
        let mut q = ReadyQueue::new();
        for &x in &c {
            q.insert(&mut t, x, 7, false);
        }

        q.remove(&mut t, c[1], 7);
        assert_eq!(ring_of(&q, &t, 7), vec![c[0], c[2]]);
        assert_eq!(t[c[2]].ready_next, c[0]);
        assert_eq!(t[c[0]].ready_prev, c[2]);
    }
}
