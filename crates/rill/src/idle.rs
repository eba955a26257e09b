use std::collections::HashMap;

use rill_timing::Millis;
use slab::Slab;

/// Index into the connection slab, or a bucket sentinel when
/// `BUCKET_BIT` is set.
pub(crate) type Link = usize;

const BUCKET_BIT: usize = 1usize << (usize::BITS - 1);

/// Rounds a timeout to its bucket: (0, 1000) rounds up to one second,
/// larger values floor to the second. Zero stays zero (disabled).
pub(crate) fn round_to_bucket(ms: u64) -> u64 {
    if ms == 0 {
        0
    } else if ms < 1_000 {
        1_000
    } else {
        ms - ms % 1_000
    }
}

/// Intrusive linkage embedded in every stream.
///
/// Detached is encoded self-referentially (`prev == next == index`),
/// which stays distinguishable from a list of one: a sole member links to
/// the bucket sentinel, never to itself.
#[derive(Clone, Copy, Debug)]
pub(crate) struct IdleLinks {
    prev: Link,
    next: Link,
    start: Millis,
    bucket_ms: u64,
    index: usize,
}

impl IdleLinks {
    pub(crate) fn detached(index: usize) -> Self {
        Self { prev: index, next: index, start: Millis::ZERO, bucket_ms: 0, index }
    }

    #[inline]
    fn is_detached(&self) -> bool {
        self.prev == self.index && self.next == self.index
    }
}

/// Anything that can sit on an idle list.
pub(crate) trait IdleNode {
    fn idle(&self) -> &IdleLinks;
    fn idle_mut(&mut self) -> &mut IdleLinks;
}

/// One timeout value's worth of streams.
///
/// `prev`/`next` are the sentinel's own links; the list is circular and
/// kept in least-recently-active-first order. `deadline` stands in for
/// the bucket's repeating timer: `Some` iff the list is non-empty.
struct Bucket {
    ms: u64,
    prev: Link,
    next: Link,
    deadline: Option<Millis>,
}

impl Bucket {
    #[inline]
    fn sentinel(index: usize) -> Link {
        BUCKET_BIT | index
    }
}

/// Groups streams sharing a timeout value onto one list each, so N
/// connections with M distinct timeouts cost M timers instead of N.
///
/// The scheduler never reads the clock; `now` always comes from the
/// caller, which keeps the expiry scan deterministic under test.
pub(crate) struct IdleScheduler {
    buckets: Vec<Bucket>,
    by_ms: HashMap<u64, usize>,
}

impl IdleScheduler {
    pub(crate) fn new() -> Self {
        Self { buckets: Vec::new(), by_ms: HashMap::new() }
    }

    /// Sets the node's timeout. Unlinks from any current bucket first;
    /// insertion happens on the next `mark_active`.
    pub(crate) fn enroll<N: IdleNode>(&mut self, nodes: &mut Slab<N>, index: usize, ms: u64) {
        self.unenroll(nodes, index);
        let bucket_ms = round_to_bucket(ms);
        nodes[index].idle_mut().bucket_ms = bucket_ms;
        if bucket_ms != 0 {
            self.bucket_index(bucket_ms);
        }
    }

    /// Stamps the node as just-active and moves it to the tail of its
    /// bucket. O(1); insertion order equals activity order, so the list
    /// stays sorted oldest-first.
    pub(crate) fn mark_active<N: IdleNode>(
        &mut self,
        nodes: &mut Slab<N>,
        index: usize,
        now: Millis,
    ) {
        let ms = nodes[index].idle().bucket_ms;
        if ms == 0 {
            return;
        }
        let bucket = self.bucket_index(ms);
        if !nodes[index].idle().is_detached() {
            self.splice_out(nodes, index);
        }
        let was_empty = self.is_empty(bucket);
        let tail = self.buckets[bucket].prev;
        self.set_next(nodes, tail, index);
        {
            let links = nodes[index].idle_mut();
            links.prev = tail;
            links.next = Bucket::sentinel(bucket);
            links.start = now;
        }
        self.buckets[bucket].prev = index;
        if was_empty {
            self.buckets[bucket].deadline = Some(now + Millis(ms));
        }
    }

    /// Unlinks the node; stops the bucket timer when the list empties.
    pub(crate) fn unenroll<N: IdleNode>(&mut self, nodes: &mut Slab<N>, index: usize) {
        if nodes[index].idle().is_detached() {
            return;
        }
        let ms = nodes[index].idle().bucket_ms;
        self.splice_out(nodes, index);
        if let Some(&bucket) = self.by_ms.get(&ms)
            && self.is_empty(bucket)
        {
            self.buckets[bucket].deadline = None;
        }
    }

    /// Earliest armed bucket deadline, for clamping the poll timeout.
    pub(crate) fn next_deadline(&self) -> Option<Millis> {
        self.buckets.iter().filter_map(|b| b.deadline).min()
    }

    /// Fires due buckets. Each scan walks from the oldest head: expired
    /// nodes are unlinked and reported, and the first survivor rearms the
    /// timer for exactly its remaining window.
    pub(crate) fn expire<N: IdleNode>(
        &mut self,
        nodes: &mut Slab<N>,
        now: Millis,
        expired: &mut Vec<usize>,
    ) {
        for bucket in 0..self.buckets.len() {
            let Some(deadline) = self.buckets[bucket].deadline else { continue };
            if now < deadline {
                continue;
            }
            let ms = self.buckets[bucket].ms;
            loop {
                let head = self.buckets[bucket].next;
                if head == Bucket::sentinel(bucket) {
                    self.buckets[bucket].deadline = None;
                    break;
                }
                let idled = now.saturating_sub(nodes[head].idle().start).as_u64();
                if idled < ms {
                    self.buckets[bucket].deadline = Some(now + Millis(ms - idled));
                    break;
                }
                self.splice_out(nodes, head);
                expired.push(head);
            }
        }
    }

    fn bucket_index(&mut self, ms: u64) -> usize {
        if let Some(&bucket) = self.by_ms.get(&ms) {
            return bucket;
        }
        let bucket = self.buckets.len();
        self.buckets.push(Bucket {
            ms,
            prev: Bucket::sentinel(bucket),
            next: Bucket::sentinel(bucket),
            deadline: None,
        });
        self.by_ms.insert(ms, bucket);
        bucket
    }

    #[inline]
    fn is_empty(&self, bucket: usize) -> bool {
        self.buckets[bucket].next == Bucket::sentinel(bucket)
    }

    fn splice_out<N: IdleNode>(&mut self, nodes: &mut Slab<N>, index: usize) {
        let (prev, next) = {
            let links = nodes[index].idle();
            (links.prev, links.next)
        };
        self.set_next(nodes, prev, next);
        self.set_prev(nodes, next, prev);
        let links = nodes[index].idle_mut();
        links.prev = index;
        links.next = index;
    }

    fn set_next<N: IdleNode>(&mut self, nodes: &mut Slab<N>, link: Link, to: Link) {
        if link & BUCKET_BIT != 0 {
            self.buckets[link & !BUCKET_BIT].next = to;
        } else {
            nodes[link].idle_mut().next = to;
        }
    }

    fn set_prev<N: IdleNode>(&mut self, nodes: &mut Slab<N>, link: Link, to: Link) {
        if link & BUCKET_BIT != 0 {
            self.buckets[link & !BUCKET_BIT].prev = to;
        } else {
            nodes[link].idle_mut().prev = to;
        }
    }

    #[cfg(test)]
    fn collect<N: IdleNode>(&self, nodes: &Slab<N>, ms: u64) -> Vec<usize> {
        let bucket = self.by_ms[&ms];
        let sentinel = Bucket::sentinel(bucket);
        let mut out = Vec::new();
        let mut cursor = self.buckets[bucket].next;
        while cursor != sentinel {
            out.push(cursor);
            cursor = nodes[cursor].idle().next;
        }
        out
    }

    #[cfg(test)]
    fn deadline_of(&self, ms: u64) -> Option<Millis> {
        self.by_ms.get(&ms).and_then(|&b| self.buckets[b].deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestNode {
        idle: IdleLinks,
    }

    impl IdleNode for TestNode {
        fn idle(&self) -> &IdleLinks {
            &self.idle
        }

        fn idle_mut(&mut self) -> &mut IdleLinks {
            &mut self.idle
        }
    }

    fn insert(nodes: &mut Slab<TestNode>) -> usize {
        let entry = nodes.vacant_entry();
        let index = entry.key();
        entry.insert(TestNode { idle: IdleLinks::detached(index) });
        index
    }

    #[test]
    fn rounding_coalesces_to_whole_seconds() {
        assert_eq!(round_to_bucket(0), 0);
        assert_eq!(round_to_bucket(1), 1_000);
        assert_eq!(round_to_bucket(500), 1_000);
        assert_eq!(round_to_bucket(999), 1_000);
        assert_eq!(round_to_bucket(1_000), 1_000);
        assert_eq!(round_to_bucket(1_500), 1_000);
        assert_eq!(round_to_bucket(2_500), 2_000);
    }

    #[test]
    fn timer_armed_iff_list_nonempty() {
        let mut nodes = Slab::new();
        let mut sched = IdleScheduler::new();
        let a = insert(&mut nodes);

        sched.enroll(&mut nodes, a, 2_000);
        assert_eq!(sched.deadline_of(2_000), None);

        sched.mark_active(&mut nodes, a, Millis(10));
        assert_eq!(sched.deadline_of(2_000), Some(Millis(2_010)));

        sched.unenroll(&mut nodes, a);
        assert_eq!(sched.deadline_of(2_000), None);
    }

    #[test]
    fn active_moves_node_to_tail() {
        let mut nodes = Slab::new();
        let mut sched = IdleScheduler::new();
        let (a, b, c) = (insert(&mut nodes), insert(&mut nodes), insert(&mut nodes));
        for &n in &[a, b, c] {
            sched.enroll(&mut nodes, n, 1_000);
            sched.mark_active(&mut nodes, n, Millis(1));
        }
        assert_eq!(sched.collect(&nodes, 1_000), vec![a, b, c]);

        sched.mark_active(&mut nodes, a, Millis(2));
        assert_eq!(sched.collect(&nodes, 1_000), vec![b, c, a]);
    }

    #[test]
    fn membership_is_exclusive_across_buckets() {
        let mut nodes = Slab::new();
        let mut sched = IdleScheduler::new();
        let a = insert(&mut nodes);

        sched.enroll(&mut nodes, a, 2_000);
        sched.mark_active(&mut nodes, a, Millis(5));
        sched.enroll(&mut nodes, a, 5_000);
        sched.mark_active(&mut nodes, a, Millis(6));

        assert!(sched.collect(&nodes, 2_000).is_empty());
        assert_eq!(sched.deadline_of(2_000), None);
        assert_eq!(sched.collect(&nodes, 5_000), vec![a]);
    }

    #[test]
    fn reenrolling_same_timeout_keeps_single_membership() {
        let mut nodes = Slab::new();
        let mut sched = IdleScheduler::new();
        let a = insert(&mut nodes);
        for _ in 0..2 {
            sched.enroll(&mut nodes, a, 1_500);
            sched.mark_active(&mut nodes, a, Millis(1));
        }
        assert_eq!(sched.collect(&nodes, 1_000), vec![a]);
    }

    #[test]
    fn singleton_is_not_detached() {
        let mut nodes = Slab::new();
        let mut sched = IdleScheduler::new();
        let a = insert(&mut nodes);
        assert!(nodes[a].idle().is_detached());

        sched.enroll(&mut nodes, a, 1_000);
        sched.mark_active(&mut nodes, a, Millis(1));
        assert!(!nodes[a].idle().is_detached());
        assert_eq!(sched.collect(&nodes, 1_000), vec![a]);
    }

    #[test]
    fn expiry_takes_oldest_and_rearms_exact_delta() {
        let mut nodes = Slab::new();
        let mut sched = IdleScheduler::new();
        let (a, b) = (insert(&mut nodes), insert(&mut nodes));
        sched.enroll(&mut nodes, a, 1_000);
        sched.enroll(&mut nodes, b, 1_000);
        sched.mark_active(&mut nodes, a, Millis(0));
        sched.mark_active(&mut nodes, b, Millis(400));

        let mut expired = Vec::new();
        sched.expire(&mut nodes, Millis(1_000), &mut expired);
        assert_eq!(expired, vec![a]);
        assert_eq!(sched.collect(&nodes, 1_000), vec![b]);
        // b has idled 600ms of its 1000ms window
        assert_eq!(sched.deadline_of(1_000), Some(Millis(1_400)));
    }

    #[test]
    fn expiry_of_last_node_stops_timer() {
        let mut nodes = Slab::new();
        let mut sched = IdleScheduler::new();
        let a = insert(&mut nodes);
        sched.enroll(&mut nodes, a, 1_000);
        sched.mark_active(&mut nodes, a, Millis(0));

        let mut expired = Vec::new();
        sched.expire(&mut nodes, Millis(2_000), &mut expired);
        assert_eq!(expired, vec![a]);
        assert_eq!(sched.deadline_of(1_000), None);
        assert!(nodes[a].idle().is_detached());
    }

    #[test]
    fn next_deadline_is_earliest_bucket() {
        let mut nodes = Slab::new();
        let mut sched = IdleScheduler::new();
        let (a, b) = (insert(&mut nodes), insert(&mut nodes));
        sched.enroll(&mut nodes, a, 5_000);
        sched.enroll(&mut nodes, b, 2_000);
        sched.mark_active(&mut nodes, a, Millis(0));
        sched.mark_active(&mut nodes, b, Millis(100));
        assert_eq!(sched.next_deadline(), Some(Millis(2_100)));
    }
}
