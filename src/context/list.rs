//! Free list and hash buckets over one index arena.
//!
//! An entry is in at most one list at a time. Membership is tracked
//! explicitly so that a stale index can be detected instead of corrupting a
//! neighbour's links.

/// Which list an entry is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Membership {
    Detached,
    Free,
    Bucket(u32),
}

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Debug)]
pub(crate) struct Lists {
    links: Box<[Link]>,
    member: Box<[Membership]>,
    free: Option<u32>,
    buckets: Box<[Option<u32>]>,
}

impl Lists {
    /// All `size` entries start detached.
    pub fn new(size: usize, depth: usize) -> Self {
        Self {
            links: vec![Link::default(); size].into_boxed_slice(),
            member: vec![Membership::Detached; size].into_boxed_slice(),
            free: None,
            buckets: vec![None; depth.max(1)].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn membership(&self, i: u32) -> Membership {
        self.member[i as usize]
    }

    #[inline]
    pub fn bucket_head(&self, bucket: usize) -> Option<u32> {
        self.buckets[bucket]
    }

    #[inline]
    pub fn next(&self, i: u32) -> Option<u32> {
        self.links[i as usize].next
    }

    fn head_mut(&mut self, member: Membership) -> Option<&mut Option<u32>> {
        match member {
            Membership::Detached => None,
            Membership::Free => Some(&mut self.free),
            Membership::Bucket(b) => Some(&mut self.buckets[b as usize]),
        }
    }

    fn insert_head(&mut self, member: Membership, i: u32) {
        debug_assert_eq!(self.member[i as usize], Membership::Detached);
        let Some(head) = self.head_mut(member) else {
            return;
        };
        let old = head.replace(i);
        if let Some(old) = old {
            self.links[old as usize].prev = Some(i);
        }
        self.links[i as usize] = Link { prev: None, next: old };
        self.member[i as usize] = member;
    }

    /// Unlink `i` from whatever list it is on.
    pub fn remove(&mut self, i: u32) {
        let member = self.member[i as usize];
        let Link { prev, next } = self.links[i as usize];
        match prev {
            Some(p) => self.links[p as usize].next = next,
            None => {
                if let Some(head) = self.head_mut(member) {
                    *head = next;
                }
            }
        }
        if let Some(n) = next {
            self.links[n as usize].prev = prev;
        }
        self.links[i as usize] = Link::default();
        self.member[i as usize] = Membership::Detached;
    }

    pub fn push_free(&mut self, i: u32) {
        self.insert_head(Membership::Free, i);
    }

    pub fn pop_free(&mut self) -> Option<u32> {
        let i = self.free?;
        self.remove(i);
        Some(i)
    }

    pub fn insert_bucket(&mut self, bucket: usize, i: u32) {
        self.insert_head(Membership::Bucket(bucket as u32), i);
    }

    /// Iterate a bucket from its head.
    pub fn bucket(&self, bucket: usize) -> impl Iterator<Item = u32> + '_ {
        std::iter::successors(self.buckets[bucket], |i| self.links[*i as usize].next)
    }
}
