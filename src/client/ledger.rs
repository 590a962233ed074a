use bit_set::BitSet;

/// The client's record of which request ids have been answered. An id is marked exactly once,
///  when its first reply arrives, and is never unmarked - later replies for the same id are
///  recognized as duplicates.
#[derive(Debug, Clone)]
pub struct DeliveryLedger {
    received: BitSet,
    len: usize,
}

impl DeliveryLedger {
    pub fn new(len: usize) -> DeliveryLedger {
        DeliveryLedger {
            received: BitSet::with_capacity(len),
            len,
        }
    }

    /// the total number of ids, marked or not
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn index(&self, id: u64) -> Option<usize> {
        usize::try_from(id).ok()
            .filter(|&idx| idx < self.len)
    }

    /// Returns `true` if the id was newly marked, `false` if it was marked before or is not a
    ///  valid id for this ledger.
    pub fn mark(&mut self, id: u64) -> bool {
        match self.index(id) {
            Some(idx) => self.received.insert(idx),
            None => false,
        }
    }

    pub fn is_marked(&self, id: u64) -> bool {
        self.index(id)
            .map(|idx| self.received.contains(idx))
            .unwrap_or(false)
    }

    pub fn num_marked(&self) -> usize {
        self.received.len()
    }

    pub fn num_pending(&self) -> usize {
        self.len - self.num_marked()
    }

    pub fn is_complete(&self) -> bool {
        self.num_marked() == self.len
    }

    /// the first unmarked id that is not smaller than `from`
    pub fn next_pending_from(&self, from: u64) -> Option<u64> {
        let from = usize::try_from(from).ok()?;
        (from..self.len)
            .find(|&idx| !self.received.contains(idx))
            .map(|idx| idx as u64)
    }

    pub fn pending(&self) -> impl Iterator<Item=u64> + '_ {
        (0..self.len)
            .filter(|&idx| !self.received.contains(idx))
            .map(|idx| idx as u64)
    }
}
