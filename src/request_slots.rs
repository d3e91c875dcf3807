use std::fmt::{Display, Formatter};
use bit_set::BitSet;

/// The number of distinct request ids, i.e. the maximum number of requests that can be active on a
///  single connection at any given time
pub const MAX_REQUEST_IDS: usize = 0x100;

/// Identifies one logical request / response exchange among the requests that are currently
///  open on a connection. Ids are reused once the previous request with the same id released it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u8);

impl RequestId {
    pub const fn new(raw: u8) -> RequestId {
        RequestId(raw)
    }

    pub const fn to_raw(self) -> u8 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A fixed arena with one slot per request id, mapping ids of currently active requests to
///  per-request state. The presence bitmap is the source of truth for which ids are taken.
pub struct RequestSlots<T> {
    entries: Vec<Option<T>>,
    occupied: BitSet,
    /// where the search for a free id starts, so that recently released ids are not handed out
    ///  again right away
    next_candidate: usize,
}

impl<T> Default for RequestSlots<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestSlots<T> {
    pub fn new() -> RequestSlots<T> {
        RequestSlots {
            entries: (0..MAX_REQUEST_IDS).map(|_| None).collect(),
            occupied: BitSet::with_capacity(MAX_REQUEST_IDS),
            next_candidate: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.occupied.count()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied.is_empty()
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.occupied.contains(request_id.index())
    }

    pub fn get(&self, request_id: RequestId) -> Option<&T> {
        self.entries[request_id.index()].as_ref()
    }

    /// Occupies the slot for a given request id. If the id is already taken, the value is handed
    ///  back and the slot is left unchanged.
    pub fn insert(&mut self, request_id: RequestId, value: T) -> Result<(), T> {
        if !self.occupied.insert(request_id.index()) {
            return Err(value);
        }
        self.entries[request_id.index()] = Some(value);
        Ok(())
    }

    /// Occupies the next free slot (round robin) with a value created for the assigned id, or
    ///  returns `None` if all ids are taken
    pub fn allocate_with(&mut self, create: impl FnOnce(RequestId) -> T) -> Option<RequestId> {
        for offset in 0..MAX_REQUEST_IDS {
            let idx = (self.next_candidate + offset) % MAX_REQUEST_IDS;
            if self.occupied.insert(idx) {
                self.next_candidate = (idx + 1) % MAX_REQUEST_IDS;
                let request_id = RequestId(idx as u8);
                self.entries[idx] = Some(create(request_id));
                return Some(request_id);
            }
        }
        None
    }

    pub fn remove(&mut self, request_id: RequestId) -> Option<T> {
        if self.occupied.remove(request_id.index()) {
            self.entries[request_id.index()].take()
        }
        else {
            None
        }
    }
}
