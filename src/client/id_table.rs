use rustc_hash::FxHashMap;

/// A table of entries keyed by ids that it allocates itself. Ids are handed out in increasing
///  order (wrapping around), and an id is never reused while its entry is live.
#[derive(Debug)]
pub struct IdTable<T> {
    entries: FxHashMap<u32, T>,
    next_id: u32,
}

impl<T> Default for IdTable<T> {
    fn default() -> Self {
        IdTable::starting_at(1)
    }
}

impl<T> IdTable<T> {
    pub fn starting_at(first_id: u32) -> IdTable<T> {
        IdTable {
            entries: Default::default(),
            next_id: first_id,
        }
    }

    /// Allocates an id and stores the entry created for it
    pub fn insert_with(&mut self, create: impl FnOnce(u32) -> T) -> &T {
        assert!(self.entries.len() < u32::MAX as usize, "id table exhausted");

        while self.entries.contains_key(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        self.entries.entry(id).or_insert(create(id))
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.entries.get(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    pub fn take_all(&mut self) -> Vec<T> {
        self.entries.drain().map(|(_, v)| v).collect()
    }
}
