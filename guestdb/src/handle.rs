//! Generation-checked arena of live statement handles.
//!
//! A statement on the host side refers to its guest handle through a
//! [`HandleId`]. Removing a handle bumps its slot's generation, so an id kept
//! past `close` can never reach a guest handle that later reuses the slot.

/// Index into a [`HandleArena`]. The zero id never names a live handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HandleId {
    slot: u32,
    generation: u32,
}

impl HandleId {
    /// The id of a closed statement.
    pub const CLOSED: Self = Self {
        slot: 0,
        generation: 0,
    };
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    handle: Option<u32>,
}

#[derive(Debug, Default)]
pub(crate) struct HandleArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl HandleArena {
    /// Records a non-zero guest handle and returns its id.
    pub fn insert(&mut self, handle: u32) -> HandleId {
        debug_assert_ne!(handle, 0);
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.handle = Some(handle);
            return HandleId {
                slot,
                generation: entry.generation,
            };
        }
        let slot = u32::try_from(self.slots.len()).expect("handle arena overflow");
        self.slots.push(Slot {
            generation: 1,
            handle: Some(handle),
        });
        HandleId {
            slot,
            generation: 1,
        }
    }

    /// The guest handle behind `id`, if it is still live.
    pub fn get(&self, id: HandleId) -> Option<u32> {
        self.slots
            .get(id.slot as usize)
            .filter(|entry| entry.generation == id.generation)
            .and_then(|entry| entry.handle)
    }

    /// Removes `id`, returning its guest handle if it was live.
    pub fn remove(&mut self, id: HandleId) -> Option<u32> {
        let entry = self
            .slots
            .get_mut(id.slot as usize)
            .filter(|entry| entry.generation == id.generation)?;
        let handle = entry.handle.take()?;
        entry.generation = entry.generation.wrapping_add(1).max(1);
        self.free.push(id.slot);
        Some(handle)
    }

    /// Removes every live handle.
    pub fn drain(&mut self) -> Vec<u32> {
        let live: Vec<_> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.handle.is_some())
            .map(|(slot, entry)| HandleId {
                slot: u32::try_from(slot).expect("handle arena overflow"),
                generation: entry.generation,
            })
            .collect();
        live.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_id_is_never_live() {
        let mut arena = HandleArena::default();
        let id = arena.insert(0x1000);
        assert_ne!(id, HandleId::CLOSED);
        assert_eq!(arena.get(HandleId::CLOSED), None);
        assert_eq!(arena.get(id), Some(0x1000));
    }

    #[test]
    fn test_stale_id_after_reuse() {
        let mut arena = HandleArena::default();
        let first = arena.insert(0x1000);
        assert_eq!(arena.remove(first), Some(0x1000));
        let second = arena.insert(0x2000);
        assert_eq!(arena.get(first), None);
        assert_eq!(arena.remove(first), None);
        assert_eq!(arena.get(second), Some(0x2000));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_drain() {
        let mut arena = HandleArena::default();
        let a = arena.insert(8);
        let b = arena.insert(16);
        arena.insert(24);
        arena.remove(b);
        let mut drained = arena.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![8, 24]);
        assert_eq!(arena.len(), 0);
        assert_eq!(arena.get(a), None);
    }
}
