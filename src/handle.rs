//! Generational handle table.
//!
//! Handles are `(index, generation)` pairs. Removing an entry bumps the
//! slot's generation, so a stale handle can never resolve to a session
//! created later in the same slot.

/// Opaque session identifier. Packs into a non-zero `u64` for callers
/// outside Rust; `0` is reserved as the null handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    index: u32,
    generation: u32,
}

impl SessionHandle {
    pub const NULL_RAW: u64 = 0;

    /// Slot index is stored off by one so no live handle packs to zero.
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | (self.index as u64 + 1)
    }

    pub const fn from_raw(raw: u64) -> Option<Self> {
        let low = (raw & 0xffff_ffff) as u32;
        if low == 0 {
            return None;
        }
        Some(Self {
            index: low - 1,
            generation: (raw >> 32) as u32,
        })
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, value: T) -> SessionHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return SessionHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        SessionHandle {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn remove(&mut self, handle: SessionHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
