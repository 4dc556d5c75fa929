//! Handle table
//!
//! Requests are owned by a slot arena.  Callers only ever see a `RawRequest`, an opaque integer
//! whose low word is the slot index plus one and whose high word is the generation of the slot at
//! allocation time.  Releasing a slot bumps its generation, so a stale handle can never resolve to
//! the request that reuses the slot.

use conv::ConvUtil;

/// Opaque handle of a request as seen by callers.
pub type RawRequest = u64;

/// The null request handle.  Completion calls treat it as an inactive request.
pub const REQUEST_NULL: RawRequest = 0;

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// A generation-tagged arena mapping `RawRequest` handles to values.
#[derive(Debug)]
pub(crate) struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    vacant: Vec<usize>,
    capacity: usize,
    live: usize,
}

/// Handle of slot `index` at `generation`.  `None` if the index does not fit the low word.
fn encode(index: usize, generation: u32) -> Option<RawRequest> {
    let low = index
        .value_as::<u64>()
        .ok()?
        .checked_add(1)
        .filter(|&low| low <= u64::from(u32::MAX))?;
    Some((u64::from(generation) << 32) | low)
}

fn decode(handle: RawRequest) -> Option<(usize, u32)> {
    let low = handle & 0xffff_ffff;
    if low == 0 {
        return None;
    }
    let index = (low - 1).value_as::<usize>().ok()?;
    let generation = (handle >> 32).value_as::<u32>().ok()?;
    Some((index, generation))
}

impl<T> HandleTable<T> {
    /// A table that holds at most `capacity` live values.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            capacity,
            live: 0,
        }
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Maximum number of live values.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stores `value` and returns its handle, or hands the value back if the table is full.
    pub fn allocate(&mut self, value: T) -> Result<RawRequest, T> {
        if self.live >= self.capacity {
            return Err(value);
        }

        let (index, handle) = match self.vacant.pop() {
            Some(index) => (index, encode(index, self.slots[index].generation)),
            None => (self.slots.len(), encode(self.slots.len(), 0)),
        };
        let handle = match handle {
            Some(handle) => handle,
            None => return Err(value),
        };
        if index == self.slots.len() {
            self.slots.push(Slot {
                generation: 0,
                value: None,
            });
        }

        let slot = &mut self.slots[index];
        debug_assert!(slot.value.is_none(), "vacant list points at an occupied slot");
        slot.value = Some(value);
        self.live += 1;
        Ok(handle)
    }

    fn slot(&self, handle: RawRequest) -> Option<&Slot<T>> {
        let (index, generation) = decode(handle)?;
        self.slots
            .get(index)
            .filter(|slot| slot.generation == generation)
    }

    /// Resolves a handle to its value.  Null, stale and out-of-range handles yield `None`.
    pub fn get(&self, handle: RawRequest) -> Option<&T> {
        self.slot(handle).and_then(|slot| slot.value.as_ref())
    }

    /// Mutable counterpart of [`get`](#method.get).
    pub fn get_mut(&mut self, handle: RawRequest) -> Option<&mut T> {
        let (index, generation) = decode(handle)?;
        self.slots
            .get_mut(index)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Removes the value behind `handle`, retiring the handle for good.
    pub fn release(&mut self, handle: RawRequest) -> Option<T> {
        let (index, generation) = decode(handle)?;
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.live -= 1;
        // the generation wrapped: retire the slot instead of risking a handle collision
        if slot.generation != 0 {
            self.vacant.push(index);
        }
        Some(value)
    }

    /// Handles of all live values, in slot order.
    pub fn handles(&self) -> Vec<RawRequest> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_some())
            .filter_map(|(index, slot)| encode(index, slot.generation))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle_never_resolves() {
        let mut table = HandleTable::with_capacity(4);
        table.allocate("a").unwrap();
        assert_eq!(table.get(REQUEST_NULL), None);
        assert_eq!(table.release(REQUEST_NULL), None);
    }

    #[test]
    fn released_handle_is_stale_after_reuse() {
        let mut table = HandleTable::with_capacity(4);
        let first = table.allocate(1).unwrap();
        assert_eq!(table.release(first), Some(1));

        let second = table.allocate(2).unwrap();
        assert_ne!(first, second);
        assert_eq!(first & 0xffff_ffff, second & 0xffff_ffff, "slot is reused");
        assert_eq!(table.get(first), None);
        assert_eq!(table.get(second), Some(&2));
        assert_eq!(table.release(first), None);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut table = HandleTable::with_capacity(2);
        table.allocate(1).unwrap();
        let second = table.allocate(2).unwrap();
        assert_eq!(table.allocate(3), Err(3));

        table.release(second);
        assert!(table.allocate(3).is_ok());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn out_of_range_handles_are_rejected() {
        let mut table: HandleTable<u8> = HandleTable::with_capacity(1);
        assert_eq!(table.get(encode(7, 0).unwrap()), None);
        assert_eq!(table.get_mut(u64::MAX), None);
    }

    #[test]
    fn indices_must_fit_the_low_word() {
        let last = encode(0xffff_fffe, 3).unwrap();
        assert_eq!(decode(last), Some((0xffff_fffe, 3)));
        assert_eq!(encode(0xffff_ffff, 3), None);
        assert_eq!(decode(encode(0, u32::MAX).unwrap()), Some((0, u32::MAX)));
    }

    #[test]
    fn handles_lists_live_values() {
        let mut table = HandleTable::with_capacity(8);
        let a = table.allocate('a').unwrap();
        let b = table.allocate('b').unwrap();
        let c = table.allocate('c').unwrap();
        table.release(b);
        assert_eq!(table.handles(), vec![a, c]);
    }
}
