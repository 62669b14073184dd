use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Identifies one TPM connection for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tpm#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Loaded for this connection only, must be flushed
    Transient,
    /// Lives in a persistent slot, only the ESYS resource is released
    Persistent,
}

/// Reference to an object loaded through a particular connection.
///
/// Only meaningful to the connection that issued it; resolving it anywhere
/// else, or after the object was flushed, fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef {
    connection: ConnectionId,
    index: usize,
    generation: u32,
}

impl ObjectRef {
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.connection, self.index, self.generation)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HandleError {
    #[error("handle {0} belongs to another connection")]
    ForeignConnection(ObjectRef),
    #[error("handle {0} has already been released")]
    Released(ObjectRef),
}

#[derive(Debug)]
struct Entry<H> {
    handle: H,
    residency: Residency,
    seq: u64,
}

#[derive(Debug)]
struct Slot<H> {
    generation: u32,
    entry: Option<Entry<H>>,
}

/// Per-connection table of live TPM handles.
#[derive(Debug)]
pub struct HandleTable<H> {
    connection: ConnectionId,
    slots: Vec<Slot<H>>,
    free: Vec<usize>,
    next_seq: u64,
}

impl<H: Copy> HandleTable<H> {
    pub fn new() -> Self {
        Self {
            connection: ConnectionId::next(),
            slots: Vec::new(),
            free: Vec::new(),
            next_seq: 0,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn insert(&mut self, handle: H, residency: Residency) -> ObjectRef {
        let entry = Entry {
            handle,
            residency,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.generation = slot.generation.wrapping_add(1);
                slot.entry = Some(entry);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                self.slots.len() - 1
            }
        };

        ObjectRef {
            connection: self.connection,
            index,
            generation: self.slots[index].generation,
        }
    }

    fn slot(&self, object: ObjectRef) -> Result<&Slot<H>, HandleError> {
        if object.connection != self.connection {
            return Err(HandleError::ForeignConnection(object));
        }
        self.slots
            .get(object.index)
            .filter(|slot| slot.generation == object.generation && slot.entry.is_some())
            .ok_or(HandleError::Released(object))
    }

    pub fn get(&self, object: ObjectRef) -> Result<(H, Residency), HandleError> {
        let slot = self.slot(object)?;
        slot.entry
            .as_ref()
            .map(|entry| (entry.handle, entry.residency))
            .ok_or(HandleError::Released(object))
    }

    pub fn remove(&mut self, object: ObjectRef) -> Result<(H, Residency), HandleError> {
        self.slot(object)?;
        let entry = self.slots[object.index]
            .entry
            .take()
            .ok_or(HandleError::Released(object))?;
        self.free.push(object.index);
        Ok((entry.handle, entry.residency))
    }

    /// Marks the current point in time for [`HandleTable::drain_since`].
    pub fn mark(&self) -> u64 {
        self.next_seq
    }

    /// Removes every entry inserted at or after `mark`.
    pub fn drain_since(&mut self, mark: u64) -> Vec<(H, Residency)> {
        let mut drained = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.entry.as_ref().map_or(false, |entry| entry.seq >= mark) {
                if let Some(entry) = slot.entry.take() {
                    drained.push((entry.seq, entry.handle, entry.residency));
                    self.free.push(index);
                }
            }
        }
        // newest first, children are released before their parents
        drained.sort_by(|a, b| b.0.cmp(&a.0));
        drained
            .into_iter()
            .map(|(_, handle, residency)| (handle, residency))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<(H, Residency)> {
        self.drain_since(0)
    }

    pub fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }
}

impl<H: Copy> Default for HandleTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_live_handle() {
        let mut table = HandleTable::new();
        let object = table.insert(0x8000_0000u32, Residency::Transient);
        assert_eq!(table.get(object), Ok((0x8000_0000, Residency::Transient)));
        assert_eq!(table.live(), 1);
    }

    #[test]
    fn released_handle_is_stale() {
        let mut table = HandleTable::new();
        let object = table.insert(1u32, Residency::Transient);
        table.remove(object).unwrap();
        assert_eq!(table.get(object), Err(HandleError::Released(object)));
        assert_eq!(table.remove(object), Err(HandleError::Released(object)));
    }

    #[test]
    fn reused_slot_does_not_resolve_old_reference() {
        let mut table = HandleTable::new();
        let old = table.insert(1u32, Residency::Transient);
        table.remove(old).unwrap();
        let new = table.insert(2u32, Residency::Transient);
        assert_ne!(old, new);
        assert_eq!(table.get(old), Err(HandleError::Released(old)));
        assert_eq!(table.get(new), Ok((2, Residency::Transient)));
    }

    #[test]
    fn reference_from_another_connection_is_rejected() {
        let mut first = HandleTable::new();
        let second: HandleTable<u32> = HandleTable::new();
        let object = first.insert(1u32, Residency::Transient);
        assert_ne!(first.connection(), second.connection());
        assert_eq!(
            second.get(object),
            Err(HandleError::ForeignConnection(object))
        );
    }

    #[test]
    fn drain_since_releases_only_newer_entries_newest_first() {
        let mut table = HandleTable::new();
        let kept = table.insert(1u32, Residency::Persistent);
        let mark = table.mark();
        table.insert(2u32, Residency::Transient);
        table.insert(3u32, Residency::Transient);

        let drained = table.drain_since(mark);
        assert_eq!(
            drained,
            vec![(3, Residency::Transient), (2, Residency::Transient)]
        );
        assert_eq!(table.live(), 1);
        assert!(table.get(kept).is_ok());
    }

    #[test]
    fn drain_empties_table() {
        let mut table = HandleTable::new();
        table.insert(1u32, Residency::Persistent);
        table.insert(2u32, Residency::Transient);
        assert_eq!(table.drain().len(), 2);
        assert_eq!(table.live(), 0);
    }
}
