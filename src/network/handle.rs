// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{NetError, NetResult};

/// Opaque token naming a listener or a connection.
///
/// The id is unique for the lifetime of the engine; the generation belongs to the slot
/// the object was stored in, so a handle kept after its object was destroyed never
/// resolves to whatever reuses the slot later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    id: u64,
    generation: u32,
}

pub type ConnectionHandle = Handle;
pub type ListenerHandle = Handle;

impl Handle {
    pub const INVALID: Handle = Handle {
        id: 0,
        generation: 0,
    };

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn is_valid(&self) -> bool {
        self.id != 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.id, self.generation)
    }
}

/// Engine-wide id source shared by the listener and connection tables.
#[derive(Debug)]
pub(crate) struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> IdGenerator {
        IdGenerator {
            next: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    occupant: Option<(u64, Arc<T>)>,
}

#[derive(Debug)]
struct Slots<T> {
    entries: Vec<Slot<T>>,
    free: Vec<usize>,
    index: HashMap<u64, usize>,
}

/// Generation-tagged arena mapping handles to shared objects.
///
/// All mutation happens under one short lock. The table only indexes objects; the
/// socket and buffers behind a connection are owned by its worker.
#[derive(Debug)]
pub(crate) struct HandleTable<T> {
    kind: &'static str,
    ids: Arc<IdGenerator>,
    slots: Mutex<Slots<T>>,
}

impl<T> HandleTable<T> {
    pub fn new(kind: &'static str, ids: Arc<IdGenerator>) -> HandleTable<T> {
        HandleTable {
            kind,
            ids,
            slots: Mutex::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
                index: HashMap::new(),
            }),
        }
    }

    /// Stores the object built by `make` and returns its handle.
    ///
    /// The id is drawn while the table lock is held, so entries of one table appear in id
    /// order. `make` sees the final handle so the object can carry it. When it fails
    /// nothing is stored and the id is not reused.
    pub fn insert_with<F>(&self, make: F) -> NetResult<(Handle, Arc<T>)>
    where
        F: FnOnce(Handle) -> NetResult<T>,
    {
        let mut slots = self.slots.lock();
        let id = self.ids.next_id();
        let (position, generation) = match slots.free.pop() {
            Some(position) => {
                let slot = &mut slots.entries[position];
                slot.generation = slot.generation.wrapping_add(1).max(1);
                (position, slot.generation)
            }
            None => {
                slots.entries.push(Slot {
                    generation: 1,
                    occupant: None,
                });
                (slots.entries.len() - 1, 1)
            }
        };
        let handle = Handle { id, generation };
        let object = match make(handle) {
            Ok(object) => Arc::new(object),
            Err(err) => {
                slots.free.push(position);
                return Err(err);
            }
        };
        slots.entries[position].occupant = Some((id, object.clone()));
        slots.index.insert(id, position);
        Ok((handle, object))
    }

    pub fn get(&self, handle: &Handle) -> NetResult<Arc<T>> {
        let slots = self.slots.lock();
        let position = self.locate(&slots, handle)?;
        match &slots.entries[position].occupant {
            Some((_, object)) => Ok(object.clone()),
            None => Err(self.corrupted(handle, position)),
        }
    }

    /// Unlinks the object; the caller becomes responsible for tearing it down.
    pub fn remove(&self, handle: &Handle) -> NetResult<Arc<T>> {
        let mut slots = self.slots.lock();
        let position = self.locate(&slots, handle)?;
        match slots.entries[position].occupant.take() {
            Some((_, object)) => {
                slots.index.remove(&handle.id);
                slots.free.push(position);
                Ok(object)
            }
            None => Err(self.corrupted(handle, position)),
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<T>> {
        let slots = self.slots.lock();
        slots
            .entries
            .iter()
            .filter_map(|slot| slot.occupant.as_ref().map(|(_, object)| object.clone()))
            .collect()
    }

    /// Empties the table, handing every object back to the caller.
    pub fn drain(&self) -> Vec<Arc<T>> {
        let mut slots = self.slots.lock();
        let mut drained = Vec::with_capacity(slots.index.len());
        let Slots {
            entries,
            free,
            index,
        } = &mut *slots;
        for (position, slot) in entries.iter_mut().enumerate() {
            if let Some((_, object)) = slot.occupant.take() {
                drained.push(object);
                free.push(position);
            }
        }
        index.clear();
        drained
    }

    pub fn len(&self) -> usize {
        self.slots.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn locate(&self, slots: &Slots<T>, handle: &Handle) -> NetResult<usize> {
        if handle.id == 0 {
            return Err(NetError::InvalidParam(format!(
                "{} handle id must not be 0",
                self.kind
            )));
        }
        let position = *slots
            .index
            .get(&handle.id)
            .ok_or(NetError::NotFound(handle.id))?;
        let slot = slots
            .entries
            .get(position)
            .ok_or_else(|| self.corrupted(handle, position))?;
        match &slot.occupant {
            Some((id, _)) if *id == handle.id => {
                if slot.generation == handle.generation {
                    Ok(position)
                } else {
                    Err(NetError::NotFound(handle.id))
                }
            }
            _ => Err(self.corrupted(handle, position)),
        }
    }

    fn corrupted(&self, handle: &Handle, position: usize) -> NetError {
        NetError::Fatal(format!(
            "{} table index of {} points at slot {} holding another object",
            self.kind, handle, position
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    fn table() -> HandleTable<String> {
        HandleTable::new("test", Arc::new(IdGenerator::new()))
    }

    #[test]
    fn test_ids_strictly_increase_across_tables() {
        let ids = Arc::new(IdGenerator::new());
        let listeners: HandleTable<u8> = HandleTable::new("listener", ids.clone());
        let connections: HandleTable<u8> = HandleTable::new("connection", ids);

        let mut last = 0;
        for round in 0..10 {
            let (handle, _) = if round % 2 == 0 {
                listeners.insert_with(|_| Ok(round)).unwrap()
            } else {
                connections.insert_with(|_| Ok(round)).unwrap()
            };
            assert!(handle.id() > last);
            last = handle.id();
        }
    }

    #[test]
    fn test_concurrent_inserts_land_in_id_order() {
        let table: Arc<HandleTable<u64>> = Arc::new(HandleTable::new(
            "connection",
            Arc::new(IdGenerator::new()),
        ));
        let inserters: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        table.insert_with(|handle| Ok(handle.id())).unwrap();
                    }
                })
            })
            .collect();
        for inserter in inserters {
            inserter.join().unwrap();
        }
        // no removals, so slot order is insertion order
        let ids: Vec<u64> = table.snapshot().iter().map(|id| **id).collect();
        assert_eq!(ids.len(), 1600);
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_stale_handle_is_not_found_after_slot_reuse() {
        let table = table();
        let (first, _) = table.insert_with(|_| Ok("first".to_string())).unwrap();
        table.remove(&first).unwrap();

        let (second, object) = table.insert_with(|_| Ok("second".to_string())).unwrap();
        assert_ne!(first.generation(), second.generation());
        assert_eq!(object.as_str(), "second");

        assert!(matches!(table.get(&first), Err(NetError::NotFound(_))));
        assert!(matches!(table.remove(&first), Err(NetError::NotFound(_))));
        assert_eq!(table.get(&second).unwrap().as_str(), "second");
    }

    #[test]
    fn test_generation_mismatch_on_live_id() {
        let table = table();
        let (handle, _) = table.insert_with(|_| Ok("x".to_string())).unwrap();
        let forged = Handle {
            id: handle.id(),
            generation: handle.generation() + 1,
        };
        assert_eq!(table.get(&forged).unwrap_err().code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_zero_and_unknown_ids() {
        let table = table();
        assert_eq!(
            table.get(&Handle::INVALID).unwrap_err().code(),
            ErrorCode::InvalidParam
        );
        let unknown = Handle {
            id: 99,
            generation: 1,
        };
        assert_eq!(table.get(&unknown).unwrap_err().code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_failed_construction_stores_nothing() {
        let table = table();
        let err = table
            .insert_with(|_| Err(NetError::NoMemory("budget".to_string())))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoMemory);
        assert!(table.is_empty());
        let (handle, _) = table.insert_with(|h| Ok(h.to_string())).unwrap();
        assert_eq!(table.get(&handle).unwrap().as_str(), handle.to_string());
    }

    #[test]
    fn test_drain_and_snapshot() {
        let table = table();
        let handles: Vec<Handle> = (0..4)
            .map(|i| table.insert_with(|_| Ok(format!("obj-{}", i))).unwrap().0)
            .collect();
        table.remove(&handles[1]).unwrap();
        assert_eq!(table.snapshot().len(), 3);
        assert_eq!(table.drain().len(), 3);
        assert!(table.is_empty());
        assert!(table.get(&handles[0]).is_err());
    }

    #[test]
    fn test_corrupted_index_is_fatal() {
        let table = table();
        let (handle, _) = table.insert_with(|_| Ok("x".to_string())).unwrap();
        table.slots.lock().entries[0].occupant = None;
        assert_eq!(table.get(&handle).unwrap_err().code(), ErrorCode::Fatal);
    }
}
