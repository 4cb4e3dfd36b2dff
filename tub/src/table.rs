//! Per-connection capability bookkeeping.
//!
//! The export side maps the ids we allocated to the local objects we granted
//! to the peer; the import side maps ids the peer granted to us onto the proxy
//! handles our application holds. A table belongs to exactly one connection.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use sturdy_common::{error::RpcError, wire::CapabilityMetadata};

use crate::referenceable::Referenceable;

/// Id of the bootstrap object present on every connection.
pub const BOOTSTRAP_ID: u64 = 0;

fn object_key(object: &Arc<dyn Referenceable>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

struct ExportEntry {
    object: Arc<dyn Referenceable>,
    /// Grants sent to the peer and not yet released.
    refs:   u64,
}

/// A capability the peer granted to us.
pub struct ImportEntry<H> {
    handle: Weak<H>,
    /// Grants recorded for this id since the handle was created.
    grants: u32,
    /// Strong handles kept alive between a grant and the value carrying it.
    staged: Vec<Arc<H>>,
}

/// Both halves of a connection's capability state.
pub struct CapabilityTable<H> {
    next_id:   u64,
    exports:   HashMap<u64, ExportEntry>,
    by_object: HashMap<usize, u64>,
    imports:   HashMap<u64, ImportEntry<H>>,
}

/// Entries removed from a table on teardown, to be dropped by the caller
/// outside of any lock.
pub struct ClearedEntries<H> {
    pub exports: Vec<Arc<dyn Referenceable>>,
    pub imports: Vec<ImportEntry<H>>,
}

impl<H> Default for CapabilityTable<H> {
    fn default() -> Self {
        Self {
            next_id:   BOOTSTRAP_ID + 1,
            exports:   HashMap::new(),
            by_object: HashMap::new(),
            imports:   HashMap::new(),
        }
    }
}

impl<H> CapabilityTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one more grant of `object` to the peer and returns its id.
    ///
    /// An object that is already exported keeps its id.
    pub fn export(&mut self, object: &Arc<dyn Referenceable>) -> u64 {
        let key = object_key(object);
        if let Some(&id) = self.by_object.get(&key) {
            if let Some(entry) = self.exports.get_mut(&id) {
                entry.refs += 1;
                return id;
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        self.exports.insert(
            id,
            ExportEntry {
                object: object.clone(),
                refs:   1,
            },
        );
        self.by_object.insert(key, id);
        id
    }

    pub fn resolve(&self, id: u64) -> Result<Arc<dyn Referenceable>, RpcError> {
        match self.exports.get(&id) {
            Some(entry) => Ok(entry.object.clone()),
            None if id != BOOTSTRAP_ID && id < self.next_id => Err(RpcError::CapabilityRevoked(id)),
            None => Err(RpcError::UnknownCapability(format!("no capability with id {id}"))),
        }
    }

    /// The peer dropped `count` grants of `id`. Returns the object once its
    /// last grant is gone.
    pub fn release(&mut self, id: u64, count: u32) -> Result<Option<Arc<dyn Referenceable>>, RpcError> {
        let entry = self
            .exports
            .get_mut(&id)
            .ok_or_else(|| RpcError::UnknownCapability(format!("release of unexported id {id}")))?;
        entry.refs = entry.refs.saturating_sub(count as u64);
        if entry.refs > 0 {
            return Ok(None);
        }
        let entry = self.exports.remove(&id);
        Ok(entry.map(|entry| {
            self.by_object.remove(&object_key(&entry.object));
            entry.object
        }))
    }

    /// Outstanding grants of an exported id.
    pub fn export_refs(&self, id: u64) -> Option<u64> {
        self.exports.get(&id).map(|entry| entry.refs)
    }

    /// Records a grant received from the peer.
    ///
    /// A live handle for `id` is reused; otherwise `create` builds a new one.
    /// Either way a strong handle is staged until [`take_granted`] claims it.
    ///
    /// [`take_granted`]: Self::take_granted
    pub fn record_grant<F>(&mut self, id: u64, metadata: CapabilityMetadata, create: F) -> Arc<H>
    where
        F: FnOnce(&CapabilityMetadata) -> Arc<H>,
    {
        if let Some(entry) = self.imports.get_mut(&id) {
            let handle = match entry.handle.upgrade() {
                Some(handle) => handle,
                None => {
                    // the previous handle is dying; its grants carry over
                    let handle = create(&metadata);
                    entry.handle = Arc::downgrade(&handle);
                    handle
                }
            };
            entry.grants += 1;
            entry.staged.push(handle.clone());
            return handle;
        }

        let handle = create(&metadata);
        self.imports.insert(
            id,
            ImportEntry {
                handle: Arc::downgrade(&handle),
                grants: 1,
                staged: vec![handle.clone()],
            },
        );
        handle
    }

    /// Claims the handle staged by a previous grant of `id`.
    pub fn take_granted(&mut self, id: u64) -> Result<Arc<H>, RpcError> {
        self.imports
            .get_mut(&id)
            .and_then(|entry| entry.staged.pop())
            .ok_or_else(|| RpcError::Protocol(format!("capability {id} referenced without a grant")))
    }

    /// Removes the import entry for `id` if it still belongs to `handle`.
    /// Returns the number of grants to release.
    pub fn forget_import(&mut self, id: u64, handle: *const H) -> Option<u32> {
        let entry = self.imports.get(&id)?;
        if !std::ptr::eq(entry.handle.as_ptr(), handle) {
            return None;
        }
        self.imports.remove(&id).map(|entry| entry.grants)
    }

    pub fn export_count(&self) -> usize {
        self.exports.len()
    }

    pub fn import_count(&self) -> usize {
        self.imports.len()
    }

    /// Empties both sides. Ids stay reserved.
    pub fn clear(&mut self) -> ClearedEntries<H> {
        self.by_object.clear();
        ClearedEntries {
            exports: self.exports.drain().map(|(_, entry)| entry.object).collect(),
            imports: self.imports.drain().map(|(_, entry)| entry).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{referenceable::FnTarget, value::Value};

    fn object() -> Arc<dyn Referenceable> {
        Arc::new(FnTarget::new(|_, _, _| Ok(Value::None)))
    }

    #[derive(Debug)]
    struct Handle;

    #[test]
    fn test_export_ids_are_stable_and_never_reused() {
        let mut table: CapabilityTable<Handle> = CapabilityTable::new();
        let a = object();
        let b = object();

        let id_a = table.export(&a);
        assert_eq!(id_a, 1);
        assert_eq!(table.export(&a), id_a);
        assert_eq!(table.export_refs(id_a), Some(2));
        let id_b = table.export(&b);
        assert_eq!(id_b, 2);

        assert!(table.release(id_a, 1).unwrap().is_none());
        assert!(table.resolve(id_a).is_ok());
        assert!(table.release(id_a, 1).unwrap().is_some());
        assert!(matches!(table.resolve(id_a), Err(RpcError::CapabilityRevoked(1))));

        // re-exporting a dropped object gets a fresh id
        assert_eq!(table.export(&a), 3);
        assert!(matches!(table.resolve(99), Err(RpcError::UnknownCapability(_))));
        assert!(matches!(table.resolve(BOOTSTRAP_ID), Err(RpcError::UnknownCapability(_))));
        assert!(table.release(99, 1).is_err());
    }

    #[test]
    fn test_grants_reuse_live_handle() {
        let mut table: CapabilityTable<Handle> = CapabilityTable::new();
        let first = table.record_grant(5, CapabilityMetadata::default(), |_| Arc::new(Handle));
        let claimed = table.take_granted(5).unwrap();
        assert!(Arc::ptr_eq(&first, &claimed));

        let again = table.record_grant(5, CapabilityMetadata::default(), |_| panic!("handle is live"));
        assert!(Arc::ptr_eq(&first, &again));
        let _ = table.take_granted(5).unwrap();
        assert!(table.take_granted(5).is_err());

        assert_eq!(table.forget_import(5, Arc::as_ptr(&first)), Some(2));
        assert_eq!(table.import_count(), 0);
    }

    #[test]
    fn test_dying_handle_carries_grants_to_replacement() {
        let mut table: CapabilityTable<Handle> = CapabilityTable::new();
        let old = table.record_grant(9, CapabilityMetadata::default(), |_| Arc::new(Handle));
        let old_ptr = Arc::as_ptr(&old);
        let _ = table.take_granted(9).unwrap();
        drop(old);

        let new = table.record_grant(9, CapabilityMetadata::default(), |_| Arc::new(Handle));
        // the old handle's late drop must not remove the new entry
        assert_eq!(table.forget_import(9, old_ptr), None);
        assert_eq!(table.forget_import(9, Arc::as_ptr(&new)), Some(2));
    }

    #[test]
    fn test_clear_empties_both_sides() {
        let mut table: CapabilityTable<Handle> = CapabilityTable::new();
        table.export(&object());
        table.export(&object());
        table.record_grant(1, CapabilityMetadata::default(), |_| Arc::new(Handle));

        let cleared = table.clear();
        assert_eq!(cleared.exports.len(), 2);
        assert_eq!(cleared.imports.len(), 1);
        assert_eq!(table.export_count() + table.import_count(), 0);
        assert!(matches!(table.resolve(1), Err(RpcError::CapabilityRevoked(1))));
    }
}
