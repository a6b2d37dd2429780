//! Per-slot memoization of object searches and attribute reads.
//!
//! Search results are keyed by (object class, attribute, value) and empty
//! results are cached too, so repeated lookups of absent aliases stay off
//! the token. Negative entries must be purged whenever an object carrying
//! the searched value is created, destroyed or renamed; the mutating
//! operations in the device layer call the `remove_*` family for that.

use cryptoki_sys::CK_ATTRIBUTE_TYPE;
use cryptoki_sys::CK_OBJECT_CLASS;
use std::collections::HashMap;

use crate::pkcs11::ObjectHandle;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SearchKey {
    pub class: CK_OBJECT_CLASS,
    pub attribute: CK_ATTRIBUTE_TYPE,
    pub value: Vec<u8>,
}

#[derive(Debug, Default)]
pub(crate) struct AttributeCache {
    searches: HashMap<SearchKey, Vec<ObjectHandle>>,
    attributes: HashMap<(ObjectHandle, CK_ATTRIBUTE_TYPE), Vec<u8>>,
}

impl AttributeCache {
    pub fn objects_exist(&self, key: &SearchKey) -> bool {
        self.searches.contains_key(key)
    }

    pub fn get_objects(&self, key: &SearchKey) -> Option<Vec<ObjectHandle>> {
        self.searches.get(key).cloned()
    }

    pub fn add_objects(&mut self, key: SearchKey, objects: &[ObjectHandle]) {
        self.searches.insert(key, objects.to_vec());
    }

    pub fn attribute_exists(&self, object: ObjectHandle, attribute: CK_ATTRIBUTE_TYPE) -> bool {
        self.attributes.contains_key(&(object, attribute))
    }

    pub fn get_attribute(
        &self,
        object: ObjectHandle,
        attribute: CK_ATTRIBUTE_TYPE,
    ) -> Option<Vec<u8>> {
        self.attributes.get(&(object, attribute)).cloned()
    }

    /// Absent attributes are never cached; only call this with a real value.
    pub fn add_attribute(
        &mut self,
        object: ObjectHandle,
        attribute: CK_ATTRIBUTE_TYPE,
        value: Vec<u8>,
    ) {
        self.attributes.insert((object, attribute), value);
    }

    /// Drops every search entry whose searched value equals `value`,
    /// whatever the attribute searched by. Creating or renaming an object
    /// with a label, id or subject must purge the negatives for it.
    pub fn remove_by_label(&mut self, value: &[u8]) {
        self.searches.retain(|key, _| key.value != value);
    }

    /// Drops every search entry whose result set contains `object`.
    pub fn remove_by_object(&mut self, object: ObjectHandle) {
        self.searches.retain(|_, objects| !objects.contains(&object));
    }

    /// [`Self::remove_by_object`] plus all cached attributes of `object`.
    /// Destroying a handle must leave no cache entry referring to it.
    pub fn remove_all_by_object(&mut self, object: ObjectHandle) {
        self.remove_by_object(object);
        self.attributes.retain(|(o, _), _| *o != object);
    }

    pub fn clear(&mut self) {
        self.searches.clear();
        self.attributes.clear();
    }
}
