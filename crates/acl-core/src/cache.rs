use std::sync::Arc;

use dashmap::DashMap;

use crate::acl::Acl;
use crate::oid::ObjectIdentity;

/// Maps object identity to a fully populated ACL subtree.
///
/// The provider never trusts this cache to be coherent: on any ambiguity
/// (e.g. a cached ACL missing a requested SID) it evicts and falls back to
/// the database.
pub trait AclCache: Send + Sync {
    fn get_from_cache_by_identity(&self, oid: &ObjectIdentity) -> Option<Arc<Acl>>;
    fn put_in_cache(&self, acl: Arc<Acl>);
    fn evict_from_cache_by_identity(&self, oid: &ObjectIdentity);
    fn evict_from_cache_by_id(&self, acl_id: i64);
    fn clear_cache(&self);
}

/// Straightforward in-process default, keyed both by object identity and by
/// ACL id so eviction can happen from either direction.
#[derive(Debug, Default)]
pub struct InMemoryAclCache {
    by_identity: DashMap<ObjectIdentity, Arc<Acl>>,
    id_to_identity: DashMap<i64, ObjectIdentity>,
}

impl InMemoryAclCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AclCache for InMemoryAclCache {
    fn get_from_cache_by_identity(&self, oid: &ObjectIdentity) -> Option<Arc<Acl>> {
        self.by_identity.get(oid).map(|entry| Arc::clone(entry.value()))
    }

    fn put_in_cache(&self, acl: Arc<Acl>) {
        self.id_to_identity.insert(acl.id(), acl.object_identity().clone());
        self.by_identity.insert(acl.object_identity().clone(), acl);
    }

    fn evict_from_cache_by_identity(&self, oid: &ObjectIdentity) {
        if let Some((_, acl)) = self.by_identity.remove(oid) {
            self.id_to_identity.remove(&acl.id());
        }
    }

    fn evict_from_cache_by_id(&self, acl_id: i64) {
        if let Some((_, oid)) = self.id_to_identity.remove(&acl_id) {
            self.by_identity.remove(&oid);
        }
    }

    fn clear_cache(&self) {
        self.by_identity.clear();
        self.id_to_identity.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::AclContent;

    #[test]
    fn put_get_evict_roundtrip() {
        let cache = InMemoryAclCache::new();
        let oid = ObjectIdentity::new("BlogPost", "42");
        let acl = Acl::hydrated(7, oid.clone(), AclContent::empty(true), None);

        assert!(cache.get_from_cache_by_identity(&oid).is_none());
        cache.put_in_cache(Arc::clone(&acl));
        assert!(cache.get_from_cache_by_identity(&oid).is_some());

        cache.evict_from_cache_by_identity(&oid);
        assert!(cache.get_from_cache_by_identity(&oid).is_none());
    }

    #[test]
    fn evict_by_id_also_clears_identity_index() {
        let cache = InMemoryAclCache::new();
        let oid = ObjectIdentity::new("BlogPost", "42");
        let acl = Acl::hydrated(7, oid.clone(), AclContent::empty(true), None);
        cache.put_in_cache(acl);

        cache.evict_from_cache_by_id(7);
        assert!(cache.get_from_cache_by_identity(&oid).is_none());
    }

    #[test]
    fn clear_cache_empties_everything() {
        let cache = InMemoryAclCache::new();
        for i in 0..3 {
            let oid = ObjectIdentity::new("BlogPost", i.to_string());
            cache.put_in_cache(Acl::hydrated(i, oid, AclContent::empty(true), None));
        }
        cache.clear_cache();
        for i in 0..3 {
            let oid = ObjectIdentity::new("BlogPost", i.to_string());
            assert!(cache.get_from_cache_by_identity(&oid).is_none());
        }
    }
}
