use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::acl::Acl;
use crate::error::AclResult;
use crate::oid::ObjectIdentity;
use crate::sid::SecurityIdentity;

/// Read path: hydrates ACLs by object identity, in single or batch form, and
/// walks the object tree for child lookups.
///
/// Hydration is conceptually a synchronous algorithm within one call, but
/// every concrete backend we care about talks to storage asynchronously, so
/// the trait surfaces that as the implementation's async wrapper rather than
/// forcing callers through a blocking bridge.
#[async_trait]
pub trait AclProvider: Send + Sync {
    /// Loads the ACL for `oid`, including its full parent chain.
    ///
    /// `sids`, when given, is a hint restricting which security identities'
    /// ACEs the caller is interested in; an implementation may use it to
    /// decide whether a cached ACL is good enough or must be reloaded. A
    /// cache hit that cannot answer for a requested SID surfaces
    /// [`crate::error::AclError::NotImplemented`] rather than silently
    /// returning a partial ACL.
    async fn find_acl(&self, oid: &ObjectIdentity, sids: Option<&[SecurityIdentity]>) -> AclResult<Arc<Acl>>;

    /// Batched variant of [`AclProvider::find_acl`].
    ///
    /// Returns `Ok` only when every requested identity resolved; otherwise
    /// returns [`crate::error::AclError::NotAllAclsFound`] carrying whatever
    /// subset did resolve, so a caller that only needs "most of them" doesn't
    /// have to retry one at a time.
    async fn find_acls(
        &self,
        oids: &[ObjectIdentity],
        sids: Option<&[SecurityIdentity]>,
    ) -> AclResult<HashMap<ObjectIdentity, Arc<Acl>>>;

    /// Lists children of `oid`: direct children only, or every transitive
    /// descendant, depending on `direct_only`.
    async fn find_children(&self, oid: &ObjectIdentity, direct_only: bool) -> AclResult<Vec<ObjectIdentity>>;
}

/// Write path: every mutation that changes what is persisted.
///
/// Implementations commit each operation as a single transaction and are
/// expected to keep their own identity map / cache coherent with what was
/// actually written, evicting or clearing rather than guessing at a patched
/// in-memory state when that's cheaper and safer.
#[async_trait]
pub trait MutableAclProvider: AclProvider {
    /// Creates a new, empty, `entriesInheriting = true` ACL for `oid`.
    ///
    /// Fails with [`crate::error::AclError::AclAlreadyExists`] if one already
    /// exists for this identity.
    async fn create_acl(&self, oid: ObjectIdentity) -> AclResult<Arc<Acl>>;

    /// Deletes the ACL for `oid` and, recursively, every direct child's ACL.
    async fn delete_acl(&self, oid: &ObjectIdentity) -> AclResult<()>;

    /// Persists every change accumulated on `acl` since it was hydrated or
    /// last saved, then marks it clean. A no-op if the ACL isn't dirty.
    async fn update_acl(&self, acl: &Arc<Acl>) -> AclResult<()>;

    /// Removes every ACE naming `sid`, across every ACL that has one.
    async fn delete_security_identity(&self, sid: &SecurityIdentity) -> AclResult<()>;

    /// Renames a user SID's username in every ACE that references it,
    /// leaving role SIDs and the rest of the wire form untouched.
    async fn update_user_security_identity(&self, sid: &SecurityIdentity, old_username: &str) -> AclResult<()>;
}

/// Table/column naming and batching knobs a concrete storage backend exposes.
/// Kept here, rather than hardcoded, since the default table names are just
/// that: defaults, not requirements.
#[derive(Debug, Clone, typed_builder::TypedBuilder)]
pub struct ProviderOptions {
    #[builder(default = "classes".to_owned())]
    pub class_table_name: String,
    #[builder(default = "object_identities".to_owned())]
    pub oid_table_name: String,
    #[builder(default = "object_identity_ancestors".to_owned())]
    pub oid_ancestors_table_name: String,
    #[builder(default = "entries".to_owned())]
    pub entry_table_name: String,
    #[builder(default = "security_identities".to_owned())]
    pub sid_table_name: String,
    /// Largest number of object identities batched into a single ancestor or
    /// hydration query before `findAcls` splits the request.
    #[builder(default = 30)]
    pub max_batch_size: usize,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}
