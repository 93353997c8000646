use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::ace::{Ace, MatchMode};
use crate::error::{AclError, AclResult};
use crate::oid::ObjectIdentity;
use crate::sid::SecurityIdentity;
use crate::strategy::{AuditLogger, GrantingStrategy};

/// Which of the four ACE buckets a mutation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AceListKind {
    Class,
    ClassField,
    Object,
    ObjectField,
}

/// The four ACE lists plus inheritance/parent state, as loaded or mutated.
///
/// Lists hold `Arc<Ace>` rather than bare `Ace` so that an ACE resolved
/// through the provider's `loaded_aces` map (see `acl-libsql`'s hydration)
/// keeps the same referential identity everywhere it's handed out, exactly
/// as `Arc<Acl>` already does for ACL ids — spec.md §3/§8.2 require this for
/// ACEs too ("likewise for ACE id"). `PartialEq` on `Arc<T>` compares the
/// pointee's value, not the pointer, so dirty-checking below still compares
/// content rather than identity.
///
/// Kept separate from [`Acl`] so it can be snapshotted wholesale: one clone
/// taken right after hydration (or after a successful `updateAcl` commit)
/// serves as the "as persisted" baseline, and diffing it against the live
/// copy at `updateAcl` time is how dirty properties are discovered (spec.md
/// §9: "position change is inferred from the snapshot diff, not from
/// per-setter events").
#[derive(Debug, Clone, PartialEq)]
pub struct AclContent {
    pub entries_inheriting: bool,
    pub parent: Option<ObjectIdentity>,
    pub class_aces: Vec<Arc<Ace>>,
    pub class_field_aces: BTreeMap<String, Vec<Arc<Ace>>>,
    pub object_aces: Vec<Arc<Ace>>,
    pub object_field_aces: BTreeMap<String, Vec<Arc<Ace>>>,
}

impl AclContent {
    pub fn empty(entries_inheriting: bool) -> Self {
        Self {
            entries_inheriting,
            parent: None,
            class_aces: Vec::new(),
            class_field_aces: BTreeMap::new(),
            object_aces: Vec::new(),
            object_field_aces: BTreeMap::new(),
        }
    }

    fn list_mut(&mut self, kind: AceListKind, field: Option<&str>) -> &mut Vec<Arc<Ace>> {
        match (kind, field) {
            (AceListKind::Class, _) => &mut self.class_aces,
            (AceListKind::Object, _) => &mut self.object_aces,
            (AceListKind::ClassField, Some(field)) => self.class_field_aces.entry(field.to_owned()).or_default(),
            (AceListKind::ObjectField, Some(field)) => self.object_field_aces.entry(field.to_owned()).or_default(),
            _ => unreachable!("field-scoped list requires a field name"),
        }
    }
}

/// Container of four ACE lists attached to an object identity.
///
/// Referential identity is realized by the provider
/// keeping exactly one `Arc<Acl>` per `(type, identifier)` in its identity
/// map and handing out clones of that `Arc`; mutation goes through
/// `parking_lot::RwLock` interior mutability so every holder observes it.
pub struct Acl {
    id: i64,
    object_identity: ObjectIdentity,
    baseline: RwLock<AclContent>,
    state: RwLock<AclContent>,
    parent_acl: RwLock<Option<Arc<Acl>>>,
}

impl Acl {
    /// Constructs an ACL whose `baseline` matches `content` — i.e. freshly
    /// hydrated from storage, or freshly created with empty lists.
    pub fn hydrated(id: i64, object_identity: ObjectIdentity, content: AclContent, parent: Option<Arc<Acl>>) -> Arc<Self> {
        Arc::new(Self {
            id,
            object_identity,
            baseline: RwLock::new(content.clone()),
            state: RwLock::new(content),
            parent_acl: RwLock::new(parent),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn object_identity(&self) -> &ObjectIdentity {
        &self.object_identity
    }

    pub fn entries_inheriting(&self) -> bool {
        self.state.read().entries_inheriting
    }

    pub fn set_entries_inheriting(&self, value: bool) {
        self.state.write().entries_inheriting = value;
    }

    pub fn parent(&self) -> Option<Arc<Acl>> {
        self.parent_acl.read().clone()
    }

    /// Sets (or clears) the parent link. The caller is responsible for
    /// passing an `Acl` already installed in the provider's identity map so
    /// referential identity of the parent chain is preserved.
    pub fn set_parent_acl(&self, parent: Option<Arc<Acl>>) {
        self.state.write().parent = parent.as_ref().map(|p| p.object_identity.clone());
        *self.parent_acl.write() = parent;
    }

    pub fn class_aces(&self) -> Vec<Arc<Ace>> {
        self.state.read().class_aces.clone()
    }

    pub fn object_aces(&self) -> Vec<Arc<Ace>> {
        self.state.read().object_aces.clone()
    }

    pub fn class_field_aces(&self, field: &str) -> Vec<Arc<Ace>> {
        self.state.read().class_field_aces.get(field).cloned().unwrap_or_default()
    }

    pub fn object_field_aces(&self, field: &str) -> Vec<Arc<Ace>> {
        self.state
            .read()
            .object_field_aces
            .get(field)
            .cloned()
            .unwrap_or_default()
    }

    /// Current live content, used by the provider to build SQL statements.
    pub fn content(&self) -> AclContent {
        self.state.read().clone()
    }

    /// Content as it was at hydration time / after the last successful commit.
    pub fn baseline(&self) -> AclContent {
        self.baseline.read().clone()
    }

    /// `true` if nothing has changed since the last commit.
    pub fn is_dirty(&self) -> bool {
        *self.baseline.read() != *self.state.read()
    }

    /// Marks the current state as persisted: the baseline becomes the state.
    /// Called by the provider after a successful `updateAcl` commit.
    pub fn mark_clean(&self) {
        let content = self.state.read().clone();
        *self.baseline.write() = content;
    }

    /// Overwrites the live `classAces`/`classFieldAces` with externally
    /// committed values, used by the provider to propagate a class-scope
    /// change to sibling ACLs of the same type that were *not* the one
    /// being saved.
    pub fn overwrite_class_scope(&self, class_aces: Vec<Arc<Ace>>, class_field_aces: BTreeMap<String, Vec<Arc<Ace>>>) {
        let mut state = self.state.write();
        state.class_aces = class_aces.clone();
        state.class_field_aces = class_field_aces.clone();
        let mut baseline = self.baseline.write();
        baseline.class_aces = class_aces;
        baseline.class_field_aces = class_field_aces;
    }

    fn insert(&self, kind: AceListKind, field: Option<&str>, ace: Ace, index: Option<usize>) -> AclResult<()> {
        let mut state = self.state.write();
        let list = state.list_mut(kind, field);
        let index = index.unwrap_or(list.len());
        if index > list.len() {
            return Err(AclError::InvalidArgument(format!(
                "insert index {index} out of range (len {})",
                list.len()
            )));
        }
        list.insert(index, Arc::new(ace));
        Ok(())
    }

    fn update(
        &self,
        kind: AceListKind,
        field: Option<&str>,
        index: usize,
        mask: i32,
        match_mode: Option<MatchMode>,
    ) -> AclResult<()> {
        let mut state = self.state.write();
        let list = state.list_mut(kind, field);
        let entry = list
            .get_mut(index)
            .ok_or_else(|| AclError::InvalidArgument(format!("index {index} out of range (len {})", list.len())))?;
        let entry = Arc::make_mut(entry);
        entry.mask = mask;
        if let Some(match_mode) = match_mode {
            entry.match_mode = match_mode;
        }
        Ok(())
    }

    fn update_auditing(
        &self,
        kind: AceListKind,
        field: Option<&str>,
        index: usize,
        audit_success: bool,
        audit_failure: bool,
    ) -> AclResult<()> {
        let mut state = self.state.write();
        let list = state.list_mut(kind, field);
        let entry = list
            .get_mut(index)
            .ok_or_else(|| AclError::InvalidArgument(format!("index {index} out of range (len {})", list.len())))?;
        let entry = Arc::make_mut(entry);
        entry.audit_success = audit_success;
        entry.audit_failure = audit_failure;
        Ok(())
    }

    fn delete(&self, kind: AceListKind, field: Option<&str>, index: usize) -> AclResult<()> {
        let mut state = self.state.write();
        let list = state.list_mut(kind, field);
        if index >= list.len() {
            return Err(AclError::InvalidArgument(format!(
                "index {index} out of range (len {})",
                list.len()
            )));
        }
        list.remove(index);
        Ok(())
    }

    pub fn insert_class_ace(&self, ace: Ace, index: Option<usize>) -> AclResult<()> {
        self.insert(AceListKind::Class, None, ace, index)
    }

    pub fn insert_object_ace(&self, ace: Ace, index: Option<usize>) -> AclResult<()> {
        self.insert(AceListKind::Object, None, ace, index)
    }

    pub fn insert_class_field_ace(&self, field: &str, ace: Ace, index: Option<usize>) -> AclResult<()> {
        self.insert(AceListKind::ClassField, Some(field), ace, index)
    }

    pub fn insert_object_field_ace(&self, field: &str, ace: Ace, index: Option<usize>) -> AclResult<()> {
        self.insert(AceListKind::ObjectField, Some(field), ace, index)
    }

    pub fn update_class_ace(&self, index: usize, mask: i32, match_mode: Option<MatchMode>) -> AclResult<()> {
        self.update(AceListKind::Class, None, index, mask, match_mode)
    }

    pub fn update_object_ace(&self, index: usize, mask: i32, match_mode: Option<MatchMode>) -> AclResult<()> {
        self.update(AceListKind::Object, None, index, mask, match_mode)
    }

    pub fn update_class_field_ace(
        &self,
        field: &str,
        index: usize,
        mask: i32,
        match_mode: Option<MatchMode>,
    ) -> AclResult<()> {
        self.update(AceListKind::ClassField, Some(field), index, mask, match_mode)
    }

    pub fn update_object_field_ace(
        &self,
        field: &str,
        index: usize,
        mask: i32,
        match_mode: Option<MatchMode>,
    ) -> AclResult<()> {
        self.update(AceListKind::ObjectField, Some(field), index, mask, match_mode)
    }

    pub fn update_class_ace_auditing(&self, index: usize, success: bool, failure: bool) -> AclResult<()> {
        self.update_auditing(AceListKind::Class, None, index, success, failure)
    }

    pub fn update_object_ace_auditing(&self, index: usize, success: bool, failure: bool) -> AclResult<()> {
        self.update_auditing(AceListKind::Object, None, index, success, failure)
    }

    pub fn update_class_field_ace_auditing(&self, field: &str, index: usize, success: bool, failure: bool) -> AclResult<()> {
        self.update_auditing(AceListKind::ClassField, Some(field), index, success, failure)
    }

    pub fn update_object_field_ace_auditing(
        &self,
        field: &str,
        index: usize,
        success: bool,
        failure: bool,
    ) -> AclResult<()> {
        self.update_auditing(AceListKind::ObjectField, Some(field), index, success, failure)
    }

    pub fn delete_class_ace(&self, index: usize) -> AclResult<()> {
        self.delete(AceListKind::Class, None, index)
    }

    pub fn delete_object_ace(&self, index: usize) -> AclResult<()> {
        self.delete(AceListKind::Object, None, index)
    }

    pub fn delete_class_field_ace(&self, field: &str, index: usize) -> AclResult<()> {
        self.delete(AceListKind::ClassField, Some(field), index)
    }

    pub fn delete_object_field_ace(&self, field: &str, index: usize) -> AclResult<()> {
        self.delete(AceListKind::ObjectField, Some(field), index)
    }

    /// Stamps the storage-assigned id onto a just-inserted ACE, called by the
    /// provider right after the corresponding `INSERT` returns. Does not
    /// dirty the ACL any further since the caller is expected to
    /// [`Acl::mark_clean`] once the whole commit succeeds.
    pub fn assign_ace_id(&self, kind: AceListKind, field: Option<&str>, index: usize, id: i64) -> AclResult<()> {
        let mut state = self.state.write();
        let list = state.list_mut(kind, field);
        let entry = list
            .get_mut(index)
            .ok_or_else(|| AclError::InvalidArgument(format!("index {index} out of range (len {})", list.len())))?;
        Arc::make_mut(entry).id = Some(id);
        Ok(())
    }

    /// Evaluates whether `sids` are granted every mask in `masks` at object scope,
    /// delegating to the permission-granting strategy.
    pub fn is_granted(
        self: &Arc<Self>,
        strategy: &dyn GrantingStrategy,
        audit: &dyn AuditLogger,
        masks: &[i32],
        sids: &[SecurityIdentity],
        administrative_mode: bool,
    ) -> AclResult<bool> {
        strategy.decide(self, None, masks, sids, administrative_mode, audit)
    }

    /// Field-scoped variant of [`Acl::is_granted`].
    pub fn is_field_granted(
        self: &Arc<Self>,
        strategy: &dyn GrantingStrategy,
        audit: &dyn AuditLogger,
        field: &str,
        masks: &[i32],
        sids: &[SecurityIdentity],
        administrative_mode: bool,
    ) -> AclResult<bool> {
        strategy.decide(self, Some(field), masks, sids, administrative_mode, audit)
    }
}

impl std::fmt::Debug for Acl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acl")
            .field("id", &self.id)
            .field("object_identity", &self.object_identity)
            .field("entries_inheriting", &self.entries_inheriting())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Arc<Acl> {
        Acl::hydrated(
            1,
            ObjectIdentity::new("BlogPost", "42"),
            AclContent::empty(true),
            None,
        )
    }

    #[test]
    fn freshly_created_acl_is_clean_and_empty() {
        let acl = fresh();
        assert!(!acl.is_dirty());
        assert!(acl.entries_inheriting());
        assert!(acl.class_aces().is_empty());
        assert!(acl.object_aces().is_empty());
        assert!(acl.parent().is_none());
    }

    #[test]
    fn insert_then_dirty_then_clean() {
        let acl = fresh();
        let ace = Ace::new(SecurityIdentity::role("ROLE_USER"), 1, true, MatchMode::All);
        acl.insert_class_ace(ace, None).unwrap();
        assert!(acl.is_dirty());
        assert_eq!(acl.class_aces().len(), 1);

        acl.mark_clean();
        assert!(!acl.is_dirty());
    }

    #[test]
    fn insert_rejects_out_of_range_index() {
        let acl = fresh();
        let ace = Ace::new(SecurityIdentity::role("ROLE_USER"), 1, true, MatchMode::All);
        let err = acl.insert_class_ace(ace, Some(5)).unwrap_err();
        assert!(matches!(err, AclError::InvalidArgument(_)));
    }

    #[test]
    fn delete_then_update_round_trip() {
        let acl = fresh();
        acl.insert_object_ace(Ace::new(SecurityIdentity::role("A"), 1, true, MatchMode::All), None)
            .unwrap();
        acl.insert_object_ace(Ace::new(SecurityIdentity::role("B"), 2, true, MatchMode::All), None)
            .unwrap();

        acl.update_object_ace(1, 4, Some(MatchMode::Any)).unwrap();
        assert_eq!(acl.object_aces()[1].mask, 4);
        assert_eq!(acl.object_aces()[1].match_mode, MatchMode::Any);

        acl.delete_object_ace(0).unwrap();
        assert_eq!(acl.object_aces().len(), 1);
        assert_eq!(acl.object_aces()[0].sid, SecurityIdentity::role("B"));
    }

    #[test]
    fn returning_to_original_value_makes_acl_clean_again() {
        let acl = fresh();
        acl.insert_class_ace(Ace::new(SecurityIdentity::role("A"), 1, true, MatchMode::All), None)
            .unwrap();
        acl.mark_clean();

        acl.update_class_ace(0, 2, None).unwrap();
        assert!(acl.is_dirty());

        acl.update_class_ace(0, 1, None).unwrap();
        assert!(!acl.is_dirty());
    }
}
