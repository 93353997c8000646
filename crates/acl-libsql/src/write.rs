//! Write path: `createAcl`, `deleteAcl`, `updateAcl` and the
//! two security-identity maintenance operations, each committed as exactly
//! one transaction on the provider's connection.
//!
//! The connection is single-owner, so a plain `BEGIN
//! IMMEDIATE` / `COMMIT` / `ROLLBACK` on `self.conn()` is enough: every
//! statement issued by the helper methods already defined on
//! `LibSqlAclProvider` (`resolve_pk`, `upsert_class`, `upsert_security_identity`)
//! runs against that same connection and is therefore inside the open
//! transaction without needing a dedicated `Transaction` handle threaded
//! through every call.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use acl_core::{Ace, AceListKind, Acl, AclContent, AclError, AclResult, ObjectIdentity, SecurityIdentity};
use anyhow::Context as _;

use crate::{util, LibSqlAclProvider};

impl LibSqlAclProvider {
    async fn begin(&self) -> AclResult<()> {
        self.conn()
            .execute("BEGIN IMMEDIATE", ())
            .await
            .context("failed to begin transaction")
            .map_err(AclError::Backend)?;
        Ok(())
    }

    async fn commit(&self) -> AclResult<()> {
        self.conn()
            .execute("COMMIT", ())
            .await
            .context("failed to commit transaction")
            .map_err(AclError::Backend)?;
        Ok(())
    }

    async fn rollback(&self) {
        if let Err(error) = self.conn().execute("ROLLBACK", ()).await {
            warn!(%error, "failed to roll back transaction");
        }
    }

    pub(crate) async fn create_acl_impl(&self, oid: ObjectIdentity) -> AclResult<Arc<Acl>> {
        if self.resolve_pk(&oid).await.map_err(AclError::Backend)?.is_some() {
            return Err(AclError::AclAlreadyExists(oid));
        }

        self.begin().await?;

        let outcome: anyhow::Result<i64> = async {
            let class_id = self.upsert_class(oid.object_type()).await?;

            self.conn()
                .execute(
                    "INSERT INTO object_identities (class_id, object_identifier, parent_object_identity_id, entries_inheriting) \
                     VALUES (?, ?, NULL, 1)",
                    (class_id, oid.identifier()),
                )
                .await
                .context("failed to insert object identity row")?;

            let pk = self.conn().last_insert_rowid();

            self.conn()
                .execute(
                    "INSERT INTO object_identity_ancestors (object_identity_id, ancestor_id) VALUES (?, ?)",
                    (pk, pk),
                )
                .await
                .context("failed to insert self-ancestor row")?;

            Ok(pk)
        }
        .await;

        match outcome {
            Ok(pk) => {
                self.commit().await?;
                self.oid_index().insert(oid.clone(), pk);
            }
            Err(error) => {
                self.rollback().await;
                return Err(AclError::Backend(error));
            }
        }

        let mut result = self.find_acls_impl(std::slice::from_ref(&oid), None).await?;
        result.remove(&oid).ok_or(AclError::AclNotFound(oid))
    }

    pub(crate) async fn delete_acl_impl(&self, oid: &ObjectIdentity) -> AclResult<()> {
        let Some(pk) = self.resolve_pk(oid).await.map_err(AclError::Backend)? else {
            // Nothing to delete; treated as a no-op rather than an error.
            return Ok(());
        };

        self.begin().await?;

        let descendants = match self.delete_acl_tx(pk).await {
            Ok(descendants) => {
                self.commit().await?;
                descendants
            }
            Err(error) => {
                self.rollback().await;
                return Err(AclError::Backend(error));
            }
        };

        for (id, _parent, class_type, identifier) in descendants {
            let descendant_oid = ObjectIdentity::new(util::normalize_class_type(&class_type), identifier);
            self.loaded_acls().remove(&id);
            self.oid_index().remove(&descendant_oid);
            if let Some(cache) = self.cache() {
                cache.evict_from_cache_by_identity(&descendant_oid);
                cache.evict_from_cache_by_id(id);
            }
        }

        Ok(())
    }

    /// Deletes `pk` and every transitive child in one pass, returning the
    /// full set deleted (each row's former `(parent, class_type, identifier)`)
    /// so the caller can evict the right identities from memory and cache.
    async fn delete_acl_tx(&self, pk: i64) -> anyhow::Result<Vec<(i64, Option<i64>, String, String)>> {
        let sql = "SELECT oi.id, oi.parent_object_identity_id, c.class_type, oi.object_identifier \
                   FROM object_identity_ancestors oia \
                   JOIN object_identities oi ON oi.id = oia.object_identity_id \
                   JOIN classes c ON c.id = oi.class_id \
                   WHERE oia.ancestor_id = ?";

        let mut rows = self.conn().query(sql, [pk]).await.context("failed to query descendants")?;
        let mut descendants = Vec::new();
        while let Some(row) = rows.next().await.context("failed to read descendant row")? {
            let id: i64 = row.get(0).context("failed to read descendant id")?;
            let parent: Option<i64> = row.get(1).context("failed to read descendant parent")?;
            let class_type: String = row.get(2).context("failed to read descendant class_type")?;
            let identifier: String = row.get(3).context("failed to read descendant identifier")?;
            descendants.push((id, parent, class_type, identifier));
        }

        let ids: Vec<i64> = descendants.iter().map(|(id, ..)| *id).collect();
        let id_values: Vec<libsql::Value> = ids.iter().map(|id| libsql::Value::from(*id)).collect();
        let placeholders = util::repeat_qm(ids.len());

        let delete_entries_sql = format!("DELETE FROM entries WHERE object_identity_id IN ({placeholders})");
        self.conn()
            .execute(&delete_entries_sql, id_values.clone())
            .await
            .context("failed to delete object-scope entries")?;

        let mut ancestor_params = id_values.clone();
        ancestor_params.extend(id_values);
        let delete_ancestors_sql =
            format!("DELETE FROM object_identity_ancestors WHERE object_identity_id IN ({placeholders}) OR ancestor_id IN ({placeholders})");
        self.conn()
            .execute(&delete_ancestors_sql, ancestor_params)
            .await
            .context("failed to delete ancestor rows")?;

        // `parent_object_identity_id` is a foreign key with no `ON DELETE`
        // action, so children must be removed before their parent row.
        let mut remaining: HashMap<i64, Option<i64>> = descendants.iter().map(|(id, parent, ..)| (*id, *parent)).collect();
        let mut order = Vec::new();
        while !remaining.is_empty() {
            let referenced: HashSet<i64> = remaining
                .values()
                .filter_map(|parent| *parent)
                .filter(|parent| remaining.contains_key(parent))
                .collect();
            let leaves: Vec<i64> = remaining.keys().copied().filter(|id| !referenced.contains(id)).collect();
            if leaves.is_empty() {
                anyhow::bail!("cycle detected while ordering ACL deletions for pk {pk}");
            }
            for id in &leaves {
                remaining.remove(id);
            }
            order.extend(leaves);
        }

        for id in order {
            self.conn()
                .execute("DELETE FROM object_identities WHERE id = ?", [id])
                .await
                .context("failed to delete object identity row")?;
        }

        Ok(descendants)
    }

    pub(crate) async fn update_acl_impl(&self, acl: &Arc<Acl>) -> AclResult<()> {
        let tracked = self
            .loaded_acls()
            .get(&acl.id())
            .map(|entry| Arc::ptr_eq(entry.value(), acl))
            .unwrap_or(false);
        if !tracked {
            return Err(AclError::InvalidArgument("ACL is not tracked by this provider".to_owned()));
        }

        if !acl.is_dirty() {
            return Ok(());
        }

        let old = acl.baseline();
        let new = acl.content();
        let class_type = acl.object_identity().object_type().to_owned();
        let class_scope_changed = old.class_aces != new.class_aces || old.class_field_aces != new.class_field_aces;

        // Detect concurrent modification up front: every sibling ACL of the
        // same type currently in memory must still match the baseline we
        // are about to overwrite. The actual overwrite happens only after
        // the transaction commits.
        let mut siblings = Vec::new();
        if class_scope_changed {
            for entry in self.loaded_acls().iter() {
                let sibling = entry.value();
                if Arc::ptr_eq(sibling, acl) || sibling.object_identity().object_type() != class_type {
                    continue;
                }
                let sibling_content = sibling.content();
                if sibling_content.class_aces != old.class_aces || sibling_content.class_field_aces != old.class_field_aces {
                    return Err(AclError::ConcurrentModification { class_type });
                }
                siblings.push(Arc::clone(sibling));
            }
        }

        self.begin().await?;

        match self.update_acl_tx(acl, &old, &new).await {
            Ok(()) => self.commit().await?,
            Err(error) => {
                self.rollback().await;
                return Err(AclError::Backend(error));
            }
        }

        acl.mark_clean();

        for sibling in &siblings {
            sibling.overwrite_class_scope(new.class_aces.clone(), new.class_field_aces.clone());
        }

        if let Some(cache) = self.cache() {
            if class_scope_changed {
                // Descendants of unrelated types may share this class too; a
                // targeted eviction can't be trusted to reach all of them.
                cache.clear_cache();
            } else {
                cache.evict_from_cache_by_identity(acl.object_identity());
                cache.evict_from_cache_by_id(acl.id());
                if let Ok(children) = self.find_children_impl(acl.object_identity(), false).await {
                    for child in children {
                        cache.evict_from_cache_by_identity(&child);
                    }
                }
            }
        }

        Ok(())
    }

    async fn update_acl_tx(&self, acl: &Arc<Acl>, old: &AclContent, new: &AclContent) -> anyhow::Result<()> {
        let pk = acl.id();
        let class_id = self.upsert_class(acl.object_identity().object_type()).await?;

        let entries_inheriting_changed = old.entries_inheriting != new.entries_inheriting;
        let parent_changed = old.parent != new.parent;

        let new_parent_pk = match &new.parent {
            Some(parent_oid) => Some(
                self.resolve_pk(parent_oid)
                    .await?
                    .with_context(|| format!("parent object identity {parent_oid} has no ACL"))?,
            ),
            None => None,
        };

        if parent_changed {
            self.regenerate_ancestor_closure(pk, new_parent_pk).await?;
        }

        self.sync_ace_list(acl, AceListKind::Class, None, class_id, None, &old.class_aces, &new.class_aces)
            .await?;
        self.sync_field_map(acl, AceListKind::ClassField, class_id, None, &old.class_field_aces, &new.class_field_aces)
            .await?;
        self.sync_ace_list(acl, AceListKind::Object, None, class_id, Some(pk), &old.object_aces, &new.object_aces)
            .await?;
        self.sync_field_map(
            acl,
            AceListKind::ObjectField,
            class_id,
            Some(pk),
            &old.object_field_aces,
            &new.object_field_aces,
        )
        .await?;

        if entries_inheriting_changed || parent_changed {
            self.conn()
                .execute(
                    "UPDATE object_identities SET entries_inheriting = ?, parent_object_identity_id = ? WHERE id = ?",
                    (i64::from(new.entries_inheriting), new_parent_pk, pk),
                )
                .await
                .context("failed to update ACL scalar columns")?;
        }

        Ok(())
    }

    /// Deletes `pk`'s ancestor rows and those of
    /// every transitive child, then reinserts each one's full chain computed
    /// from `pk`'s new parent. Descendants keep their own `parent_object_identity_id`
    /// unchanged — only the denormalized closure above them shifts.
    async fn regenerate_ancestor_closure(&self, pk: i64, new_parent_pk: Option<i64>) -> anyhow::Result<()> {
        self.conn()
            .execute(
                "UPDATE object_identities SET parent_object_identity_id = ? WHERE id = ?",
                (new_parent_pk, pk),
            )
            .await
            .context("failed to update parent column")?;

        let mut subtree = vec![pk];
        let mut frontier = vec![pk];
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for parent_pk in &frontier {
                let mut rows = self
                    .conn()
                    .query("SELECT id FROM object_identities WHERE parent_object_identity_id = ?", [*parent_pk])
                    .await
                    .context("failed to query direct children")?;
                while let Some(row) = rows.next().await.context("failed to read child row")? {
                    next.push(row.get(0).context("failed to read child id")?);
                }
            }
            subtree.extend(&next);
            frontier = next;
        }

        let root_chain = match new_parent_pk {
            Some(parent_pk) => {
                let mut chain = self.ancestor_chain_of(parent_pk).await?;
                chain.insert(0, pk);
                chain
            }
            None => vec![pk],
        };

        let mut chains: HashMap<i64, Vec<i64>> = HashMap::new();
        chains.insert(pk, root_chain);

        // `subtree` is breadth-first from `pk`, so a node's direct parent is
        // always already chained by the time we reach it.
        for &node in subtree.iter().skip(1) {
            let parent_pk: i64 = self
                .conn()
                .query("SELECT parent_object_identity_id FROM object_identities WHERE id = ?", [node])
                .await
                .context("failed to read node parent")?
                .next()
                .await
                .context("failed to read node parent row")?
                .context("node disappeared mid-transaction")?
                .get(0)
                .context("failed to read parent id")?;

            let mut chain = vec![node];
            chain.extend(chains.get(&parent_pk).cloned().unwrap_or_else(|| vec![parent_pk]));
            chains.insert(node, chain);
        }

        for &node in &subtree {
            self.conn()
                .execute("DELETE FROM object_identity_ancestors WHERE object_identity_id = ?", [node])
                .await
                .context("failed to clear old ancestor rows")?;

            for &ancestor in &chains[&node] {
                self.conn()
                    .execute(
                        "INSERT INTO object_identity_ancestors (object_identity_id, ancestor_id) VALUES (?, ?)",
                        (node, ancestor),
                    )
                    .await
                    .context("failed to insert ancestor row")?;
            }
        }

        Ok(())
    }

    async fn ancestor_chain_of(&self, pk: i64) -> anyhow::Result<Vec<i64>> {
        let mut rows = self
            .conn()
            .query("SELECT ancestor_id FROM object_identity_ancestors WHERE object_identity_id = ?", [pk])
            .await
            .context("failed to query ancestor chain")?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.context("failed to read ancestor row")? {
            out.push(row.get(0).context("failed to read ancestor id")?);
        }
        Ok(out)
    }

    /// Synchronizes one ACE list (or the flat class/object list
    /// when `field` is `None`): delete disappeared ACEs, stage surviving
    /// ones through a temporary negative order so reordering can never
    /// collide with the `(class_id, object_identity_id, field_name,
    /// ace_order)` uniqueness constraint, then insert brand-new ACEs.
    async fn sync_ace_list(
        &self,
        acl: &Arc<Acl>,
        kind: AceListKind,
        field: Option<&str>,
        class_id: i64,
        object_identity_id: Option<i64>,
        old: &[Arc<Ace>],
        new: &[Arc<Ace>],
    ) -> anyhow::Result<()> {
        if old == new {
            return Ok(());
        }

        let new_ids: HashSet<i64> = new.iter().filter_map(|ace| ace.id).collect();
        for ace in old {
            let Some(id) = ace.id else { continue };
            if !new_ids.contains(&id) {
                self.conn()
                    .execute("DELETE FROM entries WHERE id = ?", [id])
                    .await
                    .context("failed to delete removed ACE")?;
            }
        }

        for ace in new {
            if let Some(id) = ace.id {
                self.conn()
                    .execute("UPDATE entries SET ace_order = ? WHERE id = ?", (-id, id))
                    .await
                    .context("failed to stage ACE order")?;
            }
        }

        for (index, ace) in new.iter().enumerate() {
            if let Some(id) = ace.id {
                self.conn()
                    .execute(
                        "UPDATE entries SET ace_order = ?, mask = ?, granting = ?, granting_strategy = ?, \
                         audit_success = ?, audit_failure = ? WHERE id = ?",
                        (
                            index as i64,
                            i64::from(ace.mask),
                            i64::from(ace.granting),
                            util::match_mode_to_db(ace.match_mode),
                            i64::from(ace.audit_success),
                            i64::from(ace.audit_failure),
                            id,
                        ),
                    )
                    .await
                    .context("failed to update ACE")?;
            }
        }

        for (index, ace) in new.iter().enumerate() {
            if ace.id.is_some() {
                continue;
            }

            let security_identity_id = self.upsert_security_identity(&ace.sid).await?;

            self.conn()
                .execute(
                    "INSERT INTO entries (class_id, object_identity_id, security_identity_id, field_name, ace_order, \
                     mask, granting, granting_strategy, audit_success, audit_failure) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    (
                        class_id,
                        object_identity_id,
                        security_identity_id,
                        field,
                        index as i64,
                        i64::from(ace.mask),
                        i64::from(ace.granting),
                        util::match_mode_to_db(ace.match_mode),
                        i64::from(ace.audit_success),
                        i64::from(ace.audit_failure),
                    ),
                )
                .await
                .context("failed to insert new ACE")?;

            let new_id = self.conn().last_insert_rowid();
            acl.assign_ace_id(kind, field, index, new_id)?;
            self.loaded_aces()
                .insert(new_id, Arc::new(Ace { id: Some(new_id), ..(**ace).clone() }));
        }

        Ok(())
    }

    async fn sync_field_map(
        &self,
        acl: &Arc<Acl>,
        kind: AceListKind,
        class_id: i64,
        object_identity_id: Option<i64>,
        old: &BTreeMap<String, Vec<Arc<Ace>>>,
        new: &BTreeMap<String, Vec<Arc<Ace>>>,
    ) -> anyhow::Result<()> {
        let mut fields: BTreeSet<&String> = old.keys().collect();
        fields.extend(new.keys());

        let empty = Vec::new();
        for field in fields {
            let old_list = old.get(field).unwrap_or(&empty);
            let new_list = new.get(field).unwrap_or(&empty);
            self.sync_ace_list(acl, kind, Some(field.as_str()), class_id, object_identity_id, old_list, new_list)
                .await?;
        }

        Ok(())
    }

    pub(crate) async fn delete_security_identity_impl(&self, sid: &SecurityIdentity) -> AclResult<()> {
        let identifier = sid.wire_form();
        let username_flag = i64::from(sid.username_flag());

        self.conn()
            .execute(
                "DELETE FROM security_identities WHERE identifier = ? AND username = ?",
                (identifier, username_flag),
            )
            .await
            .context("failed to delete security identity")
            .map_err(AclError::Backend)?;

        // Entries naming this SID were cascade-deleted; every in-memory ACL
        // that held one is now stale. Drop everything and let the next read
        // rehydrate from storage rather than trying to patch ACE lists
        // in place across an unbounded set of affected ACLs.
        self.loaded_acls().clear();
        self.loaded_aces().clear();
        self.oid_index().clear();
        if let Some(cache) = self.cache() {
            cache.clear_cache();
        }

        Ok(())
    }

    pub(crate) async fn update_user_security_identity_impl(&self, sid: &SecurityIdentity, old_username: &str) -> AclResult<()> {
        let (user_class, username) = match sid {
            SecurityIdentity::User { user_class, username } => (user_class, username),
            SecurityIdentity::Role { .. } => {
                return Err(AclError::InvalidArgument(
                    "updateUserSecurityIdentity only applies to User security identities".to_owned(),
                ))
            }
        };

        if username == old_username {
            return Err(AclError::InvalidArgument("old and new usernames are identical".to_owned()));
        }

        let old_wire_form = format!("{user_class}-{old_username}");
        let new_wire_form = sid.wire_form();

        self.conn()
            .execute(
                "UPDATE security_identities SET identifier = ? WHERE identifier = ? AND username = 1",
                (new_wire_form, old_wire_form),
            )
            .await
            .context("failed to rename user security identity")
            .map_err(AclError::Backend)?;

        self.loaded_acls().clear();
        self.loaded_aces().clear();
        self.oid_index().clear();
        if let Some(cache) = self.cache() {
            cache.clear_cache();
        }

        Ok(())
    }
}
