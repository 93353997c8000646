use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use acl_core::{Ace, Acl, AclContent, AclError, AclResult, ObjectIdentity, SecurityIdentity};
use anyhow::Context as _;

use crate::{util, LibSqlAclProvider};

/// Accumulates the rows of one hydration query for a single `acl_id` before
/// `Acl::hydrated` is called, so the resulting ACL's baseline matches its
/// state exactly (no dirtying through the normal mutator methods).
struct Building {
    object_identifier: String,
    class_type: String,
    parent_pk: Option<i64>,
    entries_inheriting: bool,
    class_aces: Vec<(i64, Arc<Ace>)>,
    class_field_aces: BTreeMap<String, Vec<(i64, Arc<Ace>)>>,
    object_aces: Vec<(i64, Arc<Ace>)>,
    object_field_aces: BTreeMap<String, Vec<(i64, Arc<Ace>)>>,
}

impl Building {
    fn snapshot_content(&self, parent_oid: Option<ObjectIdentity>) -> AclContent {
        fn sorted(list: &[(i64, Arc<Ace>)]) -> Vec<Arc<Ace>> {
            let mut list = list.to_vec();
            list.sort_by_key(|(order, _)| *order);
            list.into_iter().map(|(_, ace)| ace).collect()
        }

        AclContent {
            entries_inheriting: self.entries_inheriting,
            parent: parent_oid,
            class_aces: sorted(&self.class_aces),
            class_field_aces: self
                .class_field_aces
                .iter()
                .map(|(field, aces)| (field.clone(), sorted(aces)))
                .collect(),
            object_aces: sorted(&self.object_aces),
            object_field_aces: self
                .object_field_aces
                .iter()
                .map(|(field, aces)| (field.clone(), sorted(aces)))
                .collect(),
        }
    }
}

impl LibSqlAclProvider {
    pub(crate) async fn find_acls_impl(
        &self,
        oids: &[ObjectIdentity],
        sids: Option<&[SecurityIdentity]>,
    ) -> AclResult<HashMap<ObjectIdentity, Arc<Acl>>> {
        if let Some(sids) = sids {
            // The provider never filters by security identity at load time (every
            // hydrated ACL already carries entries for every SID); the parameter
            // exists only so callers can express the same call shape as the
            // decision-making API.
            trace!(requested_sids = sids.len(), "findAcls sids hint (informational)");
        }

        let mut result: HashMap<ObjectIdentity, Arc<Acl>> = HashMap::new();
        let mut pending: Vec<ObjectIdentity> = Vec::new();
        let batch_size = self.options().max_batch_size.max(1);

        for oid in oids {
            if result.contains_key(oid) {
                continue;
            }

            if let Some(acl) = self.lookup_loaded(oid) {
                result.insert(oid.clone(), acl);
                continue;
            }

            if let Some(cache) = self.cache() {
                if let Some(acl) = cache.get_from_cache_by_identity(oid) {
                    self.reattach_cached_parents(&acl);
                    result.insert(oid.clone(), Arc::clone(&acl));
                    continue;
                }
            }

            pending.push(oid.clone());

            if pending.len() >= batch_size {
                self.load_batch(&pending, &mut result).await?;
                pending.clear();
            }
        }

        if !pending.is_empty() {
            self.load_batch(&pending, &mut result).await?;
        }

        let missing = oids.iter().any(|oid| !result.contains_key(oid));
        if missing {
            if oids.len() == 1 {
                return Err(AclError::AclNotFound(oids[0].clone()));
            }
            return Err(AclError::NotAllAclsFound { found: result });
        }

        Ok(result)
    }

    pub(crate) async fn find_children_impl(&self, oid: &ObjectIdentity, direct_only: bool) -> AclResult<Vec<ObjectIdentity>> {
        let pk = self
            .resolve_pk(oid)
            .await
            .map_err(AclError::Backend)?
            .ok_or_else(|| AclError::AclNotFound(oid.clone()))?;

        let sql_query = if direct_only {
            "SELECT c.class_type, oi.object_identifier FROM object_identities oi \
             JOIN classes c ON c.id = oi.class_id \
             WHERE oi.parent_object_identity_id = ?"
        } else {
            "SELECT c.class_type, oi.object_identifier FROM object_identity_ancestors oia \
             JOIN object_identities oi ON oi.id = oia.object_identity_id \
             JOIN classes c ON c.id = oi.class_id \
             WHERE oia.ancestor_id = ? AND oia.object_identity_id != oia.ancestor_id"
        };

        let mut rows = self
            .conn()
            .query(sql_query, [libsql::Value::from(pk)])
            .await
            .context("failed to query children")
            .map_err(AclError::Backend)?;

        let mut children = Vec::new();
        while let Some(row) = rows.next().await.context("failed to read children row").map_err(AclError::Backend)? {
            let class_type: String = row.get(0).context("failed to read class_type").map_err(AclError::Backend)?;
            let object_identifier: String = row.get(1).context("failed to read object_identifier").map_err(AclError::Backend)?;
            children.push(ObjectIdentity::new(util::normalize_class_type(&class_type), object_identifier));
        }

        Ok(children)
    }

    /// Adopts a cache-returned ACL into the identity map if it is not
    /// already present, and rewires its parent link onto this provider's own
    /// canonical instance for the same id, recursing up the chain.
    pub(crate) fn reattach_cached_parents(&self, acl: &Arc<Acl>) {
        let canonical = self
            .loaded_acls()
            .entry(acl.id())
            .or_insert_with(|| Arc::clone(acl))
            .value()
            .clone();
        self.oid_index().insert(canonical.object_identity().clone(), canonical.id());

        if let Some(parent) = canonical.parent() {
            let resolved_parent = if let Some(existing) = self.loaded_acls().get(&parent.id()) {
                Arc::clone(existing.value())
            } else {
                self.reattach_cached_parents(&parent);
                Arc::clone(self.loaded_acls().get(&parent.id()).expect("just inserted").value())
            };

            if !Arc::ptr_eq(&resolved_parent, &parent) {
                canonical.set_parent_acl(Some(resolved_parent));
            }
        }
    }

    fn lookup_loaded(&self, oid: &ObjectIdentity) -> Option<Arc<Acl>> {
        let pk = *self.oid_index().get(oid)?;
        self.loaded_acls().get(&pk).map(|entry| Arc::clone(entry.value()))
    }

    async fn load_batch(&self, batch: &[ObjectIdentity], result: &mut HashMap<ObjectIdentity, Arc<Acl>>) -> AclResult<()> {
        let (where_clause, params) = batch_where_clause(batch);

        let ancestor_sql = format!(
            "SELECT oi.id, oi.object_identifier, c.class_type, oia.ancestor_id \
             FROM object_identities oi \
             JOIN classes c ON c.id = oi.class_id \
             JOIN object_identity_ancestors oia ON oia.object_identity_id = oi.id \
             WHERE {where_clause}"
        );

        trace!(%ancestor_sql, batch_len = batch.len(), "ancestor query");

        let mut rows = self
            .conn()
            .query(&ancestor_sql, params)
            .await
            .context("failed to run ancestor query")
            .map_err(AclError::Backend)?;

        let mut ancestor_ids = std::collections::BTreeSet::new();
        let mut oid_to_pk: HashMap<ObjectIdentity, i64> = HashMap::new();

        while let Some(row) = rows.next().await.context("failed to read ancestor row").map_err(AclError::Backend)? {
            let pk: i64 = row.get(0).map_err(|e| AclError::Backend(e.into()))?;
            let identifier: String = row.get(1).map_err(|e| AclError::Backend(e.into()))?;
            let class_type: String = row.get(2).map_err(|e| AclError::Backend(e.into()))?;
            let ancestor_id: i64 = row.get(3).map_err(|e| AclError::Backend(e.into()))?;

            oid_to_pk.insert(ObjectIdentity::new(util::normalize_class_type(&class_type), identifier), pk);
            ancestor_ids.insert(ancestor_id);
        }

        if ancestor_ids.is_empty() {
            // None of this batch's OIDs resolved to a row; the caller's
            // end-of-pass missing-OID check reports the right error kind.
            return Ok(());
        }

        let ancestor_ids: Vec<i64> = ancestor_ids.into_iter().collect();
        let placeholders = util::repeat_qm(ancestor_ids.len());

        let hydration_sql = format!(
            "SELECT oi.id, oi.object_identifier, oi.parent_object_identity_id, oi.entries_inheriting, \
                    c.class_type, e.id, e.object_identity_id, e.field_name, e.ace_order, e.mask, \
                    e.granting, e.granting_strategy, e.audit_success, e.audit_failure, \
                    si.username, si.identifier \
             FROM object_identities oi \
             JOIN classes c ON c.id = oi.class_id \
             LEFT JOIN entries e ON (e.object_identity_id = oi.id OR (e.object_identity_id IS NULL AND e.class_id = oi.class_id)) \
             LEFT JOIN security_identities si ON si.id = e.security_identity_id \
             WHERE oi.id IN ({placeholders})"
        );

        let params: Vec<libsql::Value> = ancestor_ids.iter().map(|id| libsql::Value::from(*id)).collect();

        trace!(%hydration_sql, ancestor_count = ancestor_ids.len(), "hydration query");

        let mut rows = self
            .conn()
            .query(&hydration_sql, params)
            .await
            .context("failed to run hydration query")
            .map_err(AclError::Backend)?;

        let mut buildings: HashMap<i64, Building> = HashMap::new();

        while let Some(row) = rows.next().await.context("failed to read hydration row").map_err(AclError::Backend)? {
            let acl_id: i64 = row.get(0).map_err(|e| AclError::Backend(e.into()))?;
            let object_identifier: String = row.get(1).map_err(|e| AclError::Backend(e.into()))?;
            let parent_pk: Option<i64> = row.get(2).map_err(|e| AclError::Backend(e.into()))?;
            let entries_inheriting: i64 = row.get(3).map_err(|e| AclError::Backend(e.into()))?;
            let class_type: String = row.get(4).map_err(|e| AclError::Backend(e.into()))?;
            let ace_id: Option<i64> = row.get(5).map_err(|e| AclError::Backend(e.into()))?;
            let entry_oid: Option<i64> = row.get(6).map_err(|e| AclError::Backend(e.into()))?;
            let field_name: Option<String> = row.get(7).map_err(|e| AclError::Backend(e.into()))?;
            let ace_order: Option<i64> = row.get(8).map_err(|e| AclError::Backend(e.into()))?;
            let mask: Option<i64> = row.get(9).map_err(|e| AclError::Backend(e.into()))?;
            let granting: Option<i64> = row.get(10).map_err(|e| AclError::Backend(e.into()))?;
            let granting_strategy: Option<String> = row.get(11).map_err(|e| AclError::Backend(e.into()))?;
            let audit_success: Option<i64> = row.get(12).map_err(|e| AclError::Backend(e.into()))?;
            let audit_failure: Option<i64> = row.get(13).map_err(|e| AclError::Backend(e.into()))?;
            let username_flag: Option<i64> = row.get(14).map_err(|e| AclError::Backend(e.into()))?;
            let security_identifier: Option<String> = row.get(15).map_err(|e| AclError::Backend(e.into()))?;

            let class_type = util::normalize_class_type(&class_type);

            let building = buildings.entry(acl_id).or_insert_with(|| Building {
                object_identifier,
                class_type,
                parent_pk,
                entries_inheriting: entries_inheriting != 0,
                class_aces: Vec::new(),
                class_field_aces: BTreeMap::new(),
                object_aces: Vec::new(),
                object_field_aces: BTreeMap::new(),
            });

            let Some(ace_id) = ace_id else { continue };

            let sid = SecurityIdentity::from_wire_form(
                security_identifier.as_deref().unwrap_or_default(),
                username_flag.unwrap_or_default() != 0,
            )
            .map_err(|e| AclError::Backend(anyhow::anyhow!(e)))?;

            let match_mode = util::match_mode_from_db(granting_strategy.as_deref().unwrap_or_default()).map_err(AclError::Backend)?;

            // `or_insert_with` + `Arc::clone` (via `.clone()` on the `Arc<Ace>`
            // value) is what makes every row referencing this `ace_id` across
            // this and later hydration passes share one `Ace` instance.
            let ace = self
                .loaded_aces()
                .entry(ace_id)
                .or_insert_with(|| {
                    Arc::new(Ace {
                        id: Some(ace_id),
                        sid,
                        mask: mask.unwrap_or_default() as i32,
                        granting: granting.unwrap_or_default() != 0,
                        match_mode,
                        audit_success: audit_success.unwrap_or_default() != 0,
                        audit_failure: audit_failure.unwrap_or_default() != 0,
                        field: field_name.clone(),
                    })
                })
                .value()
                .clone();

            let order = ace_order.unwrap_or_default();
            match (entry_oid.is_none(), field_name) {
                (true, None) => building.class_aces.push((order, ace)),
                (true, Some(field)) => building.class_field_aces.entry(field).or_default().push((order, ace)),
                (false, None) => building.object_aces.push((order, ace)),
                (false, Some(field)) => building.object_field_aces.entry(field).or_default().push((order, ace)),
            }
        }

        let mut resolved: HashMap<i64, Arc<Acl>> = HashMap::new();

        for oid in batch {
            let Some(&pk) = oid_to_pk.get(oid) else { continue };

            let acl = self.materialize(pk, &buildings, &mut resolved)?;
            self.oid_index().insert(oid.clone(), pk);

            if let Some(cache) = self.cache() {
                cache.put_in_cache(Arc::clone(&acl));
            }

            result.insert(oid.clone(), acl);
        }

        Ok(())
    }

    fn materialize(&self, pk: i64, buildings: &HashMap<i64, Building>, resolved: &mut HashMap<i64, Arc<Acl>>) -> AclResult<Arc<Acl>> {
        if let Some(acl) = resolved.get(&pk) {
            return Ok(Arc::clone(acl));
        }

        if let Some(existing) = self.loaded_acls().get(&pk) {
            let acl = Arc::clone(existing.value());
            resolved.insert(pk, Arc::clone(&acl));
            return Ok(acl);
        }

        let building = buildings
            .get(&pk)
            .ok_or_else(|| AclError::IntegrityViolation(format!("no row data for acl {pk}")))?;

        let parent = match building.parent_pk {
            Some(parent_pk) => Some(self.materialize(parent_pk, buildings, resolved).map_err(|err| match err {
                AclError::IntegrityViolation(_) => AclError::IntegrityViolation(format!("cannot resolve parent {parent_pk} of acl {pk}")),
                other => other,
            })?),
            None => None,
        };

        let oid = ObjectIdentity::new(building.class_type.clone(), building.object_identifier.clone());
        let parent_oid = parent.as_ref().map(|p| p.object_identity().clone());
        let content = building.snapshot_content(parent_oid);

        let acl = Acl::hydrated(pk, oid.clone(), content, parent);
        self.loaded_acls().insert(pk, Arc::clone(&acl));
        self.oid_index().insert(oid, pk);
        resolved.insert(pk, Arc::clone(&acl));
        Ok(acl)
    }
}

fn batch_where_clause(batch: &[ObjectIdentity]) -> (String, Vec<libsql::Value>) {
    let all_same_type = batch.windows(2).all(|w| w[0].object_type() == w[1].object_type());

    if all_same_type {
        let placeholders = util::repeat_qm(batch.len());
        let sql = format!("c.class_type = ? AND oi.object_identifier IN ({placeholders})");
        let mut params = vec![libsql::Value::from(batch[0].object_type().to_owned())];
        params.extend(batch.iter().map(|oid| libsql::Value::from(oid.identifier().to_owned())));
        (sql, params)
    } else {
        let clauses: Vec<&str> = batch.iter().map(|_| "(c.class_type = ? AND oi.object_identifier = ?)").collect();
        let sql = clauses.join(" OR ");
        let mut params = Vec::with_capacity(batch.len() * 2);
        for oid in batch {
            params.push(libsql::Value::from(oid.object_type().to_owned()));
            params.push(libsql::Value::from(oid.identifier().to_owned()));
        }
        (sql, params)
    }
}
