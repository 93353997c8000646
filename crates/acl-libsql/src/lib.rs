#[macro_use]
extern crate tracing;

mod read;
mod util;
mod write;

use std::collections::HashMap;
use std::sync::Arc;

use acl_core::{
    Acl, AclCache, AclError, AclProvider, AclResult, Ace, DefaultGrantingStrategy, GrantingStrategy,
    MutableAclProvider, ObjectIdentity, ProviderOptions, SecurityIdentity, TracingAuditLogger,
};
use anyhow::Context as _;
use async_trait::async_trait;
use dashmap::DashMap;
use libsql::Connection;

pub use libsql;

const MIGRATIONS: &[&str] = &[
    // Migration 0 - classes, object identities, ancestor closure, security identities, entries.
    include_str!("migrations/01_acl_schema.sql"),
];

/// [`AclProvider`]/[`MutableAclProvider`] backed by libSQL.
///
/// A provider instance is single-owner: callers must not share it across
/// concurrent tasks (spec's concurrency model assumes a serialized
/// executor). Multiple provider instances against the same database
/// coordinate only through SQL transactions.
#[derive(typed_builder::TypedBuilder)]
pub struct LibSqlAclProvider {
    conn: Connection,
    #[builder(default)]
    options: ProviderOptions,
    #[builder(default_code = "Box::new(DefaultGrantingStrategy)")]
    strategy: Box<dyn GrantingStrategy>,
    #[builder(default_code = "Box::new(TracingAuditLogger)")]
    audit: Box<dyn acl_core::AuditLogger>,
    #[builder(default)]
    cache: Option<Arc<dyn AclCache>>,
    /// Identity map: `object_identities.id` → the single `Arc<Acl>` instance
    /// this provider hands out for it.
    #[builder(default, setter(skip))]
    loaded_acls: DashMap<i64, Arc<Acl>>,
    /// Reverse index so a caller-supplied `ObjectIdentity` can find its pk
    /// without a round-trip to storage.
    #[builder(default, setter(skip))]
    oid_index: DashMap<ObjectIdentity, i64>,
    /// Canonical ACE store: every materialized ACE, keyed by its storage id,
    /// so two ACLs referencing the same ACE id see content-identical copies.
    #[builder(default, setter(skip))]
    loaded_aces: DashMap<i64, Arc<Ace>>,
}

impl LibSqlAclProvider {
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn options(&self) -> &ProviderOptions {
        &self.options
    }

    pub(crate) fn strategy(&self) -> &dyn GrantingStrategy {
        self.strategy.as_ref()
    }

    pub(crate) fn audit(&self) -> &dyn acl_core::AuditLogger {
        self.audit.as_ref()
    }

    pub(crate) fn cache(&self) -> Option<&Arc<dyn AclCache>> {
        self.cache.as_ref()
    }

    pub(crate) fn loaded_acls(&self) -> &DashMap<i64, Arc<Acl>> {
        &self.loaded_acls
    }

    pub(crate) fn oid_index(&self) -> &DashMap<ObjectIdentity, i64> {
        &self.oid_index
    }

    pub(crate) fn loaded_aces(&self) -> &DashMap<i64, Arc<Ace>> {
        &self.loaded_aces
    }

    /// Opens a libSQL connection at `path` (a file path, or `":memory:"`).
    pub async fn open(path: &str) -> anyhow::Result<Self> {
        let conn = libsql::Builder::new_local(path)
            .build()
            .await
            .context("failed to open libSQL connection")?
            .connect()
            .context("failed to connect to libSQL")?;

        Ok(Self::builder().conn(conn).build())
    }

    /// Applies PRAGMAs and runs pending migrations. Must be called once
    /// before any other operation.
    pub async fn setup(&self) -> anyhow::Result<()> {
        self.apply_pragmas().await?;
        self.migrate().await?;
        Ok(())
    }

    /// Evaluates `acl.isGranted` using this provider's configured strategy and audit sink.
    pub fn is_granted(
        &self,
        acl: &Arc<Acl>,
        masks: &[i32],
        sids: &[SecurityIdentity],
        administrative_mode: bool,
    ) -> AclResult<bool> {
        acl.is_granted(self.strategy(), self.audit(), masks, sids, administrative_mode)
    }

    /// Field-scoped variant of [`LibSqlAclProvider::is_granted`].
    pub fn is_field_granted(
        &self,
        acl: &Arc<Acl>,
        field: &str,
        masks: &[i32],
        sids: &[SecurityIdentity],
        administrative_mode: bool,
    ) -> AclResult<bool> {
        acl.is_field_granted(self.strategy(), self.audit(), field, masks, sids, administrative_mode)
    }

    async fn apply_pragmas(&self) -> anyhow::Result<()> {
        const PRAGMAS: &str = "
            -- https://www.sqlite.org/pragma.html#pragma_journal_mode
            PRAGMA journal_mode = WAL;

            -- https://www.sqlite.org/pragma.html#pragma_synchronous
            -- WAL mode is safe from corruption with synchronous=NORMAL.
            PRAGMA synchronous = NORMAL;

            -- https://www.sqlite.org/pragma.html#pragma_busy_timeout
            PRAGMA busy_timeout = 15000;

            -- https://www.sqlite.org/pragma.html#pragma_cache_size
            PRAGMA cache_size = -3000;

            -- https://www.sqlite.org/pragma.html#pragma_auto_vacuum
            PRAGMA auto_vacuum = INCREMENTAL;

            -- https://www.sqlite.org/pragma.html#pragma_temp_store
            PRAGMA temp_store = MEMORY;

            -- Required for ON DELETE CASCADE (security_identities -> entries) to take effect.
            PRAGMA foreign_keys = ON;
        ";

        trace!(sql_query = %PRAGMAS, "PRAGMAs query");

        let mut batch_rows = self
            .conn
            .execute_batch(PRAGMAS)
            .await
            .context("failed to batch execute SQL query")?;

        while let Some(rows) = batch_rows.next_stmt_row() {
            let Some(mut rows) = rows else {
                continue;
            };

            while let Ok(Some(row)) = rows.next().await {
                trace!(?row, "PRAGMA row");
            }
        }

        Ok(())
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        let user_version = self.query_user_version().await?;

        match MIGRATIONS.get(user_version..) {
            Some(remaining) if !remaining.is_empty() => {
                info!(
                    user_version,
                    migration_count = MIGRATIONS.len() - user_version,
                    "Start migration"
                );

                for (sql_query, migration_id) in remaining.iter().zip(user_version..MIGRATIONS.len()) {
                    trace!(migration_id, %sql_query, "Apply migration");

                    self.conn
                        .execute_batch(sql_query)
                        .await
                        .with_context(|| format!("failed to execute migration {migration_id}"))?;

                    self.update_user_version(migration_id + 1)
                        .await
                        .context("failed to update user version")?;
                }

                info!("Migration complete");
            }
            None => {
                warn!(user_version, "user_version is set to an unexpected value");
            }
            _ => {
                debug!(user_version, "Database is already up to date");
            }
        }

        Ok(())
    }

    async fn query_user_version(&self) -> anyhow::Result<usize> {
        let row = self
            .conn
            .query("PRAGMA user_version", ())
            .await
            .context("failed to execute SQL query")?
            .next()
            .await
            .context("failed to read the row")?
            .context("no row returned")?;

        let value = row.get::<u64>(0).context("failed to read user_version value")?;

        Ok(usize::try_from(value).expect("number not too big"))
    }

    async fn update_user_version(&self, value: usize) -> anyhow::Result<()> {
        let value = u64::try_from(value).expect("number not too big");
        let sql_query = format!("PRAGMA user_version = {value}");

        self.conn
            .execute(&sql_query, ())
            .await
            .context("failed to execute SQL query")?;

        Ok(())
    }

    /// Resolves `(type, identifier)` to its primary key, consulting the
    /// reverse index before falling back to storage.
    async fn resolve_pk(&self, oid: &ObjectIdentity) -> anyhow::Result<Option<i64>> {
        if let Some(pk) = self.oid_index.get(oid) {
            return Ok(Some(*pk));
        }

        let sql_query = "SELECT oi.id FROM object_identities oi JOIN classes c ON c.id = oi.class_id \
             WHERE c.class_type = ? AND oi.object_identifier = ?";

        let mut rows = self
            .conn
            .query(sql_query, (oid.object_type(), oid.identifier()))
            .await
            .context("failed to resolve object identity")?;

        let Some(row) = rows.next().await.context("failed to read row")? else {
            return Ok(None);
        };

        let pk: i64 = row.get(0).context("failed to read pk")?;
        self.oid_index.insert(oid.clone(), pk);
        Ok(Some(pk))
    }

    async fn upsert_class(&self, class_type: &str) -> anyhow::Result<i64> {
        self.conn
            .execute(
                "INSERT INTO classes (class_type) VALUES (?) ON CONFLICT (class_type) DO NOTHING",
                [class_type],
            )
            .await
            .context("failed to upsert class row")?;

        let mut rows = self
            .conn
            .query("SELECT id FROM classes WHERE class_type = ?", [class_type])
            .await
            .context("failed to query class row")?;

        let row = rows
            .next()
            .await
            .context("failed to read class row")?
            .context("class row missing after upsert")?;

        row.get(0).context("failed to read class id")
    }

    async fn upsert_security_identity(&self, sid: &SecurityIdentity) -> anyhow::Result<i64> {
        let identifier = sid.wire_form();
        let username_flag = i64::from(sid.username_flag());

        self.conn
            .execute(
                "INSERT INTO security_identities (identifier, username) VALUES (?, ?) \
                 ON CONFLICT (identifier, username) DO NOTHING",
                (identifier.clone(), username_flag),
            )
            .await
            .context("failed to upsert security identity row")?;

        let mut rows = self
            .conn
            .query(
                "SELECT id FROM security_identities WHERE identifier = ? AND username = ?",
                (identifier, username_flag),
            )
            .await
            .context("failed to query security identity row")?;

        let row = rows
            .next()
            .await
            .context("failed to read security identity row")?
            .context("security identity row missing after upsert")?;

        row.get(0).context("failed to read security identity id")
    }
}

#[async_trait]
impl AclProvider for LibSqlAclProvider {
    async fn find_acl(&self, oid: &ObjectIdentity, sids: Option<&[SecurityIdentity]>) -> AclResult<Arc<Acl>> {
        let mut result = self.find_acls(std::slice::from_ref(oid), sids).await?;
        result.remove(oid).ok_or_else(|| AclError::AclNotFound(oid.clone()))
    }

    async fn find_acls(
        &self,
        oids: &[ObjectIdentity],
        sids: Option<&[SecurityIdentity]>,
    ) -> AclResult<HashMap<ObjectIdentity, Arc<Acl>>> {
        self.find_acls_impl(oids, sids).await
    }

    async fn find_children(&self, oid: &ObjectIdentity, direct_only: bool) -> AclResult<Vec<ObjectIdentity>> {
        self.find_children_impl(oid, direct_only).await
    }
}

#[async_trait]
impl MutableAclProvider for LibSqlAclProvider {
    async fn create_acl(&self, oid: ObjectIdentity) -> AclResult<Arc<Acl>> {
        self.create_acl_impl(oid).await
    }

    async fn delete_acl(&self, oid: &ObjectIdentity) -> AclResult<()> {
        self.delete_acl_impl(oid).await
    }

    async fn update_acl(&self, acl: &Arc<Acl>) -> AclResult<()> {
        self.update_acl_impl(acl).await
    }

    async fn delete_security_identity(&self, sid: &SecurityIdentity) -> AclResult<()> {
        self.delete_security_identity_impl(sid).await
    }

    async fn update_user_security_identity(&self, sid: &SecurityIdentity, old_username: &str) -> AclResult<()> {
        self.update_user_security_identity_impl(sid, old_username).await
    }
}
