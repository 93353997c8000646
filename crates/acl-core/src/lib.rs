//! Backend-agnostic access control list model.
//!
//! This crate has no opinion on storage: it owns the object/security
//! identity types, the ACE and ACL containers, the permission-granting
//! strategy, the cache interface, and the `AclProvider`/`MutableAclProvider`
//! traits that a concrete backend (see `acl-libsql`) implements.

#[macro_use]
extern crate tracing;

mod ace;
mod acl;
mod cache;
mod error;
mod oid;
mod provider;
mod sid;
mod strategy;

pub use ace::{Ace, MatchMode};
pub use acl::{AceListKind, Acl, AclContent};
pub use cache::{AclCache, InMemoryAclCache};
pub use error::{AclError, AclResult};
pub use oid::ObjectIdentity;
pub use provider::{AclProvider, MutableAclProvider, ProviderOptions};
pub use sid::{InvalidUserSidWireForm, SecurityIdentity};
pub use strategy::{AuditLogger, DefaultGrantingStrategy, GrantingStrategy, NullAuditLogger, TracingAuditLogger};

use std::sync::Arc;

pub type DynAclProvider = Arc<dyn MutableAclProvider>;
