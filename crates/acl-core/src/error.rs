use std::sync::Arc;

use crate::acl::Acl;
use crate::oid::ObjectIdentity;

/// Errors raised by the ACL provider and the permission-granting strategy.
///
/// Each variant is a distinct error kind callers are expected to match on
/// rather than parse from the message, so this is a proper
/// `thiserror` enum rather than an opaque `anyhow::Error` — the plumbing
/// inside `acl-libsql` still uses `anyhow` internally and folds into
/// `AclError::Backend` at the trait boundary.
#[derive(Debug, thiserror::Error)]
pub enum AclError {
    #[error("no ACL found for object identity {0}")]
    AclNotFound(ObjectIdentity),

    /// Carries whatever subset of the request was actually resolved.
    #[error("not all requested ACLs were found ({} of the requested set)", .found.len())]
    NotAllAclsFound { found: std::collections::HashMap<ObjectIdentity, Arc<Acl>> },

    #[error("an ACL already exists for object identity {0}")]
    AclAlreadyExists(ObjectIdentity),

    #[error("no applicable ACE was found for the requested permission")]
    NoApplicableAce,

    #[error("class-scope ACEs for type {class_type:?} were modified concurrently")]
    ConcurrentModification { class_type: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// The identity map holds an ACL for this object identity, but it was
    /// not loaded with all of the requested SIDs, and partial-SID reload is
    /// not supported by the default implementation.
    #[error("ACL is cached without the requested SIDs; partial-SID reload is not implemented")]
    NotImplemented,

    /// Wraps lower-level persistence failures (SQL errors, I/O, etc.).
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type AclResult<T> = Result<T, AclError>;
