use std::sync::Arc;

use crate::ace::Ace;
use crate::acl::Acl;
use crate::error::{AclError, AclResult};
use crate::sid::SecurityIdentity;

/// Receives the side effect of a permission decision. Never invoked when
/// `administrativeMode` is true.
pub trait AuditLogger: Send + Sync {
    fn audit(&self, granting: bool, ace: &Ace);
}

/// Default audit sink: structured `tracing` events, gated by the ACE's own
/// `audit_success`/`audit_failure` flags.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn audit(&self, granting: bool, ace: &Ace) {
        if granting {
            if ace.audit_success {
                info!(sid = %ace.sid, mask = ace.mask, field = ?ace.field, "permission granted (audited)");
            }
        } else if ace.audit_failure {
            warn!(sid = %ace.sid, mask = ace.mask, field = ?ace.field, "permission denied (audited)");
        }
    }
}

/// A sink that drops every audit event. Useful for tests and for callers that
/// maintain their own audit pipeline out-of-band.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditLogger;

impl AuditLogger for NullAuditLogger {
    fn audit(&self, _granting: bool, _ace: &Ace) {}
}

/// The decision algorithm: evaluate a permission mask against an ordered ACE
/// list pulled from object scope, then class scope (if inheriting), then the
/// parent chain.
pub trait GrantingStrategy: Send + Sync {
    fn decide(
        &self,
        acl: &Arc<Acl>,
        field: Option<&str>,
        masks: &[i32],
        sids: &[SecurityIdentity],
        administrative_mode: bool,
        audit: &dyn AuditLogger,
    ) -> AclResult<bool>;
}

/// Object scope, then class scope (if `entriesInheriting`), then recurse
/// into the parent ACL forcing the same field-variant the caller asked for.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultGrantingStrategy;

impl GrantingStrategy for DefaultGrantingStrategy {
    fn decide(
        &self,
        acl: &Arc<Acl>,
        field: Option<&str>,
        masks: &[i32],
        sids: &[SecurityIdentity],
        administrative_mode: bool,
        audit: &dyn AuditLogger,
    ) -> AclResult<bool> {
        let object_list = match field {
            Some(field) => acl.object_field_aces(field),
            None => acl.object_aces(),
        };

        if let Some((granting, ace)) = first_applicable(&object_list, masks, sids) {
            if !administrative_mode {
                audit.audit(granting, &ace);
            }
            return Ok(granting);
        }

        if acl.entries_inheriting() {
            let class_list = match field {
                Some(field) => acl.class_field_aces(field),
                None => acl.class_aces(),
            };

            if let Some((granting, ace)) = first_applicable(&class_list, masks, sids) {
                if !administrative_mode {
                    audit.audit(granting, &ace);
                }
                return Ok(granting);
            }
        }

        if let Some(parent) = acl.parent() {
            return self.decide(&parent, field, masks, sids, administrative_mode, audit);
        }

        Err(AclError::NoApplicableAce)
    }
}

/// Mask-outer, sid-inner, ACE-list-in-order scan; the first applicable ACE
/// decides.
fn first_applicable(list: &[Arc<Ace>], masks: &[i32], sids: &[SecurityIdentity]) -> Option<(bool, Arc<Ace>)> {
    for &mask in masks {
        for sid in sids {
            for ace in list {
                if ace.is_applicable(mask, sid) {
                    return Some((ace.granting, ace.clone()));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ace::MatchMode;
    use crate::acl::AclContent;
    use crate::oid::ObjectIdentity;

    fn acl_with(content: AclContent, parent: Option<Arc<Acl>>) -> Arc<Acl> {
        Acl::hydrated(1, ObjectIdentity::new("BlogPost", "42"), content, parent)
    }

    #[test]
    fn s1_basic_grant_and_no_applicable_ace() {
        let mut content = AclContent::empty(true);
        content.class_aces.push(Arc::new(Ace::new(
            SecurityIdentity::role("ROLE_USER"),
            1,
            true,
            MatchMode::All,
        )));
        let acl = acl_with(content, None);
        let strategy = DefaultGrantingStrategy;
        let audit = NullAuditLogger;

        assert!(strategy
            .decide(&acl, None, &[1], &[SecurityIdentity::role("ROLE_USER")], true, &audit)
            .unwrap());

        let err = strategy
            .decide(&acl, None, &[2], &[SecurityIdentity::role("ROLE_USER")], true, &audit)
            .unwrap_err();
        assert!(matches!(err, AclError::NoApplicableAce));
    }

    #[test]
    fn s2_object_scope_deny_wins_over_class_scope_grant() {
        let mut content = AclContent::empty(true);
        content.object_aces.push(Arc::new(Ace::new(
            SecurityIdentity::role("ROLE_USER"),
            1,
            false,
            MatchMode::All,
        )));
        content.class_aces.push(Arc::new(Ace::new(
            SecurityIdentity::role("ROLE_USER"),
            1,
            true,
            MatchMode::All,
        )));
        let acl = acl_with(content, None);
        let strategy = DefaultGrantingStrategy;

        let granted = strategy
            .decide(&acl, None, &[1], &[SecurityIdentity::role("ROLE_USER")], true, &NullAuditLogger)
            .unwrap();
        assert!(!granted);
    }

    #[test]
    fn s3_mask_strategies_any_and_all() {
        let mut content = AclContent::empty(true);
        content.class_aces.push(Arc::new(Ace::new(
            SecurityIdentity::role("R"),
            0b1100,
            true,
            MatchMode::Any,
        )));
        let acl = acl_with(content, None);
        let strategy = DefaultGrantingStrategy;

        assert!(strategy
            .decide(&acl, None, &[0b0100], &[SecurityIdentity::role("R")], true, &NullAuditLogger)
            .unwrap());
        assert!(strategy
            .decide(&acl, None, &[0b0001], &[SecurityIdentity::role("R")], true, &NullAuditLogger)
            .is_err());

        let mut content_all = AclContent::empty(true);
        content_all.class_aces.push(Arc::new(Ace::new(
            SecurityIdentity::role("R"),
            0b1100,
            true,
            MatchMode::All,
        )));
        let acl_all = acl_with(content_all, None);

        assert!(strategy
            .decide(&acl_all, None, &[0b0100], &[SecurityIdentity::role("R")], true, &NullAuditLogger)
            .unwrap());
        assert!(strategy
            .decide(&acl_all, None, &[0b1110], &[SecurityIdentity::role("R")], true, &NullAuditLogger)
            .is_err());
    }

    #[test]
    fn s4_inheritance_through_parent_and_entries_inheriting_flag() {
        let mut parent_content = AclContent::empty(true);
        parent_content.class_aces.push(Arc::new(Ace::new(
            SecurityIdentity::role("R"),
            1,
            true,
            MatchMode::All,
        )));
        let parent = acl_with(parent_content, None);

        let child_content = AclContent::empty(true);
        let child = acl_with(child_content, Some(parent));
        let strategy = DefaultGrantingStrategy;

        assert!(strategy
            .decide(&child, None, &[1], &[SecurityIdentity::role("R")], true, &NullAuditLogger)
            .unwrap());

        child.set_entries_inheriting(false);
        assert!(strategy
            .decide(&child, None, &[1], &[SecurityIdentity::role("R")], true, &NullAuditLogger)
            .is_err());
    }

    #[test]
    fn field_scoped_decisions_force_field_variant_through_parent() {
        let mut parent_content = AclContent::empty(true);
        parent_content.class_field_aces.insert(
            "title".to_owned(),
            vec![Arc::new(Ace::new_field(
                "title",
                SecurityIdentity::role("R"),
                1,
                true,
                MatchMode::All,
            ))],
        );
        let parent = acl_with(parent_content, None);
        let child = acl_with(AclContent::empty(true), Some(parent));
        let strategy = DefaultGrantingStrategy;

        assert!(strategy
            .decide(
                &child,
                Some("title"),
                &[1],
                &[SecurityIdentity::role("R")],
                true,
                &NullAuditLogger
            )
            .unwrap());
    }

    #[test]
    fn idempotent_decisions() {
        let mut content = AclContent::empty(true);
        content.class_aces.push(Arc::new(Ace::new(
            SecurityIdentity::role("R"),
            1,
            true,
            MatchMode::All,
        )));
        let acl = acl_with(content, None);
        let strategy = DefaultGrantingStrategy;

        let first = strategy
            .decide(&acl, None, &[1], &[SecurityIdentity::role("R")], true, &NullAuditLogger)
            .unwrap();
        let second = strategy
            .decide(&acl, None, &[1], &[SecurityIdentity::role("R")], true, &NullAuditLogger)
            .unwrap();
        assert_eq!(first, second);
    }
}
