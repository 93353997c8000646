use crate::sid::SecurityIdentity;

/// Predicate used to compare a requested permission mask against an ACE's mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Applicable iff the requested mask equals the ACE mask exactly.
    Equal,
    /// Applicable iff every requested bit is present in the ACE mask.
    All,
    /// Applicable iff at least one requested bit is present in the ACE mask.
    Any,
}

impl MatchMode {
    pub fn is_applicable(self, requested: i32, ace_mask: i32) -> bool {
        match self {
            Self::Equal => requested == ace_mask,
            Self::All => (requested & ace_mask) == requested,
            Self::Any => (requested & ace_mask) != 0,
        }
    }
}

/// One authorization rule.
///
/// `id` is `None` until the entry is first persisted. `field` distinguishes a
/// field-scoped entry (`FieldEntry` in spec.md's vocabulary) from a flat one;
/// an ACE never moves between the two shapes.
///
/// This is a plain value type; referential identity for a given ACE id is
/// established the same way it is for [`crate::Acl`] — by wrapping it in an
/// `Arc` and handing out clones of that `Arc` rather than the value. The ACE
/// lists on [`crate::AclContent`] hold `Arc<Ace>` for exactly this reason.
#[derive(Debug, Clone, PartialEq)]
pub struct Ace {
    pub id: Option<i64>,
    pub sid: SecurityIdentity,
    pub mask: i32,
    pub granting: bool,
    pub match_mode: MatchMode,
    pub audit_success: bool,
    pub audit_failure: bool,
    pub field: Option<String>,
}

impl Ace {
    /// Constructs a not-yet-persisted flat (class or object scope) ACE.
    pub fn new(sid: SecurityIdentity, mask: i32, granting: bool, match_mode: MatchMode) -> Self {
        Self {
            id: None,
            sid,
            mask,
            granting,
            match_mode,
            audit_success: false,
            audit_failure: false,
            field: None,
        }
    }

    /// Constructs a not-yet-persisted field-scoped ACE.
    pub fn new_field(
        field: impl Into<String>,
        sid: SecurityIdentity,
        mask: i32,
        granting: bool,
        match_mode: MatchMode,
    ) -> Self {
        Self {
            field: Some(field.into()),
            ..Self::new(sid, mask, granting, match_mode)
        }
    }

    pub fn with_auditing(mut self, audit_success: bool, audit_failure: bool) -> Self {
        self.audit_success = audit_success;
        self.audit_failure = audit_failure;
        self
    }

    pub fn is_applicable(&self, requested_mask: i32, sid: &SecurityIdentity) -> bool {
        &self.sid == sid && self.match_mode.is_applicable(requested_mask, self.mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_mode_equal() {
        assert!(MatchMode::Equal.is_applicable(1, 1));
        assert!(!MatchMode::Equal.is_applicable(1, 2));
    }

    #[test]
    fn match_mode_all() {
        assert!(MatchMode::All.is_applicable(0b0100, 0b1100));
        assert!(!MatchMode::All.is_applicable(0b1110, 0b1100));
    }

    #[test]
    fn match_mode_any() {
        assert!(MatchMode::Any.is_applicable(0b0100, 0b1100));
        assert!(!MatchMode::Any.is_applicable(0b0001, 0b1100));
    }

    #[test]
    fn is_applicable_checks_sid_too() {
        let ace = Ace::new(SecurityIdentity::role("ROLE_USER"), 1, true, MatchMode::All);
        assert!(ace.is_applicable(1, &SecurityIdentity::role("ROLE_USER")));
        assert!(!ace.is_applicable(1, &SecurityIdentity::role("ROLE_ADMIN")));
    }
}
