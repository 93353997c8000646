use std::fmt;

/// A principal appearing in an ACE: either a user or a role.
///
/// Equality is structural. The wire form is what gets persisted in the
/// `security_identities` table (`identifier`, `username` columns): a user
/// SID's wire form is `"{user_class}-{username}"` with `username_flag=true`;
/// a role SID's wire form is the role name itself with `username_flag=false`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SecurityIdentity {
    User { user_class: String, username: String },
    Role { name: String },
}

impl SecurityIdentity {
    pub fn user(user_class: impl Into<String>, username: impl Into<String>) -> Self {
        Self::User {
            user_class: user_class.into(),
            username: username.into(),
        }
    }

    pub fn role(name: impl Into<String>) -> Self {
        Self::Role { name: name.into() }
    }

    /// `true` for `User`, `false` for `Role` — mirrors the `username` column.
    pub fn username_flag(&self) -> bool {
        matches!(self, Self::User { .. })
    }

    /// The string stored in `security_identities.identifier`.
    pub fn wire_form(&self) -> String {
        match self {
            Self::User { user_class, username } => format!("{user_class}-{username}"),
            Self::Role { name } => name.clone(),
        }
    }

    /// Reconstructs a `SecurityIdentity` from a stored `(identifier, username_flag)` pair.
    ///
    /// For a user SID, the identifier is split on the *first* `-` to recover
    /// `(user_class, username)`.
    pub fn from_wire_form(identifier: &str, username_flag: bool) -> Result<Self, InvalidUserSidWireForm> {
        if username_flag {
            let (user_class, username) = identifier
                .split_once('-')
                .ok_or_else(|| InvalidUserSidWireForm(identifier.to_owned()))?;
            Ok(Self::user(user_class, username))
        } else {
            Ok(Self::role(identifier))
        }
    }
}

impl fmt::Display for SecurityIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_form())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("user security identity wire form is missing the '-' separator: {0:?}")]
pub struct InvalidUserSidWireForm(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_wire_form_roundtrips() {
        let sid = SecurityIdentity::user("AppBundle:User", "jsmith");
        assert_eq!(sid.wire_form(), "AppBundle:User-jsmith");
        assert!(sid.username_flag());

        let back = SecurityIdentity::from_wire_form(&sid.wire_form(), true).unwrap();
        assert_eq!(sid, back);
    }

    #[test]
    fn role_wire_form_roundtrips() {
        let sid = SecurityIdentity::role("ROLE_USER");
        assert_eq!(sid.wire_form(), "ROLE_USER");
        assert!(!sid.username_flag());

        let back = SecurityIdentity::from_wire_form(&sid.wire_form(), false).unwrap();
        assert_eq!(sid, back);
    }

    #[test]
    fn username_with_embedded_dash_splits_on_first() {
        // Class names can legitimately contain '-'; split_once keeps the rest as username.
        let back = SecurityIdentity::from_wire_form("App-User-bob-smith", true).unwrap();
        assert_eq!(back, SecurityIdentity::user("App", "User-bob-smith"));
    }

    #[test]
    fn malformed_user_wire_form_errs() {
        assert!(SecurityIdentity::from_wire_form("no-separator-missing", true).is_ok());
        assert!(SecurityIdentity::from_wire_form("nodash", true).is_err());
    }
}
