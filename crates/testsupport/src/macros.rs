//! Shorthand macros for the values catalog tests spell out constantly.

/// Builds a `NamespaceString` from `"db.coll"`, or from a tenant and
/// `"db.coll"`.
///
/// # Examples
///
/// ```
/// use testsupport::nss;
/// use types::{NamespaceString, TenantId};
///
/// assert_eq!(nss!("app.users"), NamespaceString::new("app", "users"));
/// assert_eq!(nss!(TenantId(3), "app.users").tenant(), Some(TenantId(3)));
/// ```
#[macro_export]
macro_rules! nss {
    ($full:expr) => {
        ::types::NamespaceString::parse($full)
            .unwrap_or_else(|| panic!("invalid namespace {:?}", $full))
    };
    ($tenant:expr, $full:expr) => {{
        let parsed = $crate::nss!($full);
        ::types::NamespaceString::from_db(
            ::types::DatabaseName::with_tenant($tenant, parsed.db.db),
            parsed.coll,
        )
    }};
}

/// Builds a `Timestamp` from seconds, or from seconds and an increment.
///
/// # Examples
///
/// ```
/// use testsupport::ts;
/// use types::Timestamp;
///
/// assert_eq!(ts!(10), Timestamp::new(10, 0));
/// assert_eq!(ts!(10, 2), Timestamp::new(10, 2));
/// ```
#[macro_export]
macro_rules! ts {
    ($secs:expr) => {
        ::types::Timestamp::new($secs, 0)
    };
    ($secs:expr, $inc:expr) => {
        ::types::Timestamp::new($secs, $inc)
    };
}
