use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical commit time. `secs` orders first, `inc` breaks ties.
/// Examples:
/// - `let ts = Timestamp::new(10, 10);`
/// - `let untimestamped = Timestamp::MIN; // the null timestamp`
/// - `let oldest = Timestamp::MAX;`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: u32,
    pub inc: u32,
}

impl Timestamp {
    pub const MIN: Timestamp = Timestamp { secs: 0, inc: 0 };
    pub const MAX: Timestamp = Timestamp {
        secs: u32::MAX,
        inc: u32::MAX,
    };

    pub const fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    /// The null timestamp marks an untimestamped write.
    pub fn is_null(&self) -> bool {
        *self == Self::MIN
    }

    /// `None` for the null timestamp, otherwise `Some(self)`.
    pub fn non_null(self) -> Option<Timestamp> {
        (!self.is_null()).then_some(self)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

/// Tenant owning a set of databases when multitenancy is enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TenantId(pub u64);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Database name, optionally scoped to a tenant.
/// Examples:
/// - `let db = DatabaseName::new("app");`
/// - `let db = DatabaseName::with_tenant(TenantId(7), "app");`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatabaseName {
    pub tenant: Option<TenantId>,
    pub db: String,
}

impl DatabaseName {
    pub fn new(db: impl Into<String>) -> Self {
        Self {
            tenant: None,
            db: db.into(),
        }
    }

    pub fn with_tenant(tenant: TenantId, db: impl Into<String>) -> Self {
        Self {
            tenant: Some(tenant),
            db: db.into(),
        }
    }

    pub fn tenant(&self) -> Option<TenantId> {
        self.tenant
    }

    /// Smallest namespace inside this database; used as a range lower bound.
    pub fn first_namespace(&self) -> NamespaceString {
        NamespaceString {
            db: self.clone(),
            coll: String::new(),
        }
    }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tenant {
            Some(tenant) => write!(f, "{tenant}_{}", self.db),
            None => f.write_str(&self.db),
        }
    }
}

/// Fully qualified collection name. Ordered by (tenant, db, coll).
/// Examples:
/// - `let nss = NamespaceString::new("app", "users");`
/// - `let nss = NamespaceString::from_db(DatabaseName::with_tenant(TenantId(1), "app"), "users");`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NamespaceString {
    pub db: DatabaseName,
    pub coll: String,
}

impl NamespaceString {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: DatabaseName::new(db),
            coll: coll.into(),
        }
    }

    pub fn from_db(db: DatabaseName, coll: impl Into<String>) -> Self {
        Self {
            db,
            coll: coll.into(),
        }
    }

    /// Parses `"db.coll"`; the collection part may itself contain dots.
    pub fn parse(full: &str) -> Option<Self> {
        let (db, coll) = full.split_once('.')?;
        if db.is_empty() || coll.is_empty() {
            return None;
        }
        Some(Self::new(db, coll))
    }

    pub fn db_name(&self) -> &DatabaseName {
        &self.db
    }

    pub fn tenant(&self) -> Option<TenantId> {
        self.db.tenant
    }
}

impl fmt::Display for NamespaceString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Stable identity of a collection across renames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollectionUuid(pub Uuid);

impl CollectionUuid {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CollectionUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Key of an entry in the durable catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CatalogId(pub u64);

impl fmt::Display for CatalogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A collection addressed either by name or by (database, uuid).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NamespaceStringOrUuid {
    Nss(NamespaceString),
    Uuid(DatabaseName, CollectionUuid),
}

impl NamespaceStringOrUuid {
    pub fn db_name(&self) -> &DatabaseName {
        match self {
            Self::Nss(nss) => &nss.db,
            Self::Uuid(db, _) => db,
        }
    }

    pub fn nss(&self) -> Option<&NamespaceString> {
        match self {
            Self::Nss(nss) => Some(nss),
            Self::Uuid(..) => None,
        }
    }

    pub fn uuid(&self) -> Option<CollectionUuid> {
        match self {
            Self::Nss(_) => None,
            Self::Uuid(_, uuid) => Some(*uuid),
        }
    }
}

impl From<NamespaceString> for NamespaceStringOrUuid {
    fn from(nss: NamespaceString) -> Self {
        Self::Nss(nss)
    }
}

impl From<&NamespaceString> for NamespaceStringOrUuid {
    fn from(nss: &NamespaceString) -> Self {
        Self::Nss(nss.clone())
    }
}

impl fmt::Display for NamespaceStringOrUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nss(nss) => nss.fmt(f),
            Self::Uuid(db, uuid) => write!(f, "{db}:{uuid}"),
        }
    }
}
