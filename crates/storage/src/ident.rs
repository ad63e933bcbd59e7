use std::{fmt, sync::Arc};

/// Name of a physical storage-engine resource (a table or an index file).
///
/// Liveness is tracked by reference counting: a drop-pending ident may only be
/// reclaimed once no [`SharedIdent`] to it remains.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Ident {
    name: String,
}

impl Ident {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Shared ownership handle to an [`Ident`].
pub type SharedIdent = Arc<Ident>;

/// Kind of resource an ident names; decides the generated prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentKind {
    Collection,
    Index,
}

impl IdentKind {
    pub fn prefix(self) -> &'static str {
        match self {
            IdentKind::Collection => "collection",
            IdentKind::Index => "index",
        }
    }
}
