//! Lookups that see an operation's own uncommitted changes and the
//! collections it established for its snapshot before the shared catalog.

use std::sync::Arc;

use common::{DbError, DbResult};
use types::{CollectionUuid, NamespaceString, NamespaceStringOrUuid};

use crate::{
    collection::Collection, collection_catalog::CollectionCatalog,
    operation_context::OperationContext,
};

impl CollectionCatalog {
    pub fn lookup_collection_by_uuid(
        &self,
        op: &OperationContext,
        uuid: CollectionUuid,
    ) -> Option<Arc<Collection>> {
        if let Some(found) = op.uncommitted().lock().lookup_collection_by_uuid(uuid) {
            return found;
        }
        if let Some(found) = op.opened_collections().lookup_by_uuid(uuid) {
            return found;
        }
        self.find_collection_by_uuid(uuid)
    }

    pub fn lookup_collection_by_namespace(
        &self,
        op: &OperationContext,
        nss: &NamespaceString,
    ) -> Option<Arc<Collection>> {
        if let Some(found) = op.uncommitted().lock().lookup_collection_by_namespace(nss) {
            return found;
        }
        if let Some(found) = op.opened_collections().lookup_by_namespace(nss) {
            return found;
        }
        self.find_collection_by_namespace(nss)
    }

    pub fn lookup_collection_by_namespace_or_uuid(
        &self,
        op: &OperationContext,
        key: &NamespaceStringOrUuid,
    ) -> Option<Arc<Collection>> {
        match key {
            NamespaceStringOrUuid::Nss(nss) => self.lookup_collection_by_namespace(op, nss),
            NamespaceStringOrUuid::Uuid(_, uuid) => self.lookup_collection_by_uuid(op, *uuid),
        }
    }

    pub fn lookup_nss_by_uuid(
        &self,
        op: &OperationContext,
        uuid: CollectionUuid,
    ) -> Option<NamespaceString> {
        let local = op
            .uncommitted()
            .lock()
            .lookup_collection_by_uuid(uuid)
            .or_else(|| op.opened_collections().lookup_by_uuid(uuid));
        match local {
            Some(found) => found.map(|collection| collection.ns().clone()),
            None => self.find_nss_by_uuid(uuid),
        }
    }

    pub fn lookup_uuid_by_nss(
        &self,
        op: &OperationContext,
        nss: &NamespaceString,
    ) -> Option<CollectionUuid> {
        let local = op
            .uncommitted()
            .lock()
            .lookup_collection_by_namespace(nss)
            .or_else(|| op.opened_collections().lookup_by_namespace(nss));
        match local {
            Some(found) => found.map(|collection| collection.uuid()),
            None => self.find_uuid_by_nss(nss),
        }
    }

    /// Namespace `key` refers to for `op`. A uuid must resolve to a
    /// namespace in the database it was qualified with.
    pub fn resolve_namespace_string_or_uuid(
        &self,
        op: &OperationContext,
        key: &NamespaceStringOrUuid,
    ) -> DbResult<NamespaceString> {
        match key {
            NamespaceStringOrUuid::Nss(nss) => Ok(nss.clone()),
            NamespaceStringOrUuid::Uuid(db, uuid) => {
                let nss = self.lookup_nss_by_uuid(op, *uuid).ok_or_else(|| {
                    DbError::NamespaceNotFound(format!("unable to resolve {uuid}"))
                })?;
                if nss.db_name() != db {
                    return Err(DbError::NamespaceNotFound(format!(
                        "{uuid} belongs to {nss}, not database {db}"
                    )));
                }
                Ok(nss)
            }
        }
    }
}
