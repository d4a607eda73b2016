//! Template store boundary and an in-memory implementation.
//!
//! The core never dictates how templates are persisted; it talks to a
//! [`TemplateStore`]. Implementations must uphold one invariant: an identity
//! that exists has at least one template. Creation is all-or-nothing and the
//! last template of an identity cannot be removed on its own.

use crate::types::{merge_metadata, FeatureVector, Identity, IdentityId, IdentitySummary, Template};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity not found: {0}")]
    NotFound(IdentityId),
    #[error("identity already exists: {0}")]
    AlreadyExists(IdentityId),
    #[error("identity id must not be blank")]
    InvalidIdentity,
    #[error("an identity needs at least one template")]
    EmptyEnrollment,
    #[error("template {template} not found for identity {identity}")]
    TemplateNotFound { identity: IdentityId, template: Uuid },
    #[error("refusing to remove the last template of identity {0}")]
    LastTemplate(IdentityId),
    #[error("storage backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Aggregate counts over a store.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct StoreStats {
    pub identities: usize,
    pub templates: usize,
    pub avg_templates_per_identity: f32,
}

impl StoreStats {
    pub fn from_summaries(summaries: &[IdentitySummary]) -> Self {
        let identities = summaries.len();
        let templates: usize = summaries.iter().map(|s| s.template_count).sum();
        Self {
            identities,
            templates,
            avg_templates_per_identity: if identities > 0 {
                templates as f32 / identities as f32
            } else {
                0.0
            },
        }
    }
}

/// Persistence boundary for identities and their templates.
///
/// Reads may run concurrently. Writes to the same identity are serialized by
/// the implementation.
pub trait TemplateStore: Send + Sync {
    /// All templates of `identity`, in insertion order.
    fn get_templates(&self, identity: &IdentityId) -> Result<Vec<Template>, StoreError>;

    /// Append one template to an existing identity.
    fn put_template(&self, identity: &IdentityId, template: Template) -> Result<(), StoreError>;

    /// Append several templates to an existing identity, all or nothing.
    fn put_templates(
        &self,
        identity: &IdentityId,
        templates: Vec<Template>,
    ) -> Result<(), StoreError> {
        for template in templates {
            self.put_template(identity, template)?;
        }
        Ok(())
    }

    /// Append templates to an existing identity if `accept` approves them.
    ///
    /// `accept` sees the identity's stored templates. The check and the append
    /// happen under the same write lock or transaction, so no other write to
    /// the identity can land in between. Returns `Ok(false)` without writing
    /// anything when `accept` refuses.
    fn put_templates_if(
        &self,
        identity: &IdentityId,
        templates: Vec<Template>,
        accept: &mut dyn FnMut(&[Template]) -> bool,
    ) -> Result<bool, StoreError>;

    /// Create `identity` with its initial templates atomically.
    fn create_identity(
        &self,
        identity: &IdentityId,
        metadata: serde_json::Value,
        templates: Vec<Template>,
    ) -> Result<(), StoreError>;

    /// Delete an identity and all of its templates; returns how many templates went with it.
    fn remove_identity(&self, identity: &IdentityId) -> Result<usize, StoreError>;

    /// Delete one template. Fails with [`StoreError::LastTemplate`] rather than
    /// leave the identity empty.
    fn remove_template(&self, identity: &IdentityId, template: Uuid) -> Result<(), StoreError>;

    /// Merge `metadata` into the identity's metadata (see [`merge_metadata`]).
    fn update_metadata(
        &self,
        identity: &IdentityId,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Snapshot of every identity with its template vectors, ordered by id.
    fn all_identities(&self) -> Result<Vec<(IdentityId, Vec<FeatureVector>)>, StoreError>;

    /// Summaries of every identity, ordered by id.
    fn list_identities(&self) -> Result<Vec<IdentitySummary>, StoreError>;

    /// Identities whose id or metadata strings contain `query`, ignoring case.
    fn search(&self, query: &str) -> Result<Vec<IdentitySummary>, StoreError> {
        let mut found = self.list_identities()?;
        found.retain(|summary| summary.matches_query(query));
        Ok(found)
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(StoreStats::from_summaries(&self.list_identities()?))
    }
}

impl<S: TemplateStore + ?Sized> TemplateStore for Arc<S> {
    fn get_templates(&self, identity: &IdentityId) -> Result<Vec<Template>, StoreError> {
        (**self).get_templates(identity)
    }

    fn put_template(&self, identity: &IdentityId, template: Template) -> Result<(), StoreError> {
        (**self).put_template(identity, template)
    }

    fn put_templates(
        &self,
        identity: &IdentityId,
        templates: Vec<Template>,
    ) -> Result<(), StoreError> {
        (**self).put_templates(identity, templates)
    }

    fn put_templates_if(
        &self,
        identity: &IdentityId,
        templates: Vec<Template>,
        accept: &mut dyn FnMut(&[Template]) -> bool,
    ) -> Result<bool, StoreError> {
        (**self).put_templates_if(identity, templates, accept)
    }

    fn create_identity(
        &self,
        identity: &IdentityId,
        metadata: serde_json::Value,
        templates: Vec<Template>,
    ) -> Result<(), StoreError> {
        (**self).create_identity(identity, metadata, templates)
    }

    fn remove_identity(&self, identity: &IdentityId) -> Result<usize, StoreError> {
        (**self).remove_identity(identity)
    }

    fn remove_template(&self, identity: &IdentityId, template: Uuid) -> Result<(), StoreError> {
        (**self).remove_template(identity, template)
    }

    fn update_metadata(
        &self,
        identity: &IdentityId,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError> {
        (**self).update_metadata(identity, metadata)
    }

    fn all_identities(&self) -> Result<Vec<(IdentityId, Vec<FeatureVector>)>, StoreError> {
        (**self).all_identities()
    }

    fn list_identities(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        (**self).list_identities()
    }

    fn search(&self, query: &str) -> Result<Vec<IdentitySummary>, StoreError> {
        (**self).search(query)
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        (**self).stats()
    }
}

struct Entry {
    identity: Identity,
    removed: bool,
}

type SharedEntry = Arc<RwLock<Entry>>;

/// In-process store.
///
/// The outer map lock is held only to find, insert or remove an entry. Each
/// identity has its own lock, so writes to one identity never wait on another.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<IdentityId, SharedEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, identity: &IdentityId) -> Result<SharedEntry, StoreError> {
        self.entries
            .read()
            .get(identity)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(identity.clone()))
    }

    fn snapshot(&self) -> Vec<SharedEntry> {
        self.entries.read().values().cloned().collect()
    }
}

impl TemplateStore for MemoryStore {
    fn get_templates(&self, identity: &IdentityId) -> Result<Vec<Template>, StoreError> {
        let entry = self.entry(identity)?;
        let entry = entry.read();
        if entry.removed {
            return Err(StoreError::NotFound(identity.clone()));
        }
        Ok(entry.identity.templates.clone())
    }

    fn put_template(&self, identity: &IdentityId, template: Template) -> Result<(), StoreError> {
        self.put_templates(identity, vec![template])
    }

    fn put_templates(
        &self,
        identity: &IdentityId,
        templates: Vec<Template>,
    ) -> Result<(), StoreError> {
        self.put_templates_if(identity, templates, &mut |_| true).map(|_| ())
    }

    fn put_templates_if(
        &self,
        identity: &IdentityId,
        templates: Vec<Template>,
        accept: &mut dyn FnMut(&[Template]) -> bool,
    ) -> Result<bool, StoreError> {
        let entry = self.entry(identity)?;
        let mut entry = entry.write();
        if entry.removed {
            return Err(StoreError::NotFound(identity.clone()));
        }
        if !accept(&entry.identity.templates) {
            return Ok(false);
        }
        entry.identity.templates.extend(templates);
        entry.identity.updated_at = Utc::now();
        Ok(true)
    }

    fn create_identity(
        &self,
        identity: &IdentityId,
        metadata: serde_json::Value,
        templates: Vec<Template>,
    ) -> Result<(), StoreError> {
        if identity.is_blank() {
            return Err(StoreError::InvalidIdentity);
        }
        if templates.is_empty() {
            return Err(StoreError::EmptyEnrollment);
        }

        let mut entries = self.entries.write();
        if entries.contains_key(identity) {
            return Err(StoreError::AlreadyExists(identity.clone()));
        }
        let now = Utc::now();
        entries.insert(
            identity.clone(),
            Arc::new(RwLock::new(Entry {
                identity: Identity {
                    id: identity.clone(),
                    templates,
                    metadata,
                    created_at: now,
                    updated_at: now,
                },
                removed: false,
            })),
        );
        Ok(())
    }

    fn remove_identity(&self, identity: &IdentityId) -> Result<usize, StoreError> {
        let entry = self
            .entries
            .write()
            .remove(identity)
            .ok_or_else(|| StoreError::NotFound(identity.clone()))?;
        // Wait out any in-flight write to this identity, then retire it.
        let mut entry = entry.write();
        entry.removed = true;
        Ok(entry.identity.templates.len())
    }

    fn remove_template(&self, identity: &IdentityId, template: Uuid) -> Result<(), StoreError> {
        let entry = self.entry(identity)?;
        let mut entry = entry.write();
        if entry.removed {
            return Err(StoreError::NotFound(identity.clone()));
        }
        let templates = &mut entry.identity.templates;
        let position = templates
            .iter()
            .position(|t| t.id == template)
            .ok_or_else(|| StoreError::TemplateNotFound {
                identity: identity.clone(),
                template,
            })?;
        if templates.len() == 1 {
            return Err(StoreError::LastTemplate(identity.clone()));
        }
        templates.remove(position);
        entry.identity.updated_at = Utc::now();
        Ok(())
    }

    fn update_metadata(
        &self,
        identity: &IdentityId,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError> {
        let entry = self.entry(identity)?;
        let mut entry = entry.write();
        if entry.removed {
            return Err(StoreError::NotFound(identity.clone()));
        }
        merge_metadata(&mut entry.identity.metadata, metadata);
        entry.identity.updated_at = Utc::now();
        Ok(())
    }

    fn all_identities(&self) -> Result<Vec<(IdentityId, Vec<FeatureVector>)>, StoreError> {
        Ok(self
            .snapshot()
            .iter()
            .filter_map(|entry| {
                let entry = entry.read();
                (!entry.removed).then(|| {
                    (
                        entry.identity.id.clone(),
                        entry
                            .identity
                            .templates
                            .iter()
                            .map(|t| t.vector.clone())
                            .collect(),
                    )
                })
            })
            .collect())
    }

    fn list_identities(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        Ok(self
            .snapshot()
            .iter()
            .filter_map(|entry| {
                let entry = entry.read();
                (!entry.removed).then(|| IdentitySummary::from(&entry.identity))
            })
            .collect())
    }
}
