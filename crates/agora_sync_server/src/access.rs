//! Document access resolution.
//!
//! Every entry point (WebSocket join, update ingestion, state reads) asks an
//! [`AccessResolver`] what the caller may do with a document before touching
//! the update log.

use std::sync::Arc;

use agora_core::AgoraError;
use agora_core::crdt::{DocumentInfo, Role, UpdateLogStore};
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::db::AuthRepo;

/// Who is asking.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessRequest<'a> {
    pub user_id: Option<&'a str>,
    pub share_token: Option<&'a str>,
}

/// Outcome of access resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    NotFound,
    Forbidden {
        /// Signing in might change the answer
        requires_auth: bool,
    },
    Granted {
        document: DocumentInfo,
        role: Role,
    },
}

/// Decides a caller's role on a document.
pub trait AccessResolver: Send + Sync {
    /// `doc` is a document id or slug.
    fn resolve(&self, doc: &str, request: AccessRequest<'_>) -> Result<AccessDecision, AgoraError>;
}

/// Deployment-wide grants on top of ownership, collaborators and share links.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    /// Anyone may edit any existing document
    pub dev_mode: bool,
    /// Documents created before this instant are editable by anyone
    pub legacy_public_cutoff: Option<DateTime<Utc>>,
}

impl AccessPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dev_mode: config.dev_mode,
            legacy_public_cutoff: config.legacy_public_cutoff,
        }
    }

    fn is_legacy_public(&self, document: &DocumentInfo) -> bool {
        self.legacy_public_cutoff
            .is_some_and(|cutoff| document.created_at < cutoff.timestamp_millis())
    }
}

/// Resolver backed by the document rows of an update log store plus the
/// collaborator and share-token tables.
pub struct DocAccessResolver {
    repo: Arc<AuthRepo>,
    store: Arc<dyn UpdateLogStore>,
    policy: AccessPolicy,
}

impl DocAccessResolver {
    pub fn new(repo: Arc<AuthRepo>, store: Arc<dyn UpdateLogStore>, policy: AccessPolicy) -> Self {
        Self {
            repo,
            store,
            policy,
        }
    }

    fn lookup(&self, doc: &str) -> Result<Option<DocumentInfo>, AgoraError> {
        match self.store.get_document(doc)? {
            Some(document) => Ok(Some(document)),
            None => self.store.find_document_by_slug(doc),
        }
    }
}

impl AccessResolver for DocAccessResolver {
    fn resolve(&self, doc: &str, request: AccessRequest<'_>) -> Result<AccessDecision, AgoraError> {
        let Some(document) = self.lookup(doc)? else {
            return Ok(AccessDecision::NotFound);
        };

        let mut role = None;
        if let Some(user_id) = request.user_id {
            if document.owner_id.as_deref() == Some(user_id) {
                return Ok(AccessDecision::Granted {
                    document,
                    role: Role::Owner,
                });
            }
            role = self.repo.collaborator_role(&document.id, user_id)?;
        }

        if let Some(token) = request.share_token {
            match self.repo.get_share_token(token)? {
                Some(share) if share.doc_id == document.id => {
                    if share.requires_login && request.user_id.is_none() {
                        return Ok(AccessDecision::Forbidden {
                            requires_auth: true,
                        });
                    }
                    role = Some(stronger(role, share.role));
                }
                _ => {}
            }
        }

        if role.is_none() {
            let ownerless_member = document.owner_id.is_none() && request.user_id.is_some();
            if ownerless_member || self.policy.is_legacy_public(&document) || self.policy.dev_mode {
                role = Some(Role::Editor);
            }
        }

        Ok(match role {
            Some(role) => AccessDecision::Granted { document, role },
            None => AccessDecision::Forbidden {
                requires_auth: request.user_id.is_none(),
            },
        })
    }
}

fn rank(role: Role) -> u8 {
    match role {
        Role::Owner => 3,
        Role::Editor => 2,
        Role::Viewer => 1,
    }
}

fn stronger(current: Option<Role>, candidate: Role) -> Role {
    match current {
        Some(role) if rank(role) >= rank(candidate) => role,
        _ => candidate,
    }
}
