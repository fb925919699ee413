//! Entitlement checks consulted before a rule is synced
//!
//! Quota and subscription state live in an external service; the control plane
//! only asks whether a subject may use a resource.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::RwLock;

#[async_trait]
pub trait Entitlements: Send + Sync {
    /// Whether `subject` may use `resource` (e.g. `rule:42`)
    async fn is_entitled(&self, subject: &str, resource: &str) -> bool;
}

/// Grants everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Entitlements for AllowAll {
    async fn is_entitled(&self, _subject: &str, _resource: &str) -> bool {
        true
    }
}

/// Denies every subject in the set, e.g. accounts over quota
#[derive(Debug, Default)]
pub struct Suspended {
    subjects: RwLock<HashSet<String>>,
}

impl Suspended {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suspend(&self, subject: impl Into<String>) {
        self.subjects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(subject.into());
    }

    pub fn restore(&self, subject: &str) -> bool {
        self.subjects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(subject)
    }
}

#[async_trait]
impl Entitlements for Suspended {
    async fn is_entitled(&self, subject: &str, _resource: &str) -> bool {
        !self
            .subjects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(subject)
    }
}

pub fn rule_resource(rule_id: i64) -> String {
    format!("rule:{}", rule_id)
}
