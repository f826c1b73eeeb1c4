//! External collaborators the scheduler drives
//!
//! Content generation, publishing and analytics live outside the decision
//! core. The scheduler only sees these traits, so tests and the simulator can
//! substitute scripted implementations.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::arms::Arm;
use crate::error::Result;
use crate::reward::RewardSignal;

/// Generated content for one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub text: String,
}

impl Content {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// What the publisher reports back for one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Platform identifier; absent when the platform returned none
    pub external_id: Option<String>,
    pub dispatch_ok: bool,
    pub error: Option<String>,
}

impl PublishReceipt {
    pub fn published(external_id: impl Into<String>) -> Self {
        Self {
            external_id: Some(external_id.into()),
            dispatch_ok: true,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            external_id: None,
            dispatch_ok: false,
            error: Some(error.into()),
        }
    }
}

/// Produces content for a selected arm
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, arm: &Arm, action_kind: &str) -> Result<Content>;
}

/// Publishes content to the platform
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, arm: &Arm, content: &Content) -> Result<PublishReceipt>;
}

/// Reads outcome signals for published actions
#[async_trait]
pub trait Analytics: Send + Sync {
    /// `Ok(None)` means the platform has nothing for this id yet
    async fn fetch_engagement(&self, external_id: &str) -> Result<Option<RewardSignal>>;
}

/// The three collaborators bundled for the scheduler
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn ContentGenerator>,
    pub publisher: Arc<dyn Publisher>,
    pub analytics: Arc<dyn Analytics>,
}

impl Collaborators {
    pub fn new(
        generator: Arc<dyn ContentGenerator>,
        publisher: Arc<dyn Publisher>,
        analytics: Arc<dyn Analytics>,
    ) -> Self {
        Self {
            generator,
            publisher,
            analytics,
        }
    }

    /// One value implementing all three roles
    pub fn from_platform<P>(platform: Arc<P>) -> Self
    where
        P: ContentGenerator + Publisher + Analytics + 'static,
    {
        Self {
            generator: platform.clone(),
            publisher: platform.clone(),
            analytics: platform,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
