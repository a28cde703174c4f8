use std::sync::Arc;

use async_trait::async_trait;
use stasis_pack::{Entity, Part};
use stasis_types::{Placement, ScopeTag, TemplateId};

use crate::error::HostError;

/// Creates live instances from templates.
#[async_trait]
pub trait SpawnProvider: Send + Sync {
    /// Spawn an instance of `template` at `placement` in `scope`.
    /// `Ok(None)` means the host has no such template.
    async fn spawn(
        &self,
        template: &TemplateId,
        placement: Placement,
        scope: &ScopeTag,
    ) -> Result<Option<Arc<dyn Entity>>, HostError>;
}

/// Loads and unloads named scopes.
#[async_trait]
pub trait ScopeLoader: Send + Sync {
    fn loaded_scopes(&self) -> Vec<ScopeTag>;

    fn active_scope(&self) -> Option<ScopeTag>;

    /// The scope hosting the persistence session; never unloaded by restore.
    fn host_scope(&self) -> Option<ScopeTag> {
        None
    }

    fn is_loaded(&self, scope: &ScopeTag) -> bool {
        self.loaded_scopes().contains(scope)
    }

    async fn load(&self, scope: &ScopeTag) -> Result<(), HostError>;

    async fn unload(&self, scope: &ScopeTag) -> Result<(), HostError>;

    fn set_active(&self, scope: &ScopeTag) -> Result<(), HostError>;
}

/// Parts that belong to no entity.
pub trait AssetSource: Send + Sync {
    fn assets(&self) -> Vec<Arc<dyn Part>>;
}

/// An [`AssetSource`] with nothing in it.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAssets;

impl AssetSource for NoAssets {
    fn assets(&self) -> Vec<Arc<dyn Part>> {
        Vec::new()
    }
}

/// The host collaborators a session works through.
#[derive(Clone)]
pub struct Host {
    pub spawner: Arc<dyn SpawnProvider>,
    pub scopes: Arc<dyn ScopeLoader>,
    pub assets: Arc<dyn AssetSource>,
}

impl Host {
    pub fn new(spawner: Arc<dyn SpawnProvider>, scopes: Arc<dyn ScopeLoader>) -> Self {
        Self {
            spawner,
            scopes,
            assets: Arc::new(NoAssets),
        }
    }

    pub fn with_assets(mut self, assets: Arc<dyn AssetSource>) -> Self {
        self.assets = assets;
        self
    }
}
