use crate::{
    entities::{bundle, plugin, Bundle, Plugin},
    errors::ServiceError,
};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use std::{collections::HashMap, sync::Arc};
use tracing::{instrument, warn};
use uuid::Uuid;

/// Read access to the plugin catalogue and bundles.
#[derive(Clone)]
pub struct CatalogService {
    db: Arc<DatabaseConnection>,
}

impl CatalogService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Active plugins, newest first, optionally restricted to one category.
    #[instrument(skip(self))]
    pub async fn list_active(
        &self,
        category: Option<&str>,
    ) -> Result<Vec<plugin::Model>, ServiceError> {
        let mut query = Plugin::find().filter(plugin::Column::IsActive.eq(true));
        if let Some(category) = category.map(str::trim).filter(|c| !c.is_empty()) {
            query = query.filter(plugin::Column::Category.eq(category));
        }

        Ok(query
            .order_by_desc(plugin::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    /// An active plugin by id.
    pub async fn get(&self, id: Uuid) -> Result<plugin::Model, ServiceError> {
        Plugin::find_by_id(id)
            .filter(plugin::Column::IsActive.eq(true))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Plugin {} not found", id)))
    }

    /// Plugins by id regardless of their active flag.
    pub async fn find_many(&self, ids: &[Uuid]) -> Result<Vec<plugin::Model>, ServiceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        Ok(Plugin::find()
            .filter(plugin::Column::Id.is_in(ids.iter().copied()))
            .all(&*self.db)
            .await?)
    }

    /// Returns the live record of every id, in the order given.
    ///
    /// Fails when any plugin is unknown or no longer on sale.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn require_active(&self, ids: &[Uuid]) -> Result<Vec<plugin::Model>, ServiceError> {
        let mut by_id: HashMap<Uuid, plugin::Model> = self
            .find_many(ids)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        ids.iter()
            .map(|id| match by_id.remove(id) {
                Some(p) if p.is_active => Ok(p),
                Some(p) => Err(ServiceError::ValidationError(format!(
                    "{} is no longer available",
                    p.title
                ))),
                None => Err(ServiceError::ValidationError(format!(
                    "Plugin {} is no longer available",
                    id
                ))),
            })
            .collect()
    }

    /// Active bundles, featured first.
    pub async fn list_active_bundles(&self) -> Result<Vec<bundle::Model>, ServiceError> {
        Ok(Bundle::find()
            .filter(bundle::Column::IsActive.eq(true))
            .order_by_desc(bundle::Column::IsFeatured)
            .order_by_desc(bundle::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    pub async fn get_bundle(&self, id: Uuid) -> Result<bundle::Model, ServiceError> {
        Bundle::find_by_id(id)
            .filter(bundle::Column::IsActive.eq(true))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Bundle {} not found", id)))
    }

    /// The active plugins of a bundle. Inactive members are skipped.
    pub async fn bundle_plugins(
        &self,
        bundle: &bundle::Model,
    ) -> Result<Vec<plugin::Model>, ServiceError> {
        let ids = bundle.plugin_id_list()?;
        let mut by_id: HashMap<Uuid, plugin::Model> = self
            .find_many(&ids)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let plugins: Vec<_> = ids
            .iter()
            .filter_map(|id| by_id.remove(id))
            .filter(|p| p.is_active)
            .collect();

        if plugins.len() < ids.len() {
            warn!(
                bundle_id = %bundle.id,
                listed = ids.len(),
                available = plugins.len(),
                "Bundle lists unavailable plugins"
            );
        }

        Ok(plugins)
    }
}
