use crate::{
    entities::{cart, CartSnapshot},
    errors::ServiceError,
    services::cart::{Cart, CartOwner},
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sea_orm::{sea_query::OnConflict, DatabaseConnection, EntityTrait, Set};
use std::sync::Arc;

/// Load/save persistence for carts.
#[async_trait]
pub trait CartStore: Send + Sync {
    async fn load(&self, owner: &CartOwner) -> Result<Option<Cart>, ServiceError>;
    async fn save(&self, owner: &CartOwner, cart: &Cart) -> Result<(), ServiceError>;
    async fn delete(&self, owner: &CartOwner) -> Result<(), ServiceError>;
}

/// Carts stored as JSON snapshots in the `carts` table.
#[derive(Clone)]
pub struct DbCartStore {
    db: Arc<DatabaseConnection>,
}

impl DbCartStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CartStore for DbCartStore {
    async fn load(&self, owner: &CartOwner) -> Result<Option<Cart>, ServiceError> {
        let row = CartSnapshot::find_by_id(owner.key()).one(&*self.db).await?;
        row.map(|row| serde_json::from_value(row.snapshot).map_err(ServiceError::from))
            .transpose()
    }

    async fn save(&self, owner: &CartOwner, cart: &Cart) -> Result<(), ServiceError> {
        let row = cart::ActiveModel {
            owner_key: Set(owner.key()),
            snapshot: Set(serde_json::to_value(cart)?),
            updated_at: Set(Utc::now()),
        };

        CartSnapshot::insert(row)
            .on_conflict(
                OnConflict::column(cart::Column::OwnerKey)
                    .update_columns([cart::Column::Snapshot, cart::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;
        Ok(())
    }

    async fn delete(&self, owner: &CartOwner) -> Result<(), ServiceError> {
        CartSnapshot::delete_by_id(owner.key())
            .exec(&*self.db)
            .await?;
        Ok(())
    }
}

/// Process-local carts, for tests and single-instance deployments.
#[derive(Clone, Default)]
pub struct InMemoryCartStore {
    carts: Arc<DashMap<String, Cart>>,
}

impl InMemoryCartStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CartStore for InMemoryCartStore {
    async fn load(&self, owner: &CartOwner) -> Result<Option<Cart>, ServiceError> {
        Ok(self.carts.get(&owner.key()).map(|entry| entry.value().clone()))
    }

    async fn save(&self, owner: &CartOwner, cart: &Cart) -> Result<(), ServiceError> {
        self.carts.insert(owner.key(), cart.clone());
        Ok(())
    }

    async fn delete(&self, owner: &CartOwner) -> Result<(), ServiceError> {
        self.carts.remove(&owner.key());
        Ok(())
    }
}
