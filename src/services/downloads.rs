use crate::{
    entities::{
        download_event,
        order::{self, OrderStatus},
        plugin, plugin_download, DownloadEvent, Order, Plugin, PluginDownload,
    },
    errors::{RedemptionError, ServiceError},
    events::{Event, EventSender},
    services::{
        constant_time_eq,
        storage::{ObjectStorage, ObjectStream, StorageError},
    },
};
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rand::{rngs::OsRng, RngCore};
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const TOKEN_BYTES: usize = 32;
const CREDENTIAL_SEPARATOR: &str = "::";

/// Client metadata recorded with every redemption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip_address: String,
    pub user_agent: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            ip_address: "unknown".to_string(),
            user_agent: "unknown".to_string(),
        }
    }
}

/// A successful redemption with the file to send.
pub struct Redemption {
    pub credential_id: Uuid,
    pub product_id: Uuid,
    pub file_name: String,
    pub first_redemption: bool,
    pub stream: ObjectStream,
}

impl std::fmt::Debug for Redemption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redemption")
            .field("credential_id", &self.credential_id)
            .field("product_id", &self.product_id)
            .field("file_name", &self.file_name)
            .field("first_redemption", &self.first_redemption)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub credential: plugin_download::Model,
    /// False when the credential already existed.
    pub created: bool,
}

/// A customer's download credential as listed in their library.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadView {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub product_title: Option<String>,
    pub credential: String,
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub expired: bool,
}

impl DownloadView {
    pub fn new(
        model: plugin_download::Model,
        product: Option<plugin::Model>,
        now: DateTime<Utc>,
    ) -> Self {
        let credential = model.credential();
        Self {
            id: model.id,
            order_id: model.order_id,
            product_id: model.plugin_id,
            product_title: product.map(|p| p.title),
            download_url: format!("/secure-download/{}", credential),
            credential,
            expired: model.is_expired_at(now),
            expires_at: model.expires_at,
            downloaded_at: model.downloaded_at,
        }
    }
}

/// 32 bytes from the OS generator, hex encoded.
pub fn generate_secure_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Splits `{id}::{token}`.
pub fn parse_credential(credential: &str) -> Result<(Uuid, &str), RedemptionError> {
    let (id, token) = credential
        .split_once(CREDENTIAL_SEPARATOR)
        .ok_or(RedemptionError::InvalidCredential)?;
    let id = Uuid::parse_str(id).map_err(|_| RedemptionError::InvalidCredential)?;
    if token.is_empty() {
        return Err(RedemptionError::InvalidCredential);
    }
    Ok((id, token))
}

/// Issues and redeems time-boxed download credentials.
#[derive(Clone)]
pub struct DownloadService {
    db: Arc<DatabaseConnection>,
    storage: Arc<dyn ObjectStorage>,
    event_sender: Arc<EventSender>,
    ttl: Duration,
}

impl DownloadService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        storage: Arc<dyn ObjectStorage>,
        event_sender: Arc<EventSender>,
        ttl: Duration,
    ) -> Self {
        Self {
            db,
            storage,
            event_sender,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issues the credential for one purchased product of a paid order.
    ///
    /// At most one credential exists per order and product; issuing again
    /// returns the existing one unchanged.
    pub async fn issue<C>(
        conn: &C,
        order: &order::Model,
        product_id: Uuid,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<IssuedCredential, ServiceError>
    where
        C: ConnectionTrait,
    {
        if order.status != OrderStatus::Paid {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} is not paid",
                order.id
            )));
        }
        if !order.contains_product(product_id) {
            return Err(ServiceError::NotFound(format!(
                "Plugin {} is not part of order {}",
                product_id, order.id
            )));
        }

        let inserted = PluginDownload::insert(plugin_download::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            plugin_id: Set(product_id),
            customer_id: Set(order.customer_id),
            secure_token: Set(generate_secure_token()),
            expires_at: Set(now + ttl),
            downloaded_at: Set(None),
            ip_address: Set(None),
            user_agent: Set(None),
            created_at: Set(now),
        })
        .on_conflict(
            OnConflict::columns([
                plugin_download::Column::OrderId,
                plugin_download::Column::PluginId,
            ])
            .do_nothing()
            .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;

        let credential = PluginDownload::find()
            .filter(plugin_download::Column::OrderId.eq(order.id))
            .filter(plugin_download::Column::PluginId.eq(product_id))
            .one(conn)
            .await?
            .ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "Download credential for order {} vanished after insert",
                    order.id
                ))
            })?;

        if inserted > 0 {
            counter!("downloads.credentials.issued", 1);
        }

        Ok(IssuedCredential {
            credential,
            created: inserted > 0,
        })
    }

    /// Issues a credential for every line of a paid order.
    pub async fn issue_for_order<C>(
        conn: &C,
        order: &order::Model,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<IssuedCredential>, ServiceError>
    where
        C: ConnectionTrait,
    {
        let mut issued = Vec::new();
        for line in order.lines()? {
            issued.push(Self::issue(conn, order, line.product_id, ttl, now).await?);
        }
        Ok(issued)
    }

    /// Rotates the token of a customer's credential and restarts its
    /// validity window. The first-download stamp is kept.
    #[instrument(skip(self))]
    pub async fn reissue(
        &self,
        customer_id: Uuid,
        order_id: Uuid,
        product_id: Uuid,
    ) -> Result<DownloadView, ServiceError> {
        let order = Order::find_by_id(order_id)
            .filter(order::Column::CustomerId.eq(customer_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let now = Utc::now();
        let issued = Self::issue(&*self.db, &order, product_id, self.ttl, now).await?;
        let credential = if issued.created {
            issued.credential
        } else {
            let mut active: plugin_download::ActiveModel = issued.credential.into();
            active.secure_token = Set(generate_secure_token());
            active.expires_at = Set(now + self.ttl);
            active.update(&*self.db).await?
        };

        self.event_sender
            .send_or_log(Event::DownloadCredentialIssued {
                credential_id: credential.id,
                order_id,
                product_id,
            })
            .await;
        info!(credential_id = %credential.id, "Download credential reissued");

        let product = Plugin::find_by_id(product_id).one(&*self.db).await?;
        Ok(DownloadView::new(credential, product, now))
    }

    /// The customer's credentials, newest first.
    pub async fn list_for_customer(
        &self,
        customer_id: Uuid,
    ) -> Result<Vec<DownloadView>, ServiceError> {
        let now = Utc::now();
        let rows = PluginDownload::find()
            .filter(plugin_download::Column::CustomerId.eq(customer_id))
            .order_by_desc(plugin_download::Column::CreatedAt)
            .find_also_related(Plugin)
            .all(&*self.db)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(download, product)| DownloadView::new(download, product, now))
            .collect())
    }

    /// Verifies `credential` and opens the purchased file.
    ///
    /// Every redemption is audited. Only the first one stamps
    /// `downloaded_at` and bumps the plugin's download counter; the stamp is
    /// a conditional update so concurrent first redemptions count once.
    pub async fn redeem(
        &self,
        credential: &str,
        client: ClientInfo,
    ) -> Result<Redemption, ServiceError> {
        self.redeem_at(credential, client, Utc::now()).await
    }

    /// [`Self::redeem`] against the clock value `now`.
    #[instrument(skip(self, credential, client), fields(ip = %client.ip_address))]
    pub async fn redeem_at(
        &self,
        credential: &str,
        client: ClientInfo,
        now: DateTime<Utc>,
    ) -> Result<Redemption, ServiceError> {
        match self.try_redeem(credential, client, now).await {
            Err(ServiceError::Redemption(reason)) => {
                counter!("downloads.rejected", 1, "reason" => reason.as_str());
                warn!(reason = reason.as_str(), "Download credential rejected");
                Err(ServiceError::Redemption(reason))
            }
            other => other,
        }
    }

    async fn try_redeem(
        &self,
        credential: &str,
        client: ClientInfo,
        now: DateTime<Utc>,
    ) -> Result<Redemption, ServiceError> {
        let (id, token) = parse_credential(credential)?;

        let download = PluginDownload::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or(RedemptionError::InvalidCredential)?;

        if !constant_time_eq(download.secure_token.as_bytes(), token.as_bytes()) {
            return Err(RedemptionError::InvalidCredential.into());
        }
        if download.is_expired_at(now) {
            return Err(RedemptionError::Expired.into());
        }

        let order = Order::find_by_id(download.order_id).one(&*self.db).await?;
        if !order.as_ref().is_some_and(order::Model::is_paid) {
            return Err(RedemptionError::PaymentNotVerified.into());
        }

        let product = Plugin::find_by_id(download.plugin_id)
            .one(&*self.db)
            .await?
            .ok_or(RedemptionError::FileUnavailable)?;
        let path = product
            .file_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or(RedemptionError::FileUnavailable)?;

        let stream = self.storage.open(path).await.map_err(|e| match e {
            StorageError::NotFound(_) => ServiceError::Redemption(RedemptionError::FileUnavailable),
            other => other.into(),
        })?;

        let first_redemption = self.record_redemption(&download, &client, now).await?;

        counter!("downloads.redeemed", 1);
        if first_redemption {
            counter!("downloads.first_redemptions", 1);
        }
        self.event_sender
            .send_or_log(Event::DownloadRedeemed {
                credential_id: download.id,
                product_id: product.id,
                first_redemption,
            })
            .await;
        debug!(credential_id = %download.id, first_redemption, "Download redeemed");

        Ok(Redemption {
            credential_id: download.id,
            product_id: product.id,
            file_name: product.download_file_name(),
            first_redemption,
            stream,
        })
    }

    /// Writes the audit row and the first-download stamp. Returns whether
    /// this call made the stamp.
    async fn record_redemption(
        &self,
        download: &plugin_download::Model,
        client: &ClientInfo,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let txn = self.db.begin().await?;

        PluginDownload::update_many()
            .col_expr(
                plugin_download::Column::IpAddress,
                Expr::value(client.ip_address.clone()),
            )
            .col_expr(
                plugin_download::Column::UserAgent,
                Expr::value(client.user_agent.clone()),
            )
            .filter(plugin_download::Column::Id.eq(download.id))
            .exec(&txn)
            .await?;

        let stamped = PluginDownload::update_many()
            .col_expr(plugin_download::Column::DownloadedAt, Expr::value(now))
            .filter(plugin_download::Column::Id.eq(download.id))
            .filter(plugin_download::Column::DownloadedAt.is_null())
            .exec(&txn)
            .await?
            .rows_affected;
        let first_redemption = stamped == 1;

        if first_redemption {
            Plugin::update_many()
                .col_expr(
                    plugin::Column::DownloadCount,
                    Expr::col(plugin::Column::DownloadCount).add(1),
                )
                .filter(plugin::Column::Id.eq(download.plugin_id))
                .exec(&txn)
                .await?;
        }

        DownloadEvent::insert(download_event::ActiveModel {
            id: Set(Uuid::new_v4()),
            download_id: Set(download.id),
            ip_address: Set(client.ip_address.clone()),
            user_agent: Set(client.user_agent.clone()),
            first_redemption: Set(first_redemption),
            created_at: Set(now),
        })
        .exec_without_returning(&txn)
        .await?;

        txn.commit().await?;
        Ok(first_redemption)
    }
}
