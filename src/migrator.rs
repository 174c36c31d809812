use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_catalog_tables::Migration),
            Box::new(m20240601_000002_create_orders_tables::Migration),
            Box::new(m20240601_000003_create_download_tables::Migration),
            Box::new(m20240601_000004_create_carts_table::Migration),
        ]
    }
}

mod m20240601_000001_create_catalog_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_catalog_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Plugins::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Plugins::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Plugins::Title).string().not_null())
                        .col(ColumnDef::new(Plugins::Description).text().null())
                        .col(ColumnDef::new(Plugins::Price).decimal_len(16, 4).not_null())
                        .col(ColumnDef::new(Plugins::Category).string().not_null())
                        .col(ColumnDef::new(Plugins::Thumbnail).string().null())
                        .col(ColumnDef::new(Plugins::FilePath).string().null())
                        .col(
                            ColumnDef::new(Plugins::DownloadCount)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Plugins::Rating)
                                .decimal_len(3, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Plugins::ReviewCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Plugins::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Plugins::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Plugins::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_plugins_category")
                        .table(Plugins::Table)
                        .col(Plugins::Category)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Discounts::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Discounts::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Discounts::Code)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Discounts::Name).string().not_null())
                        .col(
                            ColumnDef::new(Discounts::DiscountType)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Discounts::DiscountValue)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Discounts::MinAmount)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Discounts::MaxUses).integer().null())
                        .col(
                            ColumnDef::new(Discounts::UsedCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Discounts::ValidFrom)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Discounts::ValidUntil)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Discounts::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Discounts::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Bundles::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Bundles::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Bundles::Name).string().not_null())
                        .col(ColumnDef::new(Bundles::Description).text().null())
                        .col(ColumnDef::new(Bundles::Price).decimal_len(16, 4).not_null())
                        .col(ColumnDef::new(Bundles::PluginIds).json().not_null())
                        .col(
                            ColumnDef::new(Bundles::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Bundles::IsFeatured)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Bundles::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(PluginReviews::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PluginReviews::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PluginReviews::PluginId).uuid().not_null())
                        .col(ColumnDef::new(PluginReviews::CustomerId).uuid().not_null())
                        .col(ColumnDef::new(PluginReviews::Rating).integer().not_null())
                        .col(ColumnDef::new(PluginReviews::ReviewText).text().null())
                        .col(
                            ColumnDef::new(PluginReviews::IsVerifiedPurchase)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(PluginReviews::OrderId).uuid().null())
                        .col(
                            ColumnDef::new(PluginReviews::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PluginReviews::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_plugin_reviews_plugin_id")
                                .from(PluginReviews::Table, PluginReviews::PluginId)
                                .to(Plugins::Table, Plugins::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_plugin_reviews_plugin_customer")
                        .table(PluginReviews::Table)
                        .col(PluginReviews::PluginId)
                        .col(PluginReviews::CustomerId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PluginReviews::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Bundles::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Discounts::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Plugins::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Plugins {
        Table,
        Id,
        Title,
        Description,
        Price,
        Category,
        Thumbnail,
        FilePath,
        DownloadCount,
        Rating,
        ReviewCount,
        IsActive,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Discounts {
        Table,
        Id,
        Code,
        Name,
        DiscountType,
        DiscountValue,
        MinAmount,
        MaxUses,
        UsedCount,
        ValidFrom,
        ValidUntil,
        IsActive,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum Bundles {
        Table,
        Id,
        Name,
        Description,
        Price,
        PluginIds,
        IsActive,
        IsFeatured,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum PluginReviews {
        Table,
        Id,
        PluginId,
        CustomerId,
        Rating,
        ReviewText,
        IsVerifiedPurchase,
        OrderId,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000002_create_orders_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_create_orders_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Orders::CustomerId).uuid().not_null())
                        .col(ColumnDef::new(Orders::Items).json().not_null())
                        .col(ColumnDef::new(Orders::Subtotal).decimal_len(16, 4).not_null())
                        .col(
                            ColumnDef::new(Orders::DiscountAmount)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Orders::TotalAmount)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(ColumnDef::new(Orders::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Orders::Status).string_len(20).not_null())
                        .col(
                            ColumnDef::new(Orders::PaymentProvider)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::PaymentReference)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Orders::PaymentTransactionId).string().null())
                        .col(ColumnDef::new(Orders::CouponCode).string().null())
                        .col(ColumnDef::new(Orders::CustomerInfo).json().not_null())
                        .col(
                            ColumnDef::new(Orders::PaidAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_customer_id")
                        .table(Orders::Table)
                        .col(Orders::CustomerId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_status_created_at")
                        .table(Orders::Table)
                        .col(Orders::Status)
                        .col(Orders::CreatedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(CouponRedemptions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CouponRedemptions::OrderId)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CouponRedemptions::DiscountCode)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CouponRedemptions::RedeemedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_coupon_redemptions_order_id")
                                .from(CouponRedemptions::Table, CouponRedemptions::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CouponRedemptions::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Orders {
        Table,
        Id,
        CustomerId,
        Items,
        Subtotal,
        DiscountAmount,
        TotalAmount,
        Currency,
        Status,
        PaymentProvider,
        PaymentReference,
        PaymentTransactionId,
        CouponCode,
        CustomerInfo,
        PaidAt,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum CouponRedemptions {
        Table,
        OrderId,
        DiscountCode,
        RedeemedAt,
    }
}

mod m20240601_000003_create_download_tables {
    use super::m20240601_000001_create_catalog_tables::Plugins;
    use super::m20240601_000002_create_orders_tables::Orders;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000003_create_download_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PluginDownloads::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PluginDownloads::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PluginDownloads::OrderId).uuid().not_null())
                        .col(ColumnDef::new(PluginDownloads::PluginId).uuid().not_null())
                        .col(ColumnDef::new(PluginDownloads::CustomerId).uuid().not_null())
                        .col(
                            ColumnDef::new(PluginDownloads::SecureToken)
                                .string_len(128)
                                .not_null()
                                .unique_key(),
                        )
                        .col(
                            ColumnDef::new(PluginDownloads::ExpiresAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PluginDownloads::DownloadedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(PluginDownloads::IpAddress).string().null())
                        .col(ColumnDef::new(PluginDownloads::UserAgent).text().null())
                        .col(
                            ColumnDef::new(PluginDownloads::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_plugin_downloads_order_id")
                                .from(PluginDownloads::Table, PluginDownloads::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_plugin_downloads_plugin_id")
                                .from(PluginDownloads::Table, PluginDownloads::PluginId)
                                .to(Plugins::Table, Plugins::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            // One credential per purchased plugin per order
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_plugin_downloads_order_plugin")
                        .table(PluginDownloads::Table)
                        .col(PluginDownloads::OrderId)
                        .col(PluginDownloads::PluginId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_plugin_downloads_customer_id")
                        .table(PluginDownloads::Table)
                        .col(PluginDownloads::CustomerId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(DownloadEvents::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(DownloadEvents::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(DownloadEvents::DownloadId).uuid().not_null())
                        .col(ColumnDef::new(DownloadEvents::IpAddress).string().not_null())
                        .col(ColumnDef::new(DownloadEvents::UserAgent).text().not_null())
                        .col(
                            ColumnDef::new(DownloadEvents::FirstRedemption)
                                .boolean()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(DownloadEvents::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_download_events_download_id")
                                .from(DownloadEvents::Table, DownloadEvents::DownloadId)
                                .to(PluginDownloads::Table, PluginDownloads::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(DownloadEvents::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(PluginDownloads::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum PluginDownloads {
        Table,
        Id,
        OrderId,
        PluginId,
        CustomerId,
        SecureToken,
        ExpiresAt,
        DownloadedAt,
        IpAddress,
        UserAgent,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum DownloadEvents {
        Table,
        Id,
        DownloadId,
        IpAddress,
        UserAgent,
        FirstRedemption,
        CreatedAt,
    }
}

mod m20240601_000004_create_carts_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000004_create_carts_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Carts::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Carts::OwnerKey)
                                .string_len(80)
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Carts::Snapshot).json().not_null())
                        .col(
                            ColumnDef::new(Carts::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Carts::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Carts {
        Table,
        OwnerKey,
        Snapshot,
        UpdatedAt,
    }
}
