pub mod bundle;
pub mod cart;
pub mod coupon_redemption;
pub mod discount;
pub mod download_event;
pub mod order;
pub mod plugin;
pub mod plugin_download;
pub mod review;

pub use bundle::Entity as Bundle;
pub use cart::Entity as CartSnapshot;
pub use coupon_redemption::Entity as CouponRedemption;
pub use discount::Entity as Discount;
pub use download_event::Entity as DownloadEvent;
pub use order::Entity as Order;
pub use plugin::Entity as Plugin;
pub use plugin_download::Entity as PluginDownload;
pub use review::Entity as Review;
