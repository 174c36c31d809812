use crate::{
    entities::plugin,
    errors::ServiceError,
    services::{
        cart_store::CartStore,
        catalog::CatalogService,
        coupons::{round_money, CouponInfo, CouponService},
    },
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub const NOTICE_ADDED: &str = "Added to Cart";
pub const NOTICE_ALREADY_IN_CART: &str = "Already in Cart";
pub const NOTICE_MERGED: &str = "Cart Merged";

/// Who a cart belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CartOwner {
    /// Anonymous visitor, keyed by the client-held session id.
    Guest(String),
    Customer(Uuid),
}

impl CartOwner {
    /// Storage key, unique across both owner kinds.
    pub fn key(&self) -> String {
        match self {
            CartOwner::Guest(session) => format!("guest:{}", session),
            CartOwner::Customer(id) => format!("customer:{}", id),
        }
    }
}

impl fmt::Display for CartOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    /// Product id
    pub id: Uuid,
    pub title: String,
    /// Catalogue price when the item was added; charged at checkout.
    pub price: Decimal,
    /// Current catalogue price, for display only.
    pub original_price: Decimal,
    pub category: String,
    pub thumbnail: Option<String>,
    pub added_at: DateTime<Utc>,
}

impl CartItem {
    pub fn from_product(product: &plugin::Model, added_at: DateTime<Utc>) -> Self {
        Self {
            id: product.id,
            title: product.title.clone(),
            price: product.price,
            original_price: product.price,
            category: product.category.clone(),
            thumbnail: product.thumbnail.clone(),
            added_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    AlreadyInCart,
}

impl AddOutcome {
    pub fn notice(&self) -> &'static str {
        match self {
            AddOutcome::Added => NOTICE_ADDED,
            AddOutcome::AlreadyInCart => NOTICE_ALREADY_IN_CART,
        }
    }
}

/// A set of digital products, at most one line per product, plus the coupon
/// snapshot applied to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub items: Vec<CartItem>,
    #[serde(default)]
    pub applied_coupon: Option<CouponInfo>,
}

impl Cart {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, product_id: Uuid) -> bool {
        self.items.iter().any(|item| item.id == product_id)
    }

    /// Appends `item` unless the product is already present, in which case the
    /// existing line and its snapshot price are left untouched.
    pub fn add_item(&mut self, item: CartItem) -> AddOutcome {
        if self.contains(item.id) {
            return AddOutcome::AlreadyInCart;
        }
        self.items.push(item);
        AddOutcome::Added
    }

    /// Returns whether a line was removed.
    pub fn remove_item(&mut self, product_id: Uuid) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.id != product_id);
        self.items.len() != before
    }

    /// Empties the cart and drops the applied coupon.
    pub fn clear(&mut self) {
        self.items.clear();
        self.applied_coupon = None;
    }

    /// Folds a guest cart into this one. Lines already present win over the
    /// guest's; the guest coupon is only adopted when none is applied here.
    /// Returns how many lines were added.
    pub fn merge_guest(&mut self, guest: Cart) -> usize {
        let added = guest
            .items
            .into_iter()
            .filter(|item| self.add_item(item.clone()) == AddOutcome::Added)
            .count();

        if self.applied_coupon.is_none() {
            self.applied_coupon = guest.applied_coupon;
        }

        added
    }

    pub fn subtotal(&self) -> Decimal {
        round_money(self.items.iter().map(|item| item.price).sum())
    }

    pub fn discount(&self) -> Decimal {
        self.applied_coupon
            .as_ref()
            .map(|coupon| coupon.discount_for(self.subtotal()))
            .unwrap_or(Decimal::ZERO)
    }

    pub fn total(&self) -> Decimal {
        (self.subtotal() - self.discount()).max(Decimal::ZERO)
    }

    pub fn product_ids(&self) -> Vec<Uuid> {
        self.items.iter().map(|item| item.id).collect()
    }
}

/// Cart as returned to clients, with the derived amounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartView {
    pub items: Vec<CartItem>,
    pub applied_coupon: Option<CouponInfo>,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub item_count: usize,
}

impl From<Cart> for CartView {
    fn from(cart: Cart) -> Self {
        let subtotal = cart.subtotal();
        let discount = cart.discount();
        let total = cart.total();
        Self {
            item_count: cart.items.len(),
            items: cart.items,
            applied_coupon: cart.applied_coupon,
            subtotal,
            discount,
            total,
        }
    }
}

/// Result of a cart mutation together with the user-facing notice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartUpdate {
    pub cart: CartView,
    pub notice: String,
}

impl CartUpdate {
    fn new(cart: Cart, notice: impl Into<String>) -> Self {
        Self {
            cart: cart.into(),
            notice: notice.into(),
        }
    }
}

/// Cart operations over an injectable [`CartStore`].
#[derive(Clone)]
pub struct CartService {
    store: Arc<dyn CartStore>,
    catalog: CatalogService,
    coupons: CouponService,
}

impl CartService {
    pub fn new(store: Arc<dyn CartStore>, catalog: CatalogService, coupons: CouponService) -> Self {
        Self {
            store,
            catalog,
            coupons,
        }
    }

    /// The stored cart, or an empty one.
    pub async fn load(&self, owner: &CartOwner) -> Result<Cart, ServiceError> {
        Ok(self.store.load(owner).await?.unwrap_or_default())
    }

    /// The cart with `original_price` refreshed from the catalogue.
    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn get(&self, owner: &CartOwner) -> Result<CartView, ServiceError> {
        let mut cart = self.load(owner).await?;
        if !cart.is_empty() {
            let live: HashMap<Uuid, Decimal> = self
                .catalog
                .find_many(&cart.product_ids())
                .await?
                .into_iter()
                .map(|p| (p.id, p.price))
                .collect();
            for item in &mut cart.items {
                if let Some(price) = live.get(&item.id) {
                    item.original_price = *price;
                }
            }
        }
        Ok(cart.into())
    }

    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn add_product(
        &self,
        owner: &CartOwner,
        product_id: Uuid,
    ) -> Result<CartUpdate, ServiceError> {
        let product = self.catalog.get(product_id).await?;
        let mut cart = self.load(owner).await?;

        let outcome = cart.add_item(CartItem::from_product(&product, Utc::now()));
        if outcome == AddOutcome::Added {
            self.store.save(owner, &cart).await?;
            debug!(%product_id, "Plugin added to cart");
        }

        Ok(CartUpdate::new(cart, outcome.notice()))
    }

    /// Adds every available plugin of a bundle, skipping ones already present.
    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn add_bundle(
        &self,
        owner: &CartOwner,
        bundle_id: Uuid,
    ) -> Result<CartUpdate, ServiceError> {
        let bundle = self.catalog.get_bundle(bundle_id).await?;
        let plugins = self.catalog.bundle_plugins(&bundle).await?;
        let mut cart = self.load(owner).await?;

        let now = Utc::now();
        let added = plugins
            .iter()
            .filter(|p| cart.add_item(CartItem::from_product(p, now)) == AddOutcome::Added)
            .count();

        if added == 0 {
            return Ok(CartUpdate::new(cart, NOTICE_ALREADY_IN_CART));
        }

        self.store.save(owner, &cart).await?;
        Ok(CartUpdate::new(
            cart,
            format!("{} plugin(s) from {} added to cart", added, bundle.name),
        ))
    }

    pub async fn remove(
        &self,
        owner: &CartOwner,
        product_id: Uuid,
    ) -> Result<CartUpdate, ServiceError> {
        let mut cart = self.load(owner).await?;
        if !cart.remove_item(product_id) {
            return Err(ServiceError::NotFound(format!(
                "Plugin {} is not in the cart",
                product_id
            )));
        }
        self.store.save(owner, &cart).await?;
        Ok(CartUpdate::new(cart, "Removed from Cart"))
    }

    pub async fn clear(&self, owner: &CartOwner) -> Result<(), ServiceError> {
        self.store.delete(owner).await
    }

    /// Validates `code` against the live discount and stores its snapshot.
    /// A rejected code leaves the cart untouched.
    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn apply_coupon(
        &self,
        owner: &CartOwner,
        code: &str,
    ) -> Result<CartUpdate, ServiceError> {
        let mut cart = self.load(owner).await?;
        let (coupon, discount) = self
            .coupons
            .validate_for(code, cart.subtotal(), Utc::now())
            .await?;

        let notice = format!("Coupon {} applied: -${:.2}", coupon.code, discount);
        cart.applied_coupon = Some(coupon);
        self.store.save(owner, &cart).await?;

        Ok(CartUpdate::new(cart, notice))
    }

    pub async fn remove_coupon(&self, owner: &CartOwner) -> Result<CartUpdate, ServiceError> {
        let mut cart = self.load(owner).await?;
        if cart.applied_coupon.take().is_some() {
            self.store.save(owner, &cart).await?;
        }
        Ok(CartUpdate::new(cart, "Coupon removed"))
    }

    /// Moves a guest cart into the customer's cart and deletes the guest cart.
    #[instrument(skip(self, session))]
    pub async fn merge_guest_into(
        &self,
        session: &str,
        customer_id: Uuid,
    ) -> Result<CartUpdate, ServiceError> {
        let guest_owner = CartOwner::Guest(session.to_string());
        let customer_owner = CartOwner::Customer(customer_id);

        let guest = self.load(&guest_owner).await?;
        let mut cart = self.load(&customer_owner).await?;

        let added = cart.merge_guest(guest);
        self.store.save(&customer_owner, &cart).await?;
        self.store.delete(&guest_owner).await?;

        info!(%customer_id, added, "Guest cart merged");
        Ok(CartUpdate::new(cart, NOTICE_MERGED))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::discount::DiscountType;
    use rust_decimal_macros::dec;

    fn item(price: Decimal) -> CartItem {
        CartItem {
            id: Uuid::new_v4(),
            title: "WorldGuard Plus".into(),
            price,
            original_price: price,
            category: "protection".into(),
            thumbnail: None,
            added_at: Utc::now(),
        }
    }

    fn save20() -> CouponInfo {
        CouponInfo {
            code: "SAVE20".into(),
            name: "Save 20%".into(),
            discount_type: DiscountType::Percentage,
            discount_value: dec!(20),
            min_amount: dec!(50),
        }
    }

    #[test]
    fn adding_twice_keeps_original_snapshot() {
        let mut cart = Cart::default();
        let first = item(dec!(9.99));
        let mut repriced = first.clone();
        repriced.price = dec!(19.99);

        assert_eq!(cart.add_item(first.clone()), AddOutcome::Added);
        assert_eq!(cart.add_item(repriced), AddOutcome::AlreadyInCart);
        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].price, dec!(9.99));
    }

    #[test]
    fn totals_follow_the_applied_coupon() {
        let mut cart = Cart::default();
        cart.add_item(item(dec!(49.99)));
        cart.add_item(item(dec!(30.00)));
        cart.applied_coupon = Some(save20());

        assert_eq!(cart.subtotal(), dec!(79.99));
        assert_eq!(cart.discount(), dec!(16.00));
        assert_eq!(cart.total(), dec!(63.99));
    }

    #[test]
    fn discount_drops_when_subtotal_falls_below_minimum() {
        let mut cart = Cart::default();
        let big = item(dec!(49.99));
        cart.add_item(big.clone());
        cart.add_item(item(dec!(30.00)));
        cart.applied_coupon = Some(save20());

        assert!(cart.remove_item(big.id));
        assert_eq!(cart.discount(), Decimal::ZERO);
        assert_eq!(cart.total(), dec!(30.00));
    }

    #[test]
    fn clear_drops_coupon() {
        let mut cart = Cart::default();
        cart.add_item(item(dec!(5)));
        cart.applied_coupon = Some(save20());
        cart.clear();
        assert!(cart.is_empty());
        assert!(cart.applied_coupon.is_none());
        assert_eq!(cart.total(), Decimal::ZERO);
    }

    #[test]
    fn merge_keeps_existing_lines() {
        let shared = item(dec!(10));
        let mut guest_copy = shared.clone();
        guest_copy.price = dec!(1);
        let other = item(dec!(4.50));

        let mut cart = Cart::default();
        cart.add_item(shared.clone());

        let guest = Cart {
            items: vec![guest_copy, other.clone()],
            applied_coupon: Some(save20()),
        };

        assert_eq!(cart.merge_guest(guest), 1);
        assert_eq!(cart.items.len(), 2);
        assert_eq!(cart.items[0].price, dec!(10));
        assert!(cart.contains(other.id));
        assert_eq!(cart.applied_coupon.as_ref().map(|c| c.code.as_str()), Some("SAVE20"));
    }

    #[test]
    fn owner_keys_do_not_collide() {
        let id = Uuid::new_v4();
        assert_ne!(
            CartOwner::Guest(id.to_string()).key(),
            CartOwner::Customer(id).key()
        );
    }
}
