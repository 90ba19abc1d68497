/// Commerce services module - catalog, cart and checkout
pub mod cart_service;
pub mod catalog;
pub mod checkout_service;

// Re-export services for convenience
pub use cart_service::{AddToCartInput, CartLine, CartService, CartSnapshot};
pub use catalog::{CatalogService, CreateProductInput, ProductView};
pub use checkout_service::{
    generate_order_number, AddressInput, CheckoutService, CheckoutSettings, CreateOrderRequest,
    OrderTotals,
};
