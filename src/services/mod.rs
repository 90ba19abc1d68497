// Order lifecycle and queries
pub mod order_lifecycle;
pub mod orders;

// Cart, catalog and checkout
pub mod commerce;

// Payment providers and webhook reconciliation
pub mod payments;
pub mod reconciliation;
