//! Business rules that do not touch the database or the network.

pub mod abandoned;
pub mod coupons;
pub mod inventory;
pub mod money;
pub mod order_status;
pub mod pricing;
pub mod promotions;
pub mod refunds;
pub mod reviews;
pub mod tax;
