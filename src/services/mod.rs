//! Database workflows shared by the route handlers and background tasks.

pub mod abandoned;
pub mod carts;
pub mod catalog;
pub mod orders;
pub mod refunds;
