use std::collections::HashMap;

use thiserror::Error;

pub const MAX_LINE_QUANTITY: i32 = 99;

pub const CART_ACTIVE: &str = "ACTIVE";
pub const CART_CONVERTED: &str = "CONVERTED";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StockError {
    #[error("Quantity must be between 1 and {}", MAX_LINE_QUANTITY)]
    InvalidQuantity,
    #[error("{sku} is no longer available")]
    Unavailable { sku: String },
    #[error("Only {available} of {sku} left in stock")]
    Insufficient { sku: String, available: i32 },
    #[error("Stock adjustment would leave {sku} with negative stock")]
    NegativeStock { sku: String },
}

pub fn validate_quantity(quantity: i32) -> Result<(), StockError> {
    if (1..=MAX_LINE_QUANTITY).contains(&quantity) {
        Ok(())
    } else {
        Err(StockError::InvalidQuantity)
    }
}

#[derive(Debug, Clone)]
pub struct StockView<'a> {
    pub sku: &'a str,
    pub stock: i32,
    pub variant_active: bool,
    pub product_active: bool,
}

/// Checks that `requested` units can be sold right now.
pub fn ensure_available(view: &StockView<'_>, requested: i32) -> Result<(), StockError> {
    validate_quantity(requested)?;
    if !view.variant_active || !view.product_active {
        return Err(StockError::Unavailable {
            sku: view.sku.to_string(),
        });
    }
    if requested > view.stock {
        return Err(StockError::Insufficient {
            sku: view.sku.to_string(),
            available: view.stock.max(0),
        });
    }
    Ok(())
}

/// Result of a manual stock adjustment.
pub fn adjusted_stock(sku: &str, stock: i32, delta: i32) -> Result<i32, StockError> {
    let next = stock.checked_add(delta).unwrap_or(-1);
    if next < 0 {
        return Err(StockError::NegativeStock {
            sku: sku.to_string(),
        });
    }
    Ok(next)
}

/// Decrement applied when a paid order is materialized; stock never goes below zero.
/// Returns `(new_stock, oversold_units)`.
pub fn fulfil(stock: i32, quantity: i32) -> (i32, i32) {
    let taken = quantity.min(stock.max(0));
    (stock.max(0) - taken, quantity - taken)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockDecrement {
    pub variant_id: i32,
    pub stock_after: i32,
    /// Movement to record; zero or negative.
    pub delta: i32,
    pub oversold: i32,
}

/// Applies order lines to stock levels read under a row lock. Several lines
/// for one variant draw from the same running level; a variant missing from
/// `locked` counts as out of stock.
pub fn plan_fulfilment(
    locked: &HashMap<i32, i32>,
    lines: &[(i32, i32)],
) -> Vec<StockDecrement> {
    let mut levels = locked.clone();
    lines
        .iter()
        .map(|&(variant_id, quantity)| {
            let level = levels.entry(variant_id).or_insert(0);
            let before = (*level).max(0);
            let (stock_after, oversold) = fulfil(*level, quantity);
            *level = stock_after;
            StockDecrement {
                variant_id,
                stock_after,
                delta: stock_after - before,
                oversold,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(stock: i32) -> StockView<'static> {
        StockView {
            sku: "TEE-M",
            stock,
            variant_active: true,
            product_active: true,
        }
    }

    #[test]
    fn quantity_bounds() {
        assert!(validate_quantity(1).is_ok());
        assert!(validate_quantity(MAX_LINE_QUANTITY).is_ok());
        assert_eq!(validate_quantity(0), Err(StockError::InvalidQuantity));
        assert_eq!(validate_quantity(100), Err(StockError::InvalidQuantity));
    }

    #[test]
    fn availability_checks_stock_and_flags() {
        assert!(ensure_available(&view(3), 3).is_ok());
        assert_eq!(
            ensure_available(&view(2), 3),
            Err(StockError::Insufficient {
                sku: "TEE-M".into(),
                available: 2
            })
        );

        let mut hidden = view(10);
        hidden.product_active = false;
        assert_eq!(
            ensure_available(&hidden, 1),
            Err(StockError::Unavailable { sku: "TEE-M".into() })
        );
    }

    #[test]
    fn adjustments_cannot_go_negative() {
        assert_eq!(adjusted_stock("A", 5, -5), Ok(0));
        assert_eq!(adjusted_stock("A", 5, 10), Ok(15));
        assert!(adjusted_stock("A", 5, -6).is_err());
    }

    #[test]
    fn fulfilment_clamps_and_reports_oversell() {
        assert_eq!(fulfil(10, 3), (7, 0));
        assert_eq!(fulfil(2, 3), (0, 1));
        assert_eq!(fulfil(0, 3), (0, 3));
    }

    #[test]
    fn fulfilment_plan_uses_locked_levels() {
        let locked = HashMap::from([(1, 58), (2, 1)]);
        let plan = plan_fulfilment(&locked, &[(1, 2), (2, 3)]);
        assert_eq!(
            plan,
            vec![
                StockDecrement {
                    variant_id: 1,
                    stock_after: 56,
                    delta: -2,
                    oversold: 0
                },
                StockDecrement {
                    variant_id: 2,
                    stock_after: 0,
                    delta: -1,
                    oversold: 2
                },
            ]
        );
    }

    #[test]
    fn repeated_variants_share_one_level() {
        let locked = HashMap::from([(7, 3)]);
        let plan = plan_fulfilment(&locked, &[(7, 2), (7, 2), (9, 1)]);
        assert_eq!(plan[0].stock_after, 1);
        assert_eq!((plan[1].stock_after, plan[1].delta, plan[1].oversold), (0, -1, 1));
        assert_eq!((plan[2].stock_after, plan[2].delta, plan[2].oversold), (0, 0, 1));
    }
}
