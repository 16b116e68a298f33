use thiserror::Error;

use crate::domain::order_status::OrderStatus;

/// Reserved locally, not yet confirmed by the processor.
pub const REFUND_PENDING: &str = "pending";
pub const REFUND_SUCCEEDED: &str = "succeeded";
pub const REFUND_FAILED: &str = "failed";

/// Processor refund states that mean no money moved.
pub fn provider_declined(provider_status: &str) -> bool {
    matches!(provider_status, "failed" | "canceled")
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefundError {
    #[error("Orders in status {0} cannot be refunded")]
    NotRefundable(OrderStatus),
    #[error("Refund amount must be positive")]
    NonPositive,
    #[error("Refund of {requested} cents exceeds the refundable balance of {remaining} cents")]
    ExceedsBalance { requested: i64, remaining: i64 },
    #[error("Order has already been fully refunded")]
    NothingLeft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundPlan {
    pub amount_cents: i64,
    pub refunded_after_cents: i64,
    pub status_after: OrderStatus,
}

/// Works out how much to refund and where the order ends up.
/// `refunded_cents` includes amounts already reserved by refunds in flight.
/// `requested = None` refunds the remaining balance.
pub fn plan_refund(
    status: OrderStatus,
    total_cents: i64,
    refunded_cents: i64,
    requested: Option<i64>,
) -> Result<RefundPlan, RefundError> {
    if !status.is_refundable() {
        return Err(RefundError::NotRefundable(status));
    }
    let remaining = (total_cents - refunded_cents).max(0);
    if remaining == 0 {
        return Err(RefundError::NothingLeft);
    }

    let amount_cents = requested.unwrap_or(remaining);
    if amount_cents <= 0 {
        return Err(RefundError::NonPositive);
    }
    if amount_cents > remaining {
        return Err(RefundError::ExceedsBalance {
            requested: amount_cents,
            remaining,
        });
    }

    Ok(settle(status, total_cents, refunded_cents, amount_cents))
}

/// Order totals once `amount_cents` has actually been returned. The order
/// only becomes REFUNDED from a status that allows it.
pub fn settle(
    status: OrderStatus,
    total_cents: i64,
    refunded_cents: i64,
    amount_cents: i64,
) -> RefundPlan {
    let refunded_after_cents = refunded_cents.saturating_add(amount_cents);
    let status_after =
        if refunded_after_cents >= total_cents && status.can_transition_to(OrderStatus::Refunded) {
            OrderStatus::Refunded
        } else {
            status
        };

    RefundPlan {
        amount_cents,
        refunded_after_cents,
        status_after,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_refund_by_default() {
        let plan = plan_refund(OrderStatus::Delivered, 5000, 0, None).unwrap();
        assert_eq!(plan.amount_cents, 5000);
        assert_eq!(plan.status_after, OrderStatus::Refunded);
    }

    #[test]
    fn partial_refund_keeps_status() {
        let plan = plan_refund(OrderStatus::Shipped, 5000, 1000, Some(1500)).unwrap();
        assert_eq!(plan.refunded_after_cents, 2500);
        assert_eq!(plan.status_after, OrderStatus::Shipped);
    }

    #[test]
    fn last_partial_refund_completes_the_order() {
        let plan = plan_refund(OrderStatus::Processing, 5000, 4000, Some(1000)).unwrap();
        assert_eq!(plan.status_after, OrderStatus::Refunded);
    }

    #[test]
    fn rejects_invalid_requests() {
        assert_eq!(
            plan_refund(OrderStatus::Pending, 5000, 0, None),
            Err(RefundError::NotRefundable(OrderStatus::Pending))
        );
        assert_eq!(
            plan_refund(OrderStatus::Shipped, 5000, 0, Some(0)),
            Err(RefundError::NonPositive)
        );
        assert_eq!(
            plan_refund(OrderStatus::Shipped, 5000, 4500, Some(600)),
            Err(RefundError::ExceedsBalance {
                requested: 600,
                remaining: 500
            })
        );
        assert_eq!(
            plan_refund(OrderStatus::Delivered, 5000, 5000, None),
            Err(RefundError::NothingLeft)
        );
    }

    #[test]
    fn reserved_amounts_shrink_the_balance() {
        // 3000 confirmed plus 1500 in flight leaves 500.
        assert_eq!(
            plan_refund(OrderStatus::Shipped, 5000, 4500, Some(1000)),
            Err(RefundError::ExceedsBalance {
                requested: 1000,
                remaining: 500
            })
        );
        assert_eq!(
            plan_refund(OrderStatus::Shipped, 5000, 4500, None).map(|plan| plan.amount_cents),
            Ok(500)
        );
    }

    #[test]
    fn settling_only_refunds_from_allowed_statuses() {
        let plan = settle(OrderStatus::Delivered, 5000, 3000, 2000);
        assert_eq!(plan.refunded_after_cents, 5000);
        assert_eq!(plan.status_after, OrderStatus::Refunded);

        let cancelled = settle(OrderStatus::Cancelled, 5000, 0, 5000);
        assert_eq!(cancelled.status_after, OrderStatus::Cancelled);
    }

    #[test]
    fn declined_provider_states() {
        assert!(provider_declined("failed"));
        assert!(provider_declined("canceled"));
        assert!(!provider_declined("succeeded"));
        assert!(!provider_declined("pending"));
    }
}
