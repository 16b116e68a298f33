use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    Refunded,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrderStatusError {
    #[error("Unknown order status {0}")]
    Unknown(String),
    #[error("Cannot move an order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 6] = [
        OrderStatus::Pending,
        OrderStatus::Processing,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
        OrderStatus::Refunded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Shipped => "SHIPPED",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Refunded => "REFUNDED",
        }
    }

    pub fn allowed_next(&self) -> &'static [OrderStatus] {
        use OrderStatus::*;
        match self {
            Pending => &[Processing, Cancelled],
            Processing => &[Shipped, Cancelled, Refunded],
            Shipped => &[Delivered, Refunded],
            Delivered => &[Refunded],
            Cancelled | Refunded => &[],
        }
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_next().is_empty()
    }

    /// Money has been captured and not yet fully returned.
    pub fn is_refundable(&self) -> bool {
        matches!(
            self,
            OrderStatus::Processing | OrderStatus::Shipped | OrderStatus::Delivered
        )
    }

    /// Entering this status returns the order's items to stock.
    pub fn restocks(&self) -> bool {
        matches!(self, OrderStatus::Cancelled)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = OrderStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| OrderStatusError::Unknown(s.to_string()))
    }
}

pub fn transition(from: OrderStatus, to: OrderStatus) -> Result<OrderStatus, OrderStatusError> {
    if from.can_transition_to(to) {
        Ok(to)
    } else {
        Err(OrderStatusError::InvalidTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        use OrderStatus::*;
        assert_eq!(transition(Pending, Processing), Ok(Processing));
        assert_eq!(transition(Processing, Shipped), Ok(Shipped));
        assert_eq!(transition(Shipped, Delivered), Ok(Delivered));
        assert_eq!(transition(Delivered, Refunded), Ok(Refunded));
    }

    #[test]
    fn terminal_states_reject_everything() {
        for from in [OrderStatus::Cancelled, OrderStatus::Refunded] {
            assert!(from.is_terminal());
            for to in OrderStatus::ALL {
                assert!(transition(from, to).is_err());
            }
        }
    }

    #[test]
    fn cannot_skip_backwards_or_cancel_after_shipping() {
        use OrderStatus::*;
        assert!(transition(Shipped, Processing).is_err());
        assert!(transition(Shipped, Cancelled).is_err());
        assert!(transition(Delivered, Shipped).is_err());
        assert!(transition(Pending, Shipped).is_err());
        assert!(transition(Pending, Pending).is_err());
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("shipped".parse::<OrderStatus>(), Ok(OrderStatus::Shipped));
        assert_eq!(
            "lost".parse::<OrderStatus>(),
            Err(OrderStatusError::Unknown("lost".into()))
        );
        for status in OrderStatus::ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>(), Ok(status));
        }
    }

    #[test]
    fn refundable_and_restocking_sets() {
        assert!(!OrderStatus::Pending.is_refundable());
        assert!(OrderStatus::Delivered.is_refundable());
        assert!(OrderStatus::Cancelled.restocks());
        assert!(!OrderStatus::Refunded.restocks());
    }
}
