//! Transactional email content. Rendering is intentionally plain; the
//! messages carry the facts and a link back to the store.

use serde::{Deserialize, Serialize};

use crate::{
    api::email::EmailMessage,
    domain::{money::format_minor, order_status::OrderStatus},
};

pub const ORDER_CONFIRMED: &str = "order.confirmed";
pub const ORDER_STATUS_CHANGED: &str = "order.status_changed";
pub const ORDER_REFUNDED: &str = "order.refunded";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEmailItem {
    pub name: String,
    pub quantity: i32,
    pub line_total_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderNotification {
    Confirmed {
        order_id: i32,
        email: String,
        currency: String,
        items: Vec<OrderEmailItem>,
        subtotal_cents: i64,
        discount_cents: i64,
        tax_cents: i64,
        total_cents: i64,
    },
    StatusChanged {
        order_id: i32,
        email: String,
        status: OrderStatus,
    },
    Refunded {
        order_id: i32,
        email: String,
        currency: String,
        amount_cents: i64,
        fully_refunded: bool,
    },
}

impl OrderNotification {
    pub fn event_type(&self) -> &'static str {
        match self {
            OrderNotification::Confirmed { .. } => ORDER_CONFIRMED,
            OrderNotification::StatusChanged { .. } => ORDER_STATUS_CHANGED,
            OrderNotification::Refunded { .. } => ORDER_REFUNDED,
        }
    }

    pub fn render(&self, store_url: &str) -> EmailMessage {
        match self {
            OrderNotification::Confirmed {
                order_id,
                email,
                currency,
                items,
                subtotal_cents,
                discount_cents,
                tax_cents,
                total_cents,
            } => {
                let mut lines: Vec<String> = items
                    .iter()
                    .map(|item| {
                        format!(
                            "{} x {} - {}",
                            item.quantity,
                            item.name,
                            format_minor(item.line_total_cents, currency)
                        )
                    })
                    .collect();
                lines.push(format!("Subtotal: {}", format_minor(*subtotal_cents, currency)));
                if *discount_cents > 0 {
                    lines.push(format!("Discount: -{}", format_minor(*discount_cents, currency)));
                }
                lines.push(format!("Tax: {}", format_minor(*tax_cents, currency)));
                lines.push(format!("Total: {}", format_minor(*total_cents, currency)));

                message(
                    email,
                    format!("Order #{order_id} confirmed"),
                    format!("Thanks for your order #{order_id}."),
                    &lines,
                    &order_link(store_url, *order_id),
                )
            }
            OrderNotification::StatusChanged {
                order_id,
                email,
                status,
            } => {
                let headline = match status {
                    OrderStatus::Processing => "We're preparing your order.",
                    OrderStatus::Shipped => "Your order is on its way.",
                    OrderStatus::Delivered => "Your order has been delivered.",
                    OrderStatus::Cancelled => "Your order has been cancelled.",
                    OrderStatus::Refunded => "Your order has been refunded.",
                    OrderStatus::Pending => "Your order is awaiting payment confirmation.",
                };
                message(
                    email,
                    format!("Order #{order_id} update: {}", status.as_str().to_lowercase()),
                    headline.to_string(),
                    &[],
                    &order_link(store_url, *order_id),
                )
            }
            OrderNotification::Refunded {
                order_id,
                email,
                currency,
                amount_cents,
                fully_refunded,
            } => {
                let detail = if *fully_refunded {
                    "Your order has been fully refunded."
                } else {
                    "A partial refund has been issued for your order."
                };
                message(
                    email,
                    format!("Refund for order #{order_id}"),
                    detail.to_string(),
                    &[format!("Amount: {}", format_minor(*amount_cents, currency))],
                    &order_link(store_url, *order_id),
                )
            }
        }
    }
}

/// Reminder for a cart left behind. `reminder_number` starts at 1.
pub fn abandoned_cart_reminder(
    email: &str,
    item_names: &[(String, i32)],
    recovery_url: &str,
    reminder_number: i32,
) -> EmailMessage {
    let subject = if reminder_number <= 1 {
        "You left something in your cart".to_string()
    } else {
        "Your cart is still waiting".to_string()
    };
    let lines: Vec<String> = item_names
        .iter()
        .map(|(name, quantity)| format!("{quantity} x {name}"))
        .collect();

    message(
        email,
        subject,
        "Pick up where you left off.".to_string(),
        &lines,
        recovery_url,
    )
}

fn order_link(store_url: &str, order_id: i32) -> String {
    format!("{}/account/orders/{}", store_url.trim_end_matches('/'), order_id)
}

fn message(to: &str, subject: String, headline: String, lines: &[String], link: &str) -> EmailMessage {
    let mut text = format!("{headline}\n\n");
    for line in lines {
        text.push_str(line);
        text.push('\n');
    }
    text.push_str(&format!("\n{link}\n"));

    let mut html = format!("<p>{}</p>", escape_html(&headline));
    if !lines.is_empty() {
        html.push_str("<ul>");
        for line in lines {
            html.push_str(&format!("<li>{}</li>", escape_html(line)));
        }
        html.push_str("</ul>");
    }
    html.push_str(&format!(
        "<p><a href=\"{0}\">{0}</a></p>",
        escape_html(link)
    ));

    EmailMessage {
        to: to.to_string(),
        subject,
        html,
        text,
    }
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_lists_items_and_totals() {
        let notification = OrderNotification::Confirmed {
            order_id: 12,
            email: "a@b.co".into(),
            currency: "usd".into(),
            items: vec![OrderEmailItem {
                name: "Tee <M>".into(),
                quantity: 2,
                line_total_cents: 3600,
            }],
            subtotal_cents: 3600,
            discount_cents: 0,
            tax_cents: 297,
            total_cents: 3897,
        };
        let email = notification.render("https://shop.example.com");
        assert_eq!(email.subject, "Order #12 confirmed");
        assert!(email.text.contains("2 x Tee <M> - 36.00 USD"));
        assert!(email.text.contains("Total: 38.97 USD"));
        assert!(!email.text.contains("Discount"));
        assert!(email.html.contains("Tee &lt;M&gt;"));
        assert!(email.text.contains("https://shop.example.com/account/orders/12"));
    }

    #[test]
    fn payload_round_trips_through_the_outbox_format() {
        let notification = OrderNotification::StatusChanged {
            order_id: 3,
            email: "a@b.co".into(),
            status: OrderStatus::Shipped,
        };
        let raw = serde_json::to_string(&notification).unwrap();
        assert!(raw.contains("\"kind\":\"status_changed\""));
        assert!(raw.contains("\"SHIPPED\""));
        let parsed: OrderNotification = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, notification);
        assert_eq!(parsed.event_type(), ORDER_STATUS_CHANGED);
    }

    #[test]
    fn reminder_subject_changes_after_first_send() {
        let items = vec![("Mug".to_string(), 1)];
        let first = abandoned_cart_reminder("a@b.co", &items, "https://x/cart/recover/t", 1);
        let second = abandoned_cart_reminder("a@b.co", &items, "https://x/cart/recover/t", 2);
        assert_ne!(first.subject, second.subject);
        assert!(first.text.contains("1 x Mug"));
        assert!(first.html.contains("https://x/cart/recover/t"));
    }
}
