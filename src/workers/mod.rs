pub mod outbox_relay;
