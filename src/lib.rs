pub mod api;
pub mod domain;
pub mod models;
pub mod notifications;
pub mod platform;
pub mod routes;
pub mod schema;
pub mod services;
pub mod workers;
