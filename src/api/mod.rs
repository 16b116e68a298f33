//! Clients for the services this storefront talks to over HTTP.

pub mod email;
pub mod payments;
