//! Tenant entitlements, Stripe billing reconciliation and metered AI chat.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
