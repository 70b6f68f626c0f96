pub mod admin;
pub mod configuration;
pub mod health;
pub mod transaction;
pub mod transactions;
