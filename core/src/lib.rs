pub mod chain;
pub mod defs;
pub mod error;
pub mod signer;
pub mod transaction;
pub mod transaction_config;
