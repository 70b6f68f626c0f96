pub mod chains;
pub mod config;
pub mod http;
pub mod store;

// Re-export commonly used types for integration tests and external usage
pub use chains::RpcChainService;
pub use config::{
    LogFormat, RedisConfig, RelayerConfig, RelayerSettings, ServerConfig, StoreBackend,
};
pub use http::server::{RelayerServer, RelayerServerState, Worker};
pub use store::RelayStore;
