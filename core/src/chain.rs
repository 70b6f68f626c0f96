use alloy::{
    providers::{ProviderBuilder, RootProvider},
    transports::http::reqwest::Url,
};

use crate::error::EngineError;

pub const LOCAL_ANVIL_CHAIN_ID: u64 = 31337;

pub trait Chain: Send + Sync {
    fn chain_id(&self) -> u64;
    fn rpc_url(&self) -> Url;
    fn provider(&self) -> &RootProvider;
}

pub struct RpcChainConfig<'a> {
    pub chain_id: u64,
    /// URL template, `{chain_id}` is substituted with the chain identifier
    pub rpc_url_template: &'a str,
}

#[derive(Clone, Debug)]
pub struct RpcChain {
    chain_id: u64,
    rpc_url: Url,
    pub provider: RootProvider,
}

impl Chain for RpcChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn rpc_url(&self) -> Url {
        self.rpc_url.clone()
    }

    fn provider(&self) -> &RootProvider {
        &self.provider
    }
}

impl RpcChainConfig<'_> {
    pub fn rpc_url(&self) -> Result<Url, EngineError> {
        // Local anvil is always reachable on the default port
        let raw = if self.chain_id == LOCAL_ANVIL_CHAIN_ID {
            "http://127.0.0.1:8545".to_string()
        } else {
            self.rpc_url_template
                .replace("{chain_id}", &self.chain_id.to_string())
        };

        Url::parse(&raw).map_err(|e| EngineError::RpcConfigError {
            message: format!("Failed to parse RPC URL for chain {}: {e}", self.chain_id),
        })
    }

    pub fn to_chain(&self) -> Result<RpcChain, EngineError> {
        let rpc_url = self.rpc_url()?;

        Ok(RpcChain {
            chain_id: self.chain_id,
            provider: ProviderBuilder::new()
                .disable_recommended_fillers()
                .connect_http(rpc_url.clone()),
            rpc_url,
        })
    }
}

pub trait ChainService {
    fn get_chain(&self, chain_id: u64) -> Result<impl Chain, EngineError>;
}
