use std::time::Duration;

use relayer_core::{
    chain::{ChainService, RpcChain, RpcChainConfig},
    error::EngineError,
};
use relayer_executors::relay::{LedgerService, RpcLedger};

/// Resolves chains from an RPC URL template
pub struct RpcChainService {
    pub rpc_url_template: String,
    pub rpc_timeout: Duration,
}

#[allow(refining_impl_trait)]
impl ChainService for RpcChainService {
    fn get_chain(&self, chain_id: u64) -> Result<RpcChain, EngineError> {
        RpcChainConfig {
            chain_id,
            rpc_url_template: &self.rpc_url_template,
        }
        .to_chain()
    }
}

impl LedgerService for RpcChainService {
    type Ledger = RpcLedger<RpcChain>;

    fn ledger(&self, chain_id: u64) -> Result<Self::Ledger, EngineError> {
        Ok(RpcLedger::new(self.get_chain(chain_id)?, self.rpc_timeout))
    }
}
