use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, utoipa::ToSchema)]
#[schema(title = "EVM Address")]
/// Used to represent an EVM address. This is a string of length 42 with a `0x` prefix. Non-checksummed addresses are also supported, but will be converted to checksummed.
pub struct AddressDef(pub String);

#[derive(Serialize, Deserialize, Clone, utoipa::ToSchema)]
#[schema(title = "Bytes")]
/// Used to represent "bytes". This is a 0x prefixed hex string.
pub struct BytesDef(pub String);

#[derive(Serialize, Deserialize, Clone, utoipa::ToSchema)]
#[schema(title = "U256")]
/// Used to represent a 256-bit unsigned integer. The relayer can parse these from any valid encoding of the Ethereum "quantity" format.
pub struct U256Def(pub String);

#[derive(Serialize, Deserialize, Clone, utoipa::ToSchema)]
#[schema(title = "Transaction Hash")]
/// A 32 byte transaction hash, 0x prefixed.
pub struct HashDef(pub String);

#[derive(Serialize, Deserialize, Clone, utoipa::ToSchema)]
#[schema(title = "Wei Amount")]
/// A fee value in wei, encoded as a decimal string.
pub struct WeiDef(pub String);
