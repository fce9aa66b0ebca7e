//! ERC-1155 voucher contract adapter.
//!
//! Voucher contracts in the wild expose one of several mint functions. The
//! client tries them in a fixed order, simulating each with `eth_call`, and
//! submits the first one the contract accepts.

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::rpc::types::TransactionRequest;
use alloy::sol;
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::blockchain::client::BlockchainClient;
use crate::blockchain::token::TokenChain;
use crate::blockchain::transaction::TxSender;
use crate::blockchain::types::{
    BlockchainConfig, BlockchainError, BlockchainResult, SettledReceipt, Submission,
};
use crate::blockchain::wallet::Wallet;

sol! {
    interface IVoucher1155 {
        function balanceOf(address account, uint256 id) external view returns (uint256);
        function safeTransferFrom(address from, address to, uint256 id, uint256 amount, bytes data) external;
        function mint(address to, uint256 id, uint256 amount, bytes data) external;
        function mint(address to, uint256 id, uint256 amount) external;
        function mintTo(address to, uint256 id, uint256 amount, bytes data) external;
        function mintTo(address to, uint256 id, uint256 amount) external;
    }
}

/// Known mint function shapes, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MintShape {
    MintWithData,
    Mint,
    MintToWithData,
    MintTo,
}

impl MintShape {
    pub const PREFERENCE: [MintShape; 4] = [
        MintShape::MintWithData,
        MintShape::Mint,
        MintShape::MintToWithData,
        MintShape::MintTo,
    ];

    /// Canonical Solidity signature.
    pub fn signature(&self) -> &'static str {
        match self {
            MintShape::MintWithData => IVoucher1155::mint_0Call::SIGNATURE,
            MintShape::Mint => IVoucher1155::mint_1Call::SIGNATURE,
            MintShape::MintToWithData => IVoucher1155::mintTo_0Call::SIGNATURE,
            MintShape::MintTo => IVoucher1155::mintTo_1Call::SIGNATURE,
        }
    }

    /// ABI-encoded calldata for this shape. Shapes without a payload ignore `data`.
    pub fn encode(&self, to: Address, id: U256, amount: U256, data: Bytes) -> Bytes {
        let encoded = match self {
            MintShape::MintWithData => IVoucher1155::mint_0Call {
                to,
                id,
                amount,
                data,
            }
            .abi_encode(),
            MintShape::Mint => IVoucher1155::mint_1Call { to, id, amount }.abi_encode(),
            MintShape::MintToWithData => IVoucher1155::mintTo_0Call {
                to,
                id,
                amount,
                data,
            }
            .abi_encode(),
            MintShape::MintTo => IVoucher1155::mintTo_1Call { to, id, amount }.abi_encode(),
        };
        encoded.into()
    }
}

/// Simulate each shape in preference order and return the first one the
/// contract accepts, with its calldata. Rejections are collected in order
/// for [`BlockchainError::MintUnsupported`].
pub async fn select_mint_shape<F, Fut>(
    to: Address,
    token_id: U256,
    amount: U256,
    payload: Bytes,
    mut simulate: F,
) -> BlockchainResult<(MintShape, Bytes)>
where
    F: FnMut(Bytes) -> Fut,
    Fut: Future<Output = BlockchainResult<Bytes>>,
{
    let mut errors = Vec::new();
    for shape in MintShape::PREFERENCE {
        let calldata = shape.encode(to, token_id, amount, payload.clone());
        match simulate(calldata.clone()).await {
            Ok(_) => {
                tracing::debug!(shape = shape.signature(), "Mint shape accepted");
                return Ok((shape, calldata));
            }
            Err(e) => {
                tracing::debug!(shape = shape.signature(), error = %e, "Mint shape rejected");
                errors.push(format!("{}: {}", shape.signature(), e));
            }
        }
    }

    Err(BlockchainError::MintUnsupported(errors))
}

/// Live [`TokenChain`] bound to one signer, one contract and one chain.
#[derive(Debug)]
pub struct Erc1155Client {
    sender: TxSender,
    contract: Address,
    chain_id: u64,
    receipt_timeout: Duration,
    verified: OnceCell<()>,
}

impl Erc1155Client {
    /// Connect to the configured node and verify its chain id.
    ///
    /// A node reporting a different chain id is a configuration error. An
    /// unreachable node only logs a warning; verification is retried before
    /// the first submission.
    pub async fn connect(config: &BlockchainConfig, wallet: Wallet) -> BlockchainResult<Self> {
        if !config.enabled {
            return Err(BlockchainError::NotAvailable(
                "blockchain integration is disabled".to_string(),
            ));
        }
        let contract: Address = config.contract_address.parse().map_err(|e| {
            BlockchainError::NotAvailable(format!(
                "invalid contract address '{}': {}",
                config.contract_address, e
            ))
        })?;
        if wallet.chain_id() != config.chain_id {
            return Err(BlockchainError::ChainMismatch {
                expected: config.chain_id,
                actual: wallet.chain_id(),
            });
        }

        let client = BlockchainClient::new(config.clone())?;
        let this = Self {
            sender: TxSender::new(client, wallet),
            contract,
            chain_id: config.chain_id,
            receipt_timeout: Duration::from_secs(config.receipt_timeout_secs),
            verified: OnceCell::new(),
        };

        match this.ensure_chain().await {
            Ok(()) => {
                tracing::info!(
                    rpc_url = %config.rpc_url,
                    chain_id = config.chain_id,
                    contract = %contract,
                    signer = %this.sender.address(),
                    "Chain client initialized"
                );
            }
            Err(e @ BlockchainError::ChainMismatch { .. }) => {
                tracing::error!(error = %e, "Configured chain id disagrees with the node");
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Chain client initialized but chain verification failed"
                );
            }
        }

        Ok(this)
    }

    /// Verify the node's chain id once per client.
    async fn ensure_chain(&self) -> BlockchainResult<()> {
        self.verified
            .get_or_try_init(|| self.sender.client().verify_chain_id())
            .await
            .map(|_| ())
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn call_request(&self, data: Bytes) -> TransactionRequest {
        TransactionRequest::default()
            .with_from(self.sender.address())
            .with_to(self.contract)
            .with_input(data)
    }
}

#[async_trait]
impl TokenChain for Erc1155Client {
    fn signer_address(&self) -> Address {
        self.sender.address()
    }

    fn receipt_timeout(&self) -> Duration {
        self.receipt_timeout
    }

    async fn balance_of(&self, owner: Address, token_id: U256) -> BlockchainResult<U256> {
        let data = IVoucher1155::balanceOfCall {
            account: owner,
            id: token_id,
        }
        .abi_encode();
        let raw = self
            .sender
            .client()
            .call(&self.call_request(data.into()))
            .await
            .map_err(|e| BlockchainError::ChainQuery(format!("balanceOf failed: {}", e)))?;

        IVoucher1155::balanceOfCall::abi_decode_returns(&raw)
            .map_err(|e| BlockchainError::ChainQuery(format!("balanceOf failed: {}", e)))
    }

    async fn mint_to(
        &self,
        to: Address,
        token_id: U256,
        amount: U256,
        data: Option<Bytes>,
    ) -> BlockchainResult<Submission> {
        self.ensure_chain().await?;
        let payload = data.unwrap_or_default();

        let (_, calldata) = select_mint_shape(to, token_id, amount, payload, |calldata| {
            let request = self.call_request(calldata);
            async move { self.sender.client().call(&request).await }
        })
        .await?;
        self.sender.submit(self.contract, calldata).await
    }

    async fn safe_transfer(
        &self,
        from: Address,
        to: Address,
        token_id: U256,
        amount: U256,
        data: Option<Bytes>,
    ) -> BlockchainResult<Submission> {
        self.ensure_chain().await?;
        let calldata = IVoucher1155::safeTransferFromCall {
            from,
            to,
            id: token_id,
            amount,
            data: data.unwrap_or_default(),
        }
        .abi_encode();
        self.sender.submit(self.contract, calldata.into()).await
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
    ) -> BlockchainResult<SettledReceipt> {
        self.sender.wait_for_receipt(tx_hash, timeout).await
    }

    async fn receipt(&self, tx_hash: TxHash) -> BlockchainResult<Option<SettledReceipt>> {
        self.sender.receipt(tx_hash).await
    }

    async fn is_healthy(&self) -> bool {
        self.sender.client().is_healthy().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_preference_order() {
        let signatures: Vec<_> = MintShape::PREFERENCE
            .iter()
            .map(MintShape::signature)
            .collect();
        assert_eq!(
            signatures,
            vec![
                "mint(address,uint256,uint256,bytes)",
                "mint(address,uint256,uint256)",
                "mintTo(address,uint256,uint256,bytes)",
                "mintTo(address,uint256,uint256)",
            ]
        );
    }

    #[test]
    fn test_shapes_encode_distinct_selectors() {
        let to = Address::repeat_byte(0x22);
        let mut selectors: Vec<[u8; 4]> = MintShape::PREFERENCE
            .iter()
            .map(|shape| {
                let data = shape.encode(to, U256::from(7), U256::from(1), Bytes::new());
                let mut selector = [0u8; 4];
                selector.copy_from_slice(&data[..4]);
                selector
            })
            .collect();
        selectors.dedup();
        assert_eq!(selectors.len(), 4);
    }

    #[test]
    fn test_payloadless_shape_is_shorter() {
        let to = Address::repeat_byte(0x22);
        let with_data = MintShape::MintWithData.encode(to, U256::from(1), U256::from(1), Bytes::new());
        let without = MintShape::Mint.encode(to, U256::from(1), U256::from(1), Bytes::new());
        // selector + 3 words, versus selector + 4 words + empty bytes length word
        assert_eq!(without.len(), 4 + 32 * 3);
        assert_eq!(with_data.len(), 4 + 32 * 5);
    }

    fn reverted(reason: &str) -> BlockchainError {
        BlockchainError::ChainQuery(format!("execution reverted: {}", reason))
    }

    #[tokio::test]
    async fn test_first_accepted_shape_is_selected() {
        let to = Address::repeat_byte(0x22);
        let mut tried = Vec::new();

        let (shape, calldata) = select_mint_shape(
            to,
            U256::from(7),
            U256::from(1),
            Bytes::new(),
            |calldata| {
                tried.push(calldata.clone());
                let result = if tried.len() == 1 {
                    Err(reverted("unknown selector"))
                } else {
                    Ok(Bytes::new())
                };
                async move { result }
            },
        )
        .await
        .unwrap();

        assert_eq!(shape, MintShape::Mint);
        assert_eq!(
            calldata,
            MintShape::Mint.encode(to, U256::from(7), U256::from(1), Bytes::new())
        );
        assert_eq!(tried.len(), 2);
        assert_eq!(tried[1], calldata);
    }

    #[tokio::test]
    async fn test_all_shapes_rejected_reports_each_in_order() {
        let mut calls = 0;
        let err = select_mint_shape(
            Address::ZERO,
            U256::from(1),
            U256::from(1),
            Bytes::new(),
            |_| {
                calls += 1;
                let result: BlockchainResult<Bytes> = Err(reverted("nope"));
                async move { result }
            },
        )
        .await
        .unwrap_err();

        assert_eq!(calls, 4);
        let errors = match err {
            BlockchainError::MintUnsupported(errors) => errors,
            other => panic!("expected MintUnsupported, got {other}"),
        };
        assert_eq!(errors.len(), 4);
        for (error, shape) in errors.iter().zip(MintShape::PREFERENCE) {
            assert!(error.starts_with(shape.signature()), "{}", error);
            assert!(error.ends_with("execution reverted: nope"), "{}", error);
        }
    }

    #[tokio::test]
    async fn test_disabled_config_is_rejected() {
        let wallet = Wallet::from_private_key(
            "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
            1,
        )
        .unwrap();
        let err = Erc1155Client::connect(&BlockchainConfig::default(), wallet)
            .await
            .unwrap_err();
        assert!(matches!(err, BlockchainError::NotAvailable(_)));
    }

    #[tokio::test]
    async fn test_unreachable_node_is_not_fatal() {
        let config = BlockchainConfig {
            enabled: true,
            rpc_url: "http://127.0.0.1:1".to_string(),
            chain_id: 31337,
            contract_address: "0x5fbdb2315678afecb367f032d93f642f64180aa3".to_string(),
            rpc_timeout_secs: 2,
            ..BlockchainConfig::default()
        };
        let wallet = Wallet::from_private_key(
            "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
            31337,
        )
        .unwrap();

        let client = Erc1155Client::connect(&config, wallet).await.unwrap();
        // Verification is retried on use and still fails.
        let err = client
            .mint_to(Address::ZERO, U256::from(1), U256::from(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BlockchainError::ChainConnection(_)));
    }
}
