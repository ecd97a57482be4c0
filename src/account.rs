use crate::userop::UserOperation;
use anyhow::{anyhow, Context, Result};
use ethers::abi::{Abi, AbiParser, Token};
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip712::TypedData;
use ethers::types::{Address, Bytes, Signature, U256};
use std::str::FromStr;
use std::sync::Arc;

/// Placeholder signature handed to gas-estimation flows that need a
/// signature-shaped value without real signing.
pub const STUB_SIGNATURE: &str = "0xfffffffffffffffffffffffffffffff0000000000000000000000000000000007aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa1c";

/// A single call for the account to execute.
#[derive(Clone, Debug, Default)]
pub struct Call {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

/// Presents a 7702-delegated authority EOA as an ERC-4337 smart account.
///
/// Under EIP-7702 the account code lives at the EOA itself, so the account
/// address is the authority address, no deployment factory exists, and the
/// EOA transaction count doubles as the 4337 operation nonce.
pub struct SmartAccount {
    authority: LocalWallet,
    provider: Arc<Provider<Http>>,
    entry_point: Address,
    chain_id: u64,
}

impl SmartAccount {
    pub fn new(
        authority: LocalWallet,
        provider: Arc<Provider<Http>>,
        entry_point: Address,
        chain_id: u64,
    ) -> Self {
        Self {
            authority,
            provider,
            entry_point,
            chain_id,
        }
    }

    /// The smart-account address *is* the authority address.
    pub fn address(&self) -> Address {
        self.authority.address()
    }

    /// The proxy is injected by the delegation transaction; no factory is
    /// ever involved.
    #[allow(dead_code)]
    pub fn factory_args(&self) -> Option<(Address, Bytes)> {
        None
    }

    /// The authority EOA transaction count, used as the operation nonce.
    pub async fn nonce(&self) -> Result<U256> {
        self.provider
            .get_transaction_count(self.address(), None)
            .await
            .context("failed to fetch authority transaction count")
    }

    /// Encodes calls for the delegated account:
    /// a lone session-key management call passes through untouched, any
    /// other single call becomes `execute`, and multiple calls become one
    /// `executeBatch` with order-preserving parallel arrays.
    pub fn encode_calls(&self, calls: &[Call]) -> Result<Bytes> {
        let abi = account_abi()?;
        match calls {
            [] => Err(anyhow!("no calls to encode")),
            [call] => {
                if is_session_key_call(&abi, &call.data) {
                    return Ok(call.data.clone());
                }
                let data = abi.function("execute")?.encode_input(&[
                    Token::Address(call.to),
                    Token::Uint(call.value),
                    Token::Bytes(call.data.to_vec()),
                ])?;
                Ok(data.into())
            }
            _ => {
                let data = abi.function("executeBatch")?.encode_input(&[
                    Token::Array(calls.iter().map(|c| Token::Address(c.to)).collect()),
                    Token::Array(calls.iter().map(|c| Token::Uint(c.value)).collect()),
                    Token::Array(calls.iter().map(|c| Token::Bytes(c.data.to_vec())).collect()),
                ])?;
                Ok(data.into())
            }
        }
    }

    /// EIP-191 message signature by the authority key.
    pub async fn sign_message(&self, message: &[u8]) -> Result<Signature> {
        self.authority
            .sign_message(message)
            .await
            .context("authority failed to sign message")
    }

    /// Typed-data signing is not supported by the delegated account.
    #[allow(dead_code)]
    pub fn sign_typed_data(&self, _typed_data: &TypedData) -> Result<Signature> {
        Err(anyhow!("signTypedData is not implemented for the delegated account"))
    }

    /// Computes the canonical user-operation hash, with `sender` pinned to
    /// the account's own address, and signs it as an EIP-191 message.
    pub async fn sign_user_operation(&self, user_operation: &UserOperation) -> Result<Bytes> {
        let mut user_operation = user_operation.clone();
        user_operation.sender = self.address();
        let hash = user_operation.hash(self.entry_point, self.chain_id);
        let signature = self
            .sign_message(hash.as_bytes())
            .await
            .context("authority failed to sign user operation hash")?;
        Ok(Bytes::from(signature.to_vec()))
    }

    pub fn stub_signature(&self) -> Result<Bytes> {
        Bytes::from_str(STUB_SIGNATURE).context("invalid stub signature constant")
    }
}

fn account_abi() -> Result<Abi> {
    AbiParser::default()
        .parse(&[
            "function execute(address dest, uint256 value, bytes func)",
            "function executeBatch(address[] _target, uint256[] _value, bytes[] _calldata)",
            "function registerSessionKey(address _key, uint48 _validAfter, uint48 _validUntil, uint48 _limit, address[] _whitelist)",
            "function revokeSessionKey(address _key)",
        ])
        .context("failed to parse account ABI")
}

/// Session-key management must reach the account's own entry points
/// unwrapped. Anything that does not fully decode as one of those calls is
/// treated as a plain call.
fn is_session_key_call(abi: &Abi, data: &Bytes) -> bool {
    if data.len() < 4 {
        return false;
    }
    for name in ["registerSessionKey", "revokeSessionKey"] {
        if let Ok(function) = abi.function(name) {
            if function.short_signature()[..] == data[..4]
                && function.decode_input(&data[4..]).is_ok()
            {
                return true;
            }
        }
    }
    false
}
