use anyhow::{Context, Result};
use ethers::abi::{Abi, AbiEncode, Token};
use ethers::prelude::{EthAbiCodec, EthAbiType};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

/// ERC-4337 user operation in the unpacked EntryPoint v0.7 wire shape.
///
/// Bundler RPC methods take this form; the on-chain `PackedUserOperation`
/// (bytes32 `accountGasLimits`/`gasFees`, concatenated `initCode` and
/// `paymasterAndData`) only appears when hashing and when encoding
/// `handleOps`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_data: Option<Bytes>,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_verification_gas_limit: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_post_op_gas_limit: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_data: Option<Bytes>,
    pub signature: Bytes,
}

/// Packed user operation with hashed dynamic fields, for computing the
/// canonical user-operation hash.
#[derive(EthAbiCodec, EthAbiType)]
struct PackedUserOperationUnsigned {
    sender: Address,
    nonce: U256,
    init_code: H256,
    call_data: H256,
    account_gas_limits: H256,
    pre_verification_gas: U256,
    gas_fees: H256,
    paymaster_and_data: H256,
}

impl UserOperation {
    /// v0.7 `initCode`: factory address followed by its calldata, or empty
    /// for an already-active account.
    pub fn init_code(&self) -> Bytes {
        match (self.factory, self.factory_data.as_ref()) {
            (Some(factory), data) => {
                let data = data.map(|b| b.to_vec()).unwrap_or_default();
                let mut v = Vec::with_capacity(20 + data.len());
                v.extend_from_slice(factory.as_bytes());
                v.extend_from_slice(&data);
                Bytes::from(v)
            }
            (None, _) => Bytes::default(),
        }
    }

    /// v0.7 `paymasterAndData`: paymaster address, two 16-byte gas limits,
    /// then the paymaster payload, or empty without a paymaster.
    pub fn paymaster_and_data(&self) -> Bytes {
        match self.paymaster {
            Some(paymaster) => {
                let mut v = Vec::with_capacity(52);
                v.extend_from_slice(paymaster.as_bytes());
                v.extend_from_slice(
                    &pack_u128_pair(
                        self.paymaster_verification_gas_limit.unwrap_or_default(),
                        self.paymaster_post_op_gas_limit.unwrap_or_default(),
                    )
                    .0,
                );
                if let Some(data) = self.paymaster_data.as_ref() {
                    v.extend_from_slice(data);
                }
                Bytes::from(v)
            }
            None => Bytes::default(),
        }
    }

    /// `accountGasLimits`: verificationGasLimit (high 16 bytes) packed with
    /// callGasLimit (low 16 bytes).
    pub fn account_gas_limits(&self) -> H256 {
        pack_u128_pair(self.verification_gas_limit, self.call_gas_limit)
    }

    /// `gasFees`: maxPriorityFeePerGas (high 16 bytes) packed with
    /// maxFeePerGas (low 16 bytes).
    pub fn gas_fees(&self) -> H256 {
        pack_u128_pair(self.max_priority_fee_per_gas, self.max_fee_per_gas)
    }

    /// Canonical EntryPoint v0.7 user-operation hash.
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> H256 {
        let packed = PackedUserOperationUnsigned {
            sender: self.sender,
            nonce: self.nonce,
            init_code: keccak256(self.init_code()).into(),
            call_data: keccak256(&self.call_data).into(),
            account_gas_limits: self.account_gas_limits(),
            pre_verification_gas: self.pre_verification_gas,
            gas_fees: self.gas_fees(),
            paymaster_and_data: keccak256(self.paymaster_and_data()).into(),
        };
        H256::from(keccak256(
            [
                keccak256(packed.encode()).to_vec(),
                entry_point.encode(),
                U256::from(chain_id).encode(),
            ]
            .concat(),
        ))
    }

    /// The on-chain `PackedUserOperation` as an ABI token, for encoding
    /// `handleOps` calls.
    pub fn packed_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::Bytes(self.init_code().to_vec()),
            Token::Bytes(self.call_data.to_vec()),
            Token::FixedBytes(self.account_gas_limits().as_bytes().to_vec()),
            Token::Uint(self.pre_verification_gas),
            Token::FixedBytes(self.gas_fees().as_bytes().to_vec()),
            Token::Bytes(self.paymaster_and_data().to_vec()),
            Token::Bytes(self.signature.to_vec()),
        ])
    }
}

/// EntryPoint v0.7 `handleOps(PackedUserOperation[],address)` fragment.
/// Parsed from JSON because the human-readable parser has no tuple syntax.
const HANDLE_OPS_ABI: &str = r#"[{"inputs":[{"components":[{"internalType":"address","name":"sender","type":"address"},{"internalType":"uint256","name":"nonce","type":"uint256"},{"internalType":"bytes","name":"initCode","type":"bytes"},{"internalType":"bytes","name":"callData","type":"bytes"},{"internalType":"bytes32","name":"accountGasLimits","type":"bytes32"},{"internalType":"uint256","name":"preVerificationGas","type":"uint256"},{"internalType":"bytes32","name":"gasFees","type":"bytes32"},{"internalType":"bytes","name":"paymasterAndData","type":"bytes"},{"internalType":"bytes","name":"signature","type":"bytes"}],"internalType":"struct PackedUserOperation[]","name":"ops","type":"tuple[]"},{"internalType":"address","name":"beneficiary","type":"address"}],"name":"handleOps","outputs":[],"stateMutability":"nonpayable","type":"function"}]"#;

/// ABI-encodes an EntryPoint v0.7 `handleOps` invocation.
pub fn encode_handle_ops(ops: &[UserOperation], beneficiary: Address) -> Result<Bytes> {
    let abi: Abi = serde_json::from_str(HANDLE_OPS_ABI).context("failed to parse EntryPoint ABI")?;
    let data = abi.function("handleOps")?.encode_input(&[
        Token::Array(ops.iter().map(UserOperation::packed_token).collect()),
        Token::Address(beneficiary),
    ])?;
    Ok(data.into())
}

fn pack_u128_pair(high: U256, low: U256) -> H256 {
    let mut out = [0u8; 32];
    let mut buf = [0u8; 32];
    high.to_big_endian(&mut buf);
    out[..16].copy_from_slice(&buf[16..]);
    low.to_big_endian(&mut buf);
    out[16..].copy_from_slice(&buf[16..]);
    H256(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn sample_op() -> UserOperation {
        UserOperation {
            sender: Address::from_str("0x70997970C51812dc3A010C7d01b50e0d17dc79C8").unwrap(),
            nonce: U256::from(2),
            call_data: Bytes::from_str("0xdeadbeef").unwrap(),
            call_gas_limit: U256::from(500_000),
            verification_gas_limit: U256::from(100_000),
            pre_verification_gas: U256::from(21_000),
            max_fee_per_gas: U256::from(2_000_000_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000_000u64),
            signature: Bytes::default(),
            ..Default::default()
        }
    }

    #[test]
    fn gas_fields_pack_high_low() {
        let op = UserOperation {
            verification_gas_limit: U256::from(1),
            call_gas_limit: U256::from(2),
            ..Default::default()
        };
        let packed = op.account_gas_limits();
        assert_eq!(packed.as_bytes()[15], 1);
        assert_eq!(packed.as_bytes()[31], 2);
        assert!(packed.as_bytes()[..15].iter().all(|b| *b == 0));
    }

    #[test]
    fn init_code_concatenates_factory_and_data() {
        let mut op = sample_op();
        assert!(op.init_code().is_empty());

        op.factory = Some(Address::repeat_byte(0x11));
        op.factory_data = Some(Bytes::from_str("0xabcd").unwrap());
        let init_code = op.init_code();
        assert_eq!(init_code.len(), 22);
        assert_eq!(&init_code[..20], Address::repeat_byte(0x11).as_bytes());
        assert_eq!(&init_code[20..], &[0xab, 0xcd]);
    }

    #[test]
    fn hash_is_deterministic_and_field_sensitive() {
        let entry_point = Address::from_str("0x0000000071727De22E5E9d8BAf0edAc6f37da032").unwrap();
        let op = sample_op();

        let a = op.hash(entry_point, 31_337);
        let b = op.hash(entry_point, 31_337);
        assert_eq!(a, b);

        let mut changed = op.clone();
        changed.nonce = U256::from(3);
        assert_ne!(a, changed.hash(entry_point, 31_337));
        assert_ne!(a, op.hash(entry_point, 1));
    }

    #[test]
    fn handle_ops_encoding_round_trips() {
        let beneficiary: Address =
            Address::from_str("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266").unwrap();
        let op = sample_op();
        let encoded = encode_handle_ops(std::slice::from_ref(&op), beneficiary).unwrap();
        assert_eq!(hex::encode(&encoded[..4]), "765e827f");

        let abi: Abi = serde_json::from_str(HANDLE_OPS_ABI).unwrap();
        let tokens = abi
            .function("handleOps")
            .unwrap()
            .decode_input(&encoded[4..])
            .unwrap();
        assert_eq!(tokens[1], Token::Address(beneficiary));
        let Token::Array(ops) = &tokens[0] else {
            panic!("expected ops array");
        };
        let Token::Tuple(fields) = &ops[0] else {
            panic!("expected packed tuple");
        };
        assert_eq!(fields[0], Token::Address(op.sender));
        assert_eq!(fields[1], Token::Uint(op.nonce));
        assert_eq!(
            fields[4],
            Token::FixedBytes(op.account_gas_limits().as_bytes().to_vec())
        );
    }

    #[test]
    fn rpc_json_omits_absent_fields() {
        let json = serde_json::to_value(sample_op()).unwrap();
        assert_eq!(json["nonce"], "0x2");
        assert_eq!(json["callGasLimit"], "0x7a120");
        assert!(json.get("factory").is_none());
        assert!(json.get("paymaster").is_none());
        assert!(json.get("initCode").is_none());
    }
}
