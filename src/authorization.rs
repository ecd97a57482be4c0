use anyhow::{Context, Result};
use ethers::signers::LocalWallet;
use ethers::types::{Address, Bytes, Signature, H256, U256};
use ethers::utils::{keccak256, rlp::RlpStream};

// ethers 2 predates EIP-7702, so the authorization digest and the SetCode
// transaction wire format are assembled here on the library's rlp/keccak
// primitives and submitted via eth_sendRawTransaction.

const AUTHORIZATION_MAGIC: u8 = 0x05;
const SET_CODE_TX_TYPE: u8 = 0x04;

/// EIP-7702 authorization digest:
/// `keccak256(0x05 || rlp([chain_id, address, nonce]))`.
pub fn authorization_hash(chain_id: u64, address: Address, nonce: u64) -> H256 {
    let mut rlp = RlpStream::new_list(3);
    rlp.append(&chain_id);
    rlp.append(&address);
    rlp.append(&nonce);
    let mut preimage = vec![AUTHORIZATION_MAGIC];
    preimage.extend_from_slice(&rlp.out());
    H256::from(keccak256(preimage))
}

/// An EIP-7702 authorization tuple together with its signature.
#[derive(Clone, Debug)]
pub struct SignedAuthorization {
    pub chain_id: u64,
    /// Delegation designator: the contract whose code the EOA adopts.
    pub address: Address,
    pub nonce: u64,
    pub signature: Signature,
}

impl SignedAuthorization {
    pub fn hash(&self) -> H256 {
        authorization_hash(self.chain_id, self.address, self.nonce)
    }

    /// Recovers the authority that signed this authorization.
    pub fn recover(&self) -> Result<Address> {
        self.signature
            .recover(self.hash())
            .context("failed to recover authorization signer")
    }

    /// Appends the 6-item authorization-list entry
    /// `[chain_id, address, nonce, y_parity, r, s]`.
    fn rlp_append(&self, rlp: &mut RlpStream) {
        rlp.begin_list(6);
        rlp.append(&self.chain_id);
        rlp.append(&self.address);
        rlp.append(&self.nonce);
        rlp.append(&y_parity(&self.signature));
        rlp.append(&self.signature.r);
        rlp.append(&self.signature.s);
    }
}

/// An EIP-7702 SetCode (type 0x04) transaction.
#[derive(Clone, Debug)]
pub struct SetCodeTransaction {
    pub chain_id: u64,
    pub nonce: U256,
    pub max_priority_fee_per_gas: U256,
    pub max_fee_per_gas: U256,
    pub gas_limit: U256,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub authorization_list: Vec<SignedAuthorization>,
}

impl SetCodeTransaction {
    /// Appends the 10 unsigned payload items (empty access list included).
    fn rlp_base(&self, rlp: &mut RlpStream) {
        rlp.append(&self.chain_id);
        rlp.append(&self.nonce);
        rlp.append(&self.max_priority_fee_per_gas);
        rlp.append(&self.max_fee_per_gas);
        rlp.append(&self.gas_limit);
        rlp.append(&self.to);
        rlp.append(&self.value);
        rlp.append(&self.data.to_vec());
        rlp.begin_list(0);
        rlp.begin_list(self.authorization_list.len());
        for authorization in &self.authorization_list {
            authorization.rlp_append(rlp);
        }
    }

    /// Sender digest: `keccak256(0x04 || rlp(payload))`.
    pub fn sighash(&self) -> H256 {
        let mut rlp = RlpStream::new_list(10);
        self.rlp_base(&mut rlp);
        let mut preimage = vec![SET_CODE_TX_TYPE];
        preimage.extend_from_slice(&rlp.out());
        H256::from(keccak256(preimage))
    }

    /// Signs with the sender key and returns the raw wire bytes for
    /// `eth_sendRawTransaction`.
    pub fn sign(&self, sender: &LocalWallet) -> Result<Bytes> {
        let signature = sender
            .sign_hash(self.sighash())
            .context("failed to sign delegation transaction")?;
        let mut rlp = RlpStream::new_list(13);
        self.rlp_base(&mut rlp);
        rlp.append(&y_parity(&signature));
        rlp.append(&signature.r);
        rlp.append(&signature.s);
        let mut raw = vec![SET_CODE_TX_TYPE];
        raw.extend_from_slice(&rlp.out());
        Ok(Bytes::from(raw))
    }
}

fn y_parity(signature: &Signature) -> u8 {
    if signature.v >= 27 {
        (signature.v - 27) as u8
    } else {
        signature.v as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::Signer;
    use std::str::FromStr;

    // anvil dev key 0
    const AUTHORITY_KEY: &str =
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const PROXY: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

    fn authority() -> LocalWallet {
        LocalWallet::from_str(AUTHORITY_KEY).unwrap()
    }

    #[test]
    fn authorization_hash_layout() {
        let proxy = Address::from_str(PROXY).unwrap();
        let hash = authorization_hash(31_337, proxy, 6);

        let mut rlp = RlpStream::new_list(3);
        rlp.append(&31_337u64);
        rlp.append(&proxy);
        rlp.append(&6u64);
        let mut preimage = vec![0x05];
        preimage.extend_from_slice(&rlp.out());
        assert_eq!(hash, H256::from(keccak256(preimage)));

        // the digest must commit to the nonce
        assert_ne!(hash, authorization_hash(31_337, proxy, 5));
    }

    #[test]
    fn sign_then_recover_round_trip() {
        // authority with on-chain nonce 5 authorizes for nonce 6
        let authority = authority();
        let proxy = Address::from_str(PROXY).unwrap();
        let hash = authorization_hash(31_337, proxy, 5 + 1);
        let signature = authority.sign_hash(hash).unwrap();

        let authorization = SignedAuthorization {
            chain_id: 31_337,
            address: proxy,
            nonce: 6,
            signature,
        };
        assert_eq!(authorization.recover().unwrap(), authority.address());
    }

    #[test]
    fn recover_rejects_foreign_signature() {
        let proxy = Address::from_str(PROXY).unwrap();
        let other: LocalWallet =
            "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d"
                .parse()
                .unwrap();
        let signature = other.sign_hash(authorization_hash(31_337, proxy, 6)).unwrap();

        let authorization = SignedAuthorization {
            chain_id: 31_337,
            address: proxy,
            nonce: 6,
            signature,
        };
        assert_ne!(authorization.recover().unwrap(), authority().address());
    }

    #[test]
    fn set_code_transaction_encodes_with_type_prefix() {
        let authority = authority();
        let proxy = Address::from_str(PROXY).unwrap();
        let signature = authority.sign_hash(authorization_hash(31_337, proxy, 1)).unwrap();

        let tx = SetCodeTransaction {
            chain_id: 31_337,
            nonce: U256::zero(),
            max_priority_fee_per_gas: U256::from(1_000_000_000u64),
            max_fee_per_gas: U256::from(2_000_000_000u64),
            gas_limit: U256::from(1_000_000),
            to: authority.address(),
            value: U256::zero(),
            data: Bytes::from_str("0xdeadbeef").unwrap(),
            authorization_list: vec![SignedAuthorization {
                chain_id: 31_337,
                address: proxy,
                nonce: 1,
                signature,
            }],
        };

        let raw = tx.sign(&authority).unwrap();
        assert_eq!(raw[0], 0x04);
        assert!(raw.len() > 100);
        // deterministic signing key means deterministic wire bytes
        assert_eq!(raw, tx.sign(&authority).unwrap());
        // the digest excludes the outer signature
        assert_ne!(tx.sighash(), H256::from(keccak256(&raw)));
    }
}
