use anyhow::{anyhow, Context, Result};
use ethers::abi::AbiParser;
use ethers::contract::Contract;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::transaction::eip712::TypedData;
use ethers::types::{Address, Bytes, TxHash, U256};
use std::sync::Arc;

/// EIP-712 domain as reported by the account's `eip712Domain()`.
#[derive(Clone, Debug)]
pub struct RecoveryDomain {
    pub name: String,
    pub version: String,
    pub chain_id: U256,
    pub verifying_contract: Address,
}

/// Pending recovery proposal read back from chain state.
#[derive(Clone, Debug)]
pub struct RecoveryDetails {
    pub recovery_address: Address,
    pub execute_after: u64,
    pub guardians_required: u32,
}

pub async fn read_eip712_domain<M: Middleware + 'static>(
    client: Arc<M>,
    account: Address,
) -> Result<RecoveryDomain> {
    let abi = AbiParser::default().parse(&[
        "function eip712Domain() view returns (bytes1 fields, string name, string version, uint256 chainId, address verifyingContract, bytes32 salt, uint256[] extensions)",
    ])?;
    let account_c = Contract::new(account, abi, client);

    let (_fields, name, version, chain_id, verifying_contract, _salt, _extensions): (
        [u8; 1],
        String,
        String,
        U256,
        Address,
        [u8; 32],
        Vec<U256>,
    ) = account_c
        .method("eip712Domain", ())?
        .call()
        .await
        .context("eip712Domain failed")?;

    Ok(RecoveryDomain {
        name,
        version,
        chain_id,
        verifying_contract,
    })
}

pub async fn read_recovery_details<M: Middleware + 'static>(
    client: Arc<M>,
    account: Address,
) -> Result<RecoveryDetails> {
    let abi = AbiParser::default().parse(&[
        "function recoveryDetails() view returns (address recoveryAddress, uint64 executeAfter, uint32 guardiansRequired)",
    ])?;
    let account_c = Contract::new(account, abi, client);

    let (recovery_address, execute_after, guardians_required): (Address, u64, u32) = account_c
        .method("recoveryDetails", ())?
        .call()
        .await
        .context("recoveryDetails failed")?;

    Ok(RecoveryDetails {
        recovery_address,
        execute_after,
        guardians_required,
    })
}

/// The typed-data payload a guardian signs to approve the pending recovery.
pub fn recover_typed_data(
    domain: &RecoveryDomain,
    details: &RecoveryDetails,
) -> Result<TypedData> {
    let payload = serde_json::json!({
        "types": {
            "EIP712Domain": [
                { "name": "name", "type": "string" },
                { "name": "version", "type": "string" },
                { "name": "chainId", "type": "uint256" },
                { "name": "verifyingContract", "type": "address" },
            ],
            "Recover": [
                { "name": "recoveryAddress", "type": "address" },
                { "name": "executeAfter", "type": "uint64" },
                { "name": "guardiansRequired", "type": "uint32" },
            ],
        },
        "primaryType": "Recover",
        "domain": {
            "name": domain.name,
            "version": domain.version,
            "chainId": domain.chain_id,
            "verifyingContract": domain.verifying_contract,
        },
        "message": {
            "recoveryAddress": details.recovery_address,
            "executeAfter": details.execute_after,
            "guardiansRequired": details.guardians_required,
        },
    });
    serde_json::from_value(payload).context("failed to build Recover typed data")
}

pub async fn start_recovery<M: Middleware + 'static>(
    client: Arc<M>,
    account: Address,
    new_owner: Address,
) -> Result<TxHash> {
    let abi = AbiParser::default().parse(&["function startRecovery(address _recoveryAddress)"])?;
    let account_c = Contract::new(account, abi, client);

    let call = account_c.method::<_, ()>("startRecovery", new_owner)?;
    let pending = call
        .send()
        .await
        .context("startRecovery transaction failed")?;
    let tx_hash = *pending;
    pending
        .await
        .context("failed waiting for startRecovery receipt")?
        .ok_or_else(|| anyhow!("startRecovery transaction dropped from mempool"))?;
    Ok(tx_hash)
}

pub async fn complete_recovery<M: Middleware + 'static>(
    client: Arc<M>,
    account: Address,
    signatures: Vec<Bytes>,
) -> Result<TxHash> {
    let abi =
        AbiParser::default().parse(&["function completeRecovery(bytes[] _signatures)"])?;
    let account_c = Contract::new(account, abi, client);

    let call = account_c.method::<_, ()>("completeRecovery", signatures)?;
    let pending = call
        .send()
        .await
        .context("completeRecovery transaction failed")?;
    let tx_hash = *pending;
    pending
        .await
        .context("failed waiting for completeRecovery receipt")?
        .ok_or_else(|| anyhow!("completeRecovery transaction dropped from mempool"))?;
    Ok(tx_hash)
}

/// Mines empty blocks to fast-forward past the recovery delay. Anvil-only
/// test affordance.
pub async fn mine_blocks(provider: &Provider<Http>, blocks: u64) -> Result<()> {
    provider
        .request::<_, ()>("anvil_mine", [blocks])
        .await
        .context("anvil_mine failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::{LocalWallet, Signer};
    use ethers::types::transaction::eip712::Eip712;
    use ethers::types::H256;
    use std::str::FromStr;

    fn domain() -> RecoveryDomain {
        RecoveryDomain {
            name: "Openfort".to_string(),
            version: "0.5".to_string(),
            chain_id: U256::from(31_337),
            verifying_contract: Address::from_str("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266")
                .unwrap(),
        }
    }

    fn details() -> RecoveryDetails {
        RecoveryDetails {
            recovery_address: Address::from_str("0xa0Ee7A142d267C1f36714E4a8F75612F20a79720")
                .unwrap(),
            execute_after: 172_800,
            guardians_required: 1,
        }
    }

    #[test]
    fn typed_data_digest_is_deterministic() {
        let a = recover_typed_data(&domain(), &details()).unwrap();
        let b = recover_typed_data(&domain(), &details()).unwrap();
        assert_eq!(a.encode_eip712().unwrap(), b.encode_eip712().unwrap());

        let mut other = details();
        other.execute_after += 1;
        let c = recover_typed_data(&domain(), &other).unwrap();
        assert_ne!(a.encode_eip712().unwrap(), c.encode_eip712().unwrap());
    }

    #[tokio::test]
    async fn guardian_signature_recovers() {
        // anvil dev key 1 as the guardian
        let guardian: LocalWallet =
            "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d"
                .parse()
                .unwrap();

        let typed_data = recover_typed_data(&domain(), &details()).unwrap();
        let signature = guardian.sign_typed_data(&typed_data).await.unwrap();

        let digest = H256::from(typed_data.encode_eip712().unwrap());
        assert_eq!(signature.recover(digest).unwrap(), guardian.address());
    }
}
