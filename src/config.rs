use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use std::str::FromStr;

/// EntryPoint v0.7 singleton address.
pub const ENTRY_POINT_V07: &str = "0x0000000071727De22E5E9d8BAf0edAc6f37da032";

/// Default `initializeAccount` timing parameters, in seconds, in the
/// contract's parameter order.
pub const DEFAULT_RECOVERY_PERIOD: u64 = 172_800; // 2 days
pub const DEFAULT_SECURITY_PERIOD: u64 = 129_600; // 1.5 days
pub const DEFAULT_SECURITY_WINDOW: u64 = 43_200; // 0.5 days
pub const DEFAULT_LOCK_PERIOD: u64 = 432_000; // 5 days

/// Networks this tool knows how to talk to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Network {
    /// Local anvil devnet (assumes a 4337 bundler on port 4337).
    Anvil,
    /// Pectra devnet.
    Pectra,
}

impl Network {
    pub fn chain_id(self) -> u64 {
        match self {
            Network::Anvil => 31_337,
            Network::Pectra => 7_011_893_082,
        }
    }

    pub fn rpc_url(self) -> &'static str {
        match self {
            Network::Anvil => "http://127.0.0.1:8545",
            Network::Pectra => "https://rpc.pectra-devnet-3.ethpandaops.io",
        }
    }

    /// Bundler endpoint. Neither devnet has a public bundler; both expect
    /// one running locally.
    pub fn bundler_url(self) -> &'static str {
        "http://127.0.0.1:4337"
    }
}

pub fn parse_address(s: &str) -> Result<Address> {
    Address::from_str(s).map_err(|e| anyhow!("invalid address '{s}': {e}"))
}

pub fn parse_wallet(key: &str, chain_id: u64) -> Result<LocalWallet> {
    let wallet = LocalWallet::from_str(key).context("invalid private key")?;
    Ok(wallet.with_chain_id(chain_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_parameters() {
        assert_eq!(Network::Anvil.chain_id(), 31_337);
        assert_eq!(Network::Pectra.chain_id(), 7_011_893_082);
        assert!(Network::Pectra.rpc_url().starts_with("https://"));
    }

    #[test]
    fn entry_point_address_parses() {
        parse_address(ENTRY_POINT_V07).unwrap();
    }

    #[test]
    fn parse_wallet_sets_chain_id() {
        // anvil dev key 0
        let wallet = parse_wallet(
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
            31_337,
        )
        .unwrap();
        assert_eq!(wallet.chain_id(), 31_337);
        assert_eq!(
            wallet.address(),
            parse_address("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266").unwrap()
        );
    }
}
