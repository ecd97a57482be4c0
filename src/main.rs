mod account;
mod authorization;
mod bundler;
mod config;
mod encoding;
mod recovery;
mod userop;

use account::{Call, SmartAccount};
use anyhow::{anyhow, ensure, Context, Result};
use authorization::{SetCodeTransaction, SignedAuthorization};
use bundler::BundlerClient;
use clap::{Args, Parser, Subcommand};
use config::{parse_address, parse_wallet, Network};
use ethers::abi::{AbiParser, Token};
use ethers::prelude::*;
use ethers::providers::Middleware;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use userop::UserOperation;

// anvil dev accounts used by the batch demo.
const ALICE: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
const BOB: &str = "0xa0Ee7A142d267C1f36714E4a8F75612F20a79720";

// eth_estimateGas cannot model the SetCode side effects, so the
// delegation transaction ships with a generous fixed limit.
const DELEGATION_GAS_LIMIT: u64 = 1_000_000;

#[derive(Parser, Debug)]
#[command(
    name = "openfort-7702",
    version,
    about = "A simple CLI to explore 7702 with Openfort 4337 Smart Account"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the authority account's transaction count.
    GetNonce(GetNonceArgs),

    /// Compute the EIP-7702 authorization hash for the delegation target.
    GetAuthorizationHash(GetAuthorizationHashArgs),

    /// Sign an authorization hash with the authority key.
    SignAuthorization(SignAuthorizationArgs),

    /// Submit the delegation-activation transaction (SetCode + initializeAccount).
    ActivateDelegation(ActivateDelegationArgs),

    /// Send batched value transfers through the 4337 bundler.
    SendBatch(SendBatchArgs),

    /// Drive the guardian social-recovery flow for the delegated account.
    RecoverAccount(RecoverAccountArgs),

    /// Debug: ABI-encode an EntryPoint v0.7 handleOps call for a sample operation.
    EncodeHandleOps,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Target network.
    #[arg(long, env = "NETWORK", value_enum, default_value = "anvil")]
    network: Network,

    /// Override the chain RPC URL.
    #[arg(long, env = "RPC_URL")]
    rpc: Option<String>,

    /// Authority private key (the EOA that controls the smart account).
    ///
    /// Recommended: set via env var AUTHORITY_PRIVATE_KEY.
    #[arg(long, env = "AUTHORITY_PRIVATE_KEY")]
    authority_private_key: String,
}

#[derive(Args, Debug)]
struct GetNonceArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct GetAuthorizationHashArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Delegation designator (the smart-account proxy to inject).
    #[arg(short, long, env = "OPENFORT_SMART_ACCOUNT_PROXY")]
    address: String,
}

#[derive(Args, Debug)]
struct SignAuthorizationArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Authorization hash to sign.
    #[arg(short = 'H', long)]
    hash: String,
}

#[derive(Args, Debug)]
struct ActivateDelegationArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Authorization signature produced by sign-authorization.
    #[arg(short, long)]
    signature: String,

    /// Delegation designator (the smart-account proxy to inject).
    #[arg(short, long, env = "OPENFORT_SMART_ACCOUNT_PROXY")]
    address: String,

    /// Smart-account implementation behind the proxy.
    #[arg(long, env = "OPENFORT_SMART_ACCOUNT_IMPLEMENTATION")]
    implementation: String,

    /// EntryPoint address.
    #[arg(long, env = "ENTRY_POINT", default_value = config::ENTRY_POINT_V07)]
    entry_point: String,

    /// Initial guardian registered at activation.
    #[arg(long, env = "GUARDIAN_ADDRESS")]
    guardian: String,

    /// Recovery period in seconds.
    #[arg(long, env = "RECOVERY_PERIOD", default_value_t = config::DEFAULT_RECOVERY_PERIOD)]
    recovery_period: u64,

    /// Security period in seconds.
    #[arg(long, env = "SECURITY_PERIOD", default_value_t = config::DEFAULT_SECURITY_PERIOD)]
    security_period: u64,

    /// Security window in seconds.
    #[arg(long, env = "SECURITY_WINDOW", default_value_t = config::DEFAULT_SECURITY_WINDOW)]
    security_window: u64,

    /// Lock period in seconds.
    #[arg(long, env = "LOCK_PERIOD", default_value_t = config::DEFAULT_LOCK_PERIOD)]
    lock_period: u64,
}

#[derive(Args, Debug)]
struct SendBatchArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Bundler RPC URL (must support ERC-4337 JSON-RPC methods).
    #[arg(long, env = "BUNDLER_URL")]
    bundler: Option<String>,

    /// EntryPoint address.
    #[arg(long, env = "ENTRY_POINT", default_value = config::ENTRY_POINT_V07)]
    entry_point: String,

    /// Session key that signs the user operation in place of the owner.
    #[arg(short, long)]
    signer: Option<String>,

    /// Build, estimate and sign the user operation without sending it.
    #[arg(long)]
    dry_run: bool,

    /// Max seconds to wait for the userOp receipt. Use 0 to disable timeout.
    #[arg(long, default_value_t = 180)]
    max_wait_seconds: u64,
}

#[derive(Args, Debug)]
struct RecoverAccountArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Proposed new owner of the account.
    #[arg(short, long)]
    new_owner: String,

    /// Guardian private key driving the recovery.
    ///
    /// Recommended: set via env var GUARDIAN_PRIVATE_KEY.
    #[arg(long, env = "GUARDIAN_PRIVATE_KEY")]
    guardian_private_key: String,

    /// Recovery period in seconds (also the number of blocks mined to pass it).
    #[arg(long, env = "RECOVERY_PERIOD", default_value_t = config::DEFAULT_RECOVERY_PERIOD)]
    recovery_period: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // Logs go to stderr so stdout stays script-friendly.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::GetNonce(args) => cmd_get_nonce(args).await,
        Command::GetAuthorizationHash(args) => cmd_get_authorization_hash(args).await,
        Command::SignAuthorization(args) => cmd_sign_authorization(args),
        Command::ActivateDelegation(args) => cmd_activate_delegation(args).await,
        Command::SendBatch(args) => cmd_send_batch(args).await,
        Command::RecoverAccount(args) => cmd_recover_account(args).await,
        Command::EncodeHandleOps => cmd_encode_handle_ops(),
    }
}

async fn cmd_get_nonce(args: GetNonceArgs) -> Result<()> {
    let (provider, chain_id) = connect(&args.common).await?;
    let authority = parse_wallet(&args.common.authority_private_key, chain_id)
        .context("invalid authority private key")?;

    let nonce = provider
        .get_transaction_count(authority.address(), None)
        .await
        .context("failed to fetch authority transaction count")?;
    println!("Authority Account Nonce = {nonce}");

    Ok(())
}

async fn cmd_get_authorization_hash(args: GetAuthorizationHashArgs) -> Result<()> {
    let (provider, chain_id) = connect(&args.common).await?;
    let authority = parse_wallet(&args.common.authority_private_key, chain_id)
        .context("invalid authority private key")?;
    let delegation = parse_address(&args.address).context("invalid delegation designator")?;

    let nonce = provider
        .get_transaction_count(authority.address(), None)
        .await
        .context("failed to fetch authority transaction count")?;

    // The activation transaction itself consumes `nonce`, so the
    // authorization commits to the one after it.
    let hash = authorization::authorization_hash(chain_id, delegation, nonce.as_u64() + 1);
    println!("Authorization hash: {}", encoding::fmt_h256(hash));

    Ok(())
}

fn cmd_sign_authorization(args: SignAuthorizationArgs) -> Result<()> {
    let authority = parse_wallet(
        &args.common.authority_private_key,
        args.common.network.chain_id(),
    )
    .context("invalid authority private key")?;
    let hash = encoding::parse_h256(&args.hash).context("invalid authorization hash")?;

    // The authorization digest is signed raw, without the EIP-191 prefix.
    let signature = authority
        .sign_hash(hash)
        .context("failed to sign authorization hash")?;
    println!("Signature: 0x{}", hex::encode(signature.to_vec()));

    Ok(())
}

async fn cmd_activate_delegation(args: ActivateDelegationArgs) -> Result<()> {
    let (provider, chain_id) = connect(&args.common).await?;
    let authority = parse_wallet(&args.common.authority_private_key, chain_id)
        .context("invalid authority private key")?;
    let delegation = parse_address(&args.address).context("invalid delegation designator")?;
    let implementation =
        parse_address(&args.implementation).context("invalid implementation address")?;
    let entry_point = parse_address(&args.entry_point).context("invalid entry point address")?;
    let guardian = parse_address(&args.guardian).context("invalid guardian address")?;

    let nonce = provider
        .get_transaction_count(authority.address(), None)
        .await
        .context("failed to fetch authority transaction count")?;

    let signature = Signature::from_str(&args.signature).context("invalid signature")?;
    let authorization = SignedAuthorization {
        chain_id,
        address: delegation,
        nonce: nonce.as_u64() + 1,
        signature,
    };

    let recovered = authorization.recover()?;
    ensure!(
        recovered == authority.address(),
        "recovered authorization address {} does not match authority address {}",
        encoding::fmt_address(recovered),
        encoding::fmt_address(authority.address()),
    );

    let data = initialize_account_calldata(
        implementation,
        entry_point,
        args.recovery_period,
        args.security_period,
        args.security_window,
        args.lock_period,
        guardian,
    )?;

    let (max_fee, max_priority) = fee_estimate(&provider).await?;
    let tx = SetCodeTransaction {
        chain_id,
        nonce,
        max_priority_fee_per_gas: max_priority,
        max_fee_per_gas: max_fee,
        gas_limit: U256::from(DELEGATION_GAS_LIMIT),
        // the delegated EOA is its own smart account
        to: authority.address(),
        value: U256::zero(),
        data,
        authorization_list: vec![authorization],
    };
    let raw = tx.sign(&authority)?;

    match provider.send_raw_transaction(raw).await {
        Ok(pending) => println!("Transaction sent: {}", encoding::fmt_h256(*pending)),
        Err(e) => tracing::error!(error = %e, "delegation transaction failed"),
    }

    Ok(())
}

async fn cmd_send_batch(args: SendBatchArgs) -> Result<()> {
    let (provider, chain_id) = connect(&args.common).await?;
    let authority = parse_wallet(&args.common.authority_private_key, chain_id)
        .context("invalid authority private key")?;
    let entry_point = parse_address(&args.entry_point).context("invalid entry point address")?;

    let provider = Arc::new(provider);
    let account = SmartAccount::new(authority, provider.clone(), entry_point, chain_id);

    println!("Sending batch transaction...");
    let calls = vec![
        Call {
            to: parse_address(ALICE)?,
            value: U256::from(4242),
            data: Bytes::default(),
        },
        Call {
            to: parse_address(BOB)?,
            value: U256::from(1337),
            data: Bytes::default(),
        },
    ];

    let nonce = account.nonce().await?;
    let call_data = account.encode_calls(&calls)?;
    let (max_fee, max_priority) = fee_estimate(&provider).await?;

    let mut op = UserOperation {
        sender: account.address(),
        nonce,
        call_data,
        max_fee_per_gas: max_fee,
        max_priority_fee_per_gas: max_priority,
        // gas limits start at zero; the bundler estimate fills them in
        signature: account.stub_signature()?,
        ..Default::default()
    };

    let bundler_url = args
        .bundler
        .clone()
        .unwrap_or_else(|| args.common.network.bundler_url().to_string());
    let bundler = BundlerClient::new(bundler_url);

    let est = bundler
        .estimate_user_operation_gas(&op, entry_point)
        .await
        .context("bundler gas estimate failed")?;
    op.call_gas_limit = est.call_gas_limit;
    op.verification_gas_limit = est.verification_gas_limit;
    op.pre_verification_gas = est.pre_verification_gas;

    op.signature = match args.signer.as_deref() {
        Some(key) => {
            // Session-key path: the delegated account also accepts
            // signatures from a registered session key.
            let session = parse_wallet(key, chain_id).context("invalid session signer key")?;
            let hash = op.hash(entry_point, chain_id);
            let signature = session
                .sign_message(hash.as_bytes())
                .await
                .context("session signer failed to sign user operation")?;
            Bytes::from(signature.to_vec())
        }
        None => account.sign_user_operation(&op).await?,
    };

    println!("User operation:\n{}", serde_json::to_string_pretty(&op)?);

    if args.dry_run {
        println!("--dry-run set: not sending user operation.");
        return Ok(());
    }

    let user_op_hash = bundler
        .send_user_operation(&op, entry_point)
        .await
        .context("bundler send failed")?;
    println!("userOpHash: {}", encoding::fmt_h256(user_op_hash));

    let receipt = bundler
        .wait_user_operation_receipt(user_op_hash, Duration::from_secs(args.max_wait_seconds))
        .await
        .context("failed waiting for userOp receipt")?;
    println!("UserOp receipt:\n{}", serde_json::to_string_pretty(&receipt)?);

    Ok(())
}

async fn cmd_recover_account(args: RecoverAccountArgs) -> Result<()> {
    let (provider, chain_id) = connect(&args.common).await?;
    let authority = parse_wallet(&args.common.authority_private_key, chain_id)
        .context("invalid authority private key")?;
    let new_owner = parse_address(&args.new_owner).context("invalid new owner address")?;
    let guardian = parse_wallet(&args.guardian_private_key, chain_id)
        .context("invalid guardian private key")?;

    let account = authority.address();
    let client = Arc::new(SignerMiddleware::new(provider.clone(), guardian.clone()));

    println!("Starting recovery of {} for new owner {}", account, new_owner);
    let tx_hash = recovery::start_recovery(client.clone(), account, new_owner).await?;
    println!("startRecovery sent: {}", encoding::fmt_h256(tx_hash));

    let domain = recovery::read_eip712_domain(client.clone(), account).await?;
    let details = recovery::read_recovery_details(client.clone(), account).await?;
    println!(
        "Recovery proposed: executeAfter={} guardiansRequired={}",
        details.execute_after, details.guardians_required
    );

    let typed_data = recovery::recover_typed_data(&domain, &details)?;
    let signature = guardian
        .sign_typed_data(&typed_data)
        .await
        .context("guardian failed to sign recovery message")?;

    if args.common.network == Network::Anvil {
        // Testing affordance: fast-forward past the recovery delay.
        recovery::mine_blocks(&provider, args.recovery_period).await?;
        println!("Mined {} blocks", args.recovery_period);
    } else {
        tracing::warn!(
            network = ?args.common.network,
            "skipping block mining; completeRecovery will fail until the recovery period elapses"
        );
    }

    let tx_hash =
        recovery::complete_recovery(client, account, vec![Bytes::from(signature.to_vec())])
            .await?;
    println!("completeRecovery sent: {}", encoding::fmt_h256(tx_hash));

    Ok(())
}

fn cmd_encode_handle_ops() -> Result<()> {
    // A captured executeBatch of two value transfers (alice 4242, bob 1337).
    let call_data = Bytes::from_str(
        "0x47e1da2a000000000000000000000000000000000000000000000000000000000000006000000000000000000000000000000000000000000000000000000000000000c000000000000000000000000000000000000000000000000000000000000001200000000000000000000000000000000000000000000000000000000000000002000000000000000000000000f39fd6e51aad88f6f4ce6ab8827279cfffb92266000000000000000000000000a0ee7a142d267c1f36714e4a8f75612f20a7972000000000000000000000000000000000000000000000000000000000000000020000000000000000000000000000000000000000000000000000000000001092000000000000000000000000000000000000000000000000000000000000053900000000000000000000000000000000000000000000000000000000000000020000000000000000000000000000000000000000000000000000000000000040000000000000000000000000000000000000000000000000000000000000006000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000",
    )?;

    let op = UserOperation {
        sender: parse_address("0x70997970C51812dc3A010C7d01b50e0d17dc79C8")?,
        nonce: U256::from(2),
        call_data,
        call_gas_limit: U256::one() << 72,
        verification_gas_limit: U256::zero(),
        pre_verification_gas: U256::from(424_242_424u64),
        max_fee_per_gas: U256::from(0x10000000u64),
        max_priority_fee_per_gas: U256::zero(),
        signature: Bytes::from_str(account::STUB_SIGNATURE)?,
        ..Default::default()
    };

    let encoded = userop::encode_handle_ops(std::slice::from_ref(&op), parse_address(ALICE)?)?;
    println!("0x{}", hex::encode(&encoded));

    Ok(())
}

async fn connect(common: &CommonArgs) -> Result<(Provider<Http>, u64)> {
    let url = common
        .rpc
        .clone()
        .unwrap_or_else(|| common.network.rpc_url().to_string());
    let provider =
        Provider::<Http>::try_from(url.as_str())?.interval(Duration::from_millis(350));

    let chain_id = provider.get_chainid().await?.as_u64();
    if chain_id != common.network.chain_id() {
        return Err(anyhow!(
            "chainId mismatch: {:?} expects {}, RPC returned {}",
            common.network,
            common.network.chain_id(),
            chain_id
        ));
    }

    Ok((provider, chain_id))
}

/// Fee data (fallback to gas price for providers without EIP-1559 helpers).
async fn fee_estimate(provider: &Provider<Http>) -> Result<(U256, U256)> {
    match provider.estimate_eip1559_fees(None).await {
        Ok((max_fee, max_priority)) => Ok((max_fee, max_priority)),
        Err(_) => {
            let gas_price = provider
                .get_gas_price()
                .await
                .context("failed to fetch gas price")?;
            Ok((gas_price, gas_price))
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn initialize_account_calldata(
    implementation: Address,
    entry_point: Address,
    recovery_period: u64,
    security_period: u64,
    security_window: u64,
    lock_period: u64,
    guardian: Address,
) -> Result<Bytes> {
    let abi = AbiParser::default().parse(&[
        "function initializeAccount(address _implementation, address _entrypoint, uint256 _recoveryPeriod, uint256 _securityPeriod, uint256 _securityWindow, uint256 _lockPeriod, address _initialGuardian)",
    ])?;
    let data = abi.function("initializeAccount")?.encode_input(&[
        Token::Address(implementation),
        Token::Address(entry_point),
        Token::Uint(recovery_period.into()),
        Token::Uint(security_period.into()),
        Token::Uint(security_window.into()),
        Token::Uint(lock_period.into()),
        Token::Address(guardian),
    ])?;
    Ok(data.into())
}
