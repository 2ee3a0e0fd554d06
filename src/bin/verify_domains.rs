//! Checks every configured token's EIP-712 domain against the contract's
//! `DOMAIN_SEPARATOR()` on its chain.
//!
//! Run after changing token configuration and before deploying it. Exits non-zero if any
//! separator differs, since every signature built from that configuration would be rejected
//! on-chain, and also if any token could not be checked.

use dotenvy::dotenv;
use std::process::ExitCode;

use gasless_relay::chain::ChainRegistry;
use gasless_relay::config::RelayConfig;
use gasless_relay::domain::{DomainResolver, verify_all};
use gasless_relay::from_env::SignerType;
use gasless_relay::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    dotenv().ok();
    let _telemetry = Telemetry::new().with_name("verify-domains").register()?;

    let config = RelayConfig::from_env()?;
    let signer = SignerType::from_env()?.make_evm_signer()?;
    let chains = ChainRegistry::from_config(&config, signer).await?;
    let resolver = DomainResolver::from_config(&config);

    let report = verify_all(&resolver, &chains).await;
    tracing::info!(
        verified = report.verified,
        failed = report.failed,
        unreachable = report.unreachable,
        "domain verification finished"
    );
    if report.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
