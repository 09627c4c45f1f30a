pub mod classify;
pub mod law_change;
pub mod ledger;

use std::sync::Arc;

use csp_gateway::GatewayConfig;
use csp_ledger::{HmacKeyring, Verifier};

/// Build an HMAC verifier from a secret held in an environment variable.
/// The key id comes from `signing_key_id` in the configuration.
pub fn hmac_verifier(
    config: &GatewayConfig,
    secret_env: Option<&str>,
) -> anyhow::Result<Option<Arc<dyn Verifier>>> {
    let var = match secret_env {
        Some(var) => var,
        None => return Ok(None),
    };
    let secret = std::env::var(var)
        .map_err(|_| anyhow::anyhow!("environment variable {} is not set", var))?;
    let key_id = config
        .signing_key_id
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("signing_key_id must be configured to check signatures"))?;
    Ok(Some(Arc::new(HmacKeyring::new(key_id, secret.as_bytes()))))
}
