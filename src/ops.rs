//! Native ops backing the synthetic window.
//!
//! Everything the embedded environment script cannot do in pure JS lands
//! here: console capture, crypto, base64, timers and fetch. The
//! `extension!` block at the bottom ties the ops and the environment script
//! together into the runtime extension the render pipeline loads.

use anyhow::{anyhow, Error};
use deno_core::{op2, OpState};

use crate::fetch::op_fetch;

/// Console output captured from the synthetic window.
///
/// Nothing is printed while the application runs; the pipeline drains this
/// after the render and re-emits it through `tracing`.
#[derive(Debug, Default, Clone)]
pub struct ConsoleOutput {
    pub logs: Vec<String>,
    pub warns: Vec<String>,
    pub errors: Vec<String>,
}

impl ConsoleOutput {
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty() && self.warns.is_empty() && self.errors.is_empty()
    }
}

#[op2(fast)]
pub fn op_console_log(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.logs.push(msg.to_string());
    }
}

#[op2(fast)]
pub fn op_console_warn(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.warns.push(msg.to_string());
    }
}

#[op2(fast)]
pub fn op_console_error(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.errors.push(msg.to_string());
    }
}

#[op2]
#[string]
pub fn op_crypto_random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[op2(fast)]
pub fn op_crypto_get_random_values(#[buffer] buf: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(buf);
}

fn digest_with<D: sha2::Digest>(data: &[u8]) -> Vec<u8> {
    let mut hasher = D::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

#[op2]
#[buffer]
pub fn op_crypto_subtle_digest(
    #[string] algorithm: &str,
    #[buffer] data: &[u8],
) -> Result<Vec<u8>, Error> {
    match algorithm.to_uppercase().replace('-', "").as_str() {
        "SHA256" => Ok(digest_with::<sha2::Sha256>(data)),
        "SHA384" => Ok(digest_with::<sha2::Sha384>(data)),
        "SHA512" => Ok(digest_with::<sha2::Sha512>(data)),
        other => Err(anyhow!("digest algorithm '{other}' is not available")),
    }
}

#[op2]
#[string]
pub fn op_btoa(#[string] data: &str) -> String {
    use base64::Engine;
    // Browsers define btoa over Latin-1; UTF-8 input is accepted as-is.
    base64::engine::general_purpose::STANDARD.encode(data.as_bytes())
}

#[op2]
#[string]
pub fn op_atob(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| anyhow!("atob: malformed base64: {e}"))?;
    String::from_utf8(bytes).map_err(|e| anyhow!("atob: decoded bytes are not UTF-8: {e}"))
}

/// Backs `setTimeout` in the environment script. The render pipeline's event
/// loop drain waits on pending sleeps, so a long timer delays serialization
/// until the render deadline cuts it off.
#[op2(async)]
pub async fn op_timer_sleep(ms: u32) {
    tokio::time::sleep(std::time::Duration::from_millis(u64::from(ms))).await;
}

deno_core::extension!(
    synthetic_env,
    ops = [
        op_console_log,
        op_console_warn,
        op_console_error,
        op_crypto_random_uuid,
        op_crypto_get_random_values,
        op_crypto_subtle_digest,
        op_btoa,
        op_atob,
        op_timer_sleep,
        op_fetch,
    ],
    esm_entry_point = "ext:synthetic_env/bootstrap.js",
    esm = ["ext:synthetic_env/bootstrap.js" = "src/bootstrap.js"],
);
