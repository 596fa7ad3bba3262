//! Native functions exposed to guest script.
//!
//! Every capability is registered before the first guest module is loaded.
//! A capability left unconfigured still has its op; calling it fails with
//! `CapabilityNotConfigured` instead of crashing the guest.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use deno_core::{error::AnyError, op2, OpState};

use crate::error::Error;
use crate::policy::{sanitize_and_load, LoaderPolicy};

/// Measures text width for a CSS font descriptor such as `"bold 12px Arial"`.
pub trait TextMeasurer: Send + Sync {
    fn measure_text(&self, text: &str, font: &str) -> f64;
}

impl<F> TextMeasurer for F
where
    F: Fn(&str, &str) -> f64 + Send + Sync,
{
    fn measure_text(&self, text: &str, font: &str) -> f64 {
        self(text, font)
    }
}

/// Host functions bound for one script guest. Stored in the op state.
#[derive(Clone, Default)]
pub struct HostCapabilities {
    pub loader: Option<Arc<dyn LoaderPolicy>>,
    pub text_measurer: Option<Arc<dyn TextMeasurer>>,
    /// Deadline attached to each resource load.
    pub load_timeout: Option<Duration>,
}

impl HostCapabilities {
    fn loader(&self) -> Result<Arc<dyn LoaderPolicy>, Error> {
        self.loader
            .clone()
            .ok_or(Error::CapabilityNotConfigured("resource loader"))
    }
}

// ============================================================================
// Console Ops
// ============================================================================

#[op2(fast)]
pub fn op_console_log(#[string] msg: &str) {
    tracing::info!(target: "chart_sandbox::guest", "{}", msg);
}

#[op2(fast)]
pub fn op_console_warn(#[string] msg: &str) {
    tracing::warn!(target: "chart_sandbox::guest", "{}", msg);
}

#[op2(fast)]
pub fn op_console_error(#[string] msg: &str) {
    tracing::error!(target: "chart_sandbox::guest", "{}", msg);
}

// ============================================================================
// Resource Ops
// ============================================================================

/// Sanitize then load, bounded by the load deadline. The returned promise is
/// driven by the guest's own event loop on the calling thread, so the guest
/// is never re-entered from elsewhere while the load is outstanding.
#[op2(async)]
#[string]
pub async fn op_chart_load(
    state: Rc<RefCell<OpState>>,
    #[string] uri: String,
) -> Result<String, AnyError> {
    let caps = state.borrow().borrow::<HostCapabilities>().clone();
    let loader = caps.loader()?;

    let load = sanitize_and_load(loader.as_ref(), &uri);
    let data = match caps.load_timeout {
        Some(limit) => match tokio::time::timeout(limit, load).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(%uri, ?limit, "resource load deadline exceeded");
                return Err(Error::transport(uri.as_str(), "deadline exceeded").into());
            }
        },
        None => load.await?,
    };

    Ok(String::from_utf8_lossy(&data).into_owned())
}

#[op2]
#[string]
pub fn op_chart_sanitize(state: &mut OpState, #[string] uri: String) -> Result<String, AnyError> {
    let loader = state.borrow::<HostCapabilities>().loader()?;
    let vetted = loader.sanitize(&uri).map_err(Error::from)?;
    Ok(vetted.as_str().to_string())
}

// ============================================================================
// Text Ops
// ============================================================================

#[op2(fast)]
pub fn op_chart_measure_text(
    state: &mut OpState,
    #[string] text: String,
    #[string] font: String,
) -> Result<f64, AnyError> {
    let measurer = state
        .borrow::<HostCapabilities>()
        .text_measurer
        .clone()
        .ok_or(Error::CapabilityNotConfigured("text measurer"))?;
    Ok(measurer.measure_text(&text, &font))
}

// ============================================================================
// Extension Definition
// ============================================================================

deno_core::extension!(
    chart_bridge,
    ops = [
        op_console_log,
        op_console_warn,
        op_console_error,
        op_chart_load,
        op_chart_sanitize,
        op_chart_measure_text,
    ],
    esm_entry_point = "ext:chart_bridge/bootstrap.js",
    esm = ["ext:chart_bridge/bootstrap.js" = "src/bootstrap.js"],
);
