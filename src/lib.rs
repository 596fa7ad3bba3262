//! # Chart Sandbox
//!
//! Hosts untrusted chart code behind a safety boundary: a V8 isolate running
//! the chart compiler/renderer bundle, and a wasm rasterizer turning its SVG
//! into PNG.
//!
//! ## Security Guarantees
//!
//! - **No ambient I/O**: guest script has no fs, net, env or process access
//! - **Policy-gated data**: every data reference passes a [`LoaderPolicy`]
//!   (`sanitize` then `load`); the default policy denies everything
//! - **Bundle-only imports**: guest modules import nothing outside the bundle
//! - **Fault containment**: a guest crash seals that guest; later calls fail
//!   with [`Error::Sealed`] instead of touching it again
//! - **Budgets**: script heap size and per-evaluation time are bounded
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chart_sandbox::{Converter, ConverterConfig, NetworkConfig, NetworkPolicy, PngOptions};
//! use std::sync::Arc;
//!
//! let loader = NetworkPolicy::new(NetworkConfig {
//!     base_url: Some("https://cdn.example.com/datasets/".into()),
//!     allowed_domains: vec!["cdn.example.com".into()],
//! })?;
//!
//! let mut converter = Converter::new(ConverterConfig {
//!     bundle_dir: "./modules".into(),
//!     loader: Some(Arc::new(loader)),
//!     raster_module: Some(std::fs::read("resvg.wasm")?),
//!     ..Default::default()
//! })?;
//!
//! let svg = converter.vega_lite_to_svg(spec)?;
//! let png = converter.svg_to_png(&svg, &PngOptions { scale: 2.0 })?;
//! converter.close()?;
//! ```

mod converter;
mod error;
mod fetch;
mod health;
mod loader;
mod modules;
mod ops;
mod policy;
mod raster;
mod runtime;
mod script;

pub use converter::{Converter, ConverterConfig, PngOptions};
pub use error::{Error, SanitizeError};
pub use fetch::{NetworkConfig, NetworkPolicy};
pub use health::RuntimeHealth;
pub use modules::{available_versions, ModuleBundle, ModuleSource, VersionInfo};
pub use ops::TextMeasurer;
pub use policy::{
    sanitize_and_load, DenyPolicy, FallbackPolicy, FilePolicy, LoaderPolicy, Releasable,
    SanitizedUri, StaticPolicy,
};
pub use raster::RasterModule;
pub use runtime::Timezone;
pub use script::template_literal;
