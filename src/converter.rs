//! Public entry point: chart specs in, SVG/PNG out.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::health::RuntimeHealth;
use crate::modules::{ModuleBundle, BRIDGE_MODULE};
use crate::ops::{HostCapabilities, TextMeasurer};
use crate::policy::{DenyPolicy, LoaderPolicy};
use crate::raster::RasterModule;
use crate::runtime::{DenoEngine, EngineOptions, Timezone};
use crate::script::{bridge_call, template_literal, ScriptHost};

/// Configuration for a [`Converter`]
pub struct ConverterConfig {
    /// Directory holding `versions.json` and one sub-directory per version
    pub bundle_dir: PathBuf,
    /// Version key from `versions.json` (None = index default)
    pub version: Option<String>,
    /// Resource policy for data the charts reference (None = every load
    /// fails with `CapabilityNotConfigured`)
    pub loader: Option<Arc<dyn LoaderPolicy>>,
    /// Maximum script heap size in bytes (None = unlimited)
    pub max_heap_size: Option<usize>,
    /// Per-evaluation time budget, also the deadline for each resource load
    pub timeout: Option<Duration>,
    /// Expose `__chart_measure_text` backed by `text_measurer`
    pub text_measurement: bool,
    pub text_measurer: Option<Arc<dyn TextMeasurer>>,
    /// Theme JSON passed to every render call
    pub theme: Option<String>,
    pub timezone: Timezone,
    /// Rasterizer wasm bytes (None = PNG output unavailable)
    pub raster_module: Option<Vec<u8>>,
    /// Font files registered with the rasterizer
    pub fonts: Vec<Vec<u8>>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            bundle_dir: PathBuf::from("./modules"),
            version: None,
            loader: Some(Arc::new(DenyPolicy)),
            max_heap_size: Some(64 * 1024 * 1024), // 64MB default
            timeout: Some(Duration::from_secs(30)),
            text_measurement: true,
            text_measurer: None,
            theme: None,
            timezone: Timezone::Utc,
            raster_module: None,
            fonts: Vec::new(),
        }
    }
}

/// Options for PNG output
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PngOptions {
    /// Device pixel ratio applied by the rasterizer
    pub scale: f64,
}

impl Default for PngOptions {
    fn default() -> Self {
        Self { scale: 1.0 }
    }
}

/// Rasterizer created on first PNG request.
enum RasterSlot {
    Pending { wasm: Vec<u8>, fonts: Vec<Vec<u8>> },
    Ready(RasterModule),
    /// Construction failed; the message is returned on every later request.
    Failed(String),
    Unavailable,
}

/// Converts Vega and Vega-Lite specifications to SVG and PNG.
///
/// Owns one script guest and, once PNG output is requested, one raster
/// guest. Not shareable across threads; use one converter per caller.
///
/// Every method blocks. Create and call it from outside any tokio runtime
/// (a plain thread or `spawn_blocking`); inside one, construction and calls
/// fail with [`Error::Construction`].
pub struct Converter {
    script: ScriptHost<DenoEngine>,
    raster: RasterSlot,
    loader: Option<Arc<dyn LoaderPolicy>>,
    theme: Option<String>,
    version: String,
    closed: bool,
}

impl Converter {
    /// Load the configured bundle version from disk and start the guest.
    pub fn new(config: ConverterConfig) -> Result<Self, Error> {
        let bundle = ModuleBundle::from_dir(&config.bundle_dir, config.version.as_deref())?;
        Self::from_bundle(&bundle, config)
    }

    /// Start the guest with an already loaded bundle. `bundle_dir` and
    /// `version` in `config` are ignored.
    pub fn from_bundle(bundle: &ModuleBundle, config: ConverterConfig) -> Result<Self, Error> {
        if !bundle.contains(BRIDGE_MODULE) {
            return Err(Error::Construction(format!(
                "bundle {} has no '{}' module",
                bundle.version(),
                BRIDGE_MODULE
            )));
        }

        let capabilities = HostCapabilities {
            loader: config.loader.clone(),
            text_measurer: config
                .text_measurer
                .filter(|_| config.text_measurement),
            load_timeout: config.timeout,
        };

        let engine = DenoEngine::new(
            EngineOptions {
                max_heap_size: config.max_heap_size,
                timeout: config.timeout,
                timezone: config.timezone,
                capabilities,
            },
            bundle,
        )?;
        let mut script = ScriptHost::new(engine);
        script.register_bundle(bundle)?;

        let raster = match config.raster_module {
            Some(wasm) => RasterSlot::Pending {
                wasm,
                fonts: config.fonts,
            },
            None => RasterSlot::Unavailable,
        };

        tracing::info!(
            version = bundle.version(),
            modules = bundle.modules().len(),
            "converter ready"
        );

        Ok(Self {
            script,
            raster,
            loader: config.loader,
            theme: config.theme,
            version: bundle.version().to_string(),
            closed: false,
        })
    }

    /// Bundle version this converter runs.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Health of the script guest.
    pub fn health(&self) -> RuntimeHealth {
        self.script.health()
    }

    pub fn vega_to_svg(&mut self, spec: &str) -> Result<String, Error> {
        self.render_svg("vegaToSvg", spec)
    }

    pub fn vega_lite_to_svg(&mut self, spec: &str) -> Result<String, Error> {
        self.render_svg("vegaLiteToSvg", spec)
    }

    /// Compile a Vega-Lite spec to Vega JSON.
    pub fn vega_lite_to_vega(&mut self, spec: &str) -> Result<String, Error> {
        let script = bridge_call("vegaLiteToVega", &[template_literal(spec)]);
        self.script.eval(&script)
    }

    pub fn vega_to_png(&mut self, spec: &str, options: &PngOptions) -> Result<Vec<u8>, Error> {
        let svg = self.vega_to_svg(spec)?;
        self.svg_to_png(&svg, options)
    }

    pub fn vega_lite_to_png(&mut self, spec: &str, options: &PngOptions) -> Result<Vec<u8>, Error> {
        let svg = self.vega_lite_to_svg(spec)?;
        self.svg_to_png(&svg, options)
    }

    pub fn svg_to_png(&mut self, svg: &str, options: &PngOptions) -> Result<Vec<u8>, Error> {
        self.raster()?.render(svg.as_bytes(), options.scale)
    }

    /// Release both guests and the loader's OS resources. Idempotent; after
    /// a fault the faulted guest is skipped but everything else is released.
    /// Returns the first error encountered.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let RasterSlot::Ready(raster) = &mut self.raster {
            raster.close();
        }
        self.raster = RasterSlot::Unavailable;
        self.script.close();

        let released = match self.loader.take() {
            Some(loader) => match loader.releasable() {
                Some(releasable) => releasable.close(),
                None => Ok(()),
            },
            None => Ok(()),
        };
        tracing::info!(version = %self.version, "converter closed");
        released
    }

    fn render_svg(&mut self, function: &str, spec: &str) -> Result<String, Error> {
        let theme = self
            .theme
            .as_deref()
            .map(template_literal)
            .unwrap_or_else(|| "undefined".to_string());
        let script = bridge_call(function, &[template_literal(spec), theme]);
        self.script.eval(&script)
    }

    fn raster(&mut self) -> Result<&mut RasterModule, Error> {
        if self.closed {
            return Err(Error::Sealed);
        }

        if let RasterSlot::Pending { wasm, fonts } = &self.raster {
            self.raster = match RasterModule::new(wasm, fonts) {
                Ok(raster) => RasterSlot::Ready(raster),
                Err(e) => {
                    tracing::warn!(error = %e, "rasterizer failed to start");
                    RasterSlot::Failed(e.to_string())
                }
            };
        }

        match &mut self.raster {
            RasterSlot::Ready(raster) => Ok(raster),
            RasterSlot::Failed(reason) => Err(Error::Construction(reason.clone())),
            RasterSlot::Pending { .. } | RasterSlot::Unavailable => {
                Err(Error::CapabilityNotConfigured("rasterizer"))
            }
        }
    }
}

impl Drop for Converter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "converter teardown failed");
        }
    }
}
