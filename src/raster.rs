//! Guest memory bridge for the wasm rasterizer.
//!
//! The guest only understands `(ptr, len)` pairs into its own linear memory.
//! Every payload follows the same protocol: `alloc_mem`, write, call,
//! `dealloc_mem`, then read the status. A negative status means the message
//! is in the error region; otherwise the output is in the result region. Both
//! regions are copied out before the next guest call.

use wasmtime::{Engine, Linker, Memory, Module, Store, TypedFunc};

use crate::error::Error;
use crate::health::RuntimeHealth;

const MEMORY_EXPORT: &str = "memory";
const START_EXPORT: &str = "_initialize";

/// Typed handles to every export the bridge calls.
struct Exports {
    alloc: TypedFunc<u32, u32>,
    dealloc: TypedFunc<(u32, u32), ()>,
    init: TypedFunc<(), ()>,
    add_asset: TypedFunc<(u32, u32), i32>,
    render: TypedFunc<(u32, u32, u64), i32>,
    result_ptr: TypedFunc<(), u32>,
    result_len: TypedFunc<(), u32>,
    error_ptr: TypedFunc<(), u32>,
    error_len: TypedFunc<(), u32>,
}

struct RasterInstance {
    store: Store<()>,
    memory: Memory,
    exports: Exports,
}

/// An exclusively owned rasterizer instance. One call at a time.
pub struct RasterModule {
    inner: Option<RasterInstance>,
    health: RuntimeHealth,
}

impl RasterModule {
    /// Compile and instantiate `wasm`, run its init export, then register
    /// each asset. A failed asset registration is logged and skipped.
    pub fn new(wasm: &[u8], assets: &[Vec<u8>]) -> Result<Self, Error> {
        let engine = Engine::default();
        let module = Module::new(&engine, wasm)
            .map_err(|e| Error::Construction(format!("compiling raster module: {}", e)))?;

        let mut store = Store::new(&engine, ());
        let mut linker = Linker::new(&engine);
        // The rasterizer gets no host functions; any import traps when called.
        linker
            .define_unknown_imports_as_traps(&module)
            .map_err(|e| Error::Construction(format!("linking raster module: {}", e)))?;
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| Error::Construction(format!("instantiating raster module: {}", e)))?;

        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or_else(|| Error::Construction("raster module must export 'memory'".into()))?;

        fn export<P, R>(
            instance: &wasmtime::Instance,
            store: &mut Store<()>,
            name: &str,
        ) -> Result<TypedFunc<P, R>, Error>
        where
            P: wasmtime::WasmParams,
            R: wasmtime::WasmResults,
        {
            instance
                .get_typed_func::<P, R>(&mut *store, name)
                .map_err(|e| Error::Construction(format!("raster export '{}': {}", name, e)))
        }

        let exports = Exports {
            alloc: export(&instance, &mut store, "alloc_mem")?,
            dealloc: export(&instance, &mut store, "dealloc_mem")?,
            init: export(&instance, &mut store, "font_db_init")?,
            add_asset: export(&instance, &mut store, "font_db_add")?,
            render: export(&instance, &mut store, "render")?,
            result_ptr: export(&instance, &mut store, "result_ptr")?,
            result_len: export(&instance, &mut store, "result_len")?,
            error_ptr: export(&instance, &mut store, "error_ptr")?,
            error_len: export(&instance, &mut store, "error_len")?,
        };

        // Reactor-style modules need their start export run first.
        if let Ok(start) = instance.get_typed_func::<(), ()>(&mut store, START_EXPORT) {
            start
                .call(&mut store, ())
                .map_err(|e| Error::Construction(format!("{}: {}", START_EXPORT, e)))?;
        }
        exports
            .init
            .call(&mut store, ())
            .map_err(|e| Error::Construction(format!("raster init: {}", e)))?;

        let mut raster = Self {
            inner: Some(RasterInstance {
                store,
                memory,
                exports,
            }),
            health: RuntimeHealth::Healthy,
        };

        for (index, asset) in assets.iter().enumerate() {
            match raster.register_asset(asset) {
                Ok(()) => tracing::debug!(index, bytes = asset.len(), "registered raster asset"),
                Err(e @ Error::GuestFault(_)) => return Err(e),
                Err(e) => tracing::warn!(index, error = %e, "skipping raster asset"),
            }
        }

        tracing::info!(assets = assets.len(), "raster guest ready");
        Ok(raster)
    }

    /// Register one asset (a font) with the guest.
    pub fn register_asset(&mut self, data: &[u8]) -> Result<(), Error> {
        self.guarded(|guest| {
            let status = guest.with_input(data, |guest, ptr, len| {
                guest
                    .exports
                    .add_asset
                    .call(&mut guest.store, (ptr, len))
                    .map_err(|e| trap("font_db_add", e))
            })?;
            guest.check_status(status)
        })
    }

    /// Rasterize `svg` at `scale`. The scale crosses the boundary as its raw
    /// bit pattern.
    pub fn render(&mut self, svg: &[u8], scale: f64) -> Result<Vec<u8>, Error> {
        self.guarded(|guest| {
            let status = guest.with_input(svg, |guest, ptr, len| {
                guest
                    .exports
                    .render
                    .call(&mut guest.store, (ptr, len, scale.to_bits()))
                    .map_err(|e| trap("render", e))
            })?;
            guest.check_status(status)?;
            guest.read_result()
        })
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    /// Release the guest instance. Idempotent.
    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            tracing::info!("raster guest released");
        }
    }

    fn guarded<T>(
        &mut self,
        call: impl FnOnce(&mut RasterInstance) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.health.ensure_healthy()?;
        let guest = self.inner.as_mut().ok_or(Error::Sealed)?;

        match call(guest) {
            Err(Error::GuestFault(fault)) => {
                tracing::error!(%fault, "raster guest trapped; sealing module");
                self.health.seal();
                // The trapped instance is discarded without another call into it.
                self.inner = None;
                Err(Error::GuestFault(fault))
            }
            other => other,
        }
    }
}

impl Drop for RasterModule {
    fn drop(&mut self) {
        self.close();
    }
}

fn trap(export: &str, e: wasmtime::Error) -> Error {
    Error::GuestFault(format!("{} trapped: {}", export, e))
}

impl RasterInstance {
    /// Copy `data` into a fresh guest buffer, run `call` with it, and free the
    /// buffer whatever `call` returned. Empty input is passed as `(0, 0)`
    /// without an allocation.
    fn with_input<T>(
        &mut self,
        data: &[u8],
        call: impl FnOnce(&mut Self, u32, u32) -> Result<T, Error>,
    ) -> Result<T, Error> {
        if data.is_empty() {
            return call(self, 0, 0);
        }

        let len = u32::try_from(data.len()).map_err(|_| Error::Bounds {
            what: "input buffer",
            ptr: 0,
            len: data.len(),
        })?;
        let ptr = self
            .exports
            .alloc
            .call(&mut self.store, len)
            .map_err(|e| trap("alloc_mem", e))?;

        let result = match self.memory.write(&mut self.store, ptr as usize, data) {
            Ok(()) => call(self, ptr, len),
            Err(_) => Err(Error::Bounds {
                what: "input buffer",
                ptr,
                len: data.len(),
            }),
        };

        // A trapped instance is abandoned whole, buffer included.
        if matches!(result, Err(Error::GuestFault(_))) {
            return result;
        }

        self.exports
            .dealloc
            .call(&mut self.store, (ptr, len))
            .map_err(|e| trap("dealloc_mem", e))?;
        result
    }

    fn check_status(&mut self, status: i32) -> Result<(), Error> {
        if status >= 0 {
            return Ok(());
        }

        let ptr = self
            .exports
            .error_ptr
            .call(&mut self.store, ())
            .map_err(|e| trap("error_ptr", e))?;
        let len = self
            .exports
            .error_len
            .call(&mut self.store, ())
            .map_err(|e| trap("error_len", e))?;

        let message = if len == 0 {
            "unknown error".to_string()
        } else {
            String::from_utf8_lossy(&self.read_region("error region", ptr, len)?).into_owned()
        };
        Err(Error::Guest(message))
    }

    fn read_result(&mut self) -> Result<Vec<u8>, Error> {
        let ptr = self
            .exports
            .result_ptr
            .call(&mut self.store, ())
            .map_err(|e| trap("result_ptr", e))?;
        let len = self
            .exports
            .result_len
            .call(&mut self.store, ())
            .map_err(|e| trap("result_len", e))?;

        if len == 0 {
            return Err(Error::Guest("empty result".into()));
        }
        self.read_region("result region", ptr, len)
    }

    /// Copy `[ptr, ptr + len)` out of guest memory.
    fn read_region(&self, what: &'static str, ptr: u32, len: u32) -> Result<Vec<u8>, Error> {
        let bounds = || Error::Bounds {
            what,
            ptr,
            len: len as usize,
        };
        let start = ptr as usize;
        let end = start.checked_add(len as usize).ok_or_else(bounds)?;
        self.memory
            .data(&self.store)
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(bounds)
    }
}
