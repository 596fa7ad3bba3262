//! Script guest backed by a V8 isolate (deno_core).
//!
//! Provides only what the chart bridge needs:
//! - console.log/warn/error (forwarded to tracing)
//! - `__chart_load`, `__chart_sanitize`, `__chart_measure_text`
//! - timer/clone/performance polyfills
//! - Module loading from the guest bundle only
//! - No fs, net, env, or other system access

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};

use crate::error::Error;
use crate::loader::{guest_specifier, BundleLoader};
use crate::modules::ModuleBundle;
use crate::ops::{chart_bridge, HostCapabilities};
use crate::script::ScriptEngine;

/// How `Date` local-time methods behave inside the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Timezone {
    /// Redirect local-time `Date` methods to their UTC equivalents.
    #[default]
    Utc,
    /// Leave `Date` untouched.
    Host,
}

const UTC_POLYFILL: &str = r#"
Date.prototype.getTimezoneOffset = function () { return 0; };
for (const name of ["FullYear", "Month", "Date", "Day", "Hours", "Minutes", "Seconds", "Milliseconds"]) {
  Date.prototype["get" + name] = Date.prototype["getUTC" + name];
  if (name !== "Day") {
    Date.prototype["set" + name] = Date.prototype["setUTC" + name];
  }
}
"#;

/// Configuration for the script guest
pub struct EngineOptions {
    /// Maximum heap size in bytes (None = unlimited). Exhaustion is a fault.
    pub max_heap_size: Option<usize>,
    /// Maximum time for a single evaluation (None = unlimited)
    pub timeout: Option<Duration>,
    pub timezone: Timezone,
    pub capabilities: HostCapabilities,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_heap_size: Some(64 * 1024 * 1024), // 64MB default
            timeout: Some(Duration::from_secs(30)),
            timezone: Timezone::Utc,
            capabilities: HostCapabilities::default(),
        }
    }
}

pub struct DenoEngine {
    // Dropped before the tokio runtime it was driven on.
    js: JsRuntime,
    loader: Rc<BundleLoader>,
    timeout: Option<Duration>,
    heap_exhausted: Arc<AtomicBool>,
    tokio: tokio::runtime::Runtime,
}

impl DenoEngine {
    /// Create an isolate with every host capability bound. Bundle modules are
    /// served by the returned engine's loader but not yet registered.
    ///
    /// Must be called from a thread outside any tokio runtime: the engine
    /// drives its own event loop with `block_on`.
    pub fn new(options: EngineOptions, bundle: &ModuleBundle) -> Result<Self, Error> {
        ensure_blocking_context()?;

        // The watchdog runs on a worker; the isolate stays on the caller's thread.
        let tokio = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(|e| Error::Construction(format!("failed to start event loop: {}", e)))?;

        let loader = Rc::new(BundleLoader::new(bundle));

        // Configure V8 heap limits if specified
        let create_params = options
            .max_heap_size
            .map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

        let mut js = {
            let _context = tokio.enter();
            JsRuntime::new(RuntimeOptions {
                module_loader: Some(loader.clone()),
                extensions: vec![chart_bridge::init_ops_and_esm()],
                create_params,
                ..Default::default()
            })
        };

        let heap_exhausted = Arc::new(AtomicBool::new(false));
        if options.max_heap_size.is_some() {
            let handle = js.v8_isolate().thread_safe_handle();
            let flag = heap_exhausted.clone();
            js.add_near_heap_limit_callback(move |current, initial| {
                tracing::error!(
                    current_mb = current / (1024 * 1024),
                    initial_mb = initial / (1024 * 1024),
                    "script guest near heap limit"
                );
                flag.store(true, Ordering::SeqCst);
                handle.terminate_execution();
                // Head-room for the termination to unwind instead of aborting.
                current * 2
            });
        }

        js.op_state().borrow_mut().put(options.capabilities);

        if options.timezone == Timezone::Utc {
            js.execute_script("[chart:tz]", UTC_POLYFILL)
                .map_err(|e| Error::Construction(format!("installing UTC polyfill: {}", e)))?;
        }

        Ok(Self {
            js,
            loader,
            timeout: options.timeout,
            heap_exhausted,
            tokio,
        })
    }

    /// Run `work` on the isolate under the time budget, mapping termination
    /// into `Timeout` or `GuestFault`.
    fn with_budget<T>(
        &mut self,
        work: impl FnOnce(&mut JsRuntime, &tokio::runtime::Runtime) -> Result<T, Error>,
    ) -> Result<T, Error> {
        ensure_blocking_context()?;
        let timed_out = Arc::new(AtomicBool::new(false));

        // Spawn a task that will terminate execution after timeout
        let watchdog = self.timeout.map(|limit| {
            let handle = self.js.v8_isolate().thread_safe_handle();
            let flag = timed_out.clone();
            self.tokio.spawn(async move {
                tokio::time::sleep(limit).await;
                flag.store(true, Ordering::SeqCst);
                handle.terminate_execution();
            })
        });

        let result = work(&mut self.js, &self.tokio);

        // Cancel the timeout task if we finished in time. Abort does not stop
        // a task already running, so wait for it before reading the flag.
        if let Some(watchdog) = watchdog {
            watchdog.abort();
            let _ = self.tokio.block_on(watchdog);
        }

        if self.heap_exhausted.load(Ordering::SeqCst) {
            return Err(Error::GuestFault("script heap limit exceeded".into()));
        }

        if timed_out.load(Ordering::SeqCst) {
            // The isolate stays usable; a timeout does not seal.
            self.js.v8_isolate().cancel_terminate_execution();
            if result.is_err() {
                return Err(Error::Timeout(self.timeout.unwrap_or_default()));
            }
        }

        result
    }
}

/// `block_on` panics inside a tokio runtime; report that as a host defect
/// instead of letting it surface as a guest fault.
fn ensure_blocking_context() -> Result<(), Error> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(Error::Construction(
            "script guest must be driven from outside a tokio runtime \
             (use spawn_blocking or a dedicated thread)"
                .into(),
        ));
    }
    Ok(())
}

fn guest_error(e: anyhow::Error) -> Error {
    Error::Guest(e.to_string())
}

impl ScriptEngine for DenoEngine {
    fn load_module(&mut self, name: &str, source: &str) -> Result<(), Error> {
        let specifier = guest_specifier(name).map_err(|e| Error::Construction(e.to_string()))?;
        let source = source.to_string();
        let loader = self.loader.clone();

        self.with_budget(|js, tokio| {
            tokio.block_on(async {
                let id = js
                    .load_side_es_module_from_code(&specifier, source)
                    .await
                    .map_err(guest_error)?;
                loader.mark_registered(name);
                let evaluation = Box::pin(js.mod_evaluate(id));
                js.with_event_loop_future(evaluation, PollEventLoopOptions::default())
                    .await
                    .map_err(guest_error)
            })
        })
    }

    fn eval(&mut self, source: &str) -> Result<String, Error> {
        let source = source.to_string();
        self.with_budget(|js, tokio| tokio.block_on(evaluate(js, source)))
    }
}

async fn evaluate(runtime: &mut JsRuntime, source: String) -> Result<String, Error> {
    let result = runtime
        .execute_script("[chart:eval]", source)
        .map_err(guest_error)?;

    // Run event loop to settle loads and dynamic imports
    runtime
        .run_event_loop(PollEventLoopOptions::default())
        .await
        .map_err(guest_error)?;

    let scope = &mut runtime.handle_scope();
    let local = v8::Local::new(scope, &result);

    if let Ok(promise) = v8::Local::<v8::Promise>::try_from(local) {
        match promise.state() {
            v8::PromiseState::Fulfilled => {
                let value = promise.result(scope);
                Ok(value.to_rust_string_lossy(scope))
            }
            v8::PromiseState::Rejected => {
                let exception = promise.result(scope);
                Err(Error::Guest(exception.to_rust_string_lossy(scope)))
            }
            v8::PromiseState::Pending => Err(Error::Guest(
                "evaluation returned an unresolved promise".into(),
            )),
        }
    } else {
        Ok(local.to_rust_string_lossy(scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::ModuleSource;
    use crate::error::SanitizeError;
    use crate::policy::{LoaderPolicy, SanitizedUri, StaticPolicy};
    use crate::script::{bridge_call, template_literal, ScriptHost};
    use async_trait::async_trait;

    /// Accepts every URI and never answers within a test's patience.
    struct Stalled;

    #[async_trait]
    impl LoaderPolicy for Stalled {
        fn sanitize(&self, uri: &str) -> Result<SanitizedUri, SanitizeError> {
            Ok(SanitizedUri::new(uri))
        }

        async fn load(&self, _uri: &SanitizedUri) -> Result<Vec<u8>, Error> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(b"too late".to_vec())
        }
    }

    fn bundle() -> ModuleBundle {
        ModuleBundle::from_sources(
            "test",
            vec![
                ModuleSource::new("util", "export const shout = (s) => s.toUpperCase();", &[]),
                ModuleSource::new(
                    "bridge",
                    r#"
                    import { shout } from "util";
                    export function vegaToSvg(spec, theme) {
                      return "<svg>" + shout(JSON.parse(spec).mark) + (theme ?? "") + "</svg>";
                    }
                    export async function fetchData(uri) {
                      return await __chart_load(uri);
                    }
                    export function measure(text) {
                      return __chart_measure_text(text, "12px sans-serif");
                    }
                    "#,
                    &["util"],
                ),
            ],
        )
        .unwrap()
    }

    fn host(options: EngineOptions) -> ScriptHost<DenoEngine> {
        let bundle = bundle();
        let engine = DenoEngine::new(options, &bundle).unwrap();
        let mut host = ScriptHost::new(engine);
        host.register_bundle(&bundle).unwrap();
        host
    }

    #[test]
    fn test_bridge_render() {
        let mut host = host(EngineOptions::default());
        let script = bridge_call(
            "vegaToSvg",
            &[template_literal(r#"{"mark":"bar"}"#), "undefined".into()],
        );
        assert_eq!(host.eval(&script).unwrap(), "<svg>BAR</svg>");
    }

    #[test]
    fn test_script_exception_is_guest_error() {
        let mut host = host(EngineOptions::default());
        let script = bridge_call("vegaToSvg", &[template_literal("not json"), "undefined".into()]);
        assert!(matches!(host.eval(&script), Err(Error::Guest(_))));
        // Still healthy afterwards.
        assert_eq!(host.eval("'ok'").unwrap(), "ok");
    }

    #[test]
    fn test_load_resolves_inline() {
        let mut host = host(EngineOptions {
            capabilities: HostCapabilities {
                loader: Some(Arc::new(StaticPolicy::new(serde_json::json!([1, 2])))),
                ..Default::default()
            },
            ..Default::default()
        });
        let script = bridge_call("fetchData", &[template_literal("data/values.json")]);
        assert_eq!(host.eval(&script).unwrap(), "[1,2]");
    }

    #[test]
    fn test_unconfigured_capabilities_reject() {
        let mut host = host(EngineOptions::default());

        let load = bridge_call("fetchData", &[template_literal("x.json")]);
        match host.eval(&load) {
            Err(Error::Guest(msg)) => assert!(msg.contains("capability not configured")),
            other => panic!("expected rejection, got {other:?}"),
        }

        let measure = bridge_call("measure", &[template_literal("abc")]);
        match host.eval(&measure) {
            Err(Error::Guest(msg)) => assert!(msg.contains("text measurer")),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(!host.health().is_sealed());
    }

    #[test]
    fn test_measure_text() {
        let mut host = host(EngineOptions {
            capabilities: HostCapabilities {
                text_measurer: Some(Arc::new(|text: &str, _: &str| text.len() as f64 * 2.5)),
                ..Default::default()
            },
            ..Default::default()
        });
        let script = bridge_call("measure", &[template_literal("abcd")]);
        assert_eq!(host.eval(&script).unwrap(), "10");
    }

    #[test]
    fn test_timeout_does_not_seal() {
        let mut host = host(EngineOptions {
            timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        assert!(matches!(host.eval("while (true) {}"), Err(Error::Timeout(_))));
        assert!(!host.health().is_sealed());
        assert_eq!(host.eval("1 + 1").unwrap(), "2");
    }

    #[test]
    fn test_utc_polyfill() {
        let mut host = host(EngineOptions::default());
        let hours = host
            .eval("new Date(Date.UTC(2024, 0, 1, 5)).getHours()")
            .unwrap();
        assert_eq!(hours, "5");
        assert_eq!(host.eval("new Date().getTimezoneOffset()").unwrap(), "0");
    }

    #[test]
    fn test_undeclared_import_fails_registration() {
        let bundle = ModuleBundle::from_sources(
            "test",
            vec![
                ModuleSource::new("bridge", "import 'util'; export const x = 1;", &[]),
                ModuleSource::new("util", "export const y = 2;", &[]),
            ],
        )
        .unwrap();
        let engine = DenoEngine::new(EngineOptions::default(), &bundle).unwrap();
        let mut host = ScriptHost::new(engine);
        assert!(matches!(
            host.register_bundle(&bundle),
            Err(Error::Construction(_))
        ));
    }

    #[test]
    fn test_load_deadline_rejects_promise() {
        let mut host = host(EngineOptions {
            capabilities: HostCapabilities {
                loader: Some(Arc::new(Stalled)),
                load_timeout: Some(Duration::from_millis(100)),
                ..Default::default()
            },
            ..Default::default()
        });
        let script = bridge_call("fetchData", &[template_literal("slow.json")]);
        match host.eval(&script) {
            Err(Error::Guest(msg)) => assert!(msg.contains("deadline exceeded"), "{msg}"),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(!host.health().is_sealed());
        assert_eq!(host.eval("1 + 1").unwrap(), "2");
    }

    #[test]
    fn test_heap_exhaustion_seals() {
        let mut host = host(EngineOptions {
            max_heap_size: Some(16 * 1024 * 1024),
            ..Default::default()
        });
        let hog = "const a = []; while (true) { a.push(new Array(1024).fill(a.length)); }";

        assert!(matches!(host.eval(hog), Err(Error::GuestFault(_))));
        assert!(host.health().is_sealed());
        assert!(matches!(host.eval("1"), Err(Error::Sealed)));
        host.close();
        host.close();
    }

    #[tokio::test]
    async fn test_rejects_async_context() {
        let result = DenoEngine::new(EngineOptions::default(), &bundle());
        match result {
            Err(e @ Error::Construction(_)) => assert!(e.is_host_defect()),
            Err(other) => panic!("expected construction error, got {other:?}"),
            Ok(_) => panic!("engine built inside a tokio runtime"),
        }
    }
}
