//! Crash isolation around a script guest.
//!
//! [`ScriptHost`] owns one [`ScriptEngine`] and gates every call on its
//! [`RuntimeHealth`]. A fault during a call (a panic escaping the engine, or
//! an engine-reported [`Error::GuestFault`]) seals the host: the engine is
//! abandoned without being touched again, and every later call returns
//! [`Error::Sealed`].

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::Error;
use crate::health::RuntimeHealth;
use crate::modules::{ModuleBundle, BRIDGE_MODULE};

/// A single-threaded, non-reentrant script guest.
pub trait ScriptEngine {
    /// Register and evaluate one named module. Its dependencies are already
    /// registered.
    fn load_module(&mut self, name: &str, source: &str) -> Result<(), Error>;

    /// Evaluate inline source and return its final value as a string.
    fn eval(&mut self, source: &str) -> Result<String, Error>;
}

pub struct ScriptHost<E: ScriptEngine> {
    engine: Option<E>,
    health: RuntimeHealth,
}

impl<E: ScriptEngine> ScriptHost<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine: Some(engine),
            health: RuntimeHealth::Healthy,
        }
    }

    /// Register every bundle module, dependencies first.
    pub fn register_bundle(&mut self, bundle: &ModuleBundle) -> Result<(), Error> {
        for module in bundle.modules() {
            tracing::debug!(module = %module.name, version = bundle.version(), "registering guest module");
            self.guarded(|engine| engine.load_module(&module.name, &module.source))
                .map_err(|e| match e {
                    Error::Sealed | Error::GuestFault(_) => e,
                    other => Error::Construction(format!("loading module {}: {}", module.name, other)),
                })?;
        }
        Ok(())
    }

    pub fn eval(&mut self, source: &str) -> Result<String, Error> {
        self.guarded(|engine| engine.eval(source))
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    /// Release the engine. Idempotent; after a fault the engine is left alone.
    pub fn close(&mut self) {
        if let Some(engine) = self.engine.take() {
            drop(engine);
            tracing::info!("script guest released");
        }
    }

    fn guarded<T>(&mut self, call: impl FnOnce(&mut E) -> Result<T, Error>) -> Result<T, Error> {
        self.health.ensure_healthy()?;
        let engine = self.engine.as_mut().ok_or(Error::Sealed)?;

        let fault = match catch_unwind(AssertUnwindSafe(|| call(engine))) {
            Ok(Err(Error::GuestFault(msg))) => msg,
            Ok(result) => return result,
            Err(payload) => panic_message(payload.as_ref()),
        };

        tracing::error!(%fault, "script guest faulted; sealing runtime");
        self.health.seal();
        if let Some(engine) = self.engine.take() {
            // Tearing down a faulted engine can fault again.
            std::mem::forget(engine);
        }
        Err(Error::GuestFault(fault))
    }
}

impl<E: ScriptEngine> Drop for ScriptHost<E> {
    fn drop(&mut self) {
        self.close();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Quote host data as a JS template literal.
///
/// Escapes the delimiter, the escape character, and `$` so the data can
/// neither close the literal nor open a `${...}` substitution.
pub fn template_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('`');
    for c in s.chars() {
        if matches!(c, '`' | '\\' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('`');
    out
}

/// Script calling `function` on the bridge module with `args` (already
/// quoted), yielding a string.
pub fn bridge_call(function: &str, args: &[String]) -> String {
    format!(
        r#"(async () => {{
  const bridge = await import("{module}");
  const out = await bridge.{function}({args});
  return typeof out === "string" ? out : JSON.stringify(out);
}})()"#,
        module = BRIDGE_MODULE,
        function = function,
        args = args.join(", "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::ModuleSource;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Copy, PartialEq)]
    enum Behavior {
        Echo,
        Panic,
        Fault,
        Throw,
    }

    /// Instrumented engine counting every invocation and drop.
    struct StubEngine {
        calls: Arc<AtomicUsize>,
        drops: Arc<AtomicUsize>,
        behavior: Behavior,
        loaded: Vec<String>,
    }

    impl StubEngine {
        fn new(behavior: Behavior) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let drops = Arc::new(AtomicUsize::new(0));
            let engine = Self {
                calls: calls.clone(),
                drops: drops.clone(),
                behavior,
                loaded: Vec::new(),
            };
            (engine, calls, drops)
        }
    }

    impl ScriptEngine for StubEngine {
        fn load_module(&mut self, name: &str, _source: &str) -> Result<(), Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.loaded.push(name.to_string());
            Ok(())
        }

        fn eval(&mut self, source: &str) -> Result<String, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Echo => Ok(source.to_string()),
                Behavior::Panic => panic!("wasm unreachable executed"),
                Behavior::Fault => Err(Error::GuestFault("heap limit exceeded".into())),
                Behavior::Throw => Err(Error::Guest("TypeError: x is undefined".into())),
            }
        }
    }

    impl Drop for StubEngine {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_panic_seals_runtime() {
        let (engine, calls, drops) = StubEngine::new(Behavior::Panic);
        let mut host = ScriptHost::new(engine);

        match host.eval("1") {
            Err(Error::GuestFault(msg)) => assert!(msg.contains("unreachable")),
            other => panic!("expected fault, got {other:?}"),
        }
        assert!(host.health().is_sealed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            assert!(matches!(host.eval("1"), Err(Error::Sealed)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        host.close();
        host.close();
        drop(host);
        // The faulted engine is abandoned, never dropped.
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reported_fault_seals_runtime() {
        let (engine, calls, _) = StubEngine::new(Behavior::Fault);
        let mut host = ScriptHost::new(engine);

        assert!(matches!(host.eval("1"), Err(Error::GuestFault(_))));
        assert!(matches!(host.eval("1"), Err(Error::Sealed)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_script_errors_do_not_seal() {
        let (engine, calls, _) = StubEngine::new(Behavior::Throw);
        let mut host = ScriptHost::new(engine);

        assert!(matches!(host.eval("1"), Err(Error::Guest(_))));
        assert!(matches!(host.eval("1"), Err(Error::Guest(_))));
        assert!(!host.health().is_sealed());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (engine, calls, drops) = StubEngine::new(Behavior::Echo);
        let mut host = ScriptHost::new(engine);
        assert_eq!(host.eval("x").unwrap(), "x");

        host.close();
        host.close();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(host.eval("x"), Err(Error::Sealed)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registers_bundle_in_order() {
        let bundle = ModuleBundle::from_sources(
            "v1",
            vec![
                ModuleSource::new("bridge", "", &["vega"]),
                ModuleSource::new("vega", "", &[]),
            ],
        )
        .unwrap();
        let (engine, calls, _) = StubEngine::new(Behavior::Echo);
        let mut host = ScriptHost::new(engine);
        host.register_bundle(&bundle).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let loaded = &host.engine.as_ref().unwrap().loaded;
        assert_eq!(loaded, &["vega", "bridge"]);
    }

    #[test]
    fn test_template_literal_escapes_terminators() {
        assert_eq!(template_literal("plain"), "`plain`");
        assert_eq!(template_literal("a`b"), "`a\\`b`");
        assert_eq!(template_literal("a\\b"), "`a\\\\b`");
        assert_eq!(template_literal("${alert(1)}"), "`\\${alert(1)}`");
        assert_eq!(
            template_literal(r#"{"title":"`); process.exit(); (`"}"#),
            r#"`{"title":"\`); process.exit(); (\`"}`"#
        );
    }

    #[test]
    fn test_bridge_call_shape() {
        let script = bridge_call("vegaToSvg", &[template_literal("{}"), "undefined".into()]);
        assert!(script.contains(r#"import("bridge")"#));
        assert!(script.contains("bridge.vegaToSvg(`{}`, undefined)"));
    }
}
