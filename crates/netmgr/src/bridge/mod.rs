// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 netmgr contributors

//! Thread-safe facade over the embedded script engine.
//!
//! [`ScriptDriver`] implements the [`Driver`] contract on top of a
//! [`LuaEngine`] parked on a [`Service`] worker. Each call becomes one
//! interpreter task: spawn a coroutine, then ping-pong between the
//! worker (resume steps) and the caller's thread (native callbacks)
//! until the coroutine ends, all under one invocation deadline.
//!
//! A timed-out step abandons interpreter state that is still suspended
//! mid-conversation, so the whole bridge is poisoned and refuses work
//! until restarted.

pub mod engine;
pub mod init_script;

pub use engine::{
    Continuation, ExecStatus, FiberGauge, LuaEngine, MethodTable, NativeMethod,
};

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::BridgeConfig;
use crate::driver::registry::DriverRegistry;
use crate::driver::service::Service;
use crate::driver::{Driver, DriverResult, Params, INTERNAL_ERROR};
use crate::error::{Error, Result};

/// Script-backed driver: CRUD operations are handed to coroutines running
/// in an embedded interpreter, which in turn may call back into native
/// drivers through the registry.
pub struct ScriptDriver {
    name: String,
    cfg: BridgeConfig,
    registry: Arc<DriverRegistry>,
    methods: Arc<MethodTable>,
    gauge: Arc<FiberGauge>,
    service: Mutex<Option<Arc<Service<LuaEngine>>>>,
    poisoned: AtomicBool,
}

impl ScriptDriver {
    pub fn new(name: &str, cfg: BridgeConfig, registry: Arc<DriverRegistry>) -> Self {
        Self {
            name: name.to_owned(),
            cfg,
            registry,
            methods: Arc::new(MethodTable::builtin()),
            gauge: Arc::new(FiberGauge::new()),
            service: Mutex::new(None),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Run one action through the interpreter and return its final
    /// `(value, error)` pair.
    ///
    /// Native callbacks run here, on the caller's thread; only the resume
    /// steps enter the worker. The configured invocation deadline spans
    /// all steps together.
    pub fn invoke(&self, action: &str, params: Params) -> Result<(JsonValue, Option<String>)> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(Error::BridgePoisoned);
        }
        let svc = self
            .service
            .lock()
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::NotStarted(self.name.clone()))?;

        let deadline = Instant::now() + self.cfg.invoke_timeout;
        let action_owned = action.to_owned();
        let mut ctx = self.call_engine(&svc, self.cfg.invoke_timeout, move |engine| {
            let mut ctx = Continuation::new();
            engine.spawn_fiber(&action_owned, params, &mut ctx)?;
            Ok(ctx)
        })?;

        loop {
            match ctx.status {
                ExecStatus::End => {
                    return Ok((std::mem::take(&mut ctx.any), ctx.error.take()));
                }
                ExecStatus::Failed => {
                    return Err(Error::Script(
                        ctx.error.take().unwrap_or_else(|| "script failed".into()),
                    ));
                }
                ExecStatus::Continue => {
                    if let Some(cb) = ctx
                        .method
                        .and_then(|name| self.methods.get(name))
                        .and_then(|m| m.callback)
                    {
                        cb(&self.registry, &mut ctx);
                    }
                    let left = match deadline.checked_duration_since(Instant::now()) {
                        Some(left) if !left.is_zero() => left,
                        _ => {
                            self.poison();
                            return Err(Error::CallTimeout(self.name.clone()));
                        }
                    };
                    ctx = self.call_engine(&svc, left, move |engine| {
                        let mut ctx = ctx;
                        engine.resume_fiber(&mut ctx)?;
                        Ok(ctx)
                    })?;
                }
                ExecStatus::Yield => {
                    return Err(Error::Protocol(
                        "invocation parked without an action".into(),
                    ));
                }
            }
        }
    }

    /// Number of tasks currently suspended in the interpreter.
    pub fn pending_fibers(&self) -> usize {
        self.gauge.count()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
        log::error!(
            "[Bridge] '{}' abandoned a suspended task after timeout, bridge poisoned",
            self.name
        );
    }

    /// Ship a closure to the engine worker, poisoning the bridge when the
    /// deadline expires before the worker answers.
    fn call_engine<R, F>(
        &self,
        svc: &Service<LuaEngine>,
        timeout: std::time::Duration,
        f: F,
    ) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut LuaEngine) -> Result<R> + Send + 'static,
    {
        match svc.safely_call(timeout, f) {
            Ok(inner) => inner,
            Err(e @ Error::CallTimeout(_)) => {
                self.poison();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn run(&self, action: &'static str, params: &Params) -> Result<DriverResult> {
        let (value, error) = self.invoke(action, params.clone())?;
        let mut res = DriverResult::ok(value);
        if let Some(err) = error {
            res = res.with_error(INTERNAL_ERROR, err);
        }
        Ok(res)
    }

    /// Mutating operations must answer a boolean. A nil answer counts as
    /// a refusal (`false`); a non-nil non-boolean is a broken script
    /// contract.
    fn run_bool(&self, action: &'static str, params: &Params) -> Result<DriverResult> {
        let res = self.run(action, params)?;
        if res.value().is_null() {
            if res.has_error() {
                return Ok(res);
            }
            return Ok(DriverResult::ok(JsonValue::Bool(false)));
        }
        if res.as_bool().is_none() {
            panic!(
                "script answered '{}' with a non-boolean value: {}",
                action,
                res.value()
            );
        }
        Ok(res)
    }
}

impl Driver for ScriptDriver {
    fn get(&self, params: &Params) -> Result<DriverResult> {
        self.run("get", params)
    }

    fn put(&self, params: &Params) -> Result<DriverResult> {
        self.run("put", params)
    }

    fn create(&self, params: &Params) -> Result<DriverResult> {
        self.run_bool("create", params)
    }

    fn delete(&self, params: &Params) -> Result<DriverResult> {
        self.run_bool("delete", params)
    }

    fn start(&self) -> Result<()> {
        let mut guard = self.service.lock();
        if guard.is_some() {
            return Err(Error::AlreadyStarted(self.name.clone()));
        }
        let cfg = self.cfg.clone();
        let registry = Arc::clone(&self.registry);
        let methods = Arc::clone(&self.methods);
        let gauge = Arc::clone(&self.gauge);
        let svc = Service::spawn(&self.name, move || {
            LuaEngine::boot(&cfg, registry, methods, gauge)
        })?;
        self.poisoned.store(false, Ordering::Release);
        *guard = Some(Arc::new(svc));
        log::info!("[Bridge] '{}' started", self.name);
        Ok(())
    }

    fn stop(&self) {
        let svc = match self.service.lock().take() {
            Some(svc) => svc,
            None => return,
        };
        if self.poisoned.load(Ordering::Acquire) {
            log::warn!("[Bridge] '{}' is poisoned, skipping script shutdown", self.name);
        } else {
            if !self.gauge.wait_zero(self.cfg.invoke_timeout) {
                log::warn!(
                    "[Bridge] '{}' still has {} suspended tasks at stop",
                    self.name,
                    self.gauge.count()
                );
            }
            let outcome = svc.safely_call(self.cfg.invoke_timeout, |engine| {
                let mut ctx = Continuation::new();
                engine.shutdown(&mut ctx)
            });
            match outcome {
                Ok(Ok(())) => log::info!("[Bridge] '{}' stopped", self.name),
                Ok(Err(e)) => log::warn!("[Bridge] '{}' shutdown failed: {}", self.name, e),
                Err(e) => log::warn!("[Bridge] '{}' shutdown call failed: {}", self.name, e),
            }
        }
        svc.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::StubDriver;
    use serde_json::json;
    use std::io::Write as _;
    use std::time::Duration;

    fn script_params(source: &str) -> Params {
        let mut params = Params::new();
        params.insert("schema".into(), "script".into());
        params.insert("script".into(), source.into());
        params
    }

    fn started(registry: Arc<DriverRegistry>) -> ScriptDriver {
        let drv = ScriptDriver::new("core", BridgeConfig::default(), registry);
        drv.start().expect("bridge starts");
        drv
    }

    #[test]
    fn test_invoke_before_start_is_rejected() {
        let drv = ScriptDriver::new(
            "core",
            BridgeConfig::default(),
            Arc::new(DriverRegistry::new()),
        );
        let err = drv.invoke("get", Params::new()).expect_err("not started");
        assert!(matches!(err, Error::NotStarted(_)));
    }

    #[test]
    fn test_double_start_and_idempotent_stop() {
        let drv = started(Arc::new(DriverRegistry::new()));
        let err = drv.start().expect_err("second start must fail");
        assert!(matches!(err, Error::AlreadyStarted(_)));
        drv.stop();
        drv.stop(); // no-op
    }

    #[test]
    fn test_inline_script_returns_value() {
        let drv = started(Arc::new(DriverRegistry::new()));
        let res = drv
            .get(&script_params("return 'hello'"))
            .expect("get succeeds");
        assert_eq!(res.value(), &json!("hello"));
        assert!(!res.has_error());
        drv.stop();
    }

    #[test]
    fn test_backend_dispatch_through_script() {
        let registry = Arc::new(DriverRegistry::new());
        registry
            .register("mock", Arc::new(StubDriver::answering(json!(17))))
            .expect("register mock");
        let drv = started(Arc::clone(&registry));

        let mut params = Params::new();
        params.insert("backend".into(), "mock".into());
        let res = drv.get(&params).expect("get succeeds");
        assert_eq!(res.as_i64(), Some(17));
        drv.stop();
    }

    #[test]
    fn test_script_can_log() {
        let drv = started(Arc::new(DriverRegistry::new()));
        let res = drv
            .get(&script_params("mj.log(mj.INFO, 'from script'); return true"))
            .expect("get succeeds");
        assert_eq!(res.as_bool(), Some(true));
        drv.stop();
    }

    #[test]
    fn test_unknown_action_answers_error() {
        let drv = started(Arc::new(DriverRegistry::new()));
        let (value, error) = drv
            .invoke("frobnicate", Params::new())
            .expect("invoke completes");
        assert!(value.is_null());
        assert_eq!(error.as_deref(), Some("unsupport action 'frobnicate'"));
        drv.stop();
    }

    #[test]
    fn test_create_accepts_boolean() {
        let drv = started(Arc::new(DriverRegistry::new()));
        let res = drv
            .create(&script_params("return true"))
            .expect("create succeeds");
        assert_eq!(res.as_bool(), Some(true));
        drv.stop();
    }

    #[test]
    fn test_create_nil_answer_counts_as_refusal() {
        let drv = started(Arc::new(DriverRegistry::new()));
        let res = drv
            .create(&script_params("return nil"))
            .expect("nil answer is not a contract violation");
        assert_eq!(res.as_bool(), Some(false));

        // nil paired with an error keeps the error result.
        let res = drv
            .delete(&script_params("return nil, 'not permitted'"))
            .expect("delete completes");
        assert!(res.has_error());
        assert_eq!(res.error_message(), "not permitted");
        drv.stop();
    }

    #[test]
    #[should_panic(expected = "non-boolean")]
    fn test_create_panics_on_non_boolean_answer() {
        let drv = started(Arc::new(DriverRegistry::new()));
        let _ = drv.create(&script_params("return 5"));
    }

    #[test]
    fn test_init_script_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(
            br#"
local action, params = coroutine.yield()
while action ~= '__exit__' do
    action, params = coroutine.yield(coroutine.create(function()
        return 'custom:' .. action
    end))
end
return true
"#,
        )
        .expect("write script");

        let cfg = BridgeConfig {
            init_script: Some(file.path().to_path_buf()),
            ..BridgeConfig::default()
        };
        let drv = ScriptDriver::new("custom", cfg, Arc::new(DriverRegistry::new()));
        drv.start().expect("custom script boots");
        let res = drv.get(&Params::new()).expect("get succeeds");
        assert_eq!(res.as_str(), Some("custom:get"));
        drv.stop();
    }

    #[test]
    fn test_timeout_between_steps_poisons_the_bridge() {
        struct SlowDriver;
        impl Driver for SlowDriver {
            fn get(&self, _params: &Params) -> Result<DriverResult> {
                std::thread::sleep(Duration::from_millis(80));
                Ok(DriverResult::ok(json!(1)))
            }
            fn put(&self, _params: &Params) -> Result<DriverResult> {
                Ok(DriverResult::ok(json!(1)))
            }
            fn create(&self, _params: &Params) -> Result<DriverResult> {
                Ok(DriverResult::ok(json!(true)))
            }
            fn delete(&self, _params: &Params) -> Result<DriverResult> {
                Ok(DriverResult::ok(json!(true)))
            }
        }

        let registry = Arc::new(DriverRegistry::new());
        registry
            .register("slow", Arc::new(SlowDriver))
            .expect("register slow");
        let cfg = BridgeConfig {
            invoke_timeout: Duration::from_millis(40),
            ..BridgeConfig::default()
        };
        let drv = ScriptDriver::new("core", cfg, registry);
        drv.start().expect("bridge starts");

        let mut params = Params::new();
        params.insert("backend".into(), "slow".into());
        let err = drv.get(&params).expect_err("deadline expires mid-call");
        assert!(matches!(err, Error::CallTimeout(_)));
        assert!(drv.is_poisoned());

        let err = drv.get(&params).expect_err("poisoned bridge refuses work");
        assert!(matches!(err, Error::BridgePoisoned));

        // Stop must not hang on the abandoned task.
        drv.stop();
    }
}
