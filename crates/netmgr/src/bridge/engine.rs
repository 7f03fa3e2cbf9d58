// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 netmgr contributors

//! Interpreter side of the coroutine bridge.
//!
//! [`LuaEngine`] owns the embedded Lua state, the main task-loop coroutine
//! and the table of live task coroutines. It is deliberately not `Send`;
//! a [`Service`](crate::driver::service::Service) worker owns it and all
//! access is serialized there.
//!
//! The resume/yield protocol is driven by [`LuaEngine::eval`]: each call
//! resumes a coroutine with the arguments described by the pending method
//! descriptor, then classifies what the script did - finished, yielded a
//! child coroutine, yielded a native action, or failed. Native actions with
//! a callback surface as [`ExecStatus::Continue`] so the holder of the
//! [`Continuation`] can run the backend call outside the interpreter and
//! feed the answer back in.

use mlua::{Lua, MultiValue, Table, Thread, ThreadStatus, Value};
use parking_lot::{Condvar, Mutex};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bridge::init_script::DEFAULT_INIT_SCRIPT;
use crate::config::{BridgeConfig, DEFAULT_INIT_SCRIPT_NAME};
use crate::driver::registry::DriverRegistry;
use crate::driver::Params;
use crate::error::{Error, Result};

// ========================================================================
// Execution status and continuation
// ========================================================================

/// What the interpreter did on the last resume step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// Coroutine finished; final value and error are in the continuation.
    End,
    /// Coroutine yielded a native action that has a callback; run it and
    /// resume.
    Continue,
    /// Coroutine parked itself (task-loop handshake or child hand-off).
    Yield,
    /// Script raised an error or violated the protocol.
    Failed,
}

/// Cross-thread carrier of one bridge conversation.
///
/// Holds the task coroutine id, the pending method name, and the typed
/// argument/result slots the method descriptors read and write. `Send`,
/// unlike the engine, so the bridge facade can hold it between
/// `safely_call` steps.
#[derive(Debug)]
pub struct Continuation {
    pub fiber: Option<u64>,
    pub status: ExecStatus,
    pub method: Option<&'static str>,
    pub error: Option<String>,
    pub int_value: i64,
    pub string_value: String,
    pub params: Params,
    pub any: JsonValue,
}

impl Continuation {
    pub fn new() -> Self {
        Self {
            fiber: None,
            status: ExecStatus::Yield,
            method: None,
            error: None,
            int_value: 0,
            string_value: String::new(),
            params: Params::new(),
            any: JsonValue::Null,
        }
    }

    /// Reset the value slots before reading the next yield. Keeps the
    /// fiber id and pending method.
    fn clear(&mut self) {
        self.error = None;
        self.int_value = 0;
        self.string_value.clear();
        self.params.clear();
        self.any = JsonValue::Null;
    }
}

impl Default for Continuation {
    fn default() -> Self {
        Self::new()
    }
}

// ========================================================================
// Native method descriptors
// ========================================================================

/// Parse yielded values into the continuation.
pub type ReadFn = fn(&Lua, &[Value], &mut Continuation) -> mlua::Result<()>;
/// Build the resume arguments from the continuation.
pub type WriteFn = fn(&Lua, &Continuation) -> mlua::Result<MultiValue>;
/// Execute the native side of an action against the registry.
pub type CallbackFn = fn(&DriverRegistry, &mut Continuation);

/// One action the script may yield, described by up to three hooks.
///
/// `read` runs when the action is yielded, `callback` runs outside the
/// interpreter (possibly on the caller's thread), `write` builds the
/// arguments of the next resume. Any hook may be absent: an action
/// without a callback is answered in-line by the engine.
pub struct NativeMethod {
    pub name: &'static str,
    pub read: Option<ReadFn>,
    pub write: Option<WriteFn>,
    pub callback: Option<CallbackFn>,
}

/// Name-indexed set of native methods known to an engine.
pub struct MethodTable {
    methods: HashMap<&'static str, NativeMethod>,
}

impl MethodTable {
    /// The built-in action set: driver CRUD, logging, and the internal
    /// handshake methods.
    pub fn builtin() -> Self {
        let mut table = Self {
            methods: HashMap::new(),
        };
        // Internal handshakes.
        table.register(NativeMethod {
            name: "method_init",
            read: None,
            write: None,
            callback: None,
        });
        table.register(NativeMethod {
            name: "method_exit",
            read: None,
            write: Some(write_exit),
            callback: None,
        });
        table.register(NativeMethod {
            name: "method_spawn",
            read: None,
            write: Some(write_spawn),
            callback: None,
        });
        table.register(NativeMethod {
            name: "method_missing",
            read: None,
            write: Some(write_call_result),
            callback: None,
        });
        // Driver operations.
        for name in ["get", "put", "create", "delete"] {
            table.register(NativeMethod {
                name,
                read: Some(read_call_arguments),
                write: Some(write_call_result),
                callback: Some(dispatch_call),
            });
        }
        // Logging.
        table.register(NativeMethod {
            name: "log",
            read: Some(read_log_arguments),
            write: None,
            callback: Some(emit_log),
        });
        table
    }

    pub fn register(&mut self, method: NativeMethod) {
        self.methods.insert(method.name, method);
    }

    pub fn get(&self, name: &str) -> Option<&NativeMethod> {
        self.methods.get(name)
    }
}

fn read_call_arguments(lua: &Lua, vals: &[Value], ctx: &mut Continuation) -> mlua::Result<()> {
    ctx.string_value = match vals.get(1) {
        Some(Value::String(s)) => s.to_string_lossy(),
        _ => String::new(),
    };
    ctx.params = match vals.get(2) {
        Some(Value::Table(t)) => table_to_params(lua, t)?,
        _ => Params::new(),
    };
    Ok(())
}

fn read_log_arguments(_lua: &Lua, vals: &[Value], ctx: &mut Continuation) -> mlua::Result<()> {
    ctx.int_value = match vals.get(1) {
        Some(Value::Integer(n)) => *n,
        Some(Value::Number(n)) => *n as i64,
        _ => 0,
    };
    ctx.string_value = match vals.get(2) {
        Some(Value::String(s)) => s.to_string_lossy(),
        _ => String::new(),
    };
    Ok(())
}

fn write_call_result(lua: &Lua, ctx: &Continuation) -> mlua::Result<MultiValue> {
    let value = json_to_lua(lua, &ctx.any)?;
    let err = match &ctx.error {
        Some(msg) => Value::String(lua.create_string(msg)?),
        None => Value::Nil,
    };
    Ok(MultiValue::from_vec(vec![value, err]))
}

fn write_exit(lua: &Lua, _ctx: &Continuation) -> mlua::Result<MultiValue> {
    Ok(MultiValue::from_vec(vec![Value::String(
        lua.create_string("__exit__")?,
    )]))
}

fn write_spawn(lua: &Lua, ctx: &Continuation) -> mlua::Result<MultiValue> {
    let action = Value::String(lua.create_string(&ctx.string_value)?);
    let params = Value::Table(params_to_table(lua, &ctx.params)?);
    Ok(MultiValue::from_vec(vec![action, params]))
}

/// Route a yielded CRUD action to the named backend driver.
fn dispatch_call(registry: &DriverRegistry, ctx: &mut Continuation) {
    let action = ctx.method.unwrap_or("get");
    let outcome = registry.require(&ctx.string_value).and_then(|drv| match action {
        "get" => drv.get(&ctx.params),
        "put" => drv.put(&ctx.params),
        "create" => drv.create(&ctx.params),
        "delete" => drv.delete(&ctx.params),
        other => Err(Error::Script(format!("unsupport action '{}'", other))),
    });
    match outcome {
        Ok(res) => {
            ctx.error = if res.has_error() {
                Some(res.error_message().to_owned())
            } else {
                None
            };
            ctx.any = res.into_value();
        }
        Err(e) => {
            ctx.any = JsonValue::Null;
            ctx.error = Some(e.to_string());
        }
    }
}

/// Forward a script log line to the host logger. The script's numeric
/// levels collapse onto the host's four; level 0 is the script runtime
/// itself and logs as info.
fn emit_log(_registry: &DriverRegistry, ctx: &mut Continuation) {
    let msg = ctx.string_value.as_str();
    match ctx.int_value {
        n if n >= 9000 => log::debug!("[Script] {}", msg),
        n if n >= 6000 => log::info!("[Script] {}", msg),
        n if n >= 4000 => log::warn!("[Script] {}", msg),
        n if n > 0 => log::error!("[Script] {}", msg),
        _ => log::info!("[Script] {}", msg),
    }
    ctx.any = JsonValue::Null;
    ctx.error = None;
}

// ========================================================================
// Fiber gauge
// ========================================================================

/// Counter of task coroutines that started doing real work, with a
/// blocking drain for shutdown.
pub struct FiberGauge {
    count: Mutex<usize>,
    zero: Condvar,
}

impl FiberGauge {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            zero: Condvar::new(),
        }
    }

    pub fn add(&self) {
        *self.count.lock() += 1;
    }

    pub fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Wait until the count reaches zero. Returns `false` on timeout.
    pub fn wait_zero(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.zero.wait_for(&mut count, deadline - now);
        }
        true
    }
}

impl Default for FiberGauge {
    fn default() -> Self {
        Self::new()
    }
}

// ========================================================================
// Engine
// ========================================================================

struct FiberSlot {
    thread: Thread,
    /// Whether this fiber has been counted in the gauge.
    counted: bool,
}

/// The embedded interpreter plus its coroutine bookkeeping. Not `Send`;
/// lives on a service worker thread.
pub struct LuaEngine {
    lua: Lua,
    main: Thread,
    fibers: HashMap<u64, FiberSlot>,
    next_fiber: u64,
    methods: Arc<MethodTable>,
    registry: Arc<DriverRegistry>,
    gauge: Arc<FiberGauge>,
}

impl LuaEngine {
    /// Build the interpreter, load the init script and run it up to the
    /// task-loop handshake.
    pub fn boot(
        cfg: &BridgeConfig,
        registry: Arc<DriverRegistry>,
        methods: Arc<MethodTable>,
        gauge: Arc<FiberGauge>,
    ) -> Result<Self> {
        let lua = Lua::new();

        let globals = lua.globals();
        globals.set("__nm_os", std::env::consts::OS)?;
        globals.set("__nm_arch", std::env::consts::ARCH)?;
        globals.set(
            "__nm_module_path",
            cfg.module_path.clone().unwrap_or_default(),
        )?;
        drop(globals);

        let (chunk_name, source) = load_source(cfg)?;
        log::debug!("[Bridge] loading init script '{}'", chunk_name);
        let func = lua.load(&source).set_name(chunk_name).into_function()?;
        let main = lua.create_thread(func)?;

        let mut engine = Self {
            lua,
            main,
            fibers: HashMap::new(),
            next_fiber: 1,
            methods,
            registry,
            gauge,
        };

        // Drive the script to its first parked yield; log actions emitted
        // during startup are serviced here.
        let mut ctx = Continuation::new();
        ctx.method = Some("method_init");
        let main = engine.main.clone();
        loop {
            engine.eval(&main, &mut ctx)?;
            match ctx.status {
                ExecStatus::Yield => return Ok(engine),
                ExecStatus::Continue => engine.run_callback(&mut ctx),
                ExecStatus::End | ExecStatus::Failed => {
                    return Err(Error::Script(format!(
                        "init script did not reach the task loop: {}",
                        ctx.error.take().unwrap_or_else(|| "ended early".into())
                    )));
                }
            }
        }
    }

    /// Resume `thread` with the pending method's arguments and classify the
    /// outcome into `ctx`. When the thread hands off a child coroutine, the
    /// child is returned for registration.
    pub fn eval(&self, thread: &Thread, ctx: &mut Continuation) -> Result<Option<Thread>> {
        loop {
            let args = match ctx
                .method
                .and_then(|name| self.methods.get(name))
                .and_then(|m| m.write)
            {
                Some(write) => write(&self.lua, ctx)?,
                None => MultiValue::new(),
            };
            let resumed = thread.resume::<MultiValue>(args);
            ctx.clear();

            let vals: Vec<Value> = match resumed {
                Ok(mv) => mv.into_iter().collect(),
                Err(e) => {
                    ctx.status = ExecStatus::Failed;
                    ctx.error = Some(format!("script execute failed - {}", e));
                    return Ok(None);
                }
            };

            match thread.status() {
                ThreadStatus::Finished => {
                    ctx.status = ExecStatus::End;
                    self.read_final(&vals, ctx);
                    return Ok(None);
                }
                ThreadStatus::Resumable => {}
                ThreadStatus::Running | ThreadStatus::Error => {
                    ctx.status = ExecStatus::Failed;
                    ctx.error = Some("coroutine is not resumable".into());
                    return Ok(None);
                }
            }

            // Parked without values: handshake yield.
            let first = match vals.first() {
                None => {
                    ctx.status = ExecStatus::Yield;
                    ctx.method = None;
                    return Ok(None);
                }
                Some(v) => v,
            };

            match first {
                // Task hand-off: the loop yielded a fresh coroutine.
                Value::Thread(child) => {
                    ctx.status = ExecStatus::Yield;
                    ctx.method = None;
                    return Ok(Some(child.clone()));
                }
                Value::String(action) => {
                    let action = action.to_string_lossy();
                    match self.methods.get(action.as_str()) {
                        None => {
                            // Answer unknown actions in-line with an error.
                            ctx.method = Some("method_missing");
                            ctx.any = JsonValue::Null;
                            ctx.error = Some(format!("unsupport action '{}'", action));
                        }
                        Some(method) => {
                            ctx.method = Some(method.name);
                            if let Some(read) = method.read {
                                read(&self.lua, &vals, ctx)?;
                            }
                            if method.callback.is_some() {
                                ctx.status = ExecStatus::Continue;
                                return Ok(None);
                            }
                        }
                    }
                }
                other => {
                    ctx.status = ExecStatus::Failed;
                    ctx.error = Some(format!(
                        "yielded unexpected value of type {}",
                        other.type_name()
                    ));
                    return Ok(None);
                }
            }
        }
    }

    /// Hand a new task to the loop, register the child coroutine it yields
    /// and run the child to its first settle point.
    pub fn spawn_fiber(
        &mut self,
        action: &str,
        params: Params,
        ctx: &mut Continuation,
    ) -> Result<()> {
        ctx.fiber = None;
        ctx.method = Some("method_spawn");
        ctx.string_value = action.to_owned();
        ctx.params = params;

        let main = self.main.clone();
        let child = loop {
            let yielded = self.eval(&main, ctx)?;
            match ctx.status {
                ExecStatus::Yield => match yielded {
                    Some(child) => break child,
                    None => {
                        return Err(Error::Protocol(
                            "task loop parked without handing off a coroutine".into(),
                        ))
                    }
                },
                ExecStatus::Continue => self.run_callback(ctx),
                ExecStatus::End => {
                    return Err(Error::Protocol("task loop ended unexpectedly".into()))
                }
                ExecStatus::Failed => {
                    return Err(Error::Script(
                        ctx.error.take().unwrap_or_else(|| "script failed".into()),
                    ))
                }
            }
        };

        let id = self.next_fiber;
        self.next_fiber += 1;
        self.fibers.insert(
            id,
            FiberSlot {
                thread: child.clone(),
                counted: false,
            },
        );
        ctx.fiber = Some(id);
        ctx.method = None;

        if let Err(e) = self.eval(&child, ctx) {
            self.retire(id);
            return Err(e);
        }
        self.settle(id, ctx);
        Ok(())
    }

    /// Resume the task named by `ctx.fiber` with the answer carried in the
    /// continuation.
    pub fn resume_fiber(&mut self, ctx: &mut Continuation) -> Result<()> {
        let id = ctx
            .fiber
            .ok_or_else(|| Error::Protocol("continuation has no task id".into()))?;
        let thread = self
            .fibers
            .get(&id)
            .map(|slot| slot.thread.clone())
            .ok_or_else(|| Error::Protocol(format!("unknown task id {}", id)))?;
        if let Err(e) = self.eval(&thread, ctx) {
            self.retire(id);
            return Err(e);
        }
        self.settle(id, ctx);
        Ok(())
    }

    /// Run the native callback of the pending method, if any.
    pub fn run_callback(&self, ctx: &mut Continuation) {
        if let Some(cb) = ctx
            .method
            .and_then(|name| self.methods.get(name))
            .and_then(|m| m.callback)
        {
            cb(&self.registry, ctx);
        }
    }

    /// Send the exit sentinel to the task loop and drain it to completion.
    pub fn shutdown(&mut self, ctx: &mut Continuation) -> Result<()> {
        if self.main.status() != ThreadStatus::Resumable {
            return Err(Error::Protocol("task loop is not resumable".into()));
        }
        ctx.fiber = None;
        ctx.method = Some("method_exit");
        let main = self.main.clone();
        loop {
            self.eval(&main, ctx)?;
            match ctx.status {
                ExecStatus::End => return Ok(()),
                ExecStatus::Continue => self.run_callback(ctx),
                ExecStatus::Yield => {
                    return Err(Error::Protocol("task loop parked during shutdown".into()))
                }
                ExecStatus::Failed => {
                    return Err(Error::Script(
                        ctx.error.take().unwrap_or_else(|| "script failed".into()),
                    ))
                }
            }
        }
    }

    pub fn live_fibers(&self) -> usize {
        self.fibers.len()
    }

    /// Book-keep a task after an eval: count it on its first suspension,
    /// retire it when it ended, and reject bare yields.
    fn settle(&mut self, id: u64, ctx: &mut Continuation) {
        match ctx.status {
            ExecStatus::Continue => {
                if let Some(slot) = self.fibers.get_mut(&id) {
                    if !slot.counted {
                        slot.counted = true;
                        self.gauge.add();
                    }
                }
            }
            ExecStatus::Yield => {
                ctx.status = ExecStatus::Failed;
                ctx.error = Some("task coroutine parked without an action".into());
                self.retire(id);
            }
            ExecStatus::End | ExecStatus::Failed => self.retire(id),
        }
    }

    fn retire(&mut self, id: u64) {
        if let Some(slot) = self.fibers.remove(&id) {
            if slot.counted {
                self.gauge.done();
            }
        }
    }

    /// Read the final `(value, err)` pair of a finished coroutine.
    fn read_final(&self, vals: &[Value], ctx: &mut Continuation) {
        ctx.any = match vals.first() {
            Some(v) => lua_to_json(&self.lua, v).unwrap_or_else(|e| {
                log::warn!("[Bridge] final value is not serializable: {}", e);
                JsonValue::Null
            }),
            None => JsonValue::Null,
        };
        ctx.error = match vals.get(1) {
            Some(Value::String(s)) => {
                let msg = s.to_string_lossy();
                if msg.is_empty() {
                    None
                } else {
                    Some(msg)
                }
            }
            _ => None,
        };
    }
}

// ========================================================================
// Value conversion
// ========================================================================

fn load_source(cfg: &BridgeConfig) -> Result<(String, String)> {
    if let Some(path) = &cfg.init_script {
        let source = std::fs::read_to_string(path)?;
        return Ok((path.display().to_string(), source));
    }
    let default = Path::new(DEFAULT_INIT_SCRIPT_NAME);
    if default.is_file() {
        let source = std::fs::read_to_string(default)?;
        return Ok((DEFAULT_INIT_SCRIPT_NAME.to_owned(), source));
    }
    Ok(("builtin:core.lua".to_owned(), DEFAULT_INIT_SCRIPT.to_owned()))
}

fn json_to_lua(lua: &Lua, value: &JsonValue) -> mlua::Result<Value> {
    use mlua::LuaSerdeExt;
    match value {
        JsonValue::Null => Ok(Value::Nil),
        other => lua.to_value(other),
    }
}

fn lua_to_json(lua: &Lua, value: &Value) -> mlua::Result<JsonValue> {
    use mlua::LuaSerdeExt;
    match value {
        Value::Nil => Ok(JsonValue::Null),
        other => lua.from_value(other.clone()),
    }
}

/// Flatten a Lua table into the string parameter mapping drivers take.
/// Non-scalar values are skipped.
fn table_to_params(_lua: &Lua, table: &Table) -> mlua::Result<Params> {
    let mut params = Params::new();
    for pair in table.clone().pairs::<Value, Value>() {
        let (key, value) = pair?;
        let key = match key {
            Value::String(s) => s.to_string_lossy(),
            Value::Integer(n) => n.to_string(),
            Value::Number(n) => n.to_string(),
            _ => continue,
        };
        let value = match value {
            Value::String(s) => s.to_string_lossy(),
            Value::Integer(n) => n.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Boolean(b) => b.to_string(),
            _ => continue,
        };
        params.insert(key, value);
    }
    Ok(params)
}

fn params_to_table(lua: &Lua, params: &Params) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    for (key, value) in params {
        table.set(key.as_str(), value.as_str())?;
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::StubDriver;
    use serde_json::json;

    fn boot_engine(registry: Arc<DriverRegistry>) -> LuaEngine {
        let cfg = BridgeConfig::default();
        LuaEngine::boot(
            &cfg,
            registry,
            Arc::new(MethodTable::builtin()),
            Arc::new(FiberGauge::new()),
        )
        .expect("default init script boots")
    }

    fn task_params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_boot_and_shutdown() {
        let mut engine = boot_engine(Arc::new(DriverRegistry::new()));
        let mut ctx = Continuation::new();
        engine.shutdown(&mut ctx).expect("clean shutdown");
        assert_eq!(ctx.status, ExecStatus::End);
    }

    #[test]
    fn test_unknown_action_is_answered_with_error() {
        let mut engine = boot_engine(Arc::new(DriverRegistry::new()));
        let mut ctx = Continuation::new();
        engine
            .spawn_fiber("frobnicate", Params::new(), &mut ctx)
            .expect("spawn succeeds");
        assert_eq!(ctx.status, ExecStatus::End);
        assert_eq!(ctx.error.as_deref(), Some("unsupport action 'frobnicate'"));
        assert_eq!(engine.live_fibers(), 0);
    }

    #[test]
    fn test_backend_call_continues_and_resumes() {
        let registry = Arc::new(DriverRegistry::new());
        registry
            .register("mock", Arc::new(StubDriver::answering(json!("payload"))))
            .expect("register mock");
        let mut engine = boot_engine(Arc::clone(&registry));

        let mut ctx = Continuation::new();
        engine
            .spawn_fiber("get", task_params(&[("backend", "mock"), ("oid", "1.3")]), &mut ctx)
            .expect("spawn succeeds");
        assert_eq!(ctx.status, ExecStatus::Continue);
        assert_eq!(ctx.method, Some("get"));
        assert_eq!(ctx.string_value, "mock");
        assert_eq!(ctx.params.get("oid").map(String::as_str), Some("1.3"));
        assert_eq!(engine.live_fibers(), 1);

        engine.run_callback(&mut ctx);
        assert_eq!(ctx.any, json!("payload"));

        engine.resume_fiber(&mut ctx).expect("resume succeeds");
        assert_eq!(ctx.status, ExecStatus::End);
        assert_eq!(ctx.any, json!("payload"));
        assert!(ctx.error.is_none());
        assert_eq!(engine.live_fibers(), 0);
    }

    #[test]
    fn test_gauge_tracks_suspended_tasks() {
        let registry = Arc::new(DriverRegistry::new());
        registry
            .register("mock", Arc::new(StubDriver::answering(json!(true))))
            .expect("register mock");
        let gauge = Arc::new(FiberGauge::new());
        let cfg = BridgeConfig::default();
        let mut engine = LuaEngine::boot(
            &cfg,
            registry,
            Arc::new(MethodTable::builtin()),
            Arc::clone(&gauge),
        )
        .expect("boot succeeds");

        let mut ctx = Continuation::new();
        engine
            .spawn_fiber("get", task_params(&[("backend", "mock")]), &mut ctx)
            .expect("spawn succeeds");
        assert_eq!(gauge.count(), 1);

        engine.run_callback(&mut ctx);
        engine.resume_fiber(&mut ctx).expect("resume succeeds");
        assert_eq!(gauge.count(), 0);
        assert!(gauge.wait_zero(Duration::from_millis(10)));
    }

    #[test]
    fn test_inline_script_task() {
        let mut engine = boot_engine(Arc::new(DriverRegistry::new()));
        let mut ctx = Continuation::new();
        engine
            .spawn_fiber(
                "run",
                task_params(&[("schema", "script"), ("script", "return 21 * 2")]),
                &mut ctx,
            )
            .expect("spawn succeeds");
        assert_eq!(ctx.status, ExecStatus::End);
        assert_eq!(ctx.any, json!(42));
        assert!(ctx.error.is_none());
    }

    #[test]
    fn test_inline_script_compile_error() {
        let mut engine = boot_engine(Arc::new(DriverRegistry::new()));
        let mut ctx = Continuation::new();
        engine
            .spawn_fiber(
                "run",
                task_params(&[("schema", "script"), ("script", "return ((")]),
                &mut ctx,
            )
            .expect("spawn succeeds");
        assert_eq!(ctx.status, ExecStatus::End);
        let err = ctx.error.expect("compile error is reported");
        assert!(err.contains("compile script failed"));
    }

    #[test]
    fn test_missing_backend_reports_error() {
        let mut engine = boot_engine(Arc::new(DriverRegistry::new()));
        let mut ctx = Continuation::new();
        engine
            .spawn_fiber("get", task_params(&[("backend", "ghost")]), &mut ctx)
            .expect("spawn succeeds");
        assert_eq!(ctx.status, ExecStatus::Continue);
        engine.run_callback(&mut ctx);
        assert_eq!(
            ctx.error.as_deref(),
            Some("driver 'ghost' is not exists")
        );
        engine.resume_fiber(&mut ctx).expect("resume succeeds");
        assert_eq!(ctx.status, ExecStatus::End);
        assert_eq!(ctx.error.as_deref(), Some("driver 'ghost' is not exists"));
    }

    fn rejecting_read(_lua: &Lua, _vals: &[Value], _ctx: &mut Continuation) -> mlua::Result<()> {
        Err(mlua::Error::runtime("argument read rejected"))
    }

    #[test]
    fn test_failing_read_hook_retires_the_task() {
        let mut methods = MethodTable::builtin();
        methods.register(NativeMethod {
            name: "get",
            read: Some(rejecting_read),
            write: Some(write_call_result),
            callback: Some(dispatch_call),
        });
        let gauge = Arc::new(FiberGauge::new());
        let cfg = BridgeConfig::default();
        let mut engine = LuaEngine::boot(
            &cfg,
            Arc::new(DriverRegistry::new()),
            Arc::new(methods),
            Arc::clone(&gauge),
        )
        .expect("boot succeeds");

        let mut ctx = Continuation::new();
        let err = engine
            .spawn_fiber("get", task_params(&[("backend", "mock")]), &mut ctx)
            .expect_err("read hook failure must surface");
        assert!(matches!(err, Error::Script(_)));
        // The broken task must not linger in the fiber table or the gauge.
        assert_eq!(engine.live_fibers(), 0);
        assert_eq!(gauge.count(), 0);
        assert!(gauge.wait_zero(Duration::from_millis(10)));
    }

    #[test]
    fn test_gauge_wait_zero_times_out() {
        let gauge = FiberGauge::new();
        gauge.add();
        assert!(!gauge.wait_zero(Duration::from_millis(20)));
        gauge.done();
        assert!(gauge.wait_zero(Duration::from_millis(20)));
    }
}
