// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 netmgr contributors

//! Embedded fallback init script.
//!
//! Used when no `core.lua` is found next to the process and no explicit
//! path is configured. The script installs the `mj` helper module, then
//! enters the task loop: every resume delivers `(action, params)`, every
//! task runs in its own coroutine created by `mj.execute_task`, and the
//! reserved `__exit__` action ends the loop.

/// Lua 5.4 source of the default core script.
pub const DEFAULT_INIT_SCRIPT: &str = r#"
-- netmgr default core script (Lua 5.4)

if __nm_module_path ~= nil and __nm_module_path ~= '' then
    package.path = package.path .. ';' .. __nm_module_path .. '/?.lua'
end

mj = {}

-- Log levels understood by the host 'log' action.
mj.DEBUG  = 9000
mj.INFO   = 6000
mj.WARN   = 4000
mj.ERROR  = 2000
mj.FATAL  = 1000
mj.SYSTEM = 0

-- Yield helpers. Everything a script asks of the host travels through
-- coroutine.yield; the host resumes with the answer.
function mj.receive()
    return coroutine.yield()
end

function mj.send_and_recv(...)
    return coroutine.yield(...)
end

function mj.log(level, ...)
    local parts = {}
    for i = 1, select('#', ...) do
        parts[#parts + 1] = tostring(select(i, ...))
    end
    return coroutine.yield('log', level, table.concat(parts, ' '))
end

-- Ask the host to run a native driver operation. The host answers with
-- (value, err); err is nil on success.
function mj.execute(backend, action, params)
    return coroutine.yield(action, backend, params)
end

-- Run an action from a loadable extension module.
function mj.execute_module(schema, action, params)
    local ok, mod = pcall(require, schema)
    if not ok then
        return nil, 'load module \'' .. tostring(schema) .. '\' failed - ' .. tostring(mod)
    end
    local fn = mod[action]
    if type(fn) ~= 'function' then
        return nil, 'module \'' .. tostring(schema) .. '\' has no action \'' .. tostring(action) .. '\''
    end
    return fn(params)
end

-- Compile and run an inline script carried in params['script']. The chunk
-- sees mj, action and params plus the globals, nothing else is writable.
function mj.execute_script(action, params)
    local body = params and params['script'] or nil
    if body == nil or body == '' then
        return nil, 'script is empty'
    end
    local env = setmetatable({ mj = mj, action = action, params = params },
                             { __index = _G })
    local chunk, err = load(body, 'user_script', 't', env)
    if chunk == nil then
        return nil, 'compile script failed - ' .. tostring(err)
    end
    return chunk()
end

-- Wrap one task in a fresh coroutine. The schema selects the execution
-- strategy; without one the task goes straight to a native backend, and
-- unknown actions are answered by the host with an error.
function mj.execute_task(action, params)
    local schema = params and params['schema'] or nil
    return coroutine.create(function()
        if schema == 'script' then
            return mj.execute_script(action, params)
        elseif schema ~= nil and schema ~= '' then
            return mj.execute_module(schema, action, params)
        end
        return mj.execute(params and params['backend'] or '', action, params)
    end)
end

mj.log(mj.SYSTEM, 'core script ready on', tostring(__nm_os), tostring(__nm_arch))

-- Task loop: yield a child coroutine per task until the host asks us to
-- exit.
local action, params = coroutine.yield()
while action ~= '__exit__' do
    action, params = coroutine.yield(mj.execute_task(action, params))
end

mj.log(mj.SYSTEM, 'core script exit')
return true
"#;
