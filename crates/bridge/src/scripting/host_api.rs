//! The `host` global available to REPL code.
//!
//! Lua NEVER touches host state directly. Every call becomes a unit of work on
//! the callback queue and runs on the host thread at its next drain.
//!
//! # API
//! - `host:set(key, value)` → queued, returns immediately
//! - `host:remove(key)` → queued, returns immediately
//! - `host:get(key)` → waits for the host to answer (bounded), value or nil
//! - `host:keys()` → waits for the host to answer (bounded), array of keys
//! - `host:pending()` → callbacks currently waiting for a drain
//!
//! Reads queue behind earlier writes, so `host:set('a', 1); host:get('a')`
//! observes the write.

use mlua::{Lua, Result as LuaResult, UserData, UserDataMethods, Value};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use crate::host::{HostState, HostValue};
use crate::oneshot::{self, RecvTimeoutError};
use crate::queue::CallbackQueue;

pub struct HostUserData<H> {
    queue: CallbackQueue<H>,
    reply_timeout: Duration,
    /// Fire-and-forget calls made during the current evaluation.
    deferred: Rc<Cell<usize>>,
}

impl<H: HostState + 'static> HostUserData<H> {
    pub fn new(queue: CallbackQueue<H>, reply_timeout: Duration, deferred: Rc<Cell<usize>>) -> Self {
        Self {
            queue,
            reply_timeout,
            deferred,
        }
    }

    fn defer<F>(&self, label: String, work: F)
    where
        F: FnOnce(&mut H) -> Result<(), crate::host::HostError> + Send + 'static,
    {
        self.queue.enqueue(label, work);
        self.deferred.set(self.deferred.get() + 1);
    }

    /// Queue a read and wait for the host thread to answer it.
    fn round_trip<T, F>(&self, label: String, read: F) -> LuaResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&H) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.queue.enqueue(label.clone(), move |host: &mut H| {
            // Receiver may have timed out already
            let _ = tx.send(read(host));
            Ok(())
        });

        rx.recv_timeout(self.reply_timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => mlua::Error::RuntimeError(format!(
                "{}: host did not answer within {}ms",
                label,
                self.reply_timeout.as_millis()
            )),
            RecvTimeoutError::Disconnected => {
                mlua::Error::RuntimeError(format!("{}: host dropped the request", label))
            }
        })
    }
}

impl<H: HostState + 'static> UserData for HostUserData<H> {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        // ====================================================================
        // set(key, value) -> queued
        // ====================================================================
        methods.add_method("set", |_, this, (key, value): (String, Value)| {
            let value = lua_to_host_value(value)?;
            this.defer(format!("set {}", key), move |host: &mut H| host.set(&key, value));
            Ok(())
        });

        // ====================================================================
        // remove(key) -> queued
        // ====================================================================
        methods.add_method("remove", |_, this, key: String| {
            this.defer(format!("remove {}", key), move |host: &mut H| {
                host.remove(&key).map(|_| ())
            });
            Ok(())
        });

        // ====================================================================
        // get(key) -> value or nil
        // ====================================================================
        methods.add_method("get", |lua, this, key: String| {
            let label = format!("get {}", key);
            let value = this.round_trip(label, move |host: &H| host.get(&key))?;
            host_value_to_lua(lua, value.unwrap_or(HostValue::Nil))
        });

        // ====================================================================
        // keys() -> array of keys
        // ====================================================================
        methods.add_method("keys", |lua, this, ()| {
            let keys = this.round_trip("keys".to_string(), |host: &H| host.keys())?;
            lua.create_sequence_from(keys)
        });

        // ====================================================================
        // pending() -> queue depth
        // ====================================================================
        methods.add_method("pending", |_, this, ()| Ok(this.queue.len()));
    }
}

/// Convert a Lua value into something the host accepts.
pub fn lua_to_host_value(value: Value) -> LuaResult<HostValue> {
    match value {
        Value::Nil => Ok(HostValue::Nil),
        Value::Boolean(b) => Ok(HostValue::Bool(b)),
        Value::Integer(i) => Ok(HostValue::Integer(i)),
        Value::Number(n) => Ok(HostValue::Number(n)),
        Value::String(s) => Ok(HostValue::String(s.to_str()?.to_string())),
        other => Err(mlua::Error::RuntimeError(format!(
            "host values must be nil, boolean, number or string (got {})",
            other.type_name()
        ))),
    }
}

pub fn host_value_to_lua(lua: &Lua, value: HostValue) -> LuaResult<Value> {
    Ok(match value {
        HostValue::Nil => Value::Nil,
        HostValue::Bool(b) => Value::Boolean(b),
        HostValue::Integer(i) => Value::Integer(i),
        HostValue::Number(n) => Value::Number(n),
        HostValue::String(s) => Value::String(lua.create_string(&s)?),
    })
}
