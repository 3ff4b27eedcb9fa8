//! Per-session Lua runtime.
//!
//! Each REPL session owns one `LuaRuntime`, created on the session's thread.
//! Globals persist across evaluations within the session. Host state is only
//! reachable through the `host` global, whose calls go through the callback
//! queue (see `host_api`).

use mlua::{HookTriggers, Lua, MultiValue, Result as LuaResult, Value, VmState};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::host_api::HostUserData;
use crate::host::HostState;
use crate::queue::CallbackQueue;

/// Maximum number of Lua instructions per evaluation.
pub const INSTRUCTION_LIMIT: i64 = 100_000_000;

/// How often to check the instruction budget (every N instructions).
pub const INSTRUCTION_HOOK_INTERVAL: u32 = 10_000;

/// Default wall-clock timeout per evaluation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum lines of print output per evaluation.
pub const MAX_OUTPUT_LINES: usize = 5_000;

/// Per-evaluation limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalLimits {
    pub instruction_limit: i64,
    pub timeout: Duration,
    pub max_output_lines: usize,
}

impl Default for EvalLimits {
    fn default() -> Self {
        Self {
            instruction_limit: INSTRUCTION_LIMIT,
            timeout: DEFAULT_TIMEOUT,
            max_output_lines: MAX_OUTPUT_LINES,
        }
    }
}

impl EvalLimits {
    pub fn from_settings(settings: &prepl_config::Settings) -> Self {
        Self {
            instruction_limit: settings.instruction_limit,
            timeout: settings.eval_timeout(),
            max_output_lines: settings.max_output_lines,
        }
    }
}

/// Result of evaluating a Lua chunk
#[derive(Debug, Clone, Default)]
pub struct LuaEvalResult {
    /// Lines printed via print()
    pub output: Vec<String>,
    /// String representation of returned value (if any)
    pub returned: Option<String>,
    /// Error message (if evaluation failed)
    pub error: Option<String>,
    /// Fire-and-forget host actions queued by this evaluation
    pub deferred: usize,
    pub output_truncated: bool,
    pub instruction_limit_exceeded: bool,
    pub timed_out: bool,
}

impl LuaEvalResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Output buffer state (shared between print() and eval)
struct OutputState {
    lines: Vec<String>,
    truncated: bool,
    max_lines: usize,
}

impl OutputState {
    fn push(&mut self, line: String) {
        if self.lines.len() < self.max_lines {
            self.lines.push(line);
        } else {
            self.truncated = true;
        }
    }

    fn reset(&mut self) {
        self.lines.clear();
        self.truncated = false;
    }
}

/// Sandboxed Lua state with print capture and execution limits.
pub struct LuaRuntime {
    lua: Lua,
    output_state: Rc<RefCell<OutputState>>,
    deferred: Rc<Cell<usize>>,
    limits: EvalLimits,
}

impl LuaRuntime {
    /// Create a new Lua runtime with sandboxed globals.
    pub fn new(limits: EvalLimits) -> LuaResult<Self> {
        let lua = Lua::new();

        let output_state = Rc::new(RefCell::new(OutputState {
            lines: Vec::new(),
            truncated: false,
            max_lines: limits.max_output_lines,
        }));

        // Override print() to capture output (with cap)
        {
            let state = output_state.clone();
            let print_fn = lua.create_function(move |_, args: MultiValue| {
                let parts: Vec<String> = args.iter().map(lua_value_to_string).collect();
                state.borrow_mut().push(parts.join("\t"));
                Ok(())
            })?;
            lua.globals().set("print", print_fn)?;
        }

        // Sandbox: keep basic, string, table, math, utf8
        let globals = lua.globals();
        for name in ["os", "io", "debug", "package", "require", "loadfile", "dofile", "load"] {
            globals.set(name, Value::Nil)?;
        }

        Ok(Self {
            lua,
            output_state,
            deferred: Rc::new(Cell::new(0)),
            limits,
        })
    }

    /// Install the `host` global for this session.
    ///
    /// `reply_timeout` bounds how long `host:get` / `host:keys` wait for the
    /// host thread to drain the queue.
    pub fn register_host<H: HostState + 'static>(
        &self,
        queue: CallbackQueue<H>,
        reply_timeout: Duration,
    ) -> LuaResult<()> {
        let userdata = HostUserData::new(queue, reply_timeout, self.deferred.clone());
        self.lua.globals().set("host", userdata)
    }

    pub fn limits(&self) -> EvalLimits {
        self.limits
    }

    /// Evaluate a chunk with REPL-style behavior.
    ///
    /// If the input parses as an expression it is wrapped in `return (...)`
    /// so typing `1 + 1` shows `2`.
    pub fn eval(&self, input: &str) -> LuaEvalResult {
        self.output_state.borrow_mut().reset();
        self.deferred.set(0);

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return LuaEvalResult::default();
        }

        let (code, is_expression) = self.prepare_code(trimmed);

        // Instruction limit hook (also checks the wall clock)
        let limits = self.limits;
        let start_time = Instant::now();
        let budget = Arc::new(AtomicI64::new(limits.instruction_limit));
        let budget_clone = budget.clone();
        let was_timed_out = Arc::new(AtomicBool::new(false));
        let was_timed_out_clone = was_timed_out.clone();

        self.lua.set_hook(
            HookTriggers::new().every_nth_instruction(INSTRUCTION_HOOK_INTERVAL),
            move |_lua, _debug| {
                if start_time.elapsed() > limits.timeout {
                    was_timed_out_clone.store(true, Ordering::Relaxed);
                    return Err(mlua::Error::RuntimeError(format!(
                        "execution timeout ({}s limit)",
                        limits.timeout.as_secs()
                    )));
                }

                let remaining = budget_clone
                    .fetch_sub(INSTRUCTION_HOOK_INTERVAL as i64, Ordering::Relaxed);
                if remaining <= 0 {
                    Err(mlua::Error::RuntimeError(format!(
                        "instruction limit exceeded ({} instructions)",
                        limits.instruction_limit
                    )))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );

        let result = self.lua.load(&code).eval::<MultiValue>();
        self.lua.remove_hook();

        let (mut output, truncated) = {
            let state = self.output_state.borrow();
            (state.lines.clone(), state.truncated)
        };
        if truncated {
            output.push(format!(
                "... output truncated ({} line limit)",
                limits.max_output_lines
            ));
        }

        let mut eval_result = LuaEvalResult {
            output,
            deferred: self.deferred.get(),
            output_truncated: truncated,
            ..LuaEvalResult::default()
        };

        match result {
            Ok(values) => {
                eval_result.returned = format_returned(&values, is_expression);
            }
            Err(e) => {
                eval_result.error = Some(format_lua_error(&e));
                eval_result.timed_out = was_timed_out.load(Ordering::Relaxed);
                eval_result.instruction_limit_exceeded =
                    !eval_result.timed_out && budget.load(Ordering::Relaxed) <= 0;
            }
        }

        eval_result
    }

    /// Returns (code_to_execute, was_expression).
    fn prepare_code(&self, input: &str) -> (String, bool) {
        let as_expr = format!("return ({})", input);
        if self.lua.load(&as_expr).into_function().is_ok() {
            return (as_expr, true);
        }
        (input.to_string(), false)
    }
}

fn format_returned(values: &MultiValue, is_expression: bool) -> Option<String> {
    if values.is_empty() {
        return None;
    }
    // Statements that explicitly return only nils show nothing
    if !is_expression && values.iter().all(|v| matches!(v, Value::Nil)) {
        return None;
    }
    let parts: Vec<String> = values.iter().map(lua_value_to_string).collect();
    Some(parts.join(", "))
}

/// Convert a Lua value to a display string.
pub(crate) fn lua_value_to_string(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => {
            if n.fract() == 0.0 && n.abs() < 1e15 {
                format!("{:.0}", n)
            } else {
                format!("{}", n)
            }
        }
        Value::String(s) => s
            .to_str()
            .map(|s| s.to_string())
            .unwrap_or_else(|_| "<invalid utf8>".to_string()),
        Value::Table(_) => "table".to_string(),
        Value::Function(_) => "function".to_string(),
        Value::Thread(_) => "thread".to_string(),
        Value::UserData(_) => "userdata".to_string(),
        Value::LightUserData(_) => "lightuserdata".to_string(),
        Value::Error(e) => format!("error: {}", e),
        _ => "<unknown>".to_string(),
    }
}

/// Format a Lua error for display.
fn format_lua_error(error: &mlua::Error) -> String {
    match error {
        mlua::Error::SyntaxError { message, .. } => {
            // Strip the "[string \"...\"]:1: " prefix if present
            if let Some(idx) = message.find("]:") {
                let rest = &message[idx + 2..];
                match rest.find(": ") {
                    Some(pos) => rest[pos + 2..].to_string(),
                    None => rest.to_string(),
                }
            } else {
                message.clone()
            }
        }
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::CallbackError { cause, .. } => format_lua_error(cause),
        _ => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> LuaRuntime {
        LuaRuntime::new(EvalLimits::default()).unwrap()
    }

    #[test]
    fn test_basic_expression() {
        let rt = runtime();
        let result = rt.eval("1 + 1");
        assert!(result.is_ok());
        assert_eq!(result.returned, Some("2".to_string()));
    }

    #[test]
    fn test_print_capture() {
        let rt = runtime();
        let result = rt.eval("print('hello', 'world')");
        assert!(result.is_ok());
        assert_eq!(result.output, vec!["hello\tworld"]);
    }

    #[test]
    fn test_globals_persist_between_evals() {
        let rt = runtime();
        assert!(rt.eval("counter = 41").is_ok());
        let result = rt.eval("counter + 1");
        assert_eq!(result.returned, Some("42".to_string()));
    }

    #[test]
    fn test_statement_without_return() {
        let rt = runtime();
        let result = rt.eval("local x = 42");
        assert!(result.is_ok());
        assert!(result.returned.is_none());
    }

    #[test]
    fn test_multiline_code() {
        let rt = runtime();
        let code = r#"
            local sum = 0
            for i = 1, 10 do
                sum = sum + i
            end
            return sum
        "#;
        assert_eq!(rt.eval(code).returned, Some("55".to_string()));
    }

    #[test]
    fn test_syntax_error() {
        let rt = runtime();
        let result = rt.eval("if then");
        let err = result.error.unwrap();
        assert!(!err.is_empty());
        assert!(!result.instruction_limit_exceeded);
    }

    #[test]
    fn test_runtime_error_keeps_output() {
        let rt = runtime();
        let result = rt.eval("print('before'); error('oops')");
        assert!(result.error.unwrap().contains("oops"));
        assert_eq!(result.output, vec!["before"]);
    }

    #[test]
    fn test_sandbox() {
        let rt = runtime();
        for code in [
            "os.execute('ls')",
            "io.open('/etc/passwd')",
            "require('os')",
            "load('return 1')()",
            "dofile('/etc/passwd')",
        ] {
            assert!(rt.eval(code).error.is_some(), "{} should fail", code);
        }
        // Safe libraries stay available
        assert_eq!(rt.eval("string.upper('hi')").returned, Some("HI".to_string()));
        assert_eq!(rt.eval("math.floor(3.7)").returned, Some("3".to_string()));
    }

    #[test]
    fn test_instruction_limit() {
        let rt = LuaRuntime::new(EvalLimits {
            instruction_limit: 100_000,
            ..EvalLimits::default()
        })
        .unwrap();
        let result = rt.eval("while true do end");
        assert!(result.instruction_limit_exceeded);
        assert!(!result.timed_out);
        assert!(result.error.unwrap().contains("instruction limit"));

        // The runtime is still usable afterwards
        assert_eq!(rt.eval("2 * 3").returned, Some("6".to_string()));
    }

    #[test]
    fn test_timeout() {
        let rt = LuaRuntime::new(EvalLimits {
            timeout: Duration::from_millis(50),
            ..EvalLimits::default()
        })
        .unwrap();
        let result = rt.eval("while true do end");
        assert!(result.timed_out);
        assert!(!result.instruction_limit_exceeded);
    }

    #[test]
    fn test_output_cap() {
        let rt = LuaRuntime::new(EvalLimits {
            max_output_lines: 3,
            ..EvalLimits::default()
        })
        .unwrap();
        let result = rt.eval("for i = 1, 10 do print(i) end");
        assert!(result.output_truncated);
        assert_eq!(result.output.len(), 4);
        assert_eq!(result.output[2], "3");
        assert!(result.output[3].contains("truncated"));

        // Cap resets per evaluation
        let result = rt.eval("print('x')");
        assert!(!result.output_truncated);
        assert_eq!(result.output, vec!["x"]);
    }

    #[test]
    fn test_empty_input() {
        let rt = runtime();
        let result = rt.eval("   \n\t  ");
        assert!(result.is_ok());
        assert!(result.returned.is_none());
        assert!(result.output.is_empty());
    }

    #[test]
    fn test_multiple_returns() {
        let rt = runtime();
        assert_eq!(rt.eval("return 1, 'a', nil").returned, Some("1, a, nil".to_string()));
        assert_eq!(rt.eval("{1, 2}").returned, Some("table".to_string()));
    }
}
