//! Embedded Lua 5.4 interpreter for model-generated analysis code.
//!
//! Every call gets a fresh VM on a blocking thread (via
//! [`tokio::task::spawn_blocking`]), so host functions use synchronous I/O
//! (`reqwest::blocking`). Output is whatever the code `print`s, followed by
//! the chunk's return value(s) when it has any. Failures never propagate:
//! they come back as `"Error executing code: …"` text.
//!
//! # Host APIs
//!
//! | Module | Functions |
//! |--------|-----------|
//! | `http` | `get`, `post` |
//! | `json` | `parse`, `encode` |
//! | `stats` | `sum`, `mean`, `variance`, `stddev`, `min`, `max`, `rolling_mean` |
//! | `frame` | `column`, `filter`, `sort_by` (arrays of record tables) |
//! | `date` | `today`, `days_ago`, `now` (UTC, ISO 8601 strings) |
//! | `log` | `info`, `warn`, `error`, `debug` |
//!
//! # Restrictions
//!
//! `os`, `io`, `debug`, `package`, `require`, `load`, `loadfile` and
//! `dofile` are removed from the globals. An instruction-count hook aborts
//! code that runs past the configured timeout, and the VM's heap is capped.
//! Callers must still run [`crate::safety::is_safe`] first.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use mlua::prelude::*;

use crate::config::SandboxConfig;

/// Heap cap per VM.
const MEMORY_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// Deepest table nesting converted to JSON.
const MAX_JSON_DEPTH: usize = 64;

const REMOVED_GLOBALS: &[&str] = &[
    "os", "io", "debug", "package", "require", "load", "loadfile", "dofile",
];

#[derive(Debug, Clone)]
pub struct Sandbox {
    timeout: Duration,
    http_timeout: Duration,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::from_config(&SandboxConfig::default())
    }
}

impl Sandbox {
    pub fn new(timeout: Duration, http_timeout: Duration) -> Self {
        Self {
            timeout,
            http_timeout,
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(
            Duration::from_secs(config.timeout_secs),
            Duration::from_secs(config.http_timeout_secs),
        )
    }

    /// Run `code` and return its captured output, or the error as text.
    pub async fn execute(&self, code: &str) -> String {
        let sandbox = self.clone();
        let code = code.to_string();
        let result = tokio::task::spawn_blocking(move || sandbox.run_blocking(&code)).await;
        match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => format!("Error executing code: {}", e),
            Err(e) => format!("Error executing code: interpreter task failed: {}", e),
        }
    }

    /// Synchronous execution on the current thread.
    pub fn run_blocking(&self, code: &str) -> Result<String> {
        let lua = Lua::new();
        lua.set_memory_limit(MEMORY_LIMIT_BYTES)?;

        let timeout = self.timeout;
        let deadline = Instant::now() + timeout;
        lua.set_hook(
            mlua::HookTriggers::new().every_nth_instruction(10_000),
            move |_lua, _debug| {
                if Instant::now() > deadline {
                    Err(mlua::Error::RuntimeError(format!(
                        "execution timed out after {} seconds",
                        timeout.as_secs_f64()
                    )))
                } else {
                    Ok(mlua::VmState::Continue)
                }
            },
        );

        let output = Arc::new(Mutex::new(String::new()));
        restrict_globals(&lua)?;
        register_print(&lua, Arc::clone(&output))?;
        register_http_api(&lua, self.http_timeout)?;
        register_json_api(&lua)?;
        register_stats_api(&lua)?;
        register_frame_api(&lua)?;
        register_date_api(&lua)?;
        register_log_api(&lua)?;

        let returned: LuaMultiValue = lua.load(code).set_name("analysis").eval()?;

        let mut text = output
            .lock()
            .map_err(|_| anyhow::anyhow!("output buffer poisoned"))?
            .clone();
        for value in returned {
            if let Some(rendered) = render_value(&lua, value)? {
                text.push_str(&rendered);
                text.push('\n');
            }
        }
        Ok(text)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Globals
// ═══════════════════════════════════════════════════════════════════════

fn restrict_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals.set(*name, LuaValue::Nil)?;
    }
    Ok(())
}

fn register_print(lua: &Lua, output: Arc<Mutex<String>>) -> LuaResult<()> {
    let print = lua.create_function(move |lua, args: LuaMultiValue| {
        let tostring: LuaFunction = lua.globals().get("tostring")?;
        let mut parts = Vec::new();
        for value in args {
            parts.push(tostring.call::<String>(value)?);
        }
        let mut out = output
            .lock()
            .map_err(|_| mlua::Error::external(anyhow::anyhow!("output buffer poisoned")))?;
        out.push_str(&parts.join("\t"));
        out.push('\n');
        Ok(())
    })?;
    lua.globals().set("print", print)
}

/// Tables render as JSON, everything else through `tostring`. Nil is skipped.
fn render_value(lua: &Lua, value: LuaValue) -> Result<Option<String>> {
    match value {
        LuaValue::Nil => Ok(None),
        LuaValue::Table(_) => Ok(Some(serde_json::to_string(&lua_value_to_json(value)?)?)),
        other => {
            let tostring: LuaFunction = lua.globals().get("tostring")?;
            Ok(Some(tostring.call::<String>(other)?))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: http
// ═══════════════════════════════════════════════════════════════════════

fn register_http_api(lua: &Lua, timeout: Duration) -> LuaResult<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(mlua::Error::external)?;

    let http = lua.create_table()?;

    // http.get(url, opts?) → response
    let c = client.clone();
    http.set(
        "get",
        lua.create_function(move |lua, (url, opts): (String, Option<LuaTable>)| {
            do_http_request(lua, &c, "GET", &url, None, opts)
        })?,
    )?;

    // http.post(url, body, opts?) → response
    let c = client;
    http.set(
        "post",
        lua.create_function(
            move |lua, (url, body, opts): (String, String, Option<LuaTable>)| {
                do_http_request(lua, &c, "POST", &url, Some(&body), opts)
            },
        )?,
    )?;

    lua.globals().set("http", http)?;
    Ok(())
}

/// Returns `{status, ok, body, headers, json?}`.
fn do_http_request(
    lua: &Lua,
    client: &reqwest::blocking::Client,
    method: &str,
    url: &str,
    body: Option<&str>,
    opts: Option<LuaTable>,
) -> LuaResult<LuaTable> {
    let mut builder = match method {
        "POST" => client.post(url),
        _ => client.get(url),
    };

    if let Some(ref opts) = opts {
        if let Ok(headers) = opts.get::<LuaTable>("headers") {
            for pair in headers.pairs::<String, String>() {
                let (k, v) = pair?;
                builder = builder.header(k, v);
            }
        }

        if let Ok(params) = opts.get::<LuaTable>("params") {
            let mut param_vec: Vec<(String, String)> = Vec::new();
            for pair in params.pairs::<String, LuaValue>() {
                let (k, v) = pair?;
                let v = match v {
                    LuaValue::String(s) => s.to_str()?.to_string(),
                    LuaValue::Integer(i) => i.to_string(),
                    LuaValue::Number(n) => n.to_string(),
                    LuaValue::Boolean(b) => b.to_string(),
                    _ => continue,
                };
                param_vec.push((k, v));
            }
            builder = builder.query(&param_vec);
        }
    }

    if let Some(body) = body {
        builder = builder
            .header("Content-Type", "application/json")
            .body(body.to_string());
    }

    let response = builder.send().map_err(|e| {
        mlua::Error::external(anyhow::anyhow!("HTTP {} {} failed: {}", method, url, e))
    })?;

    let status = response.status().as_u16();
    let ok = response.status().is_success();

    let headers_table = lua.create_table()?;
    for (name, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            headers_table.set(name.as_str(), v.to_string())?;
        }
    }

    let body_text = response.text().map_err(|e| {
        mlua::Error::external(anyhow::anyhow!("Failed to read response body: {}", e))
    })?;
    let json_value = serde_json::from_str::<serde_json::Value>(&body_text).ok();

    let result = lua.create_table()?;
    result.set("status", status)?;
    result.set("headers", headers_table)?;
    result.set("body", body_text)?;
    result.set("ok", ok)?;
    if let Some(json) = json_value {
        result.set("json", json_value_to_lua(lua, &json)?)?;
    }

    Ok(result)
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: json
// ═══════════════════════════════════════════════════════════════════════

fn register_json_api(lua: &Lua) -> LuaResult<()> {
    let json_table = lua.create_table()?;

    json_table.set(
        "parse",
        lua.create_function(|lua, s: String| {
            let value: serde_json::Value = serde_json::from_str(&s)
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("json.parse: {}", e)))?;
            json_value_to_lua(lua, &value)
        })?,
    )?;

    json_table.set(
        "encode",
        lua.create_function(|_lua, value: LuaValue| {
            let json = lua_value_to_json(value)?;
            serde_json::to_string(&json)
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("json.encode: {}", e)))
        })?,
    )?;

    lua.globals().set("json", json_table)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: stats
// ═══════════════════════════════════════════════════════════════════════

fn numbers(values: LuaTable) -> LuaResult<Vec<f64>> {
    values.sequence_values::<f64>().collect()
}

fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        None
    } else {
        Some(xs.iter().sum::<f64>() / xs.len() as f64)
    }
}

/// Sample variance (n − 1 denominator).
fn variance(xs: &[f64]) -> Option<f64> {
    if xs.len() < 2 {
        return None;
    }
    let m = mean(xs)?;
    Some(xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64)
}

fn rolling_mean(xs: &[f64], window: usize) -> Vec<f64> {
    if window == 0 || window > xs.len() {
        return Vec::new();
    }
    xs.windows(window)
        .map(|w| w.iter().sum::<f64>() / window as f64)
        .collect()
}

fn register_stats_api(lua: &Lua) -> LuaResult<()> {
    let stats = lua.create_table()?;

    stats.set(
        "sum",
        lua.create_function(|_lua, t: LuaTable| Ok(numbers(t)?.iter().sum::<f64>()))?,
    )?;
    stats.set(
        "mean",
        lua.create_function(|_lua, t: LuaTable| Ok(mean(&numbers(t)?)))?,
    )?;
    stats.set(
        "variance",
        lua.create_function(|_lua, t: LuaTable| Ok(variance(&numbers(t)?)))?,
    )?;
    stats.set(
        "stddev",
        lua.create_function(|_lua, t: LuaTable| Ok(variance(&numbers(t)?).map(f64::sqrt)))?,
    )?;
    stats.set(
        "min",
        lua.create_function(|_lua, t: LuaTable| {
            Ok(numbers(t)?.into_iter().reduce(f64::min))
        })?,
    )?;
    stats.set(
        "max",
        lua.create_function(|_lua, t: LuaTable| {
            Ok(numbers(t)?.into_iter().reduce(f64::max))
        })?,
    )?;
    stats.set(
        "rolling_mean",
        lua.create_function(|lua, (t, window): (LuaTable, usize)| {
            lua.create_sequence_from(rolling_mean(&numbers(t)?, window))
        })?,
    )?;

    lua.globals().set("stats", stats)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: frame
// ═══════════════════════════════════════════════════════════════════════

fn rows(value: LuaTable) -> LuaResult<Vec<serde_json::Value>> {
    match lua_value_to_json(LuaValue::Table(value))? {
        serde_json::Value::Array(rows) => Ok(rows),
        serde_json::Value::Object(map) if map.is_empty() => Ok(Vec::new()),
        _ => Err(mlua::Error::external(anyhow::anyhow!(
            "frame: expected an array of records"
        ))),
    }
}

fn compare_json(a: &serde_json::Value, b: &serde_json::Value) -> Option<Ordering> {
    match (a, b) {
        (serde_json::Value::Number(x), serde_json::Value::Number(y)) => {
            x.as_f64()?.partial_cmp(&y.as_f64()?)
        }
        (serde_json::Value::String(x), serde_json::Value::String(y)) => Some(x.cmp(y)),
        (serde_json::Value::Bool(x), serde_json::Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn filter_rows(
    rows: Vec<serde_json::Value>,
    column: &str,
    op: &str,
    target: &serde_json::Value,
) -> Result<Vec<serde_json::Value>, String> {
    let keep = |ordering: Option<Ordering>| -> Result<bool, String> {
        Ok(match op {
            "==" => ordering == Some(Ordering::Equal),
            "~=" | "!=" => ordering != Some(Ordering::Equal),
            "<" => ordering == Some(Ordering::Less),
            "<=" => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
            ">" => ordering == Some(Ordering::Greater),
            ">=" => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
            other => return Err(format!("frame.filter: unknown operator '{}'", other)),
        })
    };
    let mut out = Vec::new();
    for row in rows {
        let ordering = row.get(column).and_then(|v| compare_json(v, target));
        if keep(ordering)? {
            out.push(row);
        }
    }
    Ok(out)
}

fn sort_rows(rows: &mut [serde_json::Value], column: &str, descending: bool) {
    rows.sort_by(|a, b| match (a.get(column), b.get(column)) {
        (Some(x), Some(y)) => {
            let ord = compare_json(x, y).unwrap_or(Ordering::Equal);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

fn register_frame_api(lua: &Lua) -> LuaResult<()> {
    let frame = lua.create_table()?;

    frame.set(
        "column",
        lua.create_function(|lua, (t, column): (LuaTable, String)| {
            let values: Vec<serde_json::Value> = rows(t)?
                .into_iter()
                .map(|row| row.get(&column).cloned().unwrap_or(serde_json::Value::Null))
                .collect();
            json_value_to_lua(lua, &serde_json::Value::Array(values))
        })?,
    )?;

    frame.set(
        "filter",
        lua.create_function(
            |lua, (t, column, op, value): (LuaTable, String, String, LuaValue)| {
                let target = lua_value_to_json(value)?;
                let kept = filter_rows(rows(t)?, &column, &op, &target)
                    .map_err(|e| mlua::Error::external(anyhow::anyhow!(e)))?;
                json_value_to_lua(lua, &serde_json::Value::Array(kept))
            },
        )?,
    )?;

    frame.set(
        "sort_by",
        lua.create_function(
            |lua, (t, column, descending): (LuaTable, String, Option<bool>)| {
                let mut all = rows(t)?;
                sort_rows(&mut all, &column, descending.unwrap_or(false));
                json_value_to_lua(lua, &serde_json::Value::Array(all))
            },
        )?,
    )?;

    lua.globals().set("frame", frame)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: date
// ═══════════════════════════════════════════════════════════════════════

/// `YYYY-MM-DD` for the UTC date `days` before today. `None` when the
/// result falls outside the representable calendar.
fn iso_days_ago(days: i64) -> Option<String> {
    let offset = chrono::Duration::try_days(days)?;
    let day = Utc::now().date_naive().checked_sub_signed(offset)?;
    Some(day.format("%Y-%m-%d").to_string())
}

fn date_out_of_range(days: i64) -> mlua::Error {
    mlua::Error::external(anyhow::anyhow!("date: {} days is out of range", days))
}

fn register_date_api(lua: &Lua) -> LuaResult<()> {
    let date = lua.create_table()?;

    date.set(
        "today",
        lua.create_function(|_lua, ()| iso_days_ago(0).ok_or_else(|| date_out_of_range(0)))?,
    )?;
    date.set(
        "days_ago",
        lua.create_function(|_lua, days: i64| {
            iso_days_ago(days).ok_or_else(|| date_out_of_range(days))
        })?,
    )?;
    date.set(
        "now",
        lua.create_function(|_lua, ()| {
            Ok(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        })?,
    )?;

    lua.globals().set("date", date)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: log
// ═══════════════════════════════════════════════════════════════════════

fn register_log_api(lua: &Lua) -> LuaResult<()> {
    let log = lua.create_table()?;

    log.set(
        "info",
        lua.create_function(|_lua, msg: String| {
            tracing::info!(target: "sandbox", "{}", msg);
            Ok(())
        })?,
    )?;
    log.set(
        "warn",
        lua.create_function(|_lua, msg: String| {
            tracing::warn!(target: "sandbox", "{}", msg);
            Ok(())
        })?,
    )?;
    log.set(
        "error",
        lua.create_function(|_lua, msg: String| {
            tracing::error!(target: "sandbox", "{}", msg);
            Ok(())
        })?,
    )?;
    log.set(
        "debug",
        lua.create_function(|_lua, msg: String| {
            tracing::debug!(target: "sandbox", "{}", msg);
            Ok(())
        })?,
    )?;

    lua.globals().set("log", log)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Value Conversions: JSON ↔ Lua
// ═══════════════════════════════════════════════════════════════════════

fn json_value_to_lua(lua: &Lua, value: &serde_json::Value) -> LuaResult<LuaValue> {
    match value {
        serde_json::Value::Null => Ok(LuaValue::Nil),
        serde_json::Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else {
                Ok(LuaValue::Number(n.as_f64().unwrap_or(0.0)))
            }
        }
        serde_json::Value::String(s) => lua.create_string(s).map(LuaValue::String),
        serde_json::Value::Array(arr) => {
            let table = lua.create_table()?;
            for (i, v) in arr.iter().enumerate() {
                table.set(i as i64 + 1, json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

/// Tables with a non-zero border become arrays, all others objects.
/// Nesting deeper than [`MAX_JSON_DEPTH`] (including any self-referencing
/// table) is an error.
fn lua_value_to_json(value: LuaValue) -> LuaResult<serde_json::Value> {
    lua_value_to_json_at(value, 0)
}

fn lua_value_to_json_at(value: LuaValue, depth: usize) -> LuaResult<serde_json::Value> {
    if depth > MAX_JSON_DEPTH {
        return Err(mlua::Error::external(anyhow::anyhow!(
            "table nesting exceeds {} levels (cyclic table?)",
            MAX_JSON_DEPTH
        )));
    }
    match value {
        LuaValue::Nil => Ok(serde_json::Value::Null),
        LuaValue::Boolean(b) => Ok(serde_json::Value::Bool(b)),
        LuaValue::Integer(i) => Ok(serde_json::Value::Number(i.into())),
        LuaValue::Number(n) => Ok(serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        LuaValue::String(s) => Ok(serde_json::Value::String(s.to_str()?.to_string())),
        LuaValue::Table(t) => {
            let len = t.raw_len();
            if len > 0 {
                let mut arr = Vec::with_capacity(len);
                for i in 1..=len {
                    let v: LuaValue = t.raw_get(i)?;
                    arr.push(lua_value_to_json_at(v, depth + 1)?);
                }
                Ok(serde_json::Value::Array(arr))
            } else {
                let mut map = serde_json::Map::new();
                for pair in t.pairs::<String, LuaValue>() {
                    let (k, v) = pair?;
                    map.insert(k, lua_value_to_json_at(v, depth + 1)?);
                }
                Ok(serde_json::Value::Object(map))
            }
        }
        _ => Ok(serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(code: &str) -> String {
        Sandbox::default().run_blocking(code).unwrap()
    }

    #[test]
    fn test_print_is_captured() {
        assert_eq!(run("print(1 + 1)\nprint('a', 'b')"), "2\na\tb\n");
    }

    #[test]
    fn test_expression_value_is_returned() {
        assert_eq!(run("6 * 7"), "42\n");
        assert_eq!(run("return {1, 2, 3}"), "[1,2,3]\n");
        assert_eq!(run("local x = 1"), "");
    }

    #[test]
    fn test_dangerous_globals_removed() {
        for name in REMOVED_GLOBALS {
            assert_eq!(run(&format!("return type({})", name)), "nil\n", "{}", name);
        }
    }

    #[tokio::test]
    async fn test_errors_become_text() {
        let out = Sandbox::default().execute("error('boom')").await;
        assert!(out.starts_with("Error executing code:"), "{}", out);
        assert!(out.contains("boom"));

        let out = Sandbox::default().execute("this is not lua").await;
        assert!(out.starts_with("Error executing code:"));
    }

    #[tokio::test]
    async fn test_runaway_loop_times_out() {
        let sandbox = Sandbox::new(Duration::from_millis(200), Duration::from_secs(1));
        let out = sandbox.execute("while true do end").await;
        assert!(out.contains("timed out"), "{}", out);
    }

    #[test]
    fn test_stats_functions() {
        assert_eq!(run("return stats.sum({1, 2, 3})"), "6.0\n");
        assert_eq!(run("return stats.mean({2, 4})"), "3.0\n");
        assert_eq!(
            run("return string.format('%.4f', stats.variance({1, 2, 3, 4}))"),
            "1.6667\n"
        );
        assert_eq!(run("return stats.stddev({5})"), "");
        assert_eq!(run("return stats.min({3, -1, 2}), stats.max({3, -1, 2})"), "-1.0\n3.0\n");
        assert_eq!(run("return stats.mean({})"), "");
        assert_eq!(run("return stats.rolling_mean({1, 2, 3, 4}, 2)"), "[1.5,2.5,3.5]\n");
    }

    #[test]
    fn test_frame_functions() {
        let setup = r#"
            local rows = {
                {city = "Oslo", temp = 4},
                {city = "Cairo", temp = 31},
                {city = "Lima", temp = 19},
            }
        "#;
        assert_eq!(
            run(&format!("{}\nreturn frame.column(rows, 'city')", setup)),
            "[\"Oslo\",\"Cairo\",\"Lima\"]\n"
        );
        assert_eq!(
            run(&format!(
                "{}\nreturn frame.column(frame.filter(rows, 'temp', '>', 10), 'city')",
                setup
            )),
            "[\"Cairo\",\"Lima\"]\n"
        );
        assert_eq!(
            run(&format!(
                "{}\nreturn frame.column(frame.sort_by(rows, 'temp', true), 'temp')",
                setup
            )),
            "[31,19,4]\n"
        );
    }

    #[test]
    fn test_json_roundtrip_in_script() {
        assert_eq!(
            run(r#"local t = json.parse('{"a": [1, 2]}'); return #t.a, json.encode(t.a)"#),
            "2\n[1,2]\n"
        );
    }

    #[test]
    fn test_date_functions() {
        let out = run("return date.today(), date.days_ago(30), date.now()");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        let today = chrono::NaiveDate::parse_from_str(lines[0], "%Y-%m-%d").unwrap();
        let start = chrono::NaiveDate::parse_from_str(lines[1], "%Y-%m-%d").unwrap();
        assert_eq!((today - start).num_days(), 30);
        assert!(chrono::DateTime::parse_from_rfc3339(lines[2]).is_ok());
    }

    #[tokio::test]
    async fn test_date_out_of_range_is_error_text() {
        let out = Sandbox::default().execute("return date.days_ago(math.maxinteger)").await;
        assert!(out.starts_with("Error executing code:"), "{}", out);
    }

    #[tokio::test]
    async fn test_cyclic_table_is_error_text() {
        let sandbox = Sandbox::default();
        for code in [
            "local t = {}\nt.self = t\nreturn t",
            "local t = {}\nt[1] = t\nreturn json.encode(t)",
            "local r = {x = 1}\nr.r = r\nreturn frame.column({r}, 'x')",
        ] {
            let out = sandbox.execute(code).await;
            assert!(out.starts_with("Error executing code:"), "{}", out);
            assert!(out.contains("nesting"), "{}", out);
        }
    }

    #[test]
    fn test_deep_but_finite_nesting_converts() {
        assert_eq!(run("return {{{{1}}}}"), "[[[[1]]]]\n");
    }

    #[test]
    fn test_rolling_mean_edges() {
        assert!(rolling_mean(&[1.0, 2.0], 3).is_empty());
        assert!(rolling_mean(&[1.0, 2.0], 0).is_empty());
    }

    #[test]
    fn test_filter_unknown_operator() {
        let err = filter_rows(vec![], "x", "<>", &serde_json::json!(1)).unwrap_err();
        assert!(err.contains("<>"));
    }
}
