//! Tool-call grammar over free-form model output.
//!
//! Every non-empty line of a turn's output is checked, in priority
//! order, against:
//!
//! 1. `TOOL:getAshigaruStatus`
//! 2. `TOOL:interruptAgent to=...[,...] [title=... body=...]`
//! 3. `TOOL:waitForMessage [timeoutMs=N]`
//! 4. `TOOL:sendMessage to=...[,...] title=... body=...|bodyFile=...`
//! 5. `TOOL <name> {json}`
//!
//! Arguments use a key=value grammar where values may be bare,
//! `"double-quoted"`, or `'single-quoted'` with `\\`, `\n`, `\"`,
//! `\'` escapes. A line that announces itself as a tool call but
//! fails to parse is surfaced as [`ToolLine::Error`] so the result
//! can be fed back to the model.

use std::collections::BTreeMap;

/// One recognized tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolRequest {
    GetAshigaruStatus,
    InterruptAgent {
        to: Vec<String>,
        title: Option<String>,
        body: Option<String>,
    },
    WaitForMessage {
        timeout_ms: Option<u64>,
    },
    SendMessage {
        to: Vec<String>,
        title: Option<String>,
        body: Option<String>,
        body_file: Option<String>,
    },
}

impl ToolRequest {
    /// The tool's wire name, used in `TOOL_RESULT` prefixes.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetAshigaruStatus => "getAshigaruStatus",
            Self::InterruptAgent { .. } => "interruptAgent",
            Self::WaitForMessage { .. } => "waitForMessage",
            Self::SendMessage { .. } => "sendMessage",
        }
    }
}

/// Outcome of scanning one line.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolLine {
    Request(ToolRequest),
    /// The line looked like a tool call but did not parse.
    Error { name: String, error: String },
}

impl ToolLine {
    pub fn name(&self) -> &str {
        match self {
            Self::Request(request) => request.name(),
            Self::Error { name, .. } => name,
        }
    }
}

/// Scan a turn's output for tool lines.
pub fn parse_tool_lines(output: &str) -> Vec<ToolLine> {
    output.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<ToolLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(rest) = line.strip_prefix("TOOL:") {
        return Some(parse_colon_form(rest));
    }
    if let Some(rest) = line.strip_prefix("TOOL ") {
        return Some(parse_json_form(rest));
    }
    None
}

fn parse_colon_form(rest: &str) -> ToolLine {
    let (name, args) = match rest.find(char::is_whitespace) {
        Some(idx) => (&rest[..idx], rest[idx..].trim_start()),
        None => (rest, ""),
    };

    match name {
        "getAshigaruStatus" => ToolLine::Request(ToolRequest::GetAshigaruStatus),
        "interruptAgent" => match parse_kv(args) {
            Ok(kv) => {
                let Some(to) = kv.get("to") else {
                    return error(name, "missing required argument: to");
                };
                ToolLine::Request(ToolRequest::InterruptAgent {
                    to: split_recipients(to),
                    title: kv.get("title").cloned(),
                    body: kv.get("body").cloned(),
                })
            }
            Err(err) => error(name, err),
        },
        "waitForMessage" => match parse_kv(args) {
            Ok(kv) => match kv.get("timeoutMs").map(|v| v.parse::<u64>()) {
                Some(Err(_)) => error(name, "timeoutMs must be an integer"),
                Some(Ok(ms)) => ToolLine::Request(ToolRequest::WaitForMessage {
                    timeout_ms: Some(ms),
                }),
                None => ToolLine::Request(ToolRequest::WaitForMessage { timeout_ms: None }),
            },
            Err(err) => error(name, err),
        },
        "sendMessage" => match parse_kv(args) {
            Ok(kv) => {
                let Some(to) = kv.get("to") else {
                    return error(name, "missing required argument: to");
                };
                ToolLine::Request(ToolRequest::SendMessage {
                    to: split_recipients(to),
                    title: kv.get("title").cloned(),
                    body: kv.get("body").cloned(),
                    body_file: kv.get("bodyFile").cloned(),
                })
            }
            Err(err) => error(name, err),
        },
        other => error(other, "unknown tool"),
    }
}

fn parse_json_form(rest: &str) -> ToolLine {
    let (name, json) = match rest.find(char::is_whitespace) {
        Some(idx) => (&rest[..idx], rest[idx..].trim_start()),
        None => return error(rest, "missing JSON arguments"),
    };

    let value: serde_json::Value = match serde_json::from_str(json) {
        Ok(value) => value,
        Err(err) => return error(name, format!("invalid JSON: {err}")),
    };
    let Some(object) = value.as_object() else {
        return error(name, "JSON arguments must be an object");
    };

    let to = || -> Result<Vec<String>, String> {
        match object.get("to") {
            Some(serde_json::Value::String(s)) => Ok(split_recipients(s)),
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| "to entries must be strings".to_string())
                })
                .collect(),
            Some(_) => Err("to must be a string or array".to_string()),
            None => Err("missing required argument: to".to_string()),
        }
    };
    let get_str = |key: &str| object.get(key).and_then(|v| v.as_str()).map(str::to_string);

    match name {
        "getAshigaruStatus" => ToolLine::Request(ToolRequest::GetAshigaruStatus),
        "waitForMessage" => match object.get("timeoutMs") {
            Some(value) => match value.as_u64() {
                Some(ms) => ToolLine::Request(ToolRequest::WaitForMessage {
                    timeout_ms: Some(ms),
                }),
                None => error(name, "timeoutMs must be an integer"),
            },
            None => ToolLine::Request(ToolRequest::WaitForMessage { timeout_ms: None }),
        },
        "interruptAgent" => match to() {
            Ok(to) => ToolLine::Request(ToolRequest::InterruptAgent {
                to,
                title: get_str("title"),
                body: get_str("body"),
            }),
            Err(err) => error(name, err),
        },
        "sendMessage" => match to() {
            Ok(to) => ToolLine::Request(ToolRequest::SendMessage {
                to,
                title: get_str("title"),
                body: get_str("body"),
                body_file: get_str("bodyFile"),
            }),
            Err(err) => error(name, err),
        },
        other => error(other, "unknown tool"),
    }
}

fn error(name: &str, message: impl Into<String>) -> ToolLine {
    ToolLine::Error {
        name: name.to_string(),
        error: message.into(),
    }
}

fn split_recipients(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `key=value` pairs separated by whitespace.
fn parse_kv(input: &str) -> Result<BTreeMap<String, String>, String> {
    let mut out = BTreeMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            return Ok(out);
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                break;
            }
            if c.is_whitespace() {
                return Err(format!("expected '=' after key '{key}'"));
            }
            key.push(c);
            chars.next();
        }
        if chars.next() != Some('=') {
            return Err(format!("expected '=' after key '{key}'"));
        }
        if key.is_empty() {
            return Err("empty argument key".to_string());
        }

        let value = match chars.peek() {
            Some(&quote @ ('"' | '\'')) => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some('n') => value.push('\n'),
                            Some('\\') => value.push('\\'),
                            Some('"') => value.push('"'),
                            Some('\'') => value.push('\''),
                            Some(other) => {
                                value.push('\\');
                                value.push(other);
                            }
                            None => return Err("dangling escape in quoted value".to_string()),
                        },
                        Some(c) if c == quote => break,
                        Some(c) => value.push(c),
                        None => return Err(format!("unterminated quote in value of '{key}'")),
                    }
                }
                value
            }
            _ => {
                let mut value = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
                value
            }
        };

        out.insert(key, value);
    }
}
