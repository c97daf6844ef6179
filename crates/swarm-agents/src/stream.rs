//! Parser for the agent's line-delimited stream-json output.
//!
//! One JSON object per line, each with a `type` tag. Parse failures never
//! stop ingestion: a non-JSON line becomes a synthetic `error` event carrying
//! the raw text so nothing the agent said is lost.

use regex::Regex;
use serde_json::Value;

use swarm_core::AgentEventKind;

const SUMMARY_LIMIT: usize = 200;
const COMMAND_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    pub kind: AgentEventKind,
    /// Human-readable one-liner for logs and the dashboard.
    pub summary: String,
    /// Continuation token, present on any event that carries one.
    pub session_id: Option<String>,
    /// The full original payload.
    pub raw: Value,
}

impl ParsedEvent {
    pub fn payload_json(&self) -> String {
        self.raw.to_string()
    }
}

/// Parse a single stream line. Returns `None` only for blank lines.
pub fn parse_stream_line(line: &str) -> Option<ParsedEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let Ok(data) = serde_json::from_str::<Value>(line) else {
        return Some(ParsedEvent {
            kind: AgentEventKind::Error,
            summary: format!("unparseable stream line: {}", truncate(line, SUMMARY_LIMIT)),
            session_id: None,
            raw: Value::String(line.to_string()),
        });
    };

    let session_id = data
        .get("session_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let declared = data.get("type").and_then(Value::as_str).unwrap_or("unknown");

    let (kind, summary) = match declared {
        "assistant" => (AgentEventKind::Assistant, assistant_summary(&data)),
        "tool_use" => (AgentEventKind::ToolUse, tool_use_summary(&data)),
        "user" => (AgentEventKind::User, block_text_summary(&data)),
        "result" => (AgentEventKind::Result, result_summary(&data)),
        "error" => (AgentEventKind::Error, error_summary(&data)),
        "rate_limit_event" => (AgentEventKind::RateLimitEvent, error_summary(&data)),
        "system" => (AgentEventKind::System, truncate(&data.to_string(), SUMMARY_LIMIT)),
        // Anything else (tool_result, future types) is kept as system-level
        // stream chatter; the raw payload preserves the original tag.
        _ => (AgentEventKind::System, truncate(&data.to_string(), SUMMARY_LIMIT)),
    };

    Some(ParsedEvent {
        kind,
        summary,
        session_id,
        raw: data,
    })
}

fn assistant_summary(data: &Value) -> String {
    let blocks = data
        .pointer("/message/content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut parts: Vec<String> = Vec::new();
    for block in &blocks {
        if let Some(text) = block.as_str() {
            parts.push(text.to_string());
            continue;
        }
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    parts.push(text.to_string());
                }
            }
            Some("thinking") => parts.push("[thinking]".to_string()),
            Some("tool_use") => parts.push(inline_tool_marker(block)),
            _ => {}
        }
    }

    let joined = parts.join(" ");
    if joined.trim().is_empty() {
        "(thinking...)".to_string()
    } else {
        truncate(joined.trim(), SUMMARY_LIMIT)
    }
}

fn inline_tool_marker(block: &Value) -> String {
    let name = block.get("name").and_then(Value::as_str).unwrap_or("tool");
    let input = block.get("input").cloned().unwrap_or(Value::Null);
    match name {
        "Bash" => format!(
            "[$ {}]",
            truncate(
                input.get("command").and_then(Value::as_str).unwrap_or("?"),
                COMMAND_LIMIT
            )
        ),
        "Read" => format!(
            "[Read {}]",
            input.get("file_path").and_then(Value::as_str).unwrap_or("?")
        ),
        "Edit" | "Write" => format!(
            "[{name} {}]",
            input.get("file_path").and_then(Value::as_str).unwrap_or("?")
        ),
        "Skill" => format!(
            "[Capability: {}]",
            input.get("skill").and_then(Value::as_str).unwrap_or("?")
        ),
        other => format!("[{other}]"),
    }
}

fn tool_use_summary(data: &Value) -> String {
    let name = data
        .get("tool")
        .or_else(|| data.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let input = data.get("input").cloned().unwrap_or(Value::Null);
    match name {
        "Bash" => format!(
            "Bash: {}",
            truncate(
                input.get("command").and_then(Value::as_str).unwrap_or(""),
                COMMAND_LIMIT
            )
        ),
        "Read" => format!(
            "Read: {}",
            input.get("file_path").and_then(Value::as_str).unwrap_or("?")
        ),
        "Edit" | "Write" => format!(
            "{name}: {}",
            input.get("file_path").and_then(Value::as_str).unwrap_or("?")
        ),
        "Skill" => format!(
            "Skill: {}",
            input.get("skill").and_then(Value::as_str).unwrap_or("?")
        ),
        other => format!("{other}: {}", truncate(&input.to_string(), COMMAND_LIMIT)),
    }
}

fn block_text_summary(data: &Value) -> String {
    let text = data
        .pointer("/message/content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|block| {
                    block
                        .as_str()
                        .map(str::to_string)
                        .or_else(|| block.get("text").and_then(Value::as_str).map(str::to_string))
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();
    if text.trim().is_empty() {
        "(user)".to_string()
    } else {
        truncate(text.trim(), SUMMARY_LIMIT)
    }
}

fn result_summary(data: &Value) -> String {
    let summary = match data.get("result") {
        Some(Value::String(text)) => truncate(text, SUMMARY_LIMIT),
        Some(other) if !other.is_null() => truncate(&other.to_string(), SUMMARY_LIMIT),
        _ => String::new(),
    };
    if summary.is_empty() {
        "Agent finished".to_string()
    } else {
        summary
    }
}

fn error_summary(data: &Value) -> String {
    let message = match data.get("error") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Object(map)) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
        _ => data.to_string(),
    };
    truncate(&message, SUMMARY_LIMIT)
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        text.chars().take(limit).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrNumberSource {
    /// Read from a structured field on a `result` payload.
    Structured,
    /// Recovered from free text by pattern match; callers log a warning so
    /// format drift in the agent output stays visible.
    Pattern,
}

/// Find the PR number advertised by the agent, newest events first.
pub fn extract_pr_number(events: &[ParsedEvent]) -> Option<(i64, PrNumberSource)> {
    for event in events.iter().rev() {
        if event.kind == AgentEventKind::Result {
            if let Some(number) = event
                .raw
                .get("pr_number")
                .or_else(|| event.raw.pointer("/result/pr_number"))
                .and_then(Value::as_i64)
            {
                return Some((number, PrNumberSource::Structured));
            }
        }
    }

    let pattern = Regex::new(r"(?:pull/|PR #|pr #|pull request #?)(\d+)").ok()?;
    for event in events.iter().rev() {
        let rendered = event.raw.to_string();
        let last = pattern
            .captures_iter(&rendered)
            .filter_map(|caps| caps.get(1))
            .filter_map(|m| m.as_str().parse::<i64>().ok())
            .last();
        if let Some(number) = last {
            return Some((number, PrNumberSource::Pattern));
        }
    }
    None
}
