use rmcp::model::{CallToolResult, Content};
use serde::Serialize;

/// Tool response envelope. Every tool returns `Content::text(json_string)`.
#[derive(Debug, Serialize)]
pub struct ToolResponse {
    pub status: &'static str,
    pub content: String,
    pub content_type: &'static str,
    pub metadata: ToolMetadata,
}

#[derive(Debug, Default, Serialize)]
pub struct ToolMetadata {
    pub tool_name: String,
    pub provider_used: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(serialize_with = "serialize_finite_f64")]
    pub duration_seconds: f64,
}

impl ToolMetadata {
    pub fn new(tool_name: &str, duration_seconds: f64) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            provider_used: "none".to_string(),
            duration_seconds,
            ..Default::default()
        }
    }
}

/// Serialize f64, clamping non-finite values (NaN, Inf) to 0.0.
fn serialize_finite_f64<S: serde::Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(if v.is_finite() { *v } else { 0.0 })
}

impl ToolResponse {
    pub fn success(content: String, metadata: ToolMetadata) -> Self {
        Self {
            status: "success",
            content,
            content_type: "text",
            metadata,
        }
    }

    /// Success carrying a serialized value as JSON text.
    pub fn json<T: Serialize>(value: &T, metadata: ToolMetadata) -> Self {
        match serde_json::to_string_pretty(value) {
            Ok(json) => Self {
                status: "success",
                content: json,
                content_type: "json",
                metadata,
            },
            Err(e) => Self::error(format!("serialization failed: {e}"), metadata),
        }
    }

    pub fn error(message: String, metadata: ToolMetadata) -> Self {
        Self {
            status: "error",
            content: message,
            content_type: "text",
            metadata,
        }
    }

    /// Convert to MCP CallToolResult.
    /// Always succeeds at the transport level; failures are reported in the
    /// JSON payload (`"status": "error"`) so sibling tool calls are unaffected.
    pub fn into_call_tool_result(self) -> CallToolResult {
        match serde_json::to_string(&self) {
            Ok(json) => CallToolResult::success(vec![Content::text(json)]),
            Err(e) => {
                let escaped = e.to_string().replace('\\', "\\\\").replace('"', "\\\"");
                CallToolResult::success(vec![Content::text(format!(
                    r#"{{"status":"error","content":"serialization failed: {escaped}","content_type":"text","metadata":{{}}}}"#
                ))])
            }
        }
    }
}
