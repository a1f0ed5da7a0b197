//! Wire protocol: line-delimited JSON frames over the WebSocket session.

use serde::{Deserialize, Serialize};

/// Hard cap on `top_k`.
pub const MAX_TOP_K: usize = 200;
/// Hard cap on `expand_depth`.
pub const MAX_EXPAND_DEPTH: usize = 4;
/// Per-connection in-flight request limit.
pub const MAX_IN_FLIGHT: usize = 16;
/// Per-query wall clock budget in seconds.
pub const QUERY_TIMEOUT_SECS: u64 = 30;

/// Client -> server frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Query {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        index: Option<String>,
        #[serde(default)]
        query: Option<String>,
        #[serde(default)]
        top_k: Option<usize>,
        #[serde(default)]
        expand: Option<bool>,
        #[serde(default)]
        expand_depth: Option<usize>,
        #[serde(default)]
        min_score: Option<f32>,
    },
    ListIndexes {},
    SwitchIndex {
        #[serde(default)]
        index: Option<String>,
    },
}

/// Server -> client frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    QueryResult {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        index: String,
        timing_ms: u64,
        direct: Vec<WireHit>,
        related: Vec<WireRelated>,
        graph: WireGraph,
    },
    IndexList {
        indexes: Vec<WireIndexInfo>,
        current: Option<String>,
        default: Option<String>,
    },
    IndexSwitched {
        index: String,
    },
    /// Unsolicited server push.
    Status {
        uptime_secs: u64,
        indexes: Vec<WireIndexState>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        code: ErrorCode,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    IndexNotFound,
    QueryFailed,
    InvalidRequest,
    IndexBusy,
    RateLimited,
    EmbedFailed,
    Timeout,
    IoFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireHit {
    pub path: String,
    /// File name component, for compact display.
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireRelated {
    pub path: String,
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    pub via: String,
    pub via_name: String,
    pub weight: f32,
    pub depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WireGraph {
    pub nodes: Vec<WireGraphNode>,
    pub edges: Vec<WireGraphEdge>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireGraphNode {
    pub id: String,
    pub path: String,
    pub direct: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireGraphEdge {
    pub source: String,
    pub target: String,
    pub weight: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireIndexInfo {
    pub name: String,
    pub path: String,
    pub file_count: usize,
    pub chunk_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub sample_paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git: Option<WireGitInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireGitInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireIndexState {
    pub name: String,
    /// "ready", "ingesting", or "unloaded".
    pub state: &'static str,
}

impl Response {
    pub fn error(id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            id,
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_request() {
        let frame = r#"{"type":"query","id":"42","query":"auth flow","top_k":5}"#;
        let request: Request = serde_json::from_str(frame).unwrap();
        match request {
            Request::Query {
                id, query, top_k, ..
            } => {
                assert_eq!(id.as_deref(), Some("42"));
                assert_eq!(query.as_deref(), Some("auth flow"));
                assert_eq!(top_k, Some(5));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_parse_list_indexes() {
        let request: Request = serde_json::from_str(r#"{"type":"list_indexes"}"#).unwrap();
        assert!(matches!(request, Request::ListIndexes {}));
    }

    #[test]
    fn test_parse_switch_without_name() {
        let request: Request = serde_json::from_str(r#"{"type":"switch_index"}"#).unwrap();
        match request {
            Request::SwitchIndex { index } => assert!(index.is_none()),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result: Result<Request, _> =
            serde_json::from_str(r#"{"type":"explode"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_error_codes_serialize_screaming() {
        let frame = Response::error(Some("1".to_string()), ErrorCode::IndexNotFound, "nope");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "INDEX_NOT_FOUND");
        assert_eq!(json["id"], "1");
    }

    #[test]
    fn test_query_result_shape() {
        let frame = Response::QueryResult {
            id: None,
            index: "notes".to_string(),
            timing_ms: 12,
            direct: vec![WireHit {
                path: "src/auth.rs".to_string(),
                name: "auth.rs".to_string(),
                doc_type: Some("code".to_string()),
                score: 1.0,
                lines: Some("10-20".to_string()),
                chunk: Some(0),
                url: None,
            }],
            related: vec![],
            graph: WireGraph::default(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "query_result");
        assert_eq!(json["direct"][0]["type"], "code");
        assert_eq!(json["direct"][0]["lines"], "10-20");
        // `id` is omitted entirely when absent.
        assert!(json.get("id").is_none());
    }
}
