//! LLM reasoner contract and tool registration.
//!
//! The reasoner is an external, stateful collaborator addressed by an opaque
//! agent id. The engine talks to it through `ReasonerClient` and hands it a
//! capability table of typed tools; the reasoner only ever sees the declared
//! schemas, never the handlers.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::decision::Verdict;
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::graph::RelationshipFilter;
use crate::history::HistoryStore;
use crate::index::{KnnFilter, VectorIndex};

/// A tool definition exposed to the reasoner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    /// Tool name (must be unique)
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema for input parameters
    pub input_schema: Value,
}

impl ToolDef {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: Value::Object(Default::default()),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }
}

/// Type alias for an async tool handler.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// Capability table mapping tool names to typed handlers.
pub struct ToolRegistry {
    tools: HashMap<String, (ToolDef, ToolHandler)>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool with its handler.
    pub fn register(&mut self, tool: ToolDef, handler: ToolHandler) {
        self.tools.insert(tool.name.clone(), (tool, handler));
    }

    /// Get a tool definition by name.
    pub fn get_tool(&self, name: &str) -> Option<&ToolDef> {
        self.tools.get(name).map(|(tool, _)| tool)
    }

    /// All tool definitions, sorted by name for a stable declaration order.
    pub fn defs(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().map(|(tool, _)| tool.clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool by name.
    pub async fn execute(&self, name: &str, input: Value) -> Result<Value> {
        let (_, handler) = self
            .tools
            .get(name)
            .ok_or_else(|| Error::Reasoner(format!("unknown tool: {}", name)))?;

        handler(input).await
    }

    /// Number of registered tools.
    pub fn count(&self) -> usize {
        self.tools.len()
    }
}

/// Build the fraud-analysis tool set over the engine's collaborators.
pub fn fraud_tools(
    store: Arc<dyn HistoryStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: &EngineConfig,
) -> ToolRegistry {
    let knn_k = config.knn_k;
    let knn_candidates = config.knn_candidates;
    let mut registry = ToolRegistry::new();

    {
        let store = store.clone();
        let tool = ToolDef::new(
            "lookup_customer",
            "Fetch a customer's baseline profile: amount statistics, typical \
             merchant categories and countries, and active hours.",
        )
        .with_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "customer_id": {
                    "type": "string",
                    "description": "The customer to look up"
                }
            },
            "required": ["customer_id"]
        }));

        let handler: ToolHandler = Arc::new(move |input| {
            let store = store.clone();
            Box::pin(async move {
                let customer_id = require_str(&input, "customer_id")?;
                let profile = store.get_profile(&customer_id).await?;
                Ok(serde_json::json!({ "profile": profile }))
            })
        });
        registry.register(tool, handler);
    }

    {
        let store = store.clone();
        let tool = ToolDef::new(
            "lookup_relationships",
            "List known relationships for an entity, filtered by confidence \
             and activity.",
        )
        .with_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "entity_id": {
                    "type": "string",
                    "description": "The entity whose relationships to list"
                },
                "min_confidence": {
                    "type": "number",
                    "description": "Minimum relationship confidence (0.0-1.0)",
                    "default": 0.0
                },
                "only_active": {
                    "type": "boolean",
                    "default": true
                }
            },
            "required": ["entity_id"]
        }));

        let handler: ToolHandler = Arc::new(move |input| {
            let store = store.clone();
            Box::pin(async move {
                let entity_id = require_str(&input, "entity_id")?;
                let filter = RelationshipFilter {
                    min_confidence: input
                        .get("min_confidence")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0),
                    only_active: input
                        .get("only_active")
                        .and_then(Value::as_bool)
                        .unwrap_or(true),
                    relationship_types: None,
                };
                let rels = store.get_relationships(&entity_id, &filter).await?;
                Ok(serde_json::json!({ "count": rels.len(), "relationships": rels }))
            })
        });
        registry.register(tool, handler);
    }

    {
        let tool = ToolDef::new(
            "lookup_similar_by_text",
            "Embed a free-text transaction description and return the most \
             similar historical transactions.",
        )
        .with_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "Transaction description to search with"
                },
                "k": {
                    "type": "integer",
                    "description": "Number of neighbors to return",
                    "default": knn_k
                }
            },
            "required": ["text"]
        }));

        let handler: ToolHandler = Arc::new(move |input| {
            let store = store.clone();
            let index = index.clone();
            let embedder = embedder.clone();
            Box::pin(async move {
                let text = require_str(&input, "text")?;
                let k = input
                    .get("k")
                    .and_then(Value::as_u64)
                    .map(|k| k as usize)
                    .unwrap_or(knn_k)
                    .clamp(1, 20);

                let vector = embedder.embed(&text).await?;
                let hits = index
                    .knn(&vector, k, knn_candidates, Some(&KnnFilter::new()))
                    .await?;

                let mut neighbors = Vec::with_capacity(hits.len());
                for hit in hits {
                    let txn = store.get_transaction(&hit.doc_id).await?;
                    neighbors.push(serde_json::json!({
                        "txn_id": hit.doc_id,
                        "similarity": hit.similarity,
                        "transaction": txn,
                    }));
                }
                Ok(serde_json::json!({ "count": neighbors.len(), "neighbors": neighbors }))
            })
        });
        registry.register(tool, handler);
    }

    registry
}

fn require_str(input: &Value, key: &str) -> Result<String> {
    input
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .ok_or_else(|| Error::Reasoner(format!("{} is required", key)))
}

/// A tool invocation requested by the reasoner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Opaque call id to echo back with the output
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

/// Output of one executed tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub call_id: String,
    pub output: Value,
}

/// One turn of a reasoner run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The reasoner produced its final message
    Completed { message: String },
    /// The reasoner wants these tools executed before it can continue
    ToolCalls(Vec<ToolCallRequest>),
}

/// A stateful tool-using reasoner, addressable by an opaque agent id.
///
/// Tool calls are synchronous from the reasoner's perspective: after a
/// `RunOutcome::ToolCalls` turn the caller executes the requested tools,
/// submits the outputs, and runs again.
#[async_trait]
pub trait ReasonerClient: Send + Sync {
    /// Open a conversation thread.
    async fn create_thread(&self) -> Result<String>;

    /// Append a user message to a thread.
    async fn post_message(&self, thread_id: &str, content: &str) -> Result<()>;

    /// Advance the thread with the given tool declarations.
    async fn run(&self, thread_id: &str, tools: &[ToolDef]) -> Result<RunOutcome>;

    /// Provide outputs for the tool calls requested by the last run.
    async fn submit_tool_outputs(&self, thread_id: &str, outputs: Vec<ToolOutput>) -> Result<()>;

    /// All messages on the thread, oldest first.
    async fn list_messages(&self, thread_id: &str) -> Result<Vec<String>>;
}

/// The structured verdict a reasoner run must produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasonerVerdict {
    pub recommendation: Verdict,
    pub rationale: String,
    /// 0-100
    pub stage2_score: f64,
    /// 0-1; defaults to 0.5 when the reasoner omits it
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

impl ReasonerVerdict {
    fn normalize(mut self) -> Self {
        self.stage2_score = self.stage2_score.clamp(0.0, 100.0);
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self
    }
}

/// Parse a structured verdict out of a reasoner message.
///
/// Accepts a bare JSON object, a fenced ```json block, or a JSON object
/// embedded in prose. Returns `None` when no parsable verdict is found.
pub fn parse_verdict(message: &str) -> Option<ReasonerVerdict> {
    // Bare JSON first.
    if let Ok(verdict) = serde_json::from_str::<ReasonerVerdict>(message.trim()) {
        return Some(verdict.normalize());
    }

    // Fenced code block.
    let fence = Regex::new(r"```(?:json)?\s*([\s\S]*?)```").ok()?;
    if let Some(captures) = fence.captures(message) {
        if let Ok(verdict) = serde_json::from_str::<ReasonerVerdict>(captures[1].trim()) {
            return Some(verdict.normalize());
        }
    }

    // Last resort: every balanced object that mentions a recommendation.
    for candidate in balanced_objects(message) {
        if let Ok(verdict) = serde_json::from_str::<ReasonerVerdict>(candidate) {
            return Some(verdict.normalize());
        }
    }

    None
}

/// Substrings of `text` that are brace-balanced JSON-object candidates.
fn balanced_objects(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut candidates = Vec::new();

    let mut start = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(s) = start.take() {
                            candidates.push(&text[s..=i]);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    candidates
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::testing::HashEmbedder;
    use crate::history::SqliteHistoryStore;
    use crate::index::InMemoryVectorIndex;
    use crate::transaction::fixtures;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_verdict_bare_json() {
        let verdict = parse_verdict(
            r#"{"recommendation": "BLOCK", "rationale": "pattern matches known fraud", "stage2_score": 92.0, "confidence": 0.85}"#,
        )
        .unwrap();

        assert_eq!(verdict.recommendation, Verdict::Block);
        assert_eq!(verdict.stage2_score, 92.0);
        assert_eq!(verdict.confidence, 0.85);
    }

    #[test]
    fn test_parse_verdict_fenced_block() {
        let message = "Based on the retrieved neighbors, here is my assessment:\n\n\
                       ```json\n\
                       {\"recommendation\": \"INVESTIGATE\", \"rationale\": \"two similar flagged transactions\", \"stage2_score\": 55}\n\
                       ```\n";
        let verdict = parse_verdict(message).unwrap();

        assert_eq!(verdict.recommendation, Verdict::Investigate);
        assert_eq!(verdict.stage2_score, 55.0);
        // Omitted confidence defaults.
        assert_eq!(verdict.confidence, 0.5);
    }

    #[test]
    fn test_parse_verdict_embedded_in_prose() {
        let message = "I considered several factors. Verdict: \
                       {\"recommendation\": \"APPROVE\", \"rationale\": \"consistent with baseline\", \"stage2_score\": 10, \"confidence\": 0.9} \
                       Let me know if you need more detail.";
        let verdict = parse_verdict(message).unwrap();
        assert_eq!(verdict.recommendation, Verdict::Approve);
    }

    #[test]
    fn test_parse_verdict_clamps_out_of_range() {
        let verdict = parse_verdict(
            r#"{"recommendation": "BLOCK", "rationale": "x", "stage2_score": 250, "confidence": 3.0}"#,
        )
        .unwrap();
        assert_eq!(verdict.stage2_score, 100.0);
        assert_eq!(verdict.confidence, 1.0);
    }

    #[test]
    fn test_parse_verdict_rejects_garbage() {
        assert!(parse_verdict("no structure here at all").is_none());
        assert!(parse_verdict("{\"unrelated\": true}").is_none());
    }

    #[test]
    fn test_balanced_objects_skips_braces_in_strings() {
        let text = r#"prefix {"a": "val with } brace", "b": 1} suffix"#;
        let objects = balanced_objects(text);
        assert_eq!(objects.len(), 1);
        assert!(serde_json::from_str::<Value>(objects[0]).is_ok());
    }

    #[tokio::test]
    async fn test_registry_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry.execute("nope", Value::Null).await.unwrap_err();
        assert!(err.to_string().contains("unknown tool"));
    }

    #[tokio::test]
    async fn test_fraud_tools_lookup_customer() {
        let store = Arc::new(SqliteHistoryStore::in_memory().unwrap());
        store.upsert_profile(&fixtures::profile()).unwrap();
        let index = Arc::new(InMemoryVectorIndex::new(8));
        let embedder = Arc::new(HashEmbedder::new(8));

        let registry = fraud_tools(store, index, embedder, &EngineConfig::default());
        assert_eq!(registry.count(), 3);

        let result = registry
            .execute(
                "lookup_customer",
                serde_json::json!({ "customer_id": "CUST-100" }),
            )
            .await
            .unwrap();
        assert_eq!(result["profile"]["customer_id"], "CUST-100");

        let result = registry
            .execute("lookup_customer", serde_json::json!({ "customer_id": "nobody" }))
            .await
            .unwrap();
        assert!(result["profile"].is_null());
    }

    #[tokio::test]
    async fn test_fraud_tools_lookup_similar_by_text() {
        let store = Arc::new(SqliteHistoryStore::in_memory().unwrap());
        store.insert_transaction(&fixtures::grocery_txn()).unwrap();
        let embedder = Arc::new(HashEmbedder::new(8));
        let index = Arc::new(InMemoryVectorIndex::new(8));
        let vector = embedder.embed("45.99 USD US grocery card purchase").await.unwrap();
        index
            .insert("TXN-0001", vector, crate::index::DocMeta::default())
            .await
            .unwrap();

        let registry = fraud_tools(store, index, embedder, &EngineConfig::default());
        let result = registry
            .execute(
                "lookup_similar_by_text",
                serde_json::json!({ "text": "45.99 USD US grocery card purchase" }),
            )
            .await
            .unwrap();

        assert_eq!(result["count"], 1);
        assert_eq!(result["neighbors"][0]["txn_id"], "TXN-0001");
        assert!(result["neighbors"][0]["transaction"]["amount"].as_f64().is_some());
    }

    #[tokio::test]
    async fn test_tool_defs_are_schema_typed_and_sorted() {
        let store = Arc::new(SqliteHistoryStore::in_memory().unwrap());
        let index = Arc::new(InMemoryVectorIndex::new(8));
        let embedder = Arc::new(HashEmbedder::new(8));

        let registry = fraud_tools(store, index, embedder, &EngineConfig::default());
        let defs = registry.defs();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["lookup_customer", "lookup_relationships", "lookup_similar_by_text"]
        );
        for def in &defs {
            assert!(def.input_schema.get("properties").is_some());
        }
    }
}
