//! Tool registry for the runtime — builds tool definitions for the LLM and
//! dispatches tool calls to local handlers, connected nodes, or stubs.

use serde_json::Value;

use sa_domain::config::ToolPolicy;
use sa_domain::tool::ToolDefinition;
use sa_tools::exec::{self, ExecRequest};
use sa_tools::process::{self, ProcessRequest};

use crate::nodes::router::{LocalTool, ToolDestination};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool definitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the set of tool definitions exposed to the LLM.
///
/// When `tool_policy` is `Some`, definitions are filtered through it so that
/// sub-agents only see tools their config permits.
pub fn build_tool_definitions(
    state: &AppState,
    tool_policy: Option<&ToolPolicy>,
) -> Vec<ToolDefinition> {
    let mut defs = Vec::new();

    // ── Built-in local tools ──────────────────────────────────────
    defs.push(ToolDefinition {
        name: "exec".into(),
        description: "Run a shell command. Returns output or a background session ID.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Shell command to execute" },
                "background": { "type": "boolean", "description": "Run in background" },
                "workdir": { "type": "string", "description": "Working directory" },
                "timeout_sec": { "type": "integer", "description": "Hard timeout in seconds" }
            },
            "required": ["command"]
        }),
    });

    defs.push(ToolDefinition {
        name: "process".into(),
        description: "Manage background processes: list, poll, log, write, kill, remove.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["list", "poll", "log", "write", "kill", "clear", "remove"],
                    "description": "Action to perform"
                },
                "session_id": { "type": "string", "description": "Process session ID" },
                "data": { "type": "string", "description": "Data to write to stdin" }
            },
            "required": ["action"]
        }),
    });

    // ── Skill tools ───────────────────────────────────────────────
    defs.push(ToolDefinition {
        name: "skill.read_doc".into(),
        description: "Read the full documentation (SKILL.md) for a skill.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Skill name (e.g. 'apple-notes')" }
            },
            "required": ["name"]
        }),
    });

    defs.push(ToolDefinition {
        name: "skill.read_resource".into(),
        description: "Read a bundled resource from a skill (references/, scripts/, assets/).".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Skill name" },
                "path": { "type": "string", "description": "Resource path (e.g. 'references/api.md')" }
            },
            "required": ["name", "path"]
        }),
    });

    // ── SerialMemory tools ────────────────────────────────────────
    defs.push(ToolDefinition {
        name: "memory.search".into(),
        description: "Search long-term memory for relevant facts, notes, and session history.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "limit": { "type": "integer", "description": "Max results (default 10)" }
            },
            "required": ["query"]
        }),
    });

    defs.push(ToolDefinition {
        name: "memory.ingest".into(),
        description: "Store a fact or note in long-term memory.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "Content to store" },
                "source": { "type": "string", "description": "Source label (e.g. 'user', 'agent')" }
            },
            "required": ["content"]
        }),
    });

    // ── In-process Memory Store tools (spec §4.B) ─────────────────
    defs.push(ToolDefinition {
        name: "memory_store".into(),
        description: "Store a fact, preference, or episode in the in-process memory store.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "area": { "type": "string", "enum": ["identity", "preferences", "knowledge", "solutions", "episodes"], "description": "Memory area" },
                "content": { "type": "string", "description": "Content to store" },
                "tags": { "type": "array", "items": { "type": "string" } },
                "confidence": { "type": "number", "description": "Confidence 0.0-1.0 (default 0.8)" }
            },
            "required": ["area", "content"]
        }),
    });

    defs.push(ToolDefinition {
        name: "memory_search".into(),
        description: "Search the in-process memory store across one or more areas.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "areas": { "type": "array", "items": { "type": "string" }, "description": "Areas to search (default: all)" },
                "limit": { "type": "integer", "description": "Max results (default 10)" }
            },
            "required": ["query"]
        }),
    });

    // ── Knowledge Store tools (spec §4.C) ──────────────────────────
    defs.push(ToolDefinition {
        name: "knowledge.search".into(),
        description: "Full-text search knowledge objects by title/data/tags.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "collection_id": { "type": "string", "description": "Optional collection UUID to scope the search" },
                "limit": { "type": "integer", "description": "Max results (default 10)" }
            },
            "required": ["query"]
        }),
    });

    defs.push(ToolDefinition {
        name: "knowledge.create_object".into(),
        description: "Create a knowledge object in a collection.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "collection_id": { "type": "string", "description": "Collection UUID" },
                "title": { "type": "string" },
                "data": { "type": "object", "description": "Arbitrary structured fields" },
                "tags": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["collection_id", "title"]
        }),
    });

    // ── Review Queue tool (spec §4.E) ──────────────────────────────
    defs.push(ToolDefinition {
        name: "review.request".into(),
        description: "Enqueue a human-in-the-loop review item (triage, approve, classify, verify, etc.) and pause for a decision.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "kind": { "type": "string", "enum": ["approve", "classify", "match", "select", "verify", "freeform", "triage", "verify_fact"] },
                "title": { "type": "string" },
                "description": { "type": "string" },
                "content": { "type": "array", "description": "Ordered content blocks shown to the reviewer" },
                "proposed_action": { "type": "array", "description": "Actions to take if approved" },
                "alternatives": { "type": "array" },
                "priority": { "type": "integer", "description": "0-10, higher reviewed first (default 5)" },
                "tags": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["kind", "title", "proposed_action"]
        }),
    });

    // ── Stub tools (common aliases that aren't wired yet) ─────────
    defs.push(ToolDefinition {
        name: "web.search".into(),
        description: "Search the web (SERP). Currently unavailable — returns an error with alternatives.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" }
            },
            "required": ["query"]
        }),
    });

    defs.push(ToolDefinition {
        name: "http.request".into(),
        description: "Make an HTTP request. Currently unavailable — returns an error with alternatives.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "URL to fetch" },
                "method": { "type": "string", "description": "HTTP method (GET, POST, etc.)" }
            },
            "required": ["url"]
        }),
    });

    // ── Agent delegation tools ──────────────────────────────────────
    // Only expose these if agents are configured.
    if let Some(ref agents) = state.agents {
        if !agents.is_empty() {
            defs.push(ToolDefinition {
                name: "agent.run".into(),
                description: "Delegate a task to a specialist sub-agent. The sub-agent runs in its own session with scoped tools and skills. Returns the agent's final answer.".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "agent_id": { "type": "string", "description": "ID of the agent to run (from agent.list)" },
                        "task": { "type": "string", "description": "The task or question to give the agent" },
                        "model": { "type": "string", "description": "Optional model override (e.g. 'openai/gpt-4o')" }
                    },
                    "required": ["agent_id", "task"]
                }),
            });

            defs.push(ToolDefinition {
                name: "agent.list".into(),
                description: "List all available sub-agents and their capabilities.".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {}
                }),
            });
        }
    }

    // ── Node-advertised tools ─────────────────────────────────────
    // Add definitions for capabilities advertised by connected nodes.
    for node_info in state.nodes.list() {
        for cap in &node_info.capabilities {
            // Don't duplicate tools we already defined.
            if defs.iter().any(|d| d.name == cap.name) {
                continue;
            }
            defs.push(ToolDefinition {
                name: cap.name.clone(),
                description: cap.description.clone(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {},
                    "additionalProperties": true
                }),
            });
        }
    }

    // ── Apply tool policy filter ─────────────────────────────────
    if let Some(policy) = tool_policy {
        defs.retain(|d| policy.allows(&d.name));
    }

    defs
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dispatch a single tool call. Returns (result_content, is_error).
pub async fn dispatch_tool(
    state: &AppState,
    tool_name: &str,
    arguments: &Value,
    session_key: Option<&str>,
    agent_ctx: Option<&super::agent::AgentContext>,
) -> (String, bool) {
    // Handle our built-in tools first.
    match tool_name {
        "exec" => dispatch_exec(state, arguments).await,
        "process" => dispatch_process(state, arguments).await,
        "skill.read_doc" => dispatch_skill_read_doc(state, arguments),
        "skill.read_resource" => dispatch_skill_read_resource(state, arguments),
        "memory.search" => dispatch_memory_search(state, arguments).await,
        "memory.ingest" => dispatch_memory_ingest(state, arguments).await,
        "memory_store" => dispatch_memory_store(state, arguments).await,
        "memory_search" => dispatch_memory_search_store(state, arguments).await,
        "knowledge.search" => dispatch_knowledge_search(state, arguments),
        "knowledge.create_object" => dispatch_knowledge_create_object(state, arguments, session_key),
        "review.request" => dispatch_review_request(state, arguments, session_key).await,
        "agent.run" => dispatch_agent_run(state, arguments, session_key, agent_ctx).await,
        "agent.list" => dispatch_agent_list(state),
        "web.search" => stub_tool("web.search", "Web search is not yet configured. Use exec with curl or a search CLI tool as an alternative."),
        "http.request" => stub_tool("http.request", "HTTP requests are not yet configured. Use exec with curl as an alternative."),
        _ => {
            // Try routing to a connected node via ToolRouter.
            dispatch_to_node(state, tool_name, arguments, session_key).await
        }
    }
}

async fn dispatch_exec(state: &AppState, arguments: &Value) -> (String, bool) {
    let req: ExecRequest = match serde_json::from_value(arguments.clone()) {
        Ok(r) => r,
        Err(e) => return (format!("invalid exec arguments: {e}"), true),
    };
    let resp = exec::exec(&state.processes, req).await;
    let json = serde_json::to_string_pretty(&resp).unwrap_or_default();
    (json, false)
}

async fn dispatch_process(state: &AppState, arguments: &Value) -> (String, bool) {
    let req: ProcessRequest = match serde_json::from_value(arguments.clone()) {
        Ok(r) => r,
        Err(e) => return (format!("invalid process arguments: {e}"), true),
    };
    let resp = process::handle_process(&state.processes, req).await;
    let json = serde_json::to_string_pretty(&resp).unwrap_or_default();
    (json, false)
}

fn dispatch_skill_read_doc(state: &AppState, arguments: &Value) -> (String, bool) {
    let name = arguments
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    match state.skills.read_doc(name) {
        Ok(doc) => (doc, false),
        Err(e) => (format!("skill doc error: {e}"), true),
    }
}

fn dispatch_skill_read_resource(state: &AppState, arguments: &Value) -> (String, bool) {
    let name = arguments
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let path = arguments
        .get("path")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    match state.skills.read_resource(name, path) {
        Ok(content) => (content, false),
        Err(e) => (format!("resource error: {e}"), true),
    }
}

async fn dispatch_memory_search(state: &AppState, arguments: &Value) -> (String, bool) {
    let query = arguments
        .get("query")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let limit = arguments
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32);

    let req = sa_memory::RagSearchRequest { query, limit };

    match state.memory.search(req).await {
        Ok(results) => {
            let json = serde_json::to_string_pretty(&results).unwrap_or_default();
            (json, false)
        }
        Err(e) => (format!("memory search error: {e}"), true),
    }
}

async fn dispatch_memory_ingest(state: &AppState, arguments: &Value) -> (String, bool) {
    let content = arguments
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let source = arguments
        .get("source")
        .and_then(|v| v.as_str())
        .map(String::from);

    let req = sa_memory::MemoryIngestRequest {
        content,
        source,
        session_id: None,
        metadata: None,
        extract_entities: None,
    };

    match state.memory.ingest(req).await {
        Ok(resp) => {
            let json = serde_json::to_string_pretty(&resp).unwrap_or_default();
            (json, false)
        }
        Err(e) => (format!("memory ingest error: {e}"), true),
    }
}

/// Best-effort embedding of a single string via the `embedding` role.
/// Returns `None` (never an error) when no embedding provider is
/// configured or the call fails — callers degrade to text-only search
/// per the spec 4.B failure semantics.
pub(crate) async fn try_embed(state: &AppState, text: &str) -> Option<Vec<f32>> {
    let provider = state.llm.for_role("embedding")?;
    let req = sa_providers::traits::EmbeddingsRequest { input: vec![text.to_string()], model: None };
    match provider.embeddings(req).await {
        Ok(resp) => resp.embeddings.into_iter().next(),
        Err(e) => {
            tracing::warn!(error = %e, "embedding call failed, degrading to text-only search");
            None
        }
    }
}

async fn dispatch_memory_store(state: &AppState, arguments: &Value) -> (String, bool) {
    let area = match arguments.get("area").and_then(|v| v.as_str()).map(str::parse::<sa_storage::model::MemoryArea>) {
        Some(Ok(a)) => a,
        Some(Err(e)) => return (e, true),
        None => return ("missing required argument: area".into(), true),
    };
    let content = match arguments.get("content").and_then(|v| v.as_str()) {
        Some(c) if !c.is_empty() => c,
        _ => return ("missing required argument: content".into(), true),
    };
    let tags: Vec<String> = arguments
        .get("tags")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    let confidence = arguments.get("confidence").and_then(|v| v.as_f64()).map(|v| v as f32).unwrap_or(0.8);
    let embedding = try_embed(state, content).await.unwrap_or_default();

    let write = sa_storage::memory::WriteMemory {
        area,
        content,
        summary: None,
        tags,
        embedding,
        confidence,
        source: sa_storage::model::MemorySource::Inferred,
        conversation_id: None,
        channel_id: None,
        project_id: None,
        scope: None,
        visibility: sa_storage::model::MemoryVisibility::Shared,
        expires_at: None,
    };
    match state.db.write_memory(write) {
        Ok(memory) => (serde_json::to_string_pretty(&memory).unwrap_or_default(), false),
        Err(e) => (format!("memory store error: {e}"), true),
    }
}

async fn dispatch_memory_search_store(state: &AppState, arguments: &Value) -> (String, bool) {
    let query = arguments.get("query").and_then(|v| v.as_str()).unwrap_or("");
    if query.is_empty() {
        return ("missing required argument: query".into(), true);
    }
    let areas: Option<Vec<sa_storage::model::MemoryArea>> = arguments
        .get("areas")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()?.parse().ok()).collect());
    let limit = arguments.get("limit").and_then(|v| v.as_u64()).unwrap_or(10) as usize;
    let query_embedding = try_embed(state, query).await;

    let req = sa_storage::memory::SearchRequest {
        query,
        query_embedding,
        areas,
        project: None,
        limit,
        min_confidence: None,
        include_superseded: false,
    };
    match state.db.search_memory(req) {
        Ok(result) => (serde_json::to_string_pretty(&result.hits).unwrap_or_default(), false),
        Err(e) => (format!("memory search error: {e}"), true),
    }
}

fn dispatch_knowledge_search(state: &AppState, arguments: &Value) -> (String, bool) {
    let query = arguments.get("query").and_then(|v| v.as_str()).unwrap_or("");
    if query.is_empty() {
        return ("missing required argument: query".into(), true);
    }
    let collection_id = arguments.get("collection_id").and_then(|v| v.as_str()).and_then(|s| s.parse().ok());
    let limit = arguments.get("limit").and_then(|v| v.as_i64()).unwrap_or(10);
    match state.db.search_knowledge_objects(query, collection_id, limit) {
        Ok(objects) => (serde_json::to_string_pretty(&objects).unwrap_or_default(), false),
        Err(e) => (format!("knowledge search error: {e}"), true),
    }
}

fn dispatch_knowledge_create_object(state: &AppState, arguments: &Value, session_key: Option<&str>) -> (String, bool) {
    let collection_id = match arguments.get("collection_id").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()) {
        Some(id) => id,
        None => return ("missing or invalid required argument: collection_id".into(), true),
    };
    let title = match arguments.get("title").and_then(|v| v.as_str()) {
        Some(t) if !t.is_empty() => t,
        _ => return ("missing required argument: title".into(), true),
    };
    let data = arguments.get("data").cloned().unwrap_or(serde_json::json!({}));
    let tags: Vec<String> = arguments
        .get("tags")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    let created_by = session_key.unwrap_or("agent");

    match state.db.create_knowledge_object(collection_id, title, data, tags, created_by) {
        Ok(obj) => (serde_json::to_string_pretty(&obj).unwrap_or_default(), false),
        Err(e) => (format!("knowledge create_object error: {e}"), true),
    }
}

async fn dispatch_review_request(state: &AppState, arguments: &Value, session_key: Option<&str>) -> (String, bool) {
    let kind = match arguments.get("kind").and_then(|v| v.as_str()).map(str::parse::<sa_storage::model::ReviewType>) {
        Some(Ok(k)) => k,
        Some(Err(e)) => return (e, true),
        None => return ("missing required argument: kind".into(), true),
    };
    let title = match arguments.get("title").and_then(|v| v.as_str()) {
        Some(t) if !t.is_empty() => t,
        _ => return ("missing required argument: title".into(), true),
    };
    let proposed_action = arguments.get("proposed_action").cloned().unwrap_or(serde_json::json!([]));
    let content = arguments.get("content").cloned().unwrap_or(serde_json::json!([]));
    let alternatives = arguments.get("alternatives").cloned().unwrap_or(serde_json::json!([]));
    let description = arguments.get("description").and_then(|v| v.as_str());
    let priority = arguments.get("priority").and_then(|v| v.as_i64()).unwrap_or(5) as i32;
    let tags: Vec<String> = arguments
        .get("tags")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    let new = sa_storage::review::NewReviewItem {
        agent_id: session_key.unwrap_or("agent"),
        conversation_id: None,
        kind,
        title,
        description,
        content,
        proposed_action,
        alternatives,
        priority,
        tags,
        batch_id: None,
        expires_at: None,
    };
    match state.db.enqueue_review(new) {
        Ok(item) => {
            crate::runtime::review::on_review_created(state, &item).await;
            (serde_json::to_string_pretty(&item).unwrap_or_default(), false)
        }
        Err(e) => (format!("review enqueue error: {e}"), true),
    }
}

async fn dispatch_agent_run(
    state: &AppState,
    arguments: &Value,
    session_key: Option<&str>,
    agent_ctx: Option<&super::agent::AgentContext>,
) -> (String, bool) {
    let agent_id = match arguments.get("agent_id").and_then(|v| v.as_str()) {
        Some(id) => id,
        None => return ("missing required argument: agent_id".into(), true),
    };
    let task = match arguments.get("task").and_then(|v| v.as_str()) {
        Some(t) => t,
        None => return ("missing required argument: task".into(), true),
    };
    let model = arguments
        .get("model")
        .and_then(|v| v.as_str())
        .map(String::from);

    let parent_key = session_key.unwrap_or("anonymous");
    // depth=0 at the master conversation; spawn_agent bounds the *child's*
    // own `limits.max_depth` against depth+1 (see `run_agent`).
    let parent_depth = agent_ctx.map(|a| a.depth).unwrap_or(0);

    super::agent::run_agent(state, agent_id, task, model, parent_key, parent_depth).await
}

fn dispatch_agent_list(state: &AppState) -> (String, bool) {
    let manager = match &state.agents {
        Some(m) => m,
        None => {
            return (
                serde_json::json!({ "agents": [], "count": 0 }).to_string(),
                false,
            );
        }
    };

    let agents: Vec<_> = manager
        .list()
        .into_iter()
        .map(|id| {
            let runtime = manager.get(&id);
            match runtime {
                Some(r) => serde_json::json!({
                    "id": id,
                    "tools_allow": r.config.tool_policy.allow,
                    "tools_deny": r.config.tool_policy.deny,
                    "models": r.config.models,
                    "memory_mode": r.config.memory_mode,
                }),
                None => serde_json::json!({ "id": id }),
            }
        })
        .collect();

    (
        serde_json::json!({
            "agents": agents,
            "count": agents.len(),
        })
        .to_string(),
        false,
    )
}

fn stub_tool(name: &str, message: &str) -> (String, bool) {
    (
        serde_json::json!({
            "error": format!("Tool '{name}' is not available"),
            "message": message,
            "suggestion": "Use the 'exec' tool with appropriate CLI commands as a workaround."
        })
        .to_string(),
        true,
    )
}

async fn dispatch_to_node(
    state: &AppState,
    tool_name: &str,
    arguments: &Value,
    session_key: Option<&str>,
) -> (String, bool) {
    match state.tool_router.resolve(tool_name) {
        ToolDestination::Node { node_id } => {
            let result = state
                .tool_router
                .dispatch_to_node(
                    &node_id,
                    tool_name,
                    arguments.clone(),
                    session_key.map(String::from),
                )
                .await;
            if result.success {
                (result.result.to_string(), false)
            } else {
                let err_msg = result
                    .error
                    .unwrap_or_else(|| "unknown node error".into());
                (err_msg, true)
            }
        }
        ToolDestination::Local { tool_type } => {
            // Shouldn't reach here since we handle exec/process above,
            // but handle gracefully.
            match tool_type {
                LocalTool::Exec => dispatch_exec(state, arguments).await,
                LocalTool::Process => dispatch_process(state, arguments).await,
            }
        }
        ToolDestination::Unknown => (
            serde_json::json!({
                "error": format!("Unknown tool: '{tool_name}'"),
                "message": "This tool is not registered. Check available tools.",
            })
            .to_string(),
            true,
        ),
    }
}
