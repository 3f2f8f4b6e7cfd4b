//! Tool registry for the admin loop.
//!
//! Every tool carries a static [`ToolKind`]. The effective kind of a call can
//! only be escalated: a model-declared tag, an unknown tool name, or a
//! state-changing statement passed to a read-only tool all make the call
//! mutating. Nothing downgrades a mutating tool.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use tabula_core::capability::{ExecutionError, QueryExecutor, QueryOutput, ToolCall};
use tabula_core::types::ToolKind;

pub const INSPECT_SCHEMA: &str = "inspect_schema";
pub const RUN_SELECT: &str = "run_select";
pub const CREATE_INDEX: &str = "create_index";
pub const EXECUTE_WRITE: &str = "execute_write";
pub const DROP_TABLE: &str = "drop_table";

/// Static description of one tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    pub kind: ToolKind,
    pub description: String,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, kind: ToolKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
        }
    }
}

static MUTATING_STATEMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(insert|update|delete|drop|alter|create|replace|attach|detach|vacuum|reindex|pragma)\b",
    )
    .expect("Invalid mutating statement regex")
});

/// Whether a statement can change the data source.
pub fn is_mutating_statement(statement: &str) -> bool {
    MUTATING_STATEMENT_RE.is_match(statement)
}

/// Named tools known to the admin loop.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in SQL administration tools.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ToolSpec::new(
            INSPECT_SCHEMA,
            ToolKind::ReadOnly,
            "List tables, or the columns of one table",
        ));
        registry.register(ToolSpec::new(
            RUN_SELECT,
            ToolKind::ReadOnly,
            "Run a read-only SELECT statement",
        ));
        registry.register(ToolSpec::new(
            CREATE_INDEX,
            ToolKind::Mutating,
            "Create an index",
        ));
        registry.register(ToolSpec::new(
            EXECUTE_WRITE,
            ToolKind::Mutating,
            "Run an INSERT, UPDATE or DELETE statement",
        ));
        registry.register(ToolSpec::new(
            DROP_TABLE,
            ToolKind::Mutating,
            "Drop a table",
        ));
        registry
    }

    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    /// Registered tools sorted by name.
    pub fn specs(&self) -> Vec<&ToolSpec> {
        let mut specs: Vec<&ToolSpec> = self.tools.values().collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Effective kind of a call.
    pub fn kind_of(&self, call: &ToolCall) -> ToolKind {
        let Some(spec) = self.tools.get(&call.name) else {
            return ToolKind::Mutating;
        };
        if spec.kind == ToolKind::Mutating || call.declared_mutating {
            return ToolKind::Mutating;
        }
        match call.statement() {
            Some(statement) if is_mutating_statement(statement) => ToolKind::Mutating,
            _ => ToolKind::ReadOnly,
        }
    }
}

/// Run a tool call against the executor.
pub async fn run_tool(
    executor: &dyn QueryExecutor,
    call: &ToolCall,
) -> Result<QueryOutput, ExecutionError> {
    if call.name == INSPECT_SCHEMA {
        let table = call.arguments.get("table").and_then(|v| v.as_str());
        return executor.describe(table).await;
    }
    let statement = call
        .statement()
        .ok_or_else(|| ExecutionError::Rejected("missing statement argument".to_string()))?;
    executor.execute(statement).await
}
