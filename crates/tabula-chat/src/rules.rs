//! Offline rule-based model.
//!
//! Keyword rules stand in for a hosted model so the service runs end to end
//! with no provider configured. Classification is a keyword match. Query
//! generation builds a single-table SELECT and uses the previous execution
//! error to pick the next candidate column or table name. Admin assistance
//! follows a small fixed plan per request kind (drop, index, schema).
//!
//! Conversation memory is a per-handle record of the last table mentioned,
//! so "and the newest ones?" can follow "list the orders".

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use tabula_core::capability::{
    AdminStep, Generation, GenerationRequest, ModelError, ModelService, ToolCall, TranscriptEntry,
};
use tabula_core::types::{MemoryHandle, Mode, TokenUsage};

use crate::tools::{CREATE_INDEX, DROP_TABLE, INSPECT_SCHEMA};

// =============================================================================
// Patterns
// =============================================================================

static ADMIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(drop|delete|truncate|alter|create|index|indexes|vacuum|insert|update|grant|revoke|schema|describe|remove|clean\s+up)\b",
    )
    .expect("Invalid admin regex")
});

static LITERAL_QUERY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^\s*(select|with)\b").expect("Invalid literal query regex"));

static COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(how\s+many|count|number\s+of)\b").expect("Invalid count regex")
});

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*|\d+").expect("Invalid word regex"));

static FROM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bFROM\s+([A-Za-z_][A-Za-z0-9_]*)").expect("Invalid from regex")
});

static ORDER_BY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bORDER\s+BY\s+([A-Za-z_][A-Za-z0-9_]*)").expect("Invalid order regex")
});

/// Words that never name a table.
static STOP_WORDS: &[&str] = &[
    "a", "an", "the", "me", "my", "our", "all", "of", "are", "is", "there", "in", "how", "many",
    "what", "which", "list", "show", "give", "find", "get", "count", "number", "top", "largest",
    "biggest", "smallest", "latest", "newest", "oldest", "earliest", "recent", "most", "least",
    "expensive", "cheapest", "highest", "lowest", "first", "last", "please", "by", "with",
    "where", "table", "tables", "rows", "records", "and", "them", "those", "these", "for", "to",
    "do", "we", "have", "from", "can", "you", "i", "on", "it", "drop", "remove", "delete",
    "create", "add", "index", "clean", "up", "describe", "schema", "ones", "every", "each",
    "some", "any",
];

static NUMBER_WORDS: &[(&str, u32)] = &[
    ("one", 1),
    ("two", 2),
    ("three", 3),
    ("four", 4),
    ("five", 5),
    ("six", 6),
    ("seven", 7),
    ("eight", 8),
    ("nine", 9),
    ("ten", 10),
    ("twenty", 20),
];

/// Candidate columns for "largest"-style ordering, tried in order.
const VALUE_COLUMNS: &[&str] = &["total", "amount", "price", "value"];
/// Candidate columns for "latest"-style ordering, tried in order.
const DATE_COLUMNS: &[&str] = &["created_at", "placed_at", "date"];

const DEFAULT_LIMIT: u32 = 20;

// =============================================================================
// Memory
// =============================================================================

#[derive(Debug, Clone, Default)]
struct RuleMemory {
    last_table: Option<String>,
    questions: u64,
}

fn words(text: &str) -> Vec<String> {
    WORD_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

fn number_of(word: &str) -> Option<u32> {
    word.parse().ok().or_else(|| {
        NUMBER_WORDS
            .iter()
            .find(|(name, _)| *name == word)
            .map(|(_, n)| *n)
    })
}

/// First word that is neither a stop word nor a number.
fn subject(words: &[String]) -> Option<String> {
    words
        .iter()
        .find(|w| !STOP_WORDS.contains(&w.as_str()) && number_of(w).is_none())
        .cloned()
}

fn toggle_plural(table: &str) -> String {
    match table.strip_suffix('s') {
        Some(singular) if !singular.is_empty() => singular.to_string(),
        _ => format!("{}s", table),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SortIntent {
    LargestFirst,
    SmallestFirst,
    NewestFirst,
    OldestFirst,
}

impl SortIntent {
    fn detect(words: &[String]) -> Option<Self> {
        words.iter().find_map(|w| match w.as_str() {
            "largest" | "biggest" | "top" | "highest" | "expensive" | "most" => {
                Some(SortIntent::LargestFirst)
            }
            "smallest" | "cheapest" | "lowest" | "least" => Some(SortIntent::SmallestFirst),
            "latest" | "newest" | "recent" => Some(SortIntent::NewestFirst),
            "oldest" | "earliest" => Some(SortIntent::OldestFirst),
            _ => None,
        })
    }

    fn candidates(&self) -> &'static [&'static str] {
        match self {
            SortIntent::LargestFirst | SortIntent::SmallestFirst => VALUE_COLUMNS,
            SortIntent::NewestFirst | SortIntent::OldestFirst => DATE_COLUMNS,
        }
    }

    fn direction(&self) -> &'static str {
        match self {
            SortIntent::LargestFirst | SortIntent::NewestFirst => "DESC",
            SortIntent::SmallestFirst | SortIntent::OldestFirst => "ASC",
        }
    }
}

/// Ordering column for this attempt: the candidate after the one the last
/// query was rejected for, or `rowid` once candidates run out.
fn order_column(
    ordering: SortIntent,
    last_query: Option<&str>,
    last_error: Option<&str>,
) -> String {
    let candidates = ordering.candidates();
    let rejected_column = last_error
        .filter(|e| e.contains("no such column"))
        .and(last_query)
        .and_then(|q| ORDER_BY_RE.captures(q))
        .map(|c| c[1].to_lowercase());

    let next = match rejected_column {
        None => 0,
        Some(column) => match candidates.iter().position(|c| *c == column) {
            Some(i) => i + 1,
            None => candidates.len(),
        },
    };
    candidates
        .get(next)
        .map(|c| c.to_string())
        .unwrap_or_else(|| "rowid".to_string())
}

/// First cell of each data line in a rendered tool observation.
fn first_cells(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .filter(|line| !line.starts_with("... ("))
        .filter_map(|line| line.split(" | ").next())
        .map(|cell| cell.trim().to_string())
        .filter(|cell| !cell.is_empty())
        .collect()
}

// =============================================================================
// Admin plans
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Plan {
    Drop,
    Index,
    Schema,
    Help,
}

impl Plan {
    fn detect(question: &str) -> Self {
        let words = words(question);
        let has = |w: &str| words.iter().any(|x| x == w);
        if has("drop") || has("remove") || (has("delete") && has("table")) {
            Plan::Drop
        } else if has("index") || has("indexes") {
            Plan::Index
        } else if has("schema") || has("describe") || has("tables") {
            Plan::Schema
        } else {
            Plan::Help
        }
    }
}

fn tool_call(name: &str, arguments: serde_json::Value, explanation: Option<String>) -> ToolCall {
    ToolCall {
        id: format!("call-{}", Uuid::new_v4().simple()),
        name: name.to_string(),
        arguments,
        declared_mutating: false,
        explanation,
    }
}

// =============================================================================
// RuleModel
// =============================================================================

/// Keyword-driven [`ModelService`] with no external dependencies.
#[derive(Default)]
pub struct RuleModel {
    memories: Mutex<HashMap<String, RuleMemory>>,
}

impl RuleModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn memories(&self) -> MutexGuard<'_, HashMap<String, RuleMemory>> {
        self.memories.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn recall(&self, memory: Option<&MemoryHandle>) -> RuleMemory {
        memory
            .and_then(|h| self.memories().get(h.as_str()).cloned())
            .unwrap_or_default()
    }

    /// Store `update` under the given handle, minting one if needed.
    fn remember(&self, memory: Option<&MemoryHandle>, update: RuleMemory) -> MemoryHandle {
        let handle = memory
            .cloned()
            .unwrap_or_else(|| MemoryHandle::new(format!("rules-{}", Uuid::new_v4())));
        self.memories().insert(handle.as_str().to_string(), update);
        handle
    }

    /// Number of live memory handles.
    pub fn memory_count(&self) -> usize {
        self.memories().len()
    }

    fn build_query(
        &self,
        request: &GenerationRequest,
        recalled: &RuleMemory,
    ) -> (String, Option<String>) {
        let question = request.question.trim();
        if LITERAL_QUERY_RE.is_match(question) {
            let table = FROM_RE.captures(question).map(|c| c[1].to_string());
            return (question.trim_end_matches(';').to_string(), table);
        }

        let words = words(question);
        let mut table = subject(&words).or_else(|| recalled.last_table.clone());

        // A rejected table name gets its plural toggled.
        if let (Some(error), Some(last_query)) = (&request.last_error, &request.last_query) {
            if error.contains("no such table") {
                table = FROM_RE
                    .captures(last_query)
                    .map(|c| toggle_plural(&c[1]))
                    .or(table);
            }
        }

        let Some(table) = table else {
            return (
                "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name".to_string(),
                None,
            );
        };

        if COUNT_RE.is_match(question) {
            return (format!("SELECT COUNT(*) AS count FROM {}", table), Some(table));
        }

        let limit = words
            .iter()
            .find_map(|w| number_of(w))
            .unwrap_or(DEFAULT_LIMIT);
        let query = match SortIntent::detect(&words) {
            Some(ordering) => {
                let column = order_column(
                    ordering,
                    request.last_query.as_deref(),
                    request.last_error.as_deref(),
                );
                format!(
                    "SELECT * FROM {} ORDER BY {} {} LIMIT {}",
                    table,
                    column,
                    ordering.direction(),
                    limit
                )
            }
            None => format!("SELECT * FROM {} LIMIT {}", table, limit),
        };
        (query, Some(table))
    }

    fn plan_step(&self, question: &str, transcript: &[TranscriptEntry]) -> Option<ToolCallOrText> {
        let plan = Plan::detect(question);
        let inspected = transcript.iter().any(|e| {
            matches!(e, TranscriptEntry::ToolCall { call } if call.name == INSPECT_SCHEMA)
        });
        let target = subject(&words(question));

        match transcript.last()? {
            TranscriptEntry::User { .. } => Some(ToolCallOrText::Text(match plan {
                Plan::Drop => "I'll check the schema for the table to drop. ".to_string(),
                Plan::Index => "I'll look at the table's columns first. ".to_string(),
                Plan::Schema => "Here is the current schema. ".to_string(),
                Plan::Help => "I can drop tables, add indexes, or describe the schema. \
                               Ask a data question to query the tables directly."
                    .to_string(),
            })),
            TranscriptEntry::Assistant { .. } if !inspected && plan != Plan::Help => {
                let arguments = match (plan, &target) {
                    (Plan::Index, Some(table)) => json!({ "table": table }),
                    _ => json!({}),
                };
                Some(ToolCallOrText::Call(tool_call(INSPECT_SCHEMA, arguments, None)))
            }
            TranscriptEntry::ToolResult {
                tool_name,
                output,
                is_error,
                ..
            } if tool_name == INSPECT_SCHEMA => {
                if *is_error {
                    return Some(ToolCallOrText::Text(format!(
                        "I couldn't read the schema: {}",
                        output
                    )));
                }
                let names = first_cells(output);
                Some(match plan {
                    Plan::Drop => self.propose_drop(&names, target.as_deref()),
                    Plan::Index => self.propose_index(question, &names, target.as_deref()),
                    _ => ToolCallOrText::Text(if names.is_empty() {
                        "The database has no tables.".to_string()
                    } else {
                        format!("Tables: {}.", names.join(", "))
                    }),
                })
            }
            TranscriptEntry::ToolResult {
                tool_name,
                output,
                is_error,
                ..
            } => Some(ToolCallOrText::Text(if !*is_error {
                format!("Done: {} finished ({}).", tool_name, output)
            } else if output.starts_with("Cancelled") {
                "Understood, nothing was changed.".to_string()
            } else {
                format!("{} failed: {}", tool_name, output)
            })),
            _ => None,
        }
    }

    fn propose_drop(&self, tables: &[String], target: Option<&str>) -> ToolCallOrText {
        let Some(target) = target else {
            return ToolCallOrText::Text("Which table should I drop?".to_string());
        };
        let found = tables
            .iter()
            .find(|t| t.eq_ignore_ascii_case(target))
            .or_else(|| tables.iter().find(|t| t.to_lowercase().contains(target)));
        match found {
            Some(table) => ToolCallOrText::Call(tool_call(
                DROP_TABLE,
                json!({ "statement": format!("DROP TABLE {}", table) }),
                Some(format!(
                    "Permanently removes table {} and all of its rows.",
                    table
                )),
            )),
            None => ToolCallOrText::Text(format!(
                "No table matching '{}' exists, so there is nothing to drop.",
                target
            )),
        }
    }

    fn propose_index(
        &self,
        question: &str,
        columns: &[String],
        table: Option<&str>,
    ) -> ToolCallOrText {
        let Some(table) = table else {
            return ToolCallOrText::Text("Which table should the index go on?".to_string());
        };
        let mentioned = words(question);
        let column = columns
            .iter()
            .find(|c| mentioned.contains(&c.to_lowercase()))
            .or_else(|| columns.iter().find(|c| c.ends_with("_id")));
        match column {
            Some(column) => ToolCallOrText::Call(tool_call(
                CREATE_INDEX,
                json!({
                    "statement": format!(
                        "CREATE INDEX IF NOT EXISTS idx_{table}_{column} ON {table} ({column})"
                    )
                }),
                Some(format!("Speeds up lookups on {}.{}.", table, column)),
            )),
            None => ToolCallOrText::Text(format!(
                "Which column of {} should be indexed? It has: {}.",
                table,
                columns.join(", ")
            )),
        }
    }
}

enum ToolCallOrText {
    Call(ToolCall),
    Text(String),
}

fn usage_for(input: &str, output: &str) -> TokenUsage {
    TokenUsage::new(
        input.split_whitespace().count() as u64,
        output.split_whitespace().count() as u64,
    )
}

#[async_trait]
impl ModelService for RuleModel {
    fn name(&self) -> &str {
        "rules"
    }

    async fn classify(
        &self,
        question: &str,
        _memory: Option<&MemoryHandle>,
        _model: &str,
    ) -> Result<Mode, ModelError> {
        if LITERAL_QUERY_RE.is_match(question) || !ADMIN_RE.is_match(question) {
            Ok(Mode::DataQuery)
        } else {
            Ok(Mode::AdminAssist)
        }
    }

    async fn generate_query(&self, request: &GenerationRequest) -> Result<Generation, ModelError> {
        let mut recalled = self.recall(request.memory.as_ref());
        let (query, table) = self.build_query(request, &recalled);
        debug!(attempt = request.attempt, query = %query, "Rule query generated");

        if table.is_some() {
            recalled.last_table = table;
        }
        recalled.questions += 1;
        let usage = usage_for(&request.question, &query);
        let memory = self.remember(request.memory.as_ref(), recalled);

        Ok(Generation {
            query,
            answer: None,
            usage,
            memory: Some(memory),
        })
    }

    async fn next_step(
        &self,
        transcript: &[TranscriptEntry],
        memory: Option<&MemoryHandle>,
        _model: &str,
    ) -> Result<AdminStep, ModelError> {
        let question = transcript
            .iter()
            .find_map(|entry| match entry {
                TranscriptEntry::User { text } => Some(text.as_str()),
                _ => None,
            })
            .ok_or_else(|| ModelError::InvalidResponse("transcript has no question".to_string()))?;

        match self.plan_step(question, transcript) {
            Some(ToolCallOrText::Text(text)) => Ok(AdminStep::Text {
                usage: usage_for(question, &text),
                text,
            }),
            Some(ToolCallOrText::Call(call)) => Ok(AdminStep::ToolCall {
                usage: usage_for(question, &call.arguments.to_string()),
                call,
            }),
            None => {
                let mut recalled = self.recall(memory);
                recalled.questions += 1;
                Ok(AdminStep::Finish {
                    usage: TokenUsage::default(),
                    memory: Some(self.remember(memory, recalled)),
                })
            }
        }
    }

    async fn forget(&self, memory: &MemoryHandle) {
        self.memories().remove(memory.as_str());
    }
}
