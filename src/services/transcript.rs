use log::debug;

use crate::models::conversation::{ResultRow, Turn, TurnRole};
use crate::services::llm::ChatMessage;
use crate::services::query_executor::ROW_CAP;

/// Query the model is told to return when a question cannot be answered from the schema
pub const FALLBACK_SQL: &str = "SELECT 'Query not generable' AS error";

/// Prior user/assistant turns fed into SQL generation
pub const HISTORY_WINDOW: usize = 10;

/// Rows shown to the model when composing an answer
pub const PREVIEW_ROWS: usize = 10;

/// A column of the analytics schema
#[derive(Debug, Clone, Copy)]
pub struct ColumnSchema {
    pub name: &'static str,
    pub sql_type: &'static str,
    pub references: Option<&'static str>,
}

/// A table of the analytics schema
#[derive(Debug, Clone, Copy)]
pub struct TableSchema {
    pub name: &'static str,
    pub description: &'static str,
    pub columns: &'static [ColumnSchema],
}

const fn col(name: &'static str, sql_type: &'static str) -> ColumnSchema {
    ColumnSchema { name, sql_type, references: None }
}

const fn fk(name: &'static str, sql_type: &'static str, references: &'static str) -> ColumnSchema {
    ColumnSchema { name, sql_type, references: Some(references) }
}

/// Tables synchronized from the billing platform
pub const SCHEMA: &[TableSchema] = &[
    TableSchema {
        name: "workflows",
        description: "Automation workflows synchronized from the billing platform",
        columns: &[
            col("id", "INTEGER PRIMARY KEY"),
            col("external_id", "TEXT"),
            col("name", "TEXT"),
            col("description", "TEXT"),
            col("status", "TEXT ('active', 'inactive', 'draft')"),
            col("trigger_type", "TEXT"),
            fk("customer_id", "INTEGER", "customers.id"),
            col("task_count", "INTEGER"),
            col("last_synced_at", "DATETIME"),
            col("created_at", "DATETIME"),
            col("updated_at", "DATETIME"),
        ],
    },
    TableSchema {
        name: "tasks",
        description: "Ordered steps of a workflow",
        columns: &[
            col("id", "INTEGER PRIMARY KEY"),
            fk("workflow_id", "INTEGER", "workflows.id"),
            col("external_id", "TEXT"),
            col("name", "TEXT"),
            col("type", "TEXT"),
            col("position", "INTEGER"),
            col("config", "TEXT (JSON)"),
            col("created_at", "DATETIME"),
            col("updated_at", "DATETIME"),
        ],
    },
    TableSchema {
        name: "customers",
        description: "Billing customers owning workflows",
        columns: &[
            col("id", "INTEGER PRIMARY KEY"),
            col("external_id", "TEXT"),
            col("name", "TEXT"),
            col("email", "TEXT"),
            col("company", "TEXT"),
            col("status", "TEXT"),
            col("created_at", "DATETIME"),
            col("updated_at", "DATETIME"),
        ],
    },
];

// (question, sql) pairs shown to the model before the real question
const FEW_SHOT_EXAMPLES: &[(&str, &str)] = &[
    (
        "How many workflows are there?",
        "SELECT COUNT(*) AS total_workflows FROM workflows",
    ),
    (
        "Which workflows have the most tasks?",
        "SELECT w.name, COUNT(t.id) AS task_total FROM workflows w LEFT JOIN tasks t ON t.workflow_id = w.id GROUP BY w.id, w.name ORDER BY task_total DESC LIMIT 10",
    ),
    (
        "List active workflows per customer",
        "SELECT c.name AS customer, w.name AS workflow FROM workflows w JOIN customers c ON c.id = w.customer_id WHERE w.status = 'active' ORDER BY c.name LIMIT 100",
    ),
    ("What is the weather today?", FALLBACK_SQL),
];

/// Assembles the message sequences sent to the provider
#[derive(Debug, Clone)]
pub struct LlmTranscriptBuilder {
    allowed_tables: Vec<String>,
}

impl LlmTranscriptBuilder {
    pub fn new(allowed_tables: Vec<String>) -> Self {
        Self { allowed_tables }
    }

    /// Tables, columns, types and foreign keys of the allowed tables
    pub fn schema_description(&self) -> String {
        let mut out = String::new();
        for table in SCHEMA.iter().filter(|t| self.is_allowed(t.name)) {
            out.push_str(&format!("Table {} -- {}\n", table.name, table.description));
            for column in table.columns {
                match column.references {
                    Some(target) => out.push_str(&format!(
                        "  - {} {} REFERENCES {}\n",
                        column.name, column.sql_type, target
                    )),
                    None => out.push_str(&format!("  - {} {}\n", column.name, column.sql_type)),
                }
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }

    fn is_allowed(&self, table: &str) -> bool {
        self.allowed_tables.iter().any(|t| t.eq_ignore_ascii_case(table))
    }

    fn sql_system_prompt(&self) -> String {
        format!(
            r#"You translate questions about workflow data into a single SQLite query.

Rules:
1. Generate only SELECT statements. Never modify data or schema.
2. Only use these tables: {tables}.
3. Always limit results to at most {cap} rows.
4. Return only the SQL query, without explanation or Markdown.
5. If the question cannot be answered from these tables, return exactly:
{fallback}

Schema:
{schema}"#,
            tables = self.allowed_tables.join(", "),
            cap = ROW_CAP,
            fallback = FALLBACK_SQL,
            schema = self.schema_description(),
        )
    }

    /// System prompt, few-shot examples, the recent history and the question
    pub fn build_sql_generation_prompt(&self, prior_turns: &[Turn], question: &str) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(self.sql_system_prompt())];

        for (example_question, example_sql) in FEW_SHOT_EXAMPLES {
            messages.push(ChatMessage::user(*example_question));
            messages.push(ChatMessage::assistant(*example_sql));
        }

        let history: Vec<&Turn> = prior_turns
            .iter()
            .filter(|t| matches!(t.role, TurnRole::User | TurnRole::Assistant))
            .collect();
        let start = history.len().saturating_sub(HISTORY_WINDOW);
        for turn in &history[start..] {
            match turn.role {
                TurnRole::User => messages.push(ChatMessage::user(turn.content.as_str())),
                // the model sees its own SQL, not the prose composed from it
                _ => messages.push(ChatMessage::assistant(
                    turn.query_generated.as_deref().unwrap_or(turn.content.as_str()),
                )),
            }
        }

        messages.push(ChatMessage::user(question));
        debug!(
            "Built SQL generation transcript with {} messages ({} history turns)",
            messages.len(),
            history.len() - start
        );
        messages
    }

    /// Messages asking for a Markdown answer grounded in the executed query
    pub fn build_answer_composition_prompt(&self, question: &str, sql: &str, rows: &[ResultRow]) -> Vec<ChatMessage> {
        let preview: Vec<&ResultRow> = rows.iter().take(PREVIEW_ROWS).collect();
        let preview_json = serde_json::to_string_pretty(&preview).unwrap_or_else(|_| "[]".to_string());

        let system = "You are a data assistant for workflow automation. Answer the user's question \
                      using only the query results provided. Reply in concise Markdown; use a table \
                      when listing several rows. Do not mention SQL unless asked.";

        let user = format!(
            r#"Question: {question}

Executed query:
```sql
{sql}
```

Total rows returned: {total}
First {shown} rows:
```json
{preview}
```

Write the answer in Markdown."#,
            question = question,
            sql = sql,
            total = rows.len(),
            shown = preview.len(),
            preview = preview_json,
        );

        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }
}
