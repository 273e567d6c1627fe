//! Pattern-based validation of model-generated SQL.
//!
//! The guard works on keywords and table names, not on a parsed statement. It rejects every
//! write or DDL keyword anywhere in the text, anything that is not a read statement, and any
//! table read by a FROM clause that is not on the allow-list. FROM clauses are walked token by
//! token, so parenthesized joins, quoted names and quoted aliases are all seen. Known
//! limitation: an alias that shadows an allowed table name is not distinguished from the table
//! itself. Keywords inside string literals are still matched, so such queries are refused
//! rather than risked.

use std::collections::HashSet;

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::query::{QueryDecision, RejectionKind};

/// Write, DDL and file-access keywords that may never appear in a query
pub const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "CREATE", "GRANT", "REVOKE",
    "REPLACE", "LOAD", "CALL", "EXECUTE", "EXEC", "MERGE", "INTO", "OUTFILE", "DUMPFILE",
    "LOAD_FILE",
];

/// SQLite statements that change connection state or attach other databases
pub const SQLITE_FORBIDDEN_KEYWORDS: &[&str] = &["ATTACH", "DETACH", "PRAGMA", "VACUUM", "REINDEX"];

pub const DEFAULT_ALLOWED_TABLES: &[&str] = &["workflows", "tasks", "customers"];

const STRICT_STATEMENTS: &[&str] = &["SELECT"];
const PERMISSIVE_STATEMENTS: &[&str] = &["SELECT", "WITH", "SHOW", "DESCRIBE", "EXPLAIN"];

static KEYWORD_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    FORBIDDEN_KEYWORDS
        .iter()
        .chain(SQLITE_FORBIDDEN_KEYWORDS.iter())
        .map(|kw| (*kw, Regex::new(&format!(r"\b{}\b", kw)).expect("valid keyword regex")))
        .collect()
});

/// Words that close a FROM clause at its own nesting level
const CLAUSE_END_KEYWORDS: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "HAVING", "LIMIT", "UNION", "INTERSECT", "EXCEPT", "WINDOW", "RETURNING",
];

static CTE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:\bWITH|,)\s+(?:RECURSIVE\s+)?([A-Z_][A-Z0-9_]*)\s+AS\s*\(").expect("valid regex"));

/// Decides whether a candidate query may run against the analytics store
#[derive(Debug, Clone)]
pub struct QueryGuard {
    allowed_tables: HashSet<String>,
    allowed_statements: &'static [&'static str],
}

impl Default for QueryGuard {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_TABLES.iter().map(|t| t.to_string()))
    }
}

impl QueryGuard {
    /// Guard accepting only `SELECT` statements over the given tables
    pub fn new<I>(allowed_tables: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            allowed_tables: allowed_tables
                .into_iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            allowed_statements: STRICT_STATEMENTS,
        }
    }

    /// Also accept `WITH`, `SHOW`, `DESCRIBE` and `EXPLAIN` statements
    pub fn permissive(mut self) -> Self {
        self.allowed_statements = PERMISSIVE_STATEMENTS;
        self
    }

    pub fn allowed_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.allowed_tables.iter().cloned().collect();
        tables.sort();
        tables
    }

    pub fn validate(&self, sql: &str) -> QueryDecision {
        let stripped = strip_comments(sql);
        let normalized_sql = stripped.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace()).to_string();
        let upper = stripped.trim().to_uppercase();

        for (keyword, pattern) in KEYWORD_PATTERNS.iter() {
            if pattern.is_match(&upper) {
                warn!("Rejected query containing forbidden keyword {}", keyword);
                return QueryDecision::reject(
                    normalized_sql,
                    RejectionKind::ForbiddenKeyword,
                    format!("forbidden keyword: {}", keyword),
                );
            }
        }

        let statement = self
            .allowed_statements
            .iter()
            .find(|s| starts_with_word(&upper, s));
        if statement.is_none() {
            let first_word = upper.split_whitespace().next().unwrap_or("").to_string();
            return QueryDecision::reject(
                normalized_sql,
                RejectionKind::NotSelect,
                format!("statement type not allowed: {}", first_word),
            );
        }

        if has_multiple_statements(&normalized_sql) {
            return QueryDecision::reject(
                normalized_sql,
                RejectionKind::NotSelect,
                "multiple statements are not allowed".to_string(),
            );
        }

        let ctes = if starts_with_word(&upper, "WITH") {
            match self.common_table_expressions(&upper) {
                Ok(names) => names,
                Err(table) => {
                    warn!("Rejected query whose CTE reads table {}", table);
                    return QueryDecision::reject(
                        normalized_sql,
                        RejectionKind::TableNotAllowed,
                        format!("table not allowed: {}", table),
                    );
                }
            }
        } else {
            HashSet::new()
        };

        for table in referenced_tables(&upper) {
            if self.allowed_tables.contains(&table) || ctes.contains(&table) {
                continue;
            }
            warn!("Rejected query referencing table {}", table);
            return QueryDecision::reject(
                normalized_sql,
                RejectionKind::TableNotAllowed,
                format!("table not allowed: {}", table),
            );
        }

        debug!("Query accepted: {}", normalized_sql);
        QueryDecision::accept(normalized_sql)
    }

    /// Names defined by `WITH` clauses. A CTE body may only read allowed tables or CTEs
    /// defined before it, so a CTE cannot shadow a table it also reads.
    fn common_table_expressions(&self, upper: &str) -> Result<HashSet<String>, String> {
        let mut defined = HashSet::new();
        for captures in CTE_NAME.captures_iter(upper) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else { continue };
            let name = name.as_str().to_lowercase();
            let body_start = whole.end();
            let body = &upper[body_start..closing_paren(upper, body_start)];
            for table in referenced_tables(body) {
                if !self.allowed_tables.contains(&table) && !defined.contains(&table) {
                    return Err(table);
                }
            }
            defined.insert(name);
        }
        Ok(defined)
    }
}

/// Index of the `)` closing a parenthesis opened just before `start`
fn closing_paren(text: &str, start: usize) -> usize {
    let mut depth = 1usize;
    let mut quote: Option<char> = None;
    for (offset, ch) in text[start..].char_indices() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None => match ch {
                '\'' | '"' | '`' => quote = Some(ch),
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return start + offset;
                    }
                }
                _ => {}
            },
        }
    }
    text.len()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    /// Text inside `'…'`, `"…"`, `` `…` `` or `[…]`, doubled quotes unescaped
    Quoted(String),
    Open,
    Close,
    Comma,
    Dot,
    Semicolon,
    Other,
}

impl Token {
    fn name(&self) -> Option<&str> {
        match self {
            Token::Word(w) => Some(w),
            Token::Quoted(q) => Some(q),
            _ => None,
        }
    }

    fn is_word(&self, word: &str) -> bool {
        matches!(self, Token::Word(w) if w == word)
    }
}

fn tokenize(sql: &str) -> Vec<Token> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '(' => tokens.push(Token::Open),
            ')' => tokens.push(Token::Close),
            ',' => tokens.push(Token::Comma),
            '.' => tokens.push(Token::Dot),
            ';' => tokens.push(Token::Semicolon),
            '\'' | '"' | '`' | '[' => {
                let close = if c == '[' { ']' } else { c };
                let mut text = String::new();
                i += 1;
                while i < chars.len() {
                    if chars[i] == close {
                        if close != ']' && chars.get(i + 1) == Some(&close) {
                            text.push(close);
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    text.push(chars[i]);
                    i += 1;
                }
                tokens.push(Token::Quoted(text));
            }
            c if is_word_char(c) => {
                let start = i;
                while i + 1 < chars.len() && is_word_char(chars[i + 1]) {
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..=i].iter().collect()));
            }
            c if c.is_whitespace() => {}
            _ => tokens.push(Token::Other),
        }
        i += 1;
    }
    tokens
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Tables read by every FROM clause of uppercased text, lowercased and unquoted.
/// Schema-qualified names keep their qualifier, so `main.users` is reported as such.
pub fn referenced_tables(upper_sql: &str) -> Vec<String> {
    let tokens = tokenize(upper_sql);
    let mut tables = Vec::new();
    for (idx, token) in tokens.iter().enumerate() {
        if token.is_word("FROM") {
            from_clause_tables(&tokens, idx + 1, &mut tables);
        }
    }
    tables
}

/// Walk one FROM clause. A table is expected after `FROM`, `JOIN`, a comma and any `(` that
/// groups joins; everything else until the clause ends is an alias or a join condition.
fn from_clause_tables(tokens: &[Token], start: usize, tables: &mut Vec<String>) {
    let mut depth = 0usize;
    let mut expect_table = true;
    let mut i = start;

    while i < tokens.len() {
        match &tokens[i] {
            Token::Open => {
                let opens_query = tokens
                    .get(i + 1)
                    .map_or(false, |t| t.is_word("SELECT") || t.is_word("WITH") || t.is_word("VALUES"));
                if expect_table && !opens_query {
                    depth += 1;
                } else {
                    // subqueries are walked from their own FROM
                    i = matching_close(tokens, i);
                    expect_table = false;
                }
            }
            Token::Close => {
                if depth == 0 {
                    return;
                }
                depth -= 1;
                expect_table = false;
            }
            Token::Comma => expect_table = true,
            Token::Semicolon => return,
            Token::Word(_) | Token::Quoted(_) if expect_table => {
                let (name, next) = qualified_name(tokens, i);
                if !tables.contains(&name) {
                    tables.push(name);
                }
                expect_table = false;
                i = next;
                continue;
            }
            Token::Word(w) if w == "JOIN" => expect_table = true,
            Token::Word(w) if depth == 0 && CLAUSE_END_KEYWORDS.contains(&w.as_str()) => return,
            _ => {}
        }
        i += 1;
    }
}

fn qualified_name(tokens: &[Token], start: usize) -> (String, usize) {
    let mut parts = Vec::new();
    let mut i = start;
    while let Some(part) = tokens.get(i).and_then(Token::name) {
        parts.push(part.to_lowercase());
        i += 1;
        if tokens.get(i) != Some(&Token::Dot) {
            break;
        }
        i += 1;
    }
    (parts.join("."), i)
}

/// Index of the `)` matching the `(` at `open`
fn matching_close(tokens: &[Token], open: usize) -> usize {
    let mut depth = 0usize;
    for (offset, token) in tokens[open..].iter().enumerate() {
        match token {
            Token::Open => depth += 1,
            Token::Close => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return open + offset;
                }
            }
            _ => {}
        }
    }
    tokens.len()
}

fn starts_with_word(upper: &str, word: &str) -> bool {
    upper.starts_with(word)
        && upper[word.len()..]
            .chars()
            .next()
            .map_or(true, |c| !(c.is_alphanumeric() || c == '_'))
}

/// True when a `;` outside quotes is followed by more text
fn has_multiple_statements(sql: &str) -> bool {
    let mut quote: Option<char> = None;
    for (idx, ch) in sql.char_indices() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None if ch == '\'' || ch == '"' || ch == '`' => quote = Some(ch),
            None if ch == ';' => {
                let rest = sql[idx + 1..].trim_matches(|c: char| c == ';' || c.is_whitespace());
                return !rest.is_empty();
            }
            None => {}
        }
    }
    false
}

/// Remove `--` and `/* */` comments while leaving quoted text untouched
pub fn strip_comments(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    let mut quote: Option<char> = None;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match (c, next) {
            ('\'', _) | ('"', _) | ('`', _) => {
                quote = Some(c);
                out.push(c);
                i += 1;
            }
            ('-', Some('-')) => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            ('/', Some('*')) => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
                // keep tokens on either side of the comment apart
                out.push(' ');
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> QueryGuard {
        QueryGuard::default()
    }

    fn rejection(sql: &str) -> (RejectionKind, String) {
        let decision = guard().validate(sql);
        assert!(!decision.accepted, "expected rejection for {sql}");
        (decision.rejection_kind.unwrap(), decision.rejection_reason.unwrap())
    }

    #[test]
    fn stacked_drop_is_rejected_citing_drop() {
        let (kind, reason) = rejection("select * from workflows; DROP TABLE workflows;--");
        assert_eq!(kind, RejectionKind::ForbiddenKeyword);
        assert!(reason.contains("DROP"));
    }

    #[test]
    fn every_forbidden_keyword_is_caught_in_any_case_and_position() {
        for keyword in FORBIDDEN_KEYWORDS {
            let lower = keyword.to_lowercase();
            for sql in [
                format!("{} foo", keyword),
                format!("SELECT * FROM workflows WHERE 1 = 1 {}", lower),
                format!("SELECT 1; {} x", lower),
                format!("SeLeCt id FROM tasks /* ok */ {}", keyword),
            ] {
                let (kind, reason) = rejection(&sql);
                assert_eq!(kind, RejectionKind::ForbiddenKeyword, "{sql}");
                assert!(reason.contains("forbidden keyword"), "{sql}");
            }
        }
    }

    #[test]
    fn keyword_match_uses_word_boundaries() {
        let decision = guard().validate("SELECT updated_at, created_at, deleted FROM workflows");
        assert!(decision.accepted, "{:?}", decision);
        let decision = guard().validate("SELECT id FROM tasks WHERE name LIKE '%x%' ORDER BY last_update_time");
        assert!(decision.accepted);
    }

    #[test]
    fn show_tables_is_not_select() {
        let (kind, _) = rejection("SHOW TABLES");
        assert_eq!(kind, RejectionKind::NotSelect);
        let (kind, _) = rejection("SELECTION FROM workflows");
        assert_eq!(kind, RejectionKind::NotSelect);
    }

    #[test]
    fn permissive_mode_accepts_show_and_cte() {
        let guard = QueryGuard::default().permissive();
        assert!(guard.validate("SHOW TABLES").accepted);
        let cte = "WITH recent AS (SELECT * FROM workflows WHERE status = 'active') SELECT COUNT(*) FROM recent";
        assert!(guard.validate(cte).accepted);
        assert!(!QueryGuard::default().validate(cte).accepted);
    }

    #[test]
    fn cte_cannot_shadow_a_forbidden_table() {
        let guard = QueryGuard::default().permissive();
        let decision = guard.validate("WITH users AS (SELECT * FROM users) SELECT * FROM users");
        assert_eq!(decision.rejection_kind, Some(RejectionKind::TableNotAllowed));
        let decision = guard.validate("WITH a AS (SELECT * FROM b), b AS (SELECT 1) SELECT * FROM a");
        assert_eq!(decision.rejection_kind, Some(RejectionKind::TableNotAllowed));
        let chained = "WITH a AS (SELECT id FROM tasks), b AS (SELECT id FROM a) SELECT COUNT(*) FROM b";
        assert!(guard.validate(chained).accepted);
    }

    #[test]
    fn union_into_unlisted_table_is_rejected() {
        let (kind, reason) = rejection("SELECT * FROM workflows UNION SELECT * FROM users");
        assert_eq!(kind, RejectionKind::TableNotAllowed);
        assert!(reason.contains("users"));
    }

    #[test]
    fn join_between_allowed_tables_is_accepted() {
        let sql = "SELECT w.name, COUNT(t.id) FROM workflows w JOIN tasks t ON t.workflow_id = w.id GROUP BY w.name";
        let decision = guard().validate(sql);
        assert!(decision.accepted);
        assert_eq!(decision.normalized_sql, sql);
    }

    #[test]
    fn quoted_and_comma_joined_tables_are_checked() {
        let (_, reason) = rejection("SELECT * FROM `users`");
        assert!(reason.contains("users"));
        let (_, reason) = rejection("SELECT * FROM workflows w, \"sessions\" s");
        assert!(reason.contains("sessions"));
        let (_, reason) = rejection("SELECT * FROM workflows AS w, customers c, sqlite_master");
        assert!(reason.contains("sqlite_master"));
        assert!(guard().validate("SELECT * FROM `workflows` LEFT JOIN \"customers\" ON 1=1").accepted);

        let (_, reason) = rejection("SELECT * FROM (users)");
        assert!(reason.contains("users"));
        let (_, reason) = rejection("SELECT * FROM ((workflows JOIN users ON 1=1))");
        assert!(reason.contains("users"));
        for alias in ["\"w\"", "`w`", "[w]", "'w'", "AS \"w\""] {
            let sql = format!("SELECT w.id, u.password_hash FROM workflows {}, users u", alias);
            let (kind, reason) = rejection(&sql);
            assert_eq!(kind, RejectionKind::TableNotAllowed, "{sql}");
            assert!(reason.contains("users"), "{sql}");
        }
        let (_, reason) = rejection("SELECT * FROM workflows w JOIN \"main\".\"users\" u ON 1=1");
        assert!(reason.contains("main.users"));
        let (_, reason) = rejection("SELECT * FROM pragma_table_info('users')");
        assert!(reason.contains("pragma_table_info"));
    }

    #[test]
    fn from_clause_walk_accepts_allowed_shapes() {
        for sql in [
            "SELECT * FROM (workflows) w",
            "SELECT * FROM workflows \"w\", tasks [t] WHERE t.workflow_id = w.id",
            "SELECT * FROM workflows w, (SELECT id FROM tasks) t",
            "SELECT * FROM workflows w JOIN tasks t USING (workflow_id) ORDER BY w.name",
            "SELECT * FROM (workflows w JOIN tasks t ON t.workflow_id = w.id) LIMIT 5",
            "SELECT name FROM customers WHERE name IN ('users', 'from sessions')",
        ] {
            let decision = guard().validate(sql);
            assert!(decision.accepted, "{sql}: {:?}", decision);
        }
    }

    #[test]
    fn referenced_tables_lists_each_table_once() {
        let tables = referenced_tables(
            "SELECT * FROM WORKFLOWS W JOIN TASKS T ON T.WORKFLOW_ID = W.ID WHERE W.ID IN (SELECT WORKFLOW_ID FROM TASKS)",
        );
        assert_eq!(tables, vec!["workflows".to_string(), "tasks".to_string()]);
    }

    #[test]
    fn subqueries_are_scanned() {
        assert!(guard()
            .validate("SELECT name FROM customers WHERE id IN (SELECT customer_id FROM workflows)")
            .accepted);
        let (kind, _) = rejection("SELECT (SELECT password FROM admins) AS x FROM workflows");
        assert_eq!(kind, RejectionKind::TableNotAllowed);
    }

    #[test]
    fn comments_are_ignored_not_smuggled() {
        let sql = "-- count the workflows, then update nothing\nSELECT COUNT(*) FROM workflows /* insert here */";
        let decision = guard().validate(sql);
        assert!(decision.accepted, "{:?}", decision);
        assert_eq!(decision.normalized_sql, "SELECT COUNT(*) FROM workflows");
    }

    #[test]
    fn comment_markers_inside_strings_do_not_hide_statements() {
        let (kind, reason) = rejection("SELECT '--' FROM workflows; DROP TABLE tasks");
        assert_eq!(kind, RejectionKind::ForbiddenKeyword);
        assert!(reason.contains("DROP"));
    }

    #[test]
    fn block_comment_cannot_glue_keywords() {
        let (kind, _) = rejection("SELECT 1; DR/**/OP TABLE workflows");
        assert_eq!(kind, RejectionKind::NotSelect);
    }

    #[test]
    fn multiple_selects_are_rejected_but_trailing_semicolon_is_fine() {
        let (kind, _) = rejection("SELECT * FROM workflows; SELECT * FROM tasks");
        assert_eq!(kind, RejectionKind::NotSelect);
        let decision = guard().validate("SELECT * FROM workflows;;  ");
        assert!(decision.accepted);
        assert_eq!(decision.normalized_sql, "SELECT * FROM workflows");
    }

    #[test]
    fn sqlite_state_statements_are_forbidden() {
        let (kind, reason) = rejection("SELECT 1; ATTACH DATABASE 'x.db' AS x");
        assert_eq!(kind, RejectionKind::ForbiddenKeyword);
        assert!(reason.contains("ATTACH"));
    }

    #[test]
    fn custom_allow_list() {
        let guard = QueryGuard::new(vec!["Workflows".to_string()]);
        assert!(guard.validate("select * from WORKFLOWS").accepted);
        assert!(!guard.validate("select * from tasks").accepted);
        assert_eq!(guard.allowed_tables(), vec!["workflows".to_string()]);
    }

    #[test]
    fn original_casing_is_kept() {
        let decision = guard().validate("  select name from customers where name = 'Ada'  ");
        assert_eq!(decision.normalized_sql, "select name from customers where name = 'Ada'");
    }
}
