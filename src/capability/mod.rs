//! SQL Statement Classification and Rewriting
//!
//! Shared helpers used by the connector template and the engine adapters.
//!
//! # Classification
//! - Write detection inspects only the leading keyword (after whitespace and
//!   leading comments), never substrings later in the text
//! - Multi-statement detection ignores `;` inside literals and comments
//!
//! # Row Limiting
//! - `inject_limit` appends `LIMIT n` (Postgres, MySQL, SQLite)
//! - `inject_top` inserts `TOP n` after the leading `SELECT` (SQL Server)
//! - Both are idempotent: statements that already limit themselves pass through

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{RelayError, Result};

/// Leading keywords that classify a statement as a write
pub const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "GRANT", "REVOKE", "MERGE",
    "UPSERT", "REPLACE",
];

fn limit_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\blimit\s+(all\b|\d+|\?|\$\d+|:\w+)").expect("Invalid LIMIT pattern")
    })
}

fn top_or_offset_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(\btop\s*\(?\s*(\d+|@\w+)|\boffset\s+\S+\s+rows?\b|\bfetch\s+(first|next)\b)")
            .expect("Invalid TOP/OFFSET pattern")
    })
}

fn output_clause_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\boutput\b").expect("Invalid OUTPUT pattern"))
}

fn leading_select_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^select\s+((distinct|all)\s+)?").expect("Invalid SELECT pattern")
    })
}

/// Strip whitespace and any leading `--` / `/* */` comments
#[must_use]
pub fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.find('\n').map_or("", |idx| &after[idx + 1..]).trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.find("*/").map_or("", |idx| &after[idx + 2..]).trim_start();
        } else {
            return rest;
        }
    }
}

/// Upper-cased first keyword of the statement (empty when it starts with a symbol)
#[must_use]
pub fn leading_keyword(sql: &str) -> String {
    strip_leading_comments(sql)
        .chars()
        .take_while(|c| c.is_ascii_alphabetic() || *c == '_')
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Whether the statement's leading keyword is one of [`WRITE_KEYWORDS`]
#[must_use]
pub fn is_write_statement(sql: &str) -> bool {
    let keyword = leading_keyword(sql);
    WRITE_KEYWORDS.contains(&keyword.as_str())
}

/// Whether the statement is a row-returning `SELECT` / `WITH` query
#[must_use]
pub fn is_select_query(sql: &str) -> bool {
    matches!(leading_keyword(sql).as_str(), "SELECT" | "WITH")
}

/// Whether a T-SQL statement has a top-level `OUTPUT` clause
#[must_use]
pub fn has_output_clause(sql: &str) -> bool {
    find_top_level(output_clause_regex(), &mask_literals(sql)).is_some()
}

/// Whether the statement contains a `;` separating two statements.
///
/// A trailing `;` (optionally followed by whitespace or comments) is allowed.
#[must_use]
pub fn has_multiple_statements(sql: &str) -> bool {
    let masked = mask_literals(sql);
    masked.trim_end_matches(|c: char| c == ';' || c.is_whitespace()).contains(';')
}

/// Remove trailing whitespace and semicolons
#[must_use]
pub fn strip_trailing_semicolon(sql: &str) -> &str {
    sql.trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

/// Whether the outer query already carries a `LIMIT` clause.
///
/// Literals, comments and parenthesized subqueries are ignored.
#[must_use]
pub fn has_limit_clause(sql: &str) -> bool {
    find_top_level(limit_regex(), &mask_literals(sql)).is_some()
}

/// Append `LIMIT n` to a SELECT/WITH statement that does not limit itself.
///
/// An outer `LIMIT ALL` is replaced by `LIMIT n`.
#[must_use]
pub fn inject_limit(sql: &str, limit: usize) -> String {
    if !is_select_query(sql) {
        return sql.to_string();
    }
    let masked = mask_literals(sql);
    if let Some(caps) = find_top_level(limit_regex(), &masked) {
        return match caps.get(1) {
            Some(arg) if arg.as_str().eq_ignore_ascii_case("all") => {
                format!("{}{limit}{}", &sql[..arg.start()], &sql[arg.end()..])
            }
            _ => sql.to_string(),
        };
    }
    // Newline keeps a trailing line comment from swallowing the clause
    format!("{}\nLIMIT {limit}", strip_trailing_semicolon(sql))
}

/// Whether the outer query already carries `TOP`, `OFFSET ... ROWS` or `FETCH FIRST/NEXT`
#[must_use]
pub fn has_top_or_offset(sql: &str) -> bool {
    find_top_level(top_or_offset_regex(), &mask_literals(sql)).is_some()
}

/// Insert `TOP n` after the leading `SELECT [DISTINCT|ALL]`.
///
/// `WITH` queries and statements that already limit themselves pass through.
#[must_use]
pub fn inject_top(sql: &str, limit: usize) -> String {
    let body = strip_leading_comments(sql);
    if leading_keyword(body) != "SELECT" || has_top_or_offset(body) {
        return sql.to_string();
    }
    match leading_select_regex().find(body) {
        Some(m) => format!("{}TOP {limit} {}", &body[..m.end()], &body[m.end()..]),
        None => sql.to_string(),
    }
}

/// Keep the first `max_rows` rows; report whether anything was dropped
pub fn truncate_rows<T>(rows: &mut Vec<T>, max_rows: usize) -> bool {
    if rows.len() > max_rows {
        rows.truncate(max_rows);
        true
    } else {
        false
    }
}

/// Case-insensitive SQL `LIKE` matching (`%` any sequence, `_` one character)
#[must_use]
pub fn like_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = backtrack {
            p = star_p + 1;
            t = star_t + 1;
            backtrack = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '%')
}

/// Rewrite `@p0, @p1, ...` placeholders to tiberius' one-based `@P1, @P2, ...`
///
/// Literals, comments and `@@` system variables are left untouched.
pub fn rewrite_mssql_placeholders(sql: &str) -> Result<String> {
    let masked = mask_literals(sql);
    let bytes = masked.as_bytes();
    let mut out = String::with_capacity(sql.len() + 8);
    let mut last = 0;
    let mut idx = 0;

    while idx < bytes.len() {
        let is_param = bytes[idx] == b'@'
            && (idx == 0 || bytes[idx - 1] != b'@')
            && matches!(bytes.get(idx + 1), Some(b'p' | b'P'))
            && bytes.get(idx + 2).is_some_and(u8::is_ascii_digit);
        if !is_param {
            idx += 1;
            continue;
        }

        let digits_start = idx + 2;
        let mut end = digits_start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
            idx = end;
            continue;
        }

        let ordinal: usize = masked[digits_start..end]
            .parse()
            .map_err(|_| RelayError::invalid_input(format!("Invalid placeholder in: {sql}")))?;
        out.push_str(&sql[last..idx]);
        out.push_str(&format!("@P{}", ordinal + 1));
        last = end;
        idx = end;
    }

    out.push_str(&sql[last..]);
    Ok(out)
}

/// Validate an identifier interpolated into catalog statements
pub fn validate_identifier(name: &str) -> Result<&str> {
    if name.is_empty() {
        return Err(RelayError::invalid_input("Identifier cannot be empty"));
    }
    if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(RelayError::invalid_input(format!(
            "Invalid identifier '{name}': only alphanumeric characters and underscores are allowed"
        )))
    }
}

#[derive(Clone, PartialEq, Eq)]
enum ScanState {
    Code,
    Quoted(char),
    /// Postgres `$tag$ ... $tag$` body; holds the full delimiter
    DollarQuoted(String),
    LineComment,
    BlockComment,
}

/// Opening `$$` / `$tag$` delimiter at the start of `rest`, if any.
///
/// Positional parameters (`$1`) never qualify since tags cannot start with a digit.
fn dollar_delimiter(rest: &str) -> Option<&str> {
    let body = rest.strip_prefix('$')?;
    let end = body.find('$')?;
    let tag = &body[..end];
    let starts_ok = tag.chars().next().map_or(true, |c| c.is_ascii_alphabetic() || c == '_');
    (starts_ok && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')).then(|| &rest[..end + 2])
}

/// Blank out literal contents and comments, preserving byte offsets.
///
/// Quote characters and dollar-quote delimiters are kept so callers still see
/// token boundaries.
fn mask_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut state = ScanState::Code;
    let mut pos = 0;

    let blank = |out: &mut String, ch: char| {
        for _ in 0..ch.len_utf8() {
            out.push(' ');
        }
    };

    while let Some(ch) = sql[pos..].chars().next() {
        let rest = &sql[pos..];
        let next = rest[ch.len_utf8()..].chars().next();
        let mut step = ch.len_utf8();

        match &state {
            ScanState::Code => match ch {
                '\'' | '"' | '`' => {
                    state = ScanState::Quoted(ch);
                    out.push(ch);
                }
                '[' => {
                    state = ScanState::Quoted(']');
                    out.push(ch);
                }
                '$' => match dollar_delimiter(rest) {
                    Some(delimiter) => {
                        out.push_str(delimiter);
                        step = delimiter.len();
                        state = ScanState::DollarQuoted(delimiter.to_string());
                    }
                    None => out.push(ch),
                },
                '-' if next == Some('-') => {
                    step = 2;
                    state = ScanState::LineComment;
                    out.push_str("  ");
                }
                '/' if next == Some('*') => {
                    step = 2;
                    state = ScanState::BlockComment;
                    out.push_str("  ");
                }
                _ => out.push(ch),
            },
            ScanState::Quoted(close) => {
                let close = *close;
                if ch == close {
                    // Doubled quote is an escaped quote inside the literal
                    if next == Some(close) && close != ']' {
                        step = 2;
                        out.push_str("  ");
                    } else {
                        state = ScanState::Code;
                        out.push(ch);
                    }
                } else {
                    blank(&mut out, ch);
                }
            }
            ScanState::DollarQuoted(delimiter) => {
                if rest.starts_with(delimiter.as_str()) {
                    out.push_str(delimiter);
                    step = delimiter.len();
                    state = ScanState::Code;
                } else {
                    blank(&mut out, ch);
                }
            }
            ScanState::LineComment => {
                if ch == '\n' {
                    state = ScanState::Code;
                    out.push('\n');
                } else {
                    blank(&mut out, ch);
                }
            }
            ScanState::BlockComment => {
                if ch == '*' && next == Some('/') {
                    step = 2;
                    state = ScanState::Code;
                    out.push_str("  ");
                } else {
                    blank(&mut out, ch);
                }
            }
        }
        pos += step;
    }

    out
}

/// For each byte of a masked statement, whether it sits outside all parentheses
fn top_level_bytes(masked: &str) -> Vec<bool> {
    let mut depth: usize = 0;
    masked
        .bytes()
        .map(|b| match b {
            b'(' => {
                depth += 1;
                false
            }
            b')' => {
                depth = depth.saturating_sub(1);
                false
            }
            _ => depth == 0,
        })
        .collect()
}

/// First match of `re` in the masked statement that is not nested in parentheses
fn find_top_level<'m>(re: &Regex, masked: &'m str) -> Option<regex::Captures<'m>> {
    let top = top_level_bytes(masked);
    re.captures_iter(masked).find(|caps| caps.get(0).is_some_and(|m| top[m.start()]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_write_keywords_detected() {
        for keyword in WRITE_KEYWORDS {
            let sql = format!("{} something", keyword.to_lowercase());
            assert!(is_write_statement(&sql), "{sql} should be a write");
        }
        assert!(is_write_statement("   \n\tDELETE FROM t"));
        assert!(is_write_statement("Replace INTO t VALUES (1)"));
    }

    #[test]
    fn test_write_only_inspects_leading_keyword() {
        assert!(!is_write_statement("SELECT 'update' FROM t"));
        assert!(!is_write_statement("SELECT * FROM t WHERE note = 'DROP TABLE x'"));
        assert!(!is_write_statement("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(!is_write_statement("SHOW TABLES"));
        assert!(!is_write_statement("DELETED_ROWS"));
        assert!(!is_write_statement(""));
    }

    #[test]
    fn test_write_after_leading_comments() {
        assert!(is_write_statement("-- cleanup\nDELETE FROM t"));
        assert!(is_write_statement("/* migration */ DROP TABLE t"));
        assert!(is_write_statement("/* a */ -- b\n  /* c */ insert into t values (1)"));
        assert!(!is_write_statement("-- DELETE FROM t\nSELECT 1"));
    }

    #[test]
    fn test_is_select_query() {
        assert!(is_select_query("select * from t"));
        assert!(is_select_query("  WITH a AS (SELECT 1) SELECT * FROM a"));
        assert!(!is_select_query("INSERT INTO t SELECT * FROM u"));
        assert!(!is_select_query("SHOW DATABASES"));
    }

    #[test]
    fn test_multiple_statements() {
        assert!(has_multiple_statements("SELECT 1; SELECT 2"));
        assert!(has_multiple_statements("SELECT 1; DROP TABLE t;"));
        assert!(!has_multiple_statements("SELECT 1;"));
        assert!(!has_multiple_statements("SELECT 1 ;  \n"));
        assert!(!has_multiple_statements("SELECT 'a;b' FROM t"));
        assert!(!has_multiple_statements("SELECT 1 -- trailing; comment"));
        assert!(!has_multiple_statements("SELECT 1 /* ; */ FROM t"));
        assert!(!has_multiple_statements("SELECT 'it''s; fine'"));
    }

    #[test]
    fn test_dollar_quoted_bodies_are_one_statement() {
        assert!(!has_multiple_statements("SELECT $$a;b$$"));
        assert!(!has_multiple_statements("DO $body$ BEGIN PERFORM 1; PERFORM 2; END $body$;"));
        assert!(has_multiple_statements("SELECT $$a$$; SELECT 2"));
        // Positional parameters are not delimiters
        assert!(has_multiple_statements("SELECT $1; SELECT $2"));
        assert!(!has_limit_clause("SELECT $q$ LIMIT 5 $q$ AS s"));
    }

    #[test]
    fn test_inject_limit_appends_extra_row() {
        assert_eq!(inject_limit("SELECT * FROM t", 3), "SELECT * FROM t\nLIMIT 3");
        assert_eq!(inject_limit("SELECT * FROM t;  ", 3), "SELECT * FROM t\nLIMIT 3");
        assert_eq!(
            inject_limit("SELECT * FROM t -- all rows", 11),
            "SELECT * FROM t -- all rows\nLIMIT 11"
        );
    }

    #[test]
    fn test_inject_limit_is_idempotent() {
        let once = inject_limit("SELECT * FROM t", 5);
        assert_eq!(inject_limit(&once, 5), once);
        assert_eq!(inject_limit("select * from t limit 10", 3), "select * from t limit 10");
        assert_eq!(inject_limit("SELECT * FROM t LIMIT $1", 3), "SELECT * FROM t LIMIT $1");
        assert_eq!(inject_limit("SELECT * FROM t LIMIT ?", 3), "SELECT * FROM t LIMIT ?");
    }

    #[test]
    fn test_inject_limit_ignores_limit_inside_literal() {
        assert_eq!(
            inject_limit("SELECT 'limit 5' AS s", 2),
            "SELECT 'limit 5' AS s\nLIMIT 2"
        );
    }

    #[test]
    fn test_inject_limit_replaces_limit_all() {
        assert_eq!(inject_limit("SELECT * FROM t LIMIT ALL", 10), "SELECT * FROM t LIMIT 10");
        assert_eq!(
            inject_limit("select * from t limit all offset 5", 4),
            "select * from t limit 4 offset 5"
        );
        assert!(has_limit_clause("SELECT * FROM t LIMIT ALL"));
    }

    #[test]
    fn test_inject_limit_looks_past_subqueries() {
        let sql = "SELECT * FROM (SELECT id FROM t LIMIT 5) s";
        assert!(!has_limit_clause(sql));
        assert_eq!(inject_limit(sql, 3), format!("{sql}\nLIMIT 3"));

        let sql = "SELECT * FROM (SELECT id FROM t LIMIT 5) s LIMIT 2";
        assert_eq!(inject_limit(sql, 3), sql);
    }

    #[test]
    fn test_inject_limit_skips_non_select() {
        assert_eq!(inject_limit("DELETE FROM t", 3), "DELETE FROM t");
        assert_eq!(inject_limit("PRAGMA table_info(t)", 3), "PRAGMA table_info(t)");
    }

    #[test]
    fn test_inject_top() {
        assert_eq!(inject_top("SELECT * FROM t", 11), "SELECT TOP 11 * FROM t");
        assert_eq!(inject_top("select distinct a from t", 3), "select distinct TOP 3 a from t");
        assert_eq!(inject_top("-- hi\nSELECT a FROM t", 3), "SELECT TOP 3 a FROM t");
    }

    #[test]
    fn test_inject_top_is_idempotent() {
        let once = inject_top("SELECT * FROM t", 5);
        assert_eq!(inject_top(&once, 5), once);
        assert_eq!(inject_top("SELECT TOP (10) * FROM t", 3), "SELECT TOP (10) * FROM t");
        let paged = "SELECT * FROM t ORDER BY id OFFSET 0 ROWS FETCH NEXT 5 ROWS ONLY";
        assert_eq!(inject_top(paged, 3), paged);
    }

    #[test]
    fn test_inject_top_looks_past_subqueries() {
        assert_eq!(
            inject_top("SELECT * FROM (SELECT TOP 5 id FROM t ORDER BY id) s", 3),
            "SELECT TOP 3 * FROM (SELECT TOP 5 id FROM t ORDER BY id) s"
        );
    }

    #[test]
    fn test_inject_top_skips_cte_and_writes() {
        let cte = "WITH a AS (SELECT 1 AS x) SELECT * FROM a";
        assert_eq!(inject_top(cte, 3), cte);
        assert_eq!(inject_top("UPDATE t SET a = 1", 3), "UPDATE t SET a = 1");
    }

    #[test]
    fn test_truncate_rows() {
        let mut rows = vec![1, 2, 3];
        assert!(truncate_rows(&mut rows, 2));
        assert_eq!(rows, vec![1, 2]);

        let mut rows = vec![1, 2];
        assert!(!truncate_rows(&mut rows, 2));
        assert_eq!(rows, vec![1, 2]);

        let mut rows: Vec<i32> = vec![];
        assert!(!truncate_rows(&mut rows, 2));
    }

    #[test]
    fn test_like_match() {
        assert!(like_match("%", "anything"));
        assert!(like_match("%", ""));
        assert!(like_match("user%", "USERS"));
        assert!(like_match("%log", "audit_log"));
        assert!(like_match("%dit%", "audit_log"));
        assert!(like_match("a_c", "abc"));
        assert!(!like_match("a_c", "abbc"));
        assert!(!like_match("user", "users"));
        assert!(like_match("%a%b%", "xxaxxbxx"));
        assert!(!like_match("%a%b", "xxaxxbxx"));
    }

    #[test]
    fn test_rewrite_mssql_placeholders() {
        assert_eq!(
            rewrite_mssql_placeholders("SELECT * FROM t WHERE a = @p0 AND b = @P1").unwrap(),
            "SELECT * FROM t WHERE a = @P1 AND b = @P2"
        );
        assert_eq!(
            rewrite_mssql_placeholders("SELECT '@p0', @@VERSION, @pid").unwrap(),
            "SELECT '@p0', @@VERSION, @pid"
        );
        assert_eq!(
            rewrite_mssql_placeholders("SELECT @p10 -- @p1").unwrap(),
            "SELECT @P11 -- @p1"
        );
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("sales_2024").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("a`; DROP").is_err());
        assert!(validate_identifier("db.table").is_err());
    }

    #[test]
    fn test_mask_literals_preserves_offsets() {
        let sql = "SELECT 'héllo' -- ünïcode\nFROM t";
        assert_eq!(mask_literals(sql).len(), sql.len());
        let sql = "SELECT $é$ ünï $é$, $$ü$$";
        assert_eq!(mask_literals(sql).len(), sql.len());
    }

    #[test]
    fn test_has_output_clause() {
        assert!(has_output_clause("INSERT INTO t (a) OUTPUT inserted.id VALUES (1)"));
        assert!(has_output_clause("DELETE FROM t OUTPUT deleted.* WHERE id = @p0"));
        assert!(has_output_clause("MERGE t USING s ON t.id = s.id WHEN MATCHED THEN DELETE OUTPUT $action;"));
        assert!(!has_output_clause("UPDATE t SET note = 'OUTPUT' WHERE id = 1"));
        assert!(!has_output_clause("INSERT INTO t (a) VALUES (1) -- output"));
        assert!(!has_output_clause("UPDATE t SET a = (SELECT output FROM s)"));
    }
}
