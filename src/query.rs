//! SQL text helpers: normalization for logs and verb/table detection for spans.

use once_cell::sync::Lazy;
use regex::Regex;

/// Normalize SQL text into a single line with single spaces.
///
/// Newlines and tabs become spaces, spaces are trimmed from the ends and runs
/// of spaces are collapsed until nothing changes. Other whitespace, such as
/// `\r`, is left alone.
pub fn clean_query(sql: &str) -> String {
    let mut cleaner = sql
        .replace(['\n', '\t'], " ")
        .trim_matches(['\n', '\t', ' '])
        .to_string();

    loop {
        let collapsed = cleaner.replace("  ", " ");
        if collapsed == cleaner {
            return cleaner;
        }
        cleaner = collapsed;
    }
}

/// Leading SQL keyword class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlVerb {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    Truncate,
    Begin,
    Commit,
    Rollback,
    Set,
    Other,
}

impl SqlVerb {
    /// Detect the verb from the first keyword of a statement.
    pub fn detect(sql: &str) -> Self {
        let keyword = sql
            .split(|c: char| c.is_whitespace() || c == '(')
            .find(|word| !word.is_empty())
            .unwrap_or_default()
            .to_ascii_uppercase();

        match keyword.as_str() {
            "SELECT" | "WITH" => SqlVerb::Select,
            "INSERT" => SqlVerb::Insert,
            "UPDATE" => SqlVerb::Update,
            "DELETE" => SqlVerb::Delete,
            "CREATE" => SqlVerb::Create,
            "DROP" => SqlVerb::Drop,
            "ALTER" => SqlVerb::Alter,
            "TRUNCATE" => SqlVerb::Truncate,
            "BEGIN" | "START" => SqlVerb::Begin,
            "COMMIT" => SqlVerb::Commit,
            "ROLLBACK" => SqlVerb::Rollback,
            "SET" => SqlVerb::Set,
            _ => SqlVerb::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SqlVerb::Select => "SELECT",
            SqlVerb::Insert => "INSERT",
            SqlVerb::Update => "UPDATE",
            SqlVerb::Delete => "DELETE",
            SqlVerb::Create => "CREATE",
            SqlVerb::Drop => "DROP",
            SqlVerb::Alter => "ALTER",
            SqlVerb::Truncate => "TRUNCATE",
            SqlVerb::Begin => "BEGIN",
            SqlVerb::Commit => "COMMIT",
            SqlVerb::Rollback => "ROLLBACK",
            SqlVerb::Set => "SET",
            SqlVerb::Other => "QUERY",
        }
    }

    /// The keyword that precedes the table name for this verb, if any.
    fn table_keyword(&self) -> Option<&'static str> {
        match self {
            SqlVerb::Select | SqlVerb::Delete => Some("FROM"),
            SqlVerb::Insert => Some("INTO"),
            SqlVerb::Update => Some("UPDATE"),
            SqlVerb::Create | SqlVerb::Drop | SqlVerb::Alter => Some("TABLE"),
            SqlVerb::Truncate => Some("TRUNCATE"),
            _ => None,
        }
    }
}

impl std::fmt::Display for SqlVerb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// keyword, optional TABLE / IF [NOT] EXISTS, optional quoting, then the name
static TABLE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(FROM|INTO|UPDATE|TABLE|TRUNCATE)\s+(?:TABLE\s+)?(?:IF\s+(?:NOT\s+)?EXISTS\s+)?[`"\[]?(\w+)[`"\]]?"#,
    )
    .expect("table regex is valid")
});

/// Verb and primary table of a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSql {
    pub verb: SqlVerb,
    pub table: Option<String>,
}

impl ParsedSql {
    pub fn parse(sql: &str) -> Self {
        let verb = SqlVerb::detect(sql);
        let table = verb.table_keyword().and_then(|keyword| {
            TABLE_REGEX
                .captures_iter(sql)
                .find(|caps| caps[1].eq_ignore_ascii_case(keyword))
                .map(|caps| caps[2].to_lowercase())
        });
        Self { verb, table }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_query_single_line() {
        let sql = "\n\tSELECT id,\n\t       name\n  FROM users\n WHERE id = $1\n";
        assert_eq!(clean_query(sql), "SELECT id, name FROM users WHERE id = $1");
    }

    #[test]
    fn test_clean_query_collapses_long_runs() {
        assert_eq!(clean_query("a        b"), "a b");
        assert_eq!(clean_query("a \t \n b"), "a b");
        assert_eq!(clean_query("   "), "");
        assert_eq!(clean_query(""), "");
    }

    #[test]
    fn test_clean_query_keeps_other_whitespace() {
        assert_eq!(clean_query("\r\nSELECT 1\r"), "\r SELECT 1\r");
        assert_eq!(clean_query(" \u{a0}SELECT 1 "), "\u{a0}SELECT 1");
    }

    #[test]
    fn test_clean_query_idempotent() {
        let inputs = [
            "SELECT 1",
            "  select *\n\n\tfrom   t  ",
            "\t\t\t",
            "INSERT INTO t (a, b)\n    VALUES ($1,   $2)",
            "x\t\ty  \n z",
        ];
        for input in inputs {
            let once = clean_query(input);
            assert_eq!(clean_query(&once), once, "input: {input:?}");
        }
    }

    #[test]
    fn test_detect_verb() {
        assert_eq!(SqlVerb::detect("select 1"), SqlVerb::Select);
        assert_eq!(SqlVerb::detect("  WITH cte AS (SELECT 1) SELECT * FROM cte"), SqlVerb::Select);
        assert_eq!(SqlVerb::detect("(SELECT 1)"), SqlVerb::Select);
        assert_eq!(SqlVerb::detect("INSERT INTO t VALUES (1)"), SqlVerb::Insert);
        assert_eq!(SqlVerb::detect("START TRANSACTION"), SqlVerb::Begin);
        assert_eq!(SqlVerb::detect("VACUUM"), SqlVerb::Other);
        assert_eq!(SqlVerb::detect(""), SqlVerb::Other);
    }

    #[test]
    fn test_parse_tables() {
        let cases = [
            ("SELECT * FROM users WHERE id = 1", Some("users")),
            (r#"SELECT * FROM "Users""#, Some("users")),
            ("INSERT INTO grades (student_id) VALUES ($1)", Some("grades")),
            ("UPDATE students SET name = $1", Some("students")),
            ("DELETE FROM assignments WHERE id = $1", Some("assignments")),
            ("CREATE TABLE IF NOT EXISTS audit (id int)", Some("audit")),
            ("TRUNCATE TABLE sessions", Some("sessions")),
            ("COMMIT", None),
        ];
        for (sql, table) in cases {
            assert_eq!(ParsedSql::parse(sql).table.as_deref(), table, "sql: {sql}");
        }
    }
}
