use colored::Colorize;
use once_cell::sync::Lazy;
use regex::Regex;

/// Output post-processor applied after rendering when configured. The core
/// returns the highlighted string unchanged.
pub trait PrettyPrinter: Send + Sync {
    fn highlight(&self, sql: &str) -> String;
}

/// ANSI highlighter: SQL keywords bold cyan, quoted literals magenta.
/// Colors follow the `colored` crate's global override, so output stays
/// plain when colors are disabled.
#[derive(Debug, Default, Clone)]
pub struct SqlHighlighter;

const KEYWORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "AND", "OR", "NOT", "AS", "ON", "JOIN", "LEFT", "RIGHT", "INNER",
    "OUTER", "FULL", "CROSS", "UNION", "ALL", "GROUP", "ORDER", "BY", "HAVING", "LIMIT", "OFFSET",
    "INSERT", "INTO", "VALUES", "UPDATE", "SET", "DELETE", "CREATE", "TABLE", "DROP", "ALTER",
    "WITH", "CASE", "WHEN", "THEN", "ELSE", "END", "DISTINCT", "BETWEEN", "IN", "IS", "NULL",
    "LIKE",
];

static KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"\b(?i:{})\b", KEYWORDS.join("|"))).expect("literal pattern")
});
static QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"'[^']*'|"[^"]*""#).expect("literal pattern"));

impl PrettyPrinter for SqlHighlighter {
    fn highlight(&self, sql: &str) -> String {
        let pass = KEYWORD.replace_all(sql, |caps: &regex::Captures<'_>| {
            caps[0].cyan().bold().to_string()
        });
        QUOTED
            .replace_all(&pass, |caps: &regex::Captures<'_>| {
                caps[0].magenta().to_string()
            })
            .into_owned()
    }
}
