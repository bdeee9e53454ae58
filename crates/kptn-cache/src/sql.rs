//! DuckDB SQL script handling: statement splitting and named-parameter
//! extraction, both aware of string literals and comments.

use std::collections::BTreeMap;

/// Split a script into executable statements on `;`, respecting single- and
/// double-quoted literals and line/block comments. Comments that precede any
/// statement content are dropped; comments embedded in a statement are kept.
pub fn split_statements(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut in_line_comment = false;
    let mut in_block_comment = false;
    let mut preserve_line_comment = false;
    let mut preserve_block_comment = false;
    let mut has_content = false;
    let mut i = 0;

    let flush = |current: &mut String, statements: &mut Vec<String>| {
        let statement = current.trim().to_string();
        if !statement.is_empty() && !statement.starts_with("--") && !statement.starts_with("/*") {
            statements.push(statement);
        }
        current.clear();
    };

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied().unwrap_or('\0');

        if in_single {
            current.push(ch);
            if ch == '\'' && next == '\'' {
                current.push(next);
                i += 2;
                continue;
            }
            if ch == '\'' {
                in_single = false;
            } else if !ch.is_whitespace() {
                has_content = true;
            }
            i += 1;
            continue;
        }

        if in_double {
            current.push(ch);
            if ch == '"' && next == '"' {
                current.push(next);
                i += 2;
                continue;
            }
            if ch == '"' {
                in_double = false;
            } else if !ch.is_whitespace() {
                has_content = true;
            }
            i += 1;
            continue;
        }

        if in_line_comment {
            if preserve_line_comment {
                current.push(ch);
            }
            if ch == '\n' {
                in_line_comment = false;
                preserve_line_comment = false;
            }
            i += 1;
            continue;
        }

        if in_block_comment {
            if ch == '*' && next == '/' {
                if preserve_block_comment {
                    current.push(ch);
                    current.push(next);
                }
                in_block_comment = false;
                preserve_block_comment = false;
                i += 2;
            } else {
                if preserve_block_comment {
                    current.push(ch);
                }
                i += 1;
            }
            continue;
        }

        if ch == '-' && next == '-' {
            preserve_line_comment = has_content;
            if preserve_line_comment {
                current.push(ch);
                current.push(next);
            }
            in_line_comment = true;
            i += 2;
            continue;
        }

        if ch == '/' && next == '*' {
            preserve_block_comment = has_content;
            if preserve_block_comment {
                current.push(ch);
                current.push(next);
            }
            in_block_comment = true;
            i += 2;
            continue;
        }

        if ch == '\'' {
            in_single = true;
            current.push(ch);
            has_content = true;
            i += 1;
            continue;
        }

        if ch == '"' {
            in_double = true;
            current.push(ch);
            has_content = true;
            i += 1;
            continue;
        }

        if ch == ';' {
            flush(&mut current, &mut statements);
            has_content = false;
            i += 1;
            continue;
        }

        current.push(ch);
        if !ch.is_whitespace() {
            has_content = true;
        }
        i += 1;
    }

    flush(&mut current, &mut statements);
    statements
}

/// Collect the `:name` / `$name` parameters a statement actually references,
/// restricted to names available in the runtime config. `::` casts and
/// quoted/commented text never match.
pub fn statement_parameters(
    statement: &str,
    available: &BTreeMap<String, serde_json::Value>,
) -> BTreeMap<String, serde_json::Value> {
    let chars: Vec<char> = statement.chars().collect();
    let mut used = BTreeMap::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut in_line_comment = false;
    let mut in_block_comment = false;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied().unwrap_or('\0');

        if in_single {
            if ch == '\'' && next == '\'' {
                i += 2;
                continue;
            }
            if ch == '\'' {
                in_single = false;
            }
            i += 1;
            continue;
        }
        if in_double {
            if ch == '"' && next == '"' {
                i += 2;
                continue;
            }
            if ch == '"' {
                in_double = false;
            }
            i += 1;
            continue;
        }
        if in_line_comment {
            if ch == '\n' {
                in_line_comment = false;
            }
            i += 1;
            continue;
        }
        if in_block_comment {
            if ch == '*' && next == '/' {
                in_block_comment = false;
                i += 2;
            } else {
                i += 1;
            }
            continue;
        }

        match ch {
            '-' if next == '-' => {
                in_line_comment = true;
                i += 2;
            }
            '/' if next == '*' => {
                in_block_comment = true;
                i += 2;
            }
            '\'' => {
                in_single = true;
                i += 1;
            }
            '"' => {
                in_double = true;
                i += 1;
            }
            ':' | '$' if next.is_alphabetic() || next == '_' => {
                // A second colon means a `::type` cast, not a parameter.
                if ch == ':' && i > 0 && chars[i - 1] == ':' {
                    i += 1;
                    continue;
                }
                let mut end = i + 1;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let name: String = chars[i + 1..end].iter().collect();
                if let Some(value) = available.get(&name) {
                    used.insert(name, value.clone());
                }
                i = end;
            }
            _ => {
                i += 1;
            }
        }
    }

    used
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_splits_on_semicolons() {
        let statements = split_statements("CREATE TABLE t (x INT);\nINSERT INTO t VALUES (1);");
        assert_eq!(
            statements,
            vec!["CREATE TABLE t (x INT)", "INSERT INTO t VALUES (1)"]
        );
    }

    #[test]
    fn test_semicolons_inside_literals_do_not_split() {
        let statements = split_statements("INSERT INTO t VALUES ('a;b');");
        assert_eq!(statements, vec!["INSERT INTO t VALUES ('a;b')"]);
    }

    #[test]
    fn test_leading_comments_are_dropped() {
        let statements = split_statements("-- setup\nSELECT 1;\n/* trailer */");
        assert_eq!(statements, vec!["SELECT 1"]);
    }

    #[test]
    fn test_embedded_comment_is_preserved() {
        let statements = split_statements("SELECT 1 -- keep me\n, 2;");
        assert_eq!(statements, vec!["SELECT 1 -- keep me\n, 2"]);
    }

    #[test]
    fn test_escaped_quotes() {
        let statements = split_statements("SELECT 'it''s;fine';SELECT \"we\"\"ird;name\";");
        assert_eq!(
            statements,
            vec!["SELECT 'it''s;fine'", "SELECT \"we\"\"ird;name\""]
        );
    }

    #[test]
    fn test_parameters_found_outside_literals_only() {
        let mut available = BTreeMap::new();
        available.insert("year".to_string(), json!(2022));
        available.insert("region".to_string(), json!("us"));

        let params = statement_parameters(
            "SELECT * FROM t WHERE y = :year AND label = ':region'",
            &available,
        );
        assert_eq!(params.len(), 1);
        assert_eq!(params["year"], json!(2022));
    }

    #[test]
    fn test_cast_colons_are_not_parameters() {
        let mut available = BTreeMap::new();
        available.insert("TEXT".to_string(), json!("oops"));
        let params = statement_parameters("SELECT x::TEXT FROM t", &available);
        assert!(params.is_empty());
    }

    #[test]
    fn test_dollar_parameters_match() {
        let mut available = BTreeMap::new();
        available.insert("year".to_string(), json!(2022));
        let params = statement_parameters("SELECT * FROM t WHERE y = $year", &available);
        assert_eq!(params["year"], json!(2022));
    }

    #[test]
    fn test_unknown_names_are_ignored() {
        let available = BTreeMap::new();
        let params = statement_parameters("SELECT :missing FROM t", &available);
        assert!(params.is_empty());
    }
}
