//! Statement guard for tenant handles.
//!
//! Statements issued through a [`TenantHandle`](crate::router::TenantHandle)
//! may not change the schema context or control the transaction the router
//! owns. The guard is a lexical check over the statement text: comments and
//! string literals are blanked out, each `;`-separated segment is checked
//! for a forbidden leading keyword, and the whole text is searched for
//! forbidden tokens. Dollar-quoted bodies are checked like statements, which
//! rejects some harmless `$$` string constants.

use crate::error::{DbError, DbResult};

const FORBIDDEN_LEADING: &[&str] = &[
    "set",
    "reset",
    "discard",
    "begin",
    "commit",
    "rollback",
    "savepoint",
    "release",
    "start",
    "end",
    "abort",
    "prepare",
    "call",
    "do",
];

const FORBIDDEN_TOKENS: &[&str] = &["search_path", "set_config", "set_role", "session_authorization"];

/// Rejects statements that would escape the asserted schema context.
#[derive(Debug, Clone)]
pub struct StatementGuard {
    procedure: String,
}

impl StatementGuard {
    /// Create a guard that also rejects calls to the named assertion procedure.
    pub fn new(procedure: impl Into<String>) -> Self {
        Self {
            procedure: procedure.into().to_ascii_lowercase(),
        }
    }

    /// Check a statement.
    pub fn check(&self, sql: &str) -> DbResult<()> {
        let text = normalize(sql, false);

        for segment in text.split(';') {
            let Some(word) = segment.split_whitespace().next() else {
                continue;
            };
            if FORBIDDEN_LEADING.contains(&word) {
                return Err(DbError::forbidden(format!(
                    "'{}' statements are not allowed inside a tenant context",
                    word.to_ascii_uppercase()
                )));
            }
        }

        for token in FORBIDDEN_TOKENS
            .iter()
            .copied()
            .chain(std::iter::once(self.procedure.as_str()))
        {
            if contains_word(&text, token) {
                return Err(DbError::forbidden(format!(
                    "statement references '{}', which is not allowed inside a tenant context",
                    token
                )));
            }
        }

        Ok(())
    }
}

/// Lowercase the statement and blank out comments and string literals,
/// keeping `;` separators and the text of quoted identifiers.
///
/// Dollar-quoted bodies are emitted as their own segments and scanned again
/// with `scan_literals` set, since they are executed as statements by `DO`
/// and function bodies. Inside such a body, single-quoted literals may be
/// dynamic SQL for `EXECUTE`, so they are scanned as statements too.
fn normalize(sql: &str, scan_literals: bool) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;

    while let Some(c) = rest.chars().next() {
        let after = &rest[c.len_utf8()..];
        match c {
            '-' if after.starts_with('-') => {
                rest = after.find('\n').map_or("", |i| &after[i + 1..]);
                out.push(' ');
            }
            '/' if after.starts_with('*') => {
                rest = after[1..].find("*/").map_or("", |i| &after[i + 3..]);
                out.push(' ');
            }
            '\'' => {
                let (literal, tail) = split_quoted(after, '\'');
                rest = tail;
                if scan_literals {
                    push_segment(&mut out, &normalize(&literal, true));
                } else {
                    out.push_str(" '' ");
                }
            }
            '"' => {
                // Quoted identifiers keep their text so that `"search_path"`
                // is still caught.
                let (ident, tail) = split_quoted(after, '"');
                rest = tail;
                out.push(' ');
                out.push_str(&ident.to_ascii_lowercase());
                out.push(' ');
            }
            '$' if !out.chars().next_back().is_some_and(is_ident) => match dollar_tag(after) {
                Some(len) => {
                    let delimiter = &rest[..len + 2];
                    let opened = &rest[len + 2..];
                    let (body, tail) = match opened.find(delimiter) {
                        Some(i) => (&opened[..i], &opened[i + delimiter.len()..]),
                        None => (opened, ""),
                    };
                    push_segment(&mut out, &normalize(body, true));
                    rest = tail;
                }
                None => {
                    out.push('$');
                    rest = after;
                }
            },
            _ => {
                out.push(c.to_ascii_lowercase());
                rest = after;
            }
        }
    }

    out
}

fn push_segment(out: &mut String, segment: &str) {
    out.push_str(" ; ");
    out.push_str(segment);
    out.push_str(" ; ");
}

/// Split at the closing `quote`, unescaping doubled quotes. An unterminated
/// quote runs to the end of the text.
fn split_quoted(s: &str, quote: char) -> (String, &str) {
    let mut text = String::new();
    let mut chars = s.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == quote {
            if chars.peek().is_some_and(|&(_, next)| next == quote) {
                chars.next();
                text.push(quote);
                continue;
            }
            return (text, &s[i + c.len_utf8()..]);
        }
        text.push(c);
    }
    (text, "")
}

/// Length of the tag in a `$tag$` opener, given the text after the first `$`.
/// Positional parameters such as `$1` are not tags.
fn dollar_tag(s: &str) -> Option<usize> {
    let len = s.find(|c: char| !is_ident(c))?;
    if s.starts_with(|c: char| c.is_ascii_digit()) || !s[len..].starts_with('$') {
        return None;
    }
    Some(len)
}

fn is_ident(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn contains_word(text: &str, word: &str) -> bool {
    text.match_indices(word).any(|(start, _)| {
        let before = text[..start].chars().next_back();
        let after = text[start + word.len()..].chars().next();
        !before.is_some_and(is_ident) && !after.is_some_and(is_ident)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbErrorKind;

    fn guard() -> StatementGuard {
        StatementGuard::new("assert_environment")
    }

    fn rejected(sql: &str) -> bool {
        matches!(guard().check(sql), Err(e) if e.kind == DbErrorKind::Forbidden)
    }

    #[test]
    fn test_allows_plain_statements() {
        assert!(guard().check("SELECT * FROM listings WHERE id = $1").is_ok());
        assert!(guard().check("INSERT INTO offers VALUES ($1, $2)").is_ok());
        assert!(guard().check("UPDATE listings SET price = 10 WHERE id = 1").is_ok());
        assert!(guard().check("DELETE FROM listings").is_ok());
    }

    #[test]
    fn test_rejects_context_changes() {
        assert!(rejected("SET search_path TO client_2"));
        assert!(rejected("set local search_path = public"));
        assert!(rejected("SELECT set_config('search_path', 'client_2', false)"));
        assert!(rejected("SELECT pg_catalog.set_config('x', 'y', true)"));
        assert!(rejected("RESET ALL"));
        assert!(rejected("DISCARD ALL"));
        assert!(rejected("SET ROLE admin"));
        assert!(rejected("SET SESSION AUTHORIZATION admin"));
        assert!(rejected("CALL \"client_2\".assert_environment(false)"));
    }

    #[test]
    fn test_rejects_transaction_control() {
        assert!(rejected("BEGIN"));
        assert!(rejected("commit"));
        assert!(rejected("ROLLBACK"));
        assert!(rejected("SAVEPOINT s1"));
        assert!(rejected("START TRANSACTION"));
        assert!(rejected("END"));
    }

    #[test]
    fn test_rejects_hidden_segments() {
        assert!(rejected("SELECT 1; SET search_path TO client_2"));
        assert!(rejected("/* harmless */ COMMIT"));
        assert!(rejected("-- note\nRESET search_path"));
        assert!(rejected("SELECT 1 FROM \"search_path\""));
    }

    #[test]
    fn test_ignores_string_literals() {
        assert!(guard().check("INSERT INTO notes VALUES ('SET search_path; COMMIT')").is_ok());
        assert!(guard().check("SELECT * FROM t -- commit later").is_ok());
    }

    #[test]
    fn test_word_boundaries() {
        assert!(guard().check("SELECT settings, reset_count FROM t").is_ok());
        assert!(guard().check("SELECT * FROM my_search_path_log").is_ok());
    }

    #[test]
    fn test_rejects_dollar_quoted_bodies() {
        assert!(rejected("DO $$BEGIN EXECUTE 'SET search_path TO client_2'; END$$"));
        assert!(rejected("do $x$ begin perform 1; end $x$"));
        assert!(rejected(
            "CREATE FUNCTION f() RETURNS void LANGUAGE sql AS $body$ SET search_path TO client_2 $body$"
        ));
        assert!(rejected(
            "CREATE FUNCTION f() RETURNS void LANGUAGE plpgsql AS $f$ BEGIN EXECUTE 'RESET ALL'; END $f$"
        ));
        assert!(rejected("SELECT $q$unterminated; COMMIT"));
    }

    #[test]
    fn test_positional_parameters_are_not_dollar_quotes() {
        assert!(guard().check("SELECT $1::text, $2 FROM listings WHERE id = $3").is_ok());
        assert!(guard().check("SELECT price$usd FROM listings").is_ok());
        assert!(guard().check("SELECT $tag$ plain text $tag$").is_ok());
    }
}
