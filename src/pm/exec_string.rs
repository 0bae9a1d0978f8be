//! Command string handling: shell-like tokenisation and `$VAR` expansion.
//!
//! Command lines arrive as a single string in the orders message and are
//! re-tokenised every time the command starts, so edits to a command take
//! effect on its next start without any extra bookkeeping.

use std::collections::HashMap;

/// Splits a command string into tokens.
///
/// Whitespace separates tokens. Single and double quotes group and do not
/// nest; the matching quote closes the group. A backslash escapes the next
/// character (inside single quotes it is literal); a lone backslash at the
/// end of the string is preserved.
pub fn separate_args(input: &str) -> Vec<String> {
    let chars: Vec<char> = input.chars().collect();
    let mut result = Vec::new();
    let mut cur = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    cur.push(c);
                }
            }
            Some(_) => {
                if c == '"' {
                    quote = None;
                } else if c == '\\' {
                    if i + 1 < chars.len() {
                        i += 1;
                        cur.push(chars[i]);
                    } else {
                        cur.push('\\');
                    }
                } else {
                    cur.push(c);
                }
            }
            None => {
                if c.is_whitespace() {
                    if in_token {
                        result.push(std::mem::take(&mut cur));
                        in_token = false;
                    }
                } else if c == '\'' || c == '"' {
                    quote = Some(c);
                    in_token = true;
                } else if c == '\\' {
                    in_token = true;
                    if i + 1 < chars.len() {
                        i += 1;
                        cur.push(chars[i]);
                    } else {
                        cur.push('\\');
                    }
                } else {
                    in_token = true;
                    cur.push(c);
                }
            }
        }
        i += 1;
    }
    if in_token {
        result.push(cur);
    }
    result
}

/// Expands `$NAME` and `${NAME}` in a single token.
///
/// Values come from `vars` first, then from the process environment. A
/// variable name starts with `[A-Za-z_]` and continues with `[A-Za-z_0-9]`.
/// An unmatched `${` or an unknown variable leaves the original text in
/// place. A backslash escapes the next character.
pub fn expand_variables(input: &str, vars: &HashMap<String, String>) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            if i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
            } else {
                out.push('\\');
                i += 1;
            }
            continue;
        }
        if c != '$' {
            out.push(c);
            i += 1;
            continue;
        }

        // Parse a variable reference starting at the '$'.
        let dollar = i;
        i += 1;
        if i >= chars.len() {
            out.push('$');
            continue;
        }
        let braced = chars[i] == '{';
        if braced {
            i += 1;
        }
        let name_start = i;
        while i < chars.len() && is_name_char(chars[i], i - name_start) {
            i += 1;
        }
        let name: String = chars[name_start..i].iter().collect();

        let mut braces_ok = true;
        if braced {
            if i < chars.len() && chars[i] == '}' {
                i += 1;
            } else {
                braces_ok = false;
            }
        }

        let value = if !name.is_empty() && braces_ok {
            vars.get(&name)
                .cloned()
                .or_else(|| std::env::var(&name).ok())
        } else {
            None
        };
        match value {
            Some(v) => out.push_str(&v),
            None => {
                // Expansion failed; keep the original text verbatim.
                out.extend(&chars[dollar..i]);
            }
        }
    }
    out
}

fn is_name_char(c: char, pos: usize) -> bool {
    c.is_ascii_alphabetic() || c == '_' || (pos > 0 && c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separates_plain_words() {
        assert_eq!(separate_args("echo hello world"), ["echo", "hello", "world"]);
        assert_eq!(separate_args("  spaced \t out\n"), ["spaced", "out"]);
        assert!(separate_args("").is_empty());
        assert!(separate_args("   ").is_empty());
    }

    #[test]
    fn quotes_group_and_do_not_nest() {
        assert_eq!(
            separate_args("echo  'hello  world' \"quoted\\\"text\""),
            ["echo", "hello  world", "quoted\"text"]
        );
        assert_eq!(separate_args("a 'b \"c\" d' e"), ["a", "b \"c\" d", "e"]);
        assert_eq!(separate_args("\"it's\""), ["it's"]);
    }

    #[test]
    fn backslash_escapes_literally() {
        assert_eq!(separate_args("a\\ b c"), ["a b", "c"]);
        assert_eq!(separate_args("tail\\"), ["tail\\"]);
        assert_eq!(separate_args("'lit\\eral'"), ["lit\\eral"]);
    }

    #[test]
    fn adjacent_quotes_join_into_one_token() {
        assert_eq!(separate_args("ab'cd'\"ef\""), ["abcdef"]);
        assert_eq!(separate_args("''"), [""]);
    }

    #[test]
    fn expands_from_table_then_environment() {
        let mut vars = HashMap::new();
        vars.insert("FOO".to_string(), "/a".to_string());
        std::env::set_var("PM_EXPAND_TEST_BAR", "b");
        assert_eq!(
            expand_variables("$FOO/${PM_EXPAND_TEST_BAR}/\\$lit", &vars),
            "/a/b/$lit"
        );
        // The table wins over the environment.
        std::env::set_var("FOO", "/env");
        assert_eq!(expand_variables("$FOO", &vars), "/a");
        std::env::remove_var("FOO");
    }

    #[test]
    fn failed_expansions_are_left_verbatim() {
        let vars = HashMap::new();
        assert_eq!(
            expand_variables("${PM_EXPAND_TEST_MISSING}", &vars),
            "${PM_EXPAND_TEST_MISSING}"
        );
        assert_eq!(expand_variables("${UNCLOSED", &vars), "${UNCLOSED");
        assert_eq!(expand_variables("a$", &vars), "a$");
        assert_eq!(expand_variables("100$/day", &vars), "100$/day");
    }

    #[test]
    fn name_grammar_rejects_leading_digits() {
        let mut vars = HashMap::new();
        vars.insert("A1".to_string(), "ok".to_string());
        assert_eq!(expand_variables("$A1", &vars), "ok");
        assert_eq!(expand_variables("$1A", &vars), "$1A");
    }
}
