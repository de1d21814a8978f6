//! Tolerant JSON preprocessing for action bodies
//!
//! LLM generators routinely emit three defects inside otherwise-valid JSON:
//! C-style line comments, block comments, and trailing commas. These are
//! stripped string-aware before the body is handed to `serde_json` for
//! strict parsing. Anything else malformed still fails strict parsing and
//! the action is dropped with a warning.

/// Strip `// ...`, `/* ... */` and trailing commas from a JSON candidate.
pub fn strip_json_defects(input: &str) -> String {
    strip_trailing_commas(&strip_comments(input))
}

fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' => match chars.peek() {
                Some('/') => {
                    chars.next();
                    for c in chars.by_ref() {
                        if c == '\n' {
                            out.push('\n');
                            break;
                        }
                    }
                }
                Some('*') => {
                    chars.next();
                    let mut prev = '\0';
                    for c in chars.by_ref() {
                        if prev == '*' && c == '/' {
                            break;
                        }
                        prev = c;
                    }
                }
                _ => out.push(c),
            },
            _ => out.push(c),
        }
    }

    out
}

fn strip_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }

        if c == ',' {
            // Drop the comma when the next non-whitespace char closes a
            // container.
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1;
                continue;
            }
        }

        out.push(c);
        i += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn parse(input: &str) -> Value {
        serde_json::from_str(&strip_json_defects(input)).unwrap()
    }

    #[test]
    fn test_valid_json_unchanged() {
        let input = r#"{"name": "t", "parameters": {"x": [1, 2]}}"#;
        assert_eq!(strip_json_defects(input), input);
    }

    #[test]
    fn test_line_comments() {
        let input = "{\n  \"a\": 1, // the first field\n  \"b\": 2\n}";
        assert_eq!(parse(input), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_block_comments() {
        let input = r#"{"a": /* inline */ 1, "b": 2}"#;
        assert_eq!(parse(input), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_trailing_comma_in_object() {
        let input = r#"{"name":"t","parameters":{},}"#;
        assert_eq!(parse(input), json!({"name": "t", "parameters": {}}));
    }

    #[test]
    fn test_trailing_comma_in_array() {
        let input = r#"{"xs": [1, 2, 3,]}"#;
        assert_eq!(parse(input), json!({"xs": [1, 2, 3]}));
    }

    #[test]
    fn test_trailing_comma_with_newline() {
        let input = "{\"a\": 1,\n}";
        assert_eq!(parse(input), json!({"a": 1}));
    }

    #[test]
    fn test_comment_markers_inside_strings_kept() {
        let input = r#"{"url": "http://example.com", "note": "a, b, /* not a comment */"}"#;
        assert_eq!(
            parse(input),
            json!({"url": "http://example.com", "note": "a, b, /* not a comment */"})
        );
    }

    #[test]
    fn test_escaped_quote_inside_string() {
        let input = r#"{"s": "say \"hi\" // still text",}"#;
        assert_eq!(parse(input), json!({"s": "say \"hi\" // still text"}));
    }

    #[test]
    fn test_all_defects_together() {
        let input = r#"{
            // header comment
            "name": "t", /* mid */
            "parameters": {"x": 1,},
        }"#;
        assert_eq!(parse(input), json!({"name": "t", "parameters": {"x": 1}}));
    }

    #[test]
    fn test_unrecoverable_still_fails() {
        let input = r#"{"name": }"#;
        assert!(serde_json::from_str::<Value>(&strip_json_defects(input)).is_err());
    }
}
