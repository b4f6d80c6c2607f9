//! Prompt text substitution.
//!
//! Two independent single-pass expansions are applied to instruction text:
//! snippet references `{%name%}` are replaced from the graph's snippet table,
//! then variable references `{{name}}` are replaced from the test's dynamic
//! variables. Unknown references are left verbatim and replaced text is never
//! re-scanned.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

fn snippet_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{%\s*([A-Za-z0-9_.\-]+)\s*%\}")
            .unwrap_or_else(|err| panic!("invalid snippet pattern: {err}"))
    })
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}")
            .unwrap_or_else(|err| panic!("invalid variable pattern: {err}"))
    })
}

/// Replace `{%name%}` references with snippet text.
pub fn expand_snippets(text: &str, snippets: &BTreeMap<String, String>) -> String {
    if snippets.is_empty() {
        return text.to_string();
    }
    snippet_pattern()
        .replace_all(text, |caps: &Captures<'_>| match snippets.get(&caps[1]) {
            Some(snippet) => snippet.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Replace `{{name}}` references with dynamic variable values.
///
/// String values are inserted bare; other JSON values use their compact
/// JSON rendering.
pub fn substitute_variables(text: &str, variables: &HashMap<String, Value>) -> String {
    if variables.is_empty() {
        return text.to_string();
    }
    variable_pattern()
        .replace_all(text, |caps: &Captures<'_>| match variables.get(&caps[1]) {
            Some(value) => render_value(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Snippets first, then variables.
pub fn render(
    text: &str,
    snippets: &BTreeMap<String, String>,
    variables: &HashMap<String, Value>,
) -> String {
    substitute_variables(&expand_snippets(text, snippets), variables)
}

/// Names of every snippet referenced in `text`, in order of appearance.
pub fn referenced_snippets(text: &str) -> Vec<String> {
    snippet_pattern()
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect()
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snippets(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn test_unknown_references_stay_verbatim() {
        let text = "Hello {{name}}, see {%policy%}";
        assert_eq!(render(text, &BTreeMap::new(), &HashMap::new()), text);
        assert_eq!(
            render(text, &snippets(&[("other", "x")]), &vars(&[("other", json!(1))])),
            text
        );
    }

    #[test]
    fn test_snippet_then_variable() {
        let text = "{%greeting%} Your balance is {{balance}}.";
        let out = render(
            text,
            &snippets(&[("greeting", "Hi {{name}}!")]),
            &vars(&[("name", json!("Ada")), ("balance", json!(42))]),
        );
        assert_eq!(out, "Hi Ada! Your balance is 42.");
    }

    #[test]
    fn test_variable_values_are_not_rescanned() {
        let out = render(
            "{{a}}",
            &snippets(&[("s", "SNIPPET")]),
            &vars(&[("a", json!("{{b}} {%s%}")), ("b", json!("nope"))]),
        );
        assert_eq!(out, "{{b}} {%s%}");
    }

    #[test]
    fn test_snippet_text_is_not_reexpanded_as_snippet() {
        let out = expand_snippets("{%a%}", &snippets(&[("a", "{%b%}"), ("b", "deep")]));
        assert_eq!(out, "{%b%}");
    }

    #[test]
    fn test_whitespace_inside_braces() {
        let out = substitute_variables("{{ name }}", &vars(&[("name", json!("Bo"))]));
        assert_eq!(out, "Bo");
    }

    #[test]
    fn test_referenced_snippets() {
        assert_eq!(referenced_snippets("{%a%} and {% b %}"), vec!["a", "b"]);
    }

    proptest::proptest! {
        #[test]
        fn prop_inserted_values_are_left_alone(value in ".*", snippet in ".*") {
            let variables = vars(&[("v", json!(value.clone())), ("b", json!("other"))]);
            let out = render("[{%s%}|{{v}}]", &snippets(&[("s", snippet.as_str())]), &variables);
            let expected = format!("[{}|{value}]", substitute_variables(&snippet, &variables));
            proptest::prop_assert_eq!(out, expected);
        }

        #[test]
        fn prop_text_without_references_is_unchanged(text in "[^{}]*") {
            let out = render(&text, &snippets(&[("s", "x")]), &vars(&[("v", json!(1))]));
            proptest::prop_assert_eq!(out, text);
        }
    }
}
