//! Rendering of evaluation results into display documents.

use std::collections::BTreeMap;

use serde_json::Value;

/// Renders an evaluation result as a mime-type keyed document.
pub trait DisplayFormatter: Send {
    fn format(&self, value: &Value) -> BTreeMap<String, String>;
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Default formatter.
///
/// An object whose keys all look like mime types is taken as a
/// ready-made display bundle; anything else renders as `text/plain`,
/// with strings shown unquoted.
pub struct MimeFormatter;

impl DisplayFormatter for MimeFormatter {
    fn format(&self, value: &Value) -> BTreeMap<String, String> {
        if let Value::Object(map) = value {
            if !map.is_empty() && map.keys().all(|key| key.contains('/')) {
                return map.iter().map(|(key, v)| (key.clone(), render(v))).collect();
            }
        }

        let mut data = BTreeMap::new();
        data.insert("text/plain".into(), render(value));
        data
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_strings_render_unquoted() {
        let data = MimeFormatter.format(&json!("hello"));
        assert_eq!(data.get("text/plain"), Some(&"hello".to_string()));
    }

    #[test]
    fn test_numbers_render_as_text_plain() {
        let data = MimeFormatter.format(&json!(6));
        assert_eq!(data.get("text/plain"), Some(&"6".to_string()));
    }

    #[test]
    fn test_mime_bundle_passes_through() {
        let data = MimeFormatter.format(&json!({
            "text/plain": "plain",
            "text/html": "<b>rich</b>"
        }));
        assert_eq!(data.get("text/plain"), Some(&"plain".to_string()));
        assert_eq!(data.get("text/html"), Some(&"<b>rich</b>".to_string()));
    }

    #[test]
    fn test_plain_object_is_not_a_bundle() {
        let data = MimeFormatter.format(&json!({"x": 5}));
        assert_eq!(data.get("text/plain"), Some(&r#"{"x":5}"#.to_string()));
    }
}
