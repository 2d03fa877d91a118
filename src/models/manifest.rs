use crate::error::{LivecapError, Result};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// A model offered by the remote manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RemoteModel {
    pub id: String,
    pub version: String,
    pub language: String,
    pub url: String,
    pub filename: String,
    pub size_bytes: u64,
    pub name: String,
    pub author: String,
    pub description: String,
    pub url_website: String,
}

impl RemoteModel {
    /// Human-facing label, falling back to the id
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Required fields present and filename is a bare file name
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty()
            && !self.url.is_empty()
            && !self.filename.is_empty()
            && is_bare_filename(&self.filename)
    }
}

/// Plain file name: no directory parts, not `.` or `..`
pub(crate) fn is_bare_filename(name: &str) -> bool {
    name != "." && name != ".." && !name.contains('/') && !name.contains('\\')
}

/// Fetch and parse the manifest at `url`
pub async fn fetch_manifest(
    transport: &dyn Transport,
    url: &str,
    timeout: Duration,
) -> Result<Vec<RemoteModel>> {
    tracing::info!("Fetching model manifest from {url}");

    let body = transport.get_text(url, timeout).await?;
    if body.trim().is_empty() {
        return Err(LivecapError::Network(format!(
            "GET {url}: empty response"
        )));
    }

    let models = parse_manifest(&body)?;
    tracing::info!("Manifest lists {} model(s)", models.len());
    Ok(models)
}

/// Parse a manifest body into valid records
///
/// Valid JSON is read structurally: every object with an `id` key is an
/// entry, at any depth (a top-level array, a `models` array, or any other
/// container key). Anything else is scanned leniently for `"id"` fragments.
/// Invalid entries are skipped individually.
pub fn parse_manifest(body: &str) -> Result<Vec<RemoteModel>> {
    let (json_like, candidates) = match serde_json::from_str::<Value>(body) {
        Ok(doc) => (doc.is_array() || doc.is_object(), from_document(&doc)),
        Err(e) => {
            tracing::debug!("Manifest is not strict JSON ({e}), scanning fragments");
            let (fragments, candidates) = scan_fragments(body);
            (fragments > 0, candidates)
        }
    };

    let total = candidates.len();
    let models: Vec<RemoteModel> = candidates
        .into_iter()
        .filter(|m| {
            let keep = m.is_valid();
            if !keep {
                tracing::debug!("Skipping manifest entry '{}': missing id/url/filename", m.id);
            }
            keep
        })
        .collect();

    if models.is_empty() {
        if !json_like {
            return Err(LivecapError::ManifestInvalid(
                "response does not look like a model manifest".to_string(),
            ));
        }
        return Err(LivecapError::ManifestEmpty);
    }

    if models.len() < total {
        tracing::warn!(
            "Skipped {} malformed manifest entr(ies)",
            total - models.len()
        );
    }

    Ok(models)
}

fn from_document(doc: &Value) -> Vec<RemoteModel> {
    let mut entries = Vec::new();
    collect_entries(doc, &mut entries);

    entries
        .into_iter()
        .map(|entry| RemoteModel {
            id: json_string(entry, "id"),
            version: json_string(entry, "version"),
            language: json_string(entry, "language"),
            url: json_string(entry, "url"),
            filename: json_string(entry, "filename"),
            size_bytes: json_u64(entry, "size_bytes"),
            name: json_string(entry, "name"),
            author: json_string(entry, "author"),
            description: json_string(entry, "description"),
            url_website: json_string(entry, "url_website"),
        })
        .collect()
}

/// Every object carrying an `id` key, wherever it sits in the document
fn collect_entries<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) if map.contains_key("id") => out.push(value),
        Value::Object(map) => map.values().for_each(|v| collect_entries(v, out)),
        Value::Array(items) => items.iter().for_each(|v| collect_entries(v, out)),
        _ => {}
    }
}

fn json_string(entry: &Value, key: &str) -> String {
    match entry.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn json_u64(entry: &Value, key: &str) -> u64 {
    match entry.get(key) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Lenient textual scan: each fragment runs from an `"id"` key to the next `}`
///
/// Returns the number of fragments seen and the records extracted from them.
fn scan_fragments(body: &str) -> (usize, Vec<RemoteModel>) {
    let mut out = Vec::new();
    let mut fragments = 0;
    let mut pos = 0;

    while let Some(rel) = body[pos..].find("\"id\"") {
        let start = pos + rel;
        let end = body[start..].find('}').map_or(body.len(), |e| start + e);
        let fragment = &body[start..end];
        fragments += 1;

        out.push(RemoteModel {
            id: extract_string(fragment, "id"),
            version: extract_string(fragment, "version"),
            language: extract_string(fragment, "language"),
            url: extract_string(fragment, "url"),
            filename: extract_string(fragment, "filename"),
            size_bytes: extract_u64(fragment, "size_bytes"),
            name: extract_string(fragment, "name"),
            author: extract_string(fragment, "author"),
            description: extract_string(fragment, "description"),
            url_website: extract_string(fragment, "url_website"),
        });

        if end >= body.len() {
            break;
        }
        pos = end + 1;
    }

    (fragments, out)
}

/// Locate the raw text after `"key":` with leading whitespace removed
fn value_after_key<'a>(fragment: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("\"{key}\"");
    let at = fragment.find(&needle)?;
    let rest = &fragment[at + needle.len()..];
    let rest = rest.trim_start().strip_prefix(':')?;
    Some(rest.trim_start())
}

fn extract_string(fragment: &str, key: &str) -> String {
    let Some(raw) = value_after_key(fragment, key) else {
        return String::new();
    };

    if let Some(quoted) = raw.strip_prefix('"') {
        let mut prev_backslash = false;
        for (i, c) in quoted.char_indices() {
            if c == '"' && !prev_backslash {
                return quoted[..i].replace("\\\"", "\"").replace("\\/", "/");
            }
            prev_backslash = c == '\\' && !prev_backslash;
        }
        return String::new();
    }

    // Bare scalar such as `"version": 2`
    raw.split(|c: char| c == ',' || c == '}' || c.is_whitespace())
        .next()
        .unwrap_or_default()
        .to_string()
}

fn extract_u64(fragment: &str, key: &str) -> u64 {
    let Some(raw) = value_after_key(fragment, key) else {
        return 0;
    };
    let digits: String = raw
        .trim_start_matches('"')
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"[
        {"id": "en-base", "version": "2", "language": "en", "url": "https://x/en.april",
         "filename": "en.april", "size_bytes": 1000, "name": "English Base",
         "author": "April", "description": "General English", "url_website": "https://x"},
        {"id": "fr-small", "version": "1", "language": "fr", "url": "https://x/fr.onnx",
         "filename": "fr.onnx", "size_bytes": 2048}
    ]"#;

    #[test]
    fn test_parse_structured_array() {
        let models = parse_manifest(MANIFEST).unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].id, "en-base");
        assert_eq!(models[0].version, "2");
        assert_eq!(models[0].size_bytes, 1000);
        assert_eq!(models[0].display_name(), "English Base");
        assert_eq!(models[1].display_name(), "fr-small");
        assert!(models[1].author.is_empty());
    }

    #[test]
    fn test_parse_object_with_models_array() {
        let body = r#"{"schema": 1, "models": [{"id": "a", "url": "u", "filename": "a.ort"}]}"#;
        let models = parse_manifest(body).unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].filename, "a.ort");
    }

    #[test]
    fn test_entries_under_other_keys_found() {
        let body = r#"{
            "schema": 1,
            "data": [{"id": "en-base", "version": "2", "url": "https://x/en.april", "filename": "en.april"}],
            "extra": {"featured": {"id": "de", "url": "https://x/de.ort", "filename": "de.ort"}}
        }"#;
        let models = parse_manifest(body).unwrap();
        let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["en-base", "de"]);
        assert_eq!(models[0].version, "2");
    }

    #[test]
    fn test_numeric_version_and_string_size_accepted() {
        let body = r#"[{"id": "a", "version": 3, "url": "u", "filename": "a.april", "size_bytes": "42"}]"#;
        let models = parse_manifest(body).unwrap();
        assert_eq!(models[0].version, "3");
        assert_eq!(models[0].size_bytes, 42);
    }

    #[test]
    fn test_entries_missing_required_fields_skipped() {
        let body = r#"[
            {"id": "", "url": "u", "filename": "a.april"},
            {"id": "b", "filename": "b.april"},
            {"id": "c", "url": "u"},
            {"id": "d", "url": "u", "filename": "d.april"}
        ]"#;
        let models = parse_manifest(body).unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "d");
    }

    #[test]
    fn test_all_entries_invalid_is_empty() {
        let body = r#"[{"id": "b", "filename": "b.april"}, {"url": "u", "filename": "x"}]"#;
        assert!(matches!(
            parse_manifest(body),
            Err(LivecapError::ManifestEmpty)
        ));
        assert!(matches!(parse_manifest("[]"), Err(LivecapError::ManifestEmpty)));
    }

    #[test]
    fn test_path_traversal_filename_rejected() {
        let body = r#"[
            {"id": "evil", "url": "u", "filename": "../../.bashrc"},
            {"id": "ok", "url": "u", "filename": "ok.april"}
        ]"#;
        let models = parse_manifest(body).unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "ok");
    }

    #[test]
    fn test_lenient_scan_of_non_strict_json() {
        // Trailing commas make this invalid JSON
        let body = r#"[
            {"name": "before id", "id": "en-base", "version": "2", "url": "https://x/en.april",
             "filename": "en.april", "size_bytes": 1000, "extra": true,},
            {"id": "broken", "version": "1",},
            {"filename": "fr.onnx", "id": "fr", "url": "https://x/fr.onnx",},
            {"id": "de", "url": "https://x/de.ort", "filename": "de.ort", "size_bytes": "77",},
        ]"#;
        let models = parse_manifest(body).unwrap();
        let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["en-base", "de"]);
        assert_eq!(models[0].size_bytes, 1000);
        assert_eq!(models[0].version, "2");
        // Fields listed before "id" fall outside the scanned fragment
        assert!(models[0].name.is_empty());
        assert_eq!(models[1].size_bytes, 77);
    }

    #[test]
    fn test_lenient_scan_only_invalid_fragments_is_empty() {
        let body = r#"{"id": "a", "version": "1",} {"id": "b",}"#;
        assert!(matches!(
            parse_manifest(body),
            Err(LivecapError::ManifestEmpty)
        ));
    }

    #[test]
    fn test_non_manifest_body_is_invalid() {
        let body = "<html><body>502 Bad Gateway</body></html>";
        assert!(matches!(
            parse_manifest(body),
            Err(LivecapError::ManifestInvalid(_))
        ));
    }

    #[test]
    fn test_extract_helpers() {
        let fragment = r#""id" : "x", "url":"https:\/\/h\/m", "version": 12, "size_bytes": 5"#;
        assert_eq!(extract_string(fragment, "id"), "x");
        assert_eq!(extract_string(fragment, "url"), "https://h/m");
        assert_eq!(extract_string(fragment, "version"), "12");
        assert_eq!(extract_string(fragment, "missing"), "");
        assert_eq!(extract_u64(fragment, "size_bytes"), 5);
        assert_eq!(extract_u64(fragment, "id"), 0);
    }
}
