//! In-memory inverted index over app-scoped project documents.
//!
//! Entries are tagged with their `(appId, userKey)` scope; queries only
//! ever search one scope's tags. The index is never persisted: a scope is
//! warmed on its first query by streaming every stored document once, then
//! maintained incrementally. Writes are serialized per scope; searches
//! take the read side and may run alongside updates without reflecting
//! them in the same call.

use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// The scope tag of an `(appId, userKey)` pair.
///
/// `~` cannot appear in either component, so the tag is unambiguous.
pub fn scope_tag(app: &str, user: &str) -> String {
    format!("{app}~{user}")
}

#[derive(Default)]
struct ScopeIndex {
    warmed: bool,
    /// token → document keys containing it
    postings: HashMap<String, HashSet<String>>,
    /// document key → its tokens, for removal
    doc_tokens: HashMap<String, HashSet<String>>,
}

impl ScopeIndex {
    fn insert(&mut self, key: &str, doc: &JsonValue) {
        self.remove(key);
        let tokens = tokenize_document(doc);
        for token in &tokens {
            self.postings
                .entry(token.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.doc_tokens.insert(key.to_string(), tokens);
    }

    fn remove(&mut self, key: &str) {
        if let Some(tokens) = self.doc_tokens.remove(key) {
            for token in tokens {
                if let Some(keys) = self.postings.get_mut(&token) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.postings.remove(&token);
                    }
                }
            }
        }
    }

    fn query(&self, text: &str, limit: usize) -> Vec<String> {
        let query_tokens = tokenize(text);
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let mut result: Option<HashSet<String>> = None;
        for qt in &query_tokens {
            // Prefix match: "proj" finds documents containing "projects".
            let mut matched = HashSet::new();
            for (token, keys) in &self.postings {
                if token.starts_with(qt.as_str()) {
                    matched.extend(keys.iter().cloned());
                }
            }
            result = Some(match result {
                None => matched,
                Some(acc) => acc.intersection(&matched).cloned().collect(),
            });
            if result.as_ref().map(HashSet::is_empty).unwrap_or(false) {
                break;
            }
        }
        let mut keys: Vec<String> = result.unwrap_or_default().into_iter().collect();
        keys.sort();
        keys.truncate(limit);
        keys
    }
}

/// Scope-tagged inverted index.
pub struct SearchIndex {
    scopes: DashMap<String, Arc<RwLock<ScopeIndex>>>,
}

impl SearchIndex {
    pub fn new() -> Self {
        Self {
            scopes: DashMap::new(),
        }
    }

    fn scope(&self, tag: &str) -> Arc<RwLock<ScopeIndex>> {
        self.scopes
            .entry(tag.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(ScopeIndex::default())))
            .clone()
    }

    /// Whether the scope has been populated.
    pub fn is_warm(&self, tag: &str) -> bool {
        self.scopes
            .get(tag)
            .map(|scope| scope.read().expect("index lock").warmed)
            .unwrap_or(false)
    }

    /// Replace a scope's contents with the given documents and mark it
    /// warm. Called with every live stored document on first query.
    pub fn warm_with<'a>(
        &self,
        tag: &str,
        docs: impl IntoIterator<Item = (&'a str, &'a JsonValue)>,
    ) {
        let scope = self.scope(tag);
        let mut scope = scope.write().expect("index lock");
        scope.postings.clear();
        scope.doc_tokens.clear();
        for (key, doc) in docs {
            scope.insert(key, doc);
        }
        scope.warmed = true;
    }

    /// Incrementally index a created or updated document. A no-op for
    /// scopes that were never queried; warming will pick the change up.
    pub fn maintain(&self, tag: &str, key: &str, doc: &JsonValue) {
        if let Some(scope) = self.scopes.get(tag) {
            let mut scope = scope.write().expect("index lock");
            if scope.warmed {
                scope.insert(key, doc);
            }
        }
    }

    /// Incrementally drop a deleted document.
    pub fn remove(&self, tag: &str, key: &str) {
        if let Some(scope) = self.scopes.get(tag) {
            let mut scope = scope.write().expect("index lock");
            if scope.warmed {
                scope.remove(key);
            }
        }
    }

    /// Document keys in this scope matching every query token.
    pub fn query(&self, tag: &str, text: &str, limit: usize) -> Vec<String> {
        match self.scopes.get(tag) {
            Some(scope) => scope.read().expect("index lock").query(text, limit),
            None => Vec::new(),
        }
    }
}

impl Default for SearchIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(str::to_string)
        .collect()
}

/// Collect the indexable strings of one project document.
///
/// Indexed fields: `info.{name,displayName,description}`; the same info
/// fields of every folder, request, and environment under `definitions`;
/// request `expects.url` and `expects.headers`; environment `server.uri`
/// and `variables[].name`.
fn tokenize_document(doc: &JsonValue) -> HashSet<String> {
    let mut strings: Vec<&str> = Vec::new();
    collect_info(doc, &mut strings);

    if let Some(definitions) = doc.get("definitions") {
        let groups: Vec<&JsonValue> = match definitions {
            JsonValue::Array(items) => items.iter().collect(),
            JsonValue::Object(map) => map
                .values()
                .flat_map(|v| v.as_array().map(|a| a.iter()).into_iter().flatten())
                .collect(),
            _ => Vec::new(),
        };
        for entity in groups {
            collect_info(entity, &mut strings);
            if let Some(expects) = entity.get("expects") {
                push_str(expects.get("url"), &mut strings);
                collect_string_values(expects.get("headers"), &mut strings);
            }
            if let Some(server) = entity.get("server") {
                push_str(server.get("uri"), &mut strings);
            }
            if let Some(variables) = entity.get("variables").and_then(JsonValue::as_array) {
                for variable in variables {
                    push_str(variable.get("name"), &mut strings);
                }
            }
        }
    }

    let mut tokens = HashSet::new();
    for s in strings {
        tokens.extend(tokenize(s));
    }
    tokens
}

fn collect_info<'a>(value: &'a JsonValue, out: &mut Vec<&'a str>) {
    if let Some(info) = value.get("info") {
        for field in ["name", "displayName", "description"] {
            push_str(info.get(field), out);
        }
    }
}

fn push_str<'a>(value: Option<&'a JsonValue>, out: &mut Vec<&'a str>) {
    if let Some(s) = value.and_then(JsonValue::as_str) {
        out.push(s);
    }
}

fn collect_string_values<'a>(value: Option<&'a JsonValue>, out: &mut Vec<&'a str>) {
    match value {
        Some(JsonValue::String(s)) => out.push(s),
        Some(JsonValue::Object(map)) => {
            for v in map.values() {
                if let Some(s) = v.as_str() {
                    out.push(s);
                }
            }
        }
        _ => {}
    }
}
