//! Structured diff between two configuration snapshots.
//!
//! Paths are dotted (`network_instances.C0001-00.connections.0.config.psk`)
//! so commit logs and `--diff` output can point at the exact field.

use serde::Serialize;
use serde_yaml::Value;

/// What happened to a config path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Changed,
}

/// One changed path.
#[derive(Debug, Clone, Serialize)]
pub struct DiffEntry {
    pub kind: ChangeKind,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<String>,
}

/// An ordered list of changes between two snapshots.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diff {
    pub entries: Vec<DiffEntry>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Diff two YAML documents.
    pub fn between(old: &Value, new: &Value) -> Self {
        let mut diff = Diff::default();
        walk("", old, new, &mut diff.entries);
        diff
    }
}

fn render(value: &Value) -> String {
    serde_yaml::to_string(value)
        .unwrap_or_else(|_| "<unrenderable>".to_string())
        .trim_end()
        .to_string()
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn key_string(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => render(other),
    }
}

fn walk(prefix: &str, old: &Value, new: &Value, out: &mut Vec<DiffEntry>) {
    match (old, new) {
        (Value::Mapping(old_map), Value::Mapping(new_map)) => {
            for (key, old_value) in old_map {
                let path = join(prefix, &key_string(key));
                match new_map.get(key) {
                    Some(new_value) => walk(&path, old_value, new_value, out),
                    None => out.push(DiffEntry {
                        kind: ChangeKind::Removed,
                        path,
                        old: Some(render(old_value)),
                        new: None,
                    }),
                }
            }
            for (key, new_value) in new_map {
                if old_map.get(key).is_none() {
                    out.push(DiffEntry {
                        kind: ChangeKind::Added,
                        path: join(prefix, &key_string(key)),
                        old: None,
                        new: Some(render(new_value)),
                    });
                }
            }
        }
        (Value::Sequence(old_seq), Value::Sequence(new_seq)) => {
            let shared = old_seq.len().min(new_seq.len());
            for i in 0..shared {
                walk(&join(prefix, &i.to_string()), &old_seq[i], &new_seq[i], out);
            }
            for (i, old_value) in old_seq.iter().enumerate().skip(shared) {
                out.push(DiffEntry {
                    kind: ChangeKind::Removed,
                    path: join(prefix, &i.to_string()),
                    old: Some(render(old_value)),
                    new: None,
                });
            }
            for (i, new_value) in new_seq.iter().enumerate().skip(shared) {
                out.push(DiffEntry {
                    kind: ChangeKind::Added,
                    path: join(prefix, &i.to_string()),
                    old: None,
                    new: Some(render(new_value)),
                });
            }
        }
        (o, n) if o == n => {}
        (o, n) => out.push(DiffEntry {
            kind: ChangeKind::Changed,
            path: prefix.to_string(),
            old: Some(render(o)),
            new: Some(render(n)),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn identical_documents_have_empty_diff() {
        let v = value("a: 1\nb: [1, 2]\n");
        assert!(Diff::between(&v, &v).is_empty());
    }

    #[test]
    fn detects_nested_changes() {
        let old = value("tenant:\n  name: one\n  routes: [a]\n");
        let new = value("tenant:\n  name: two\n  routes: [a, b]\n");
        let diff = Diff::between(&old, &new);
        let paths: Vec<_> = diff.entries.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"tenant.name"));
        assert!(paths.contains(&"tenant.routes.1"));
    }

    #[test]
    fn detects_added_and_removed_keys() {
        let old = value("a: 1\nb: 2\n");
        let new = value("b: 2\nc: 3\n");
        let diff = Diff::between(&old, &new);
        assert_eq!(diff.entries.len(), 2);
        assert_eq!(diff.entries[0].kind, ChangeKind::Removed);
        assert_eq!(diff.entries[0].path, "a");
        assert_eq!(diff.entries[1].kind, ChangeKind::Added);
        assert_eq!(diff.entries[1].path, "c");
    }
}
