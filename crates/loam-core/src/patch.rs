// Patch operations and RFC 6901 pointer application

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// One mutation within a patch fact. Paths are JSON Pointers (RFC 6901)
/// with `~0`/`~1` escapes; `-` appends to an array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    /// Replace the value at `path`; the path must exist
    Replace { path: String, value: Value },
    /// Insert at `path`: overwrite an object key, or shift array elements
    Add { path: String, value: Value },
    /// Remove the value at `path`; the path must exist
    Remove { path: String },
    /// Remove at `from` and insert at `path`
    Move { from: String, path: String },
    /// Remove `remove` elements of the array at `path` starting at
    /// `index`, then insert `add` there
    Splice {
        path: String,
        index: usize,
        remove: usize,
        add: Vec<Value>,
    },
}

/// Apply `ops` to `value` in order, returning the patched result.
/// The first failing operation aborts the whole patch with
/// `InvalidPatch { index }`; the input is never partially mutated.
pub fn apply_patch(value: &Value, ops: &[PatchOperation]) -> Result<Value, StoreError> {
    let mut next = value.clone();
    for (index, op) in ops.iter().enumerate() {
        apply_op(&mut next, op).map_err(|detail| StoreError::InvalidPatch { index, detail })?;
    }
    Ok(next)
}

fn apply_op(root: &mut Value, op: &PatchOperation) -> Result<(), String> {
    match op {
        PatchOperation::Replace { path, value } => {
            let tokens = parse_pointer(path)?;
            let target = resolve_mut(root, &tokens)?;
            *target = value.clone();
            Ok(())
        }
        PatchOperation::Add { path, value } => {
            let tokens = parse_pointer(path)?;
            add_at(root, &tokens, value.clone())
        }
        PatchOperation::Remove { path } => {
            let tokens = parse_pointer(path)?;
            remove_at(root, &tokens)?;
            Ok(())
        }
        PatchOperation::Move { from, path } => {
            let from_tokens = parse_pointer(from)?;
            let path_tokens = parse_pointer(path)?;
            if path_tokens.len() >= from_tokens.len()
                && path_tokens[..from_tokens.len()] == from_tokens[..]
            {
                return Err(format!("move source {from:?} is a prefix of {path:?}"));
            }
            let moved = remove_at(root, &from_tokens)?;
            add_at(root, &path_tokens, moved)
        }
        PatchOperation::Splice {
            path,
            index,
            remove,
            add,
        } => {
            let tokens = parse_pointer(path)?;
            let target = resolve_mut(root, &tokens)?;
            let items = target
                .as_array_mut()
                .ok_or_else(|| format!("splice target {path:?} is not an array"))?;
            if *index > items.len() {
                return Err(format!(
                    "splice index {index} out of bounds (len {})",
                    items.len()
                ));
            }
            if *remove > items.len() - index {
                return Err(format!(
                    "splice removes {remove} past end (len {}, index {index})",
                    items.len()
                ));
            }
            items.drain(*index..*index + *remove);
            for (offset, item) in add.iter().enumerate() {
                items.insert(index + offset, item.clone());
            }
            Ok(())
        }
    }
}

fn parse_pointer(path: &str) -> Result<Vec<String>, String> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| format!("pointer {path:?} must start with '/'"))?;
    rest.split('/').map(unescape_token).collect()
}

fn unescape_token(token: &str) -> Result<String, String> {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c == '~' {
            match chars.next() {
                Some('0') => out.push('~'),
                Some('1') => out.push('/'),
                _ => return Err(format!("invalid escape in token {token:?}")),
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

fn resolve_mut<'a>(root: &'a mut Value, tokens: &[String]) -> Result<&'a mut Value, String> {
    let mut current = root;
    for token in tokens {
        current = match current {
            Value::Object(map) => map
                .get_mut(token)
                .ok_or_else(|| format!("no member {token:?}"))?,
            Value::Array(items) => {
                let index = parse_array_index(token)?;
                let len = items.len();
                items
                    .get_mut(index)
                    .ok_or_else(|| format!("index {index} out of bounds (len {len})"))?
            }
            _ => return Err(format!("cannot descend into scalar at {token:?}")),
        };
    }
    Ok(current)
}

fn add_at(root: &mut Value, tokens: &[String], value: Value) -> Result<(), String> {
    let Some((last, parents)) = tokens.split_last() else {
        // whole-document target
        *root = value;
        return Ok(());
    };
    let parent = resolve_mut(root, parents)?;
    match parent {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = if last == "-" {
                items.len()
            } else {
                parse_array_index(last)?
            };
            if index > items.len() {
                return Err(format!(
                    "add index {index} out of bounds (len {})",
                    items.len()
                ));
            }
            items.insert(index, value);
            Ok(())
        }
        _ => Err(format!("add target parent at {last:?} is not a container")),
    }
}

fn remove_at(root: &mut Value, tokens: &[String]) -> Result<Value, String> {
    let Some((last, parents)) = tokens.split_last() else {
        return Err("cannot remove the document root".to_string());
    };
    let parent = resolve_mut(root, parents)?;
    match parent {
        Value::Object(map) => map
            .remove(last)
            .ok_or_else(|| format!("no member {last:?}")),
        Value::Array(items) => {
            let index = parse_array_index(last)?;
            if index >= items.len() {
                return Err(format!(
                    "remove index {index} out of bounds (len {})",
                    items.len()
                ));
            }
            Ok(items.remove(index))
        }
        _ => Err(format!("remove target parent at {last:?} is not a container")),
    }
}

/// Array indices are canonical decimal: digits only, no leading zeros
fn parse_array_index(token: &str) -> Result<usize, String> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid array index {token:?}"));
    }
    if token.len() > 1 && token.starts_with('0') {
        return Err(format!("array index {token:?} has leading zeros"));
    }
    token
        .parse()
        .map_err(|_| format!("invalid array index {token:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn replace(path: &str, value: Value) -> PatchOperation {
        PatchOperation::Replace {
            path: path.to_string(),
            value,
        }
    }

    fn add(path: &str, value: Value) -> PatchOperation {
        PatchOperation::Add {
            path: path.to_string(),
            value,
        }
    }

    fn remove(path: &str) -> PatchOperation {
        PatchOperation::Remove {
            path: path.to_string(),
        }
    }

    #[test]
    fn test_replace_and_add_objects() {
        let doc = json!({"a": 1, "nested": {"b": 2}});
        let out = apply_patch(
            &doc,
            &[
                replace("/a", json!(10)),
                add("/nested/c", json!(3)),
                add("/nested/b", json!(20)), // add overwrites existing keys
            ],
        )
        .unwrap();
        assert_eq!(out, json!({"a": 10, "nested": {"b": 20, "c": 3}}));
        assert_eq!(doc, json!({"a": 1, "nested": {"b": 2}})); // input untouched
    }

    #[test]
    fn test_array_add_and_append() {
        let doc = json!({"arr": [1, 3]});
        let out = apply_patch(
            &doc,
            &[
                add("/arr/1", json!(2)),
                add("/arr/-", json!(4)),
                add("/arr/4", json!(5)), // index == len is allowed
            ],
        )
        .unwrap();
        assert_eq!(out, json!({"arr": [1, 2, 3, 4, 5]}));
    }

    #[test]
    fn test_add_past_end_fails() {
        let doc = json!({"arr": [1]});
        let err = apply_patch(&doc, &[add("/arr/5", json!(2))]).unwrap_err();
        match err {
            StoreError::InvalidPatch { index: 0, .. } => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_remove() {
        let doc = json!({"a": 1, "arr": [1, 2, 3]});
        let out = apply_patch(&doc, &[remove("/a"), remove("/arr/1")]).unwrap();
        assert_eq!(out, json!({"arr": [1, 3]}));
    }

    #[test]
    fn test_replace_missing_path_fails() {
        let doc = json!({"a": 1});
        assert!(apply_patch(&doc, &[replace("/missing", json!(0))]).is_err());
    }

    #[test]
    fn test_failing_op_reports_index() {
        let doc = json!({"a": 1});
        let err = apply_patch(
            &doc,
            &[replace("/a", json!(2)), remove("/missing")],
        )
        .unwrap_err();
        match err {
            StoreError::InvalidPatch { index, .. } => assert_eq!(index, 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_pointer_escapes() {
        let doc = json!({"a/b": 1, "m~n": 2});
        let out = apply_patch(
            &doc,
            &[replace("/a~1b", json!(10)), replace("/m~0n", json!(20))],
        )
        .unwrap();
        assert_eq!(out, json!({"a/b": 10, "m~n": 20}));
    }

    #[test]
    fn test_invalid_pointers_rejected() {
        let doc = json!({"a": 1});
        assert!(apply_patch(&doc, &[remove("a")]).is_err()); // no leading slash
        assert!(apply_patch(&doc, &[remove("/~2")]).is_err()); // bad escape
        assert!(apply_patch(&doc, &[remove("")]).is_err()); // root removal
        let arr = json!([1]);
        assert!(apply_patch(&arr, &[remove("/00")]).is_err()); // leading zeros
        assert!(apply_patch(&arr, &[remove("/-1")]).is_err());
    }

    #[test]
    fn test_move() {
        let doc = json!({"a": {"x": 1}, "b": {}});
        let out = apply_patch(
            &doc,
            &[PatchOperation::Move {
                from: "/a/x".to_string(),
                path: "/b/x".to_string(),
            }],
        )
        .unwrap();
        assert_eq!(out, json!({"a": {}, "b": {"x": 1}}));
    }

    #[test]
    fn test_move_into_own_subtree_fails() {
        let doc = json!({"a": {"x": 1}});
        for (from, path) in [("/a", "/a/y"), ("/a", "/a")] {
            let err = apply_patch(
                &doc,
                &[PatchOperation::Move {
                    from: from.to_string(),
                    path: path.to_string(),
                }],
            );
            assert!(err.is_err(), "move {from} -> {path} should fail");
        }
    }

    #[test]
    fn test_splice() {
        let doc = json!({"arr": [1, 2, 3, 4]});
        let out = apply_patch(
            &doc,
            &[PatchOperation::Splice {
                path: "/arr".to_string(),
                index: 1,
                remove: 2,
                add: vec![json!(9), json!(8)],
            }],
        )
        .unwrap();
        assert_eq!(out, json!({"arr": [1, 9, 8, 4]}));
    }

    #[test]
    fn test_splice_insert_only_and_bounds() {
        let doc = json!([1, 2]);
        let out = apply_patch(
            &doc,
            &[PatchOperation::Splice {
                path: "".to_string(),
                index: 2,
                remove: 0,
                add: vec![json!(3)],
            }],
        )
        .unwrap();
        assert_eq!(out, json!([1, 2, 3]));

        let too_far = PatchOperation::Splice {
            path: "".to_string(),
            index: 3,
            remove: 0,
            add: vec![],
        };
        assert!(apply_patch(&doc, &[too_far]).is_err());

        let removes_past_end = PatchOperation::Splice {
            path: "".to_string(),
            index: 1,
            remove: 2,
            add: vec![],
        };
        assert!(apply_patch(&doc, &[removes_past_end]).is_err());

        let not_an_array = PatchOperation::Splice {
            path: "".to_string(),
            index: 0,
            remove: 0,
            add: vec![],
        };
        assert!(apply_patch(&json!({"a": 1}), &[not_an_array]).is_err());
    }

    #[test]
    fn test_add_then_remove_is_identity() {
        let doc = json!({"a": 1});
        let out = apply_patch(&doc, &[add("/p", json!("x")), remove("/p")]).unwrap();
        assert_eq!(out, doc);
    }

    #[test]
    fn test_whole_document_replace() {
        let doc = json!({"a": 1});
        let out = apply_patch(&doc, &[replace("", json!([1, 2]))]).unwrap();
        assert_eq!(out, json!([1, 2]));
    }

    #[test]
    fn test_operation_wire_form() {
        let op: PatchOperation =
            serde_json::from_str(r#"{"op": "add", "path": "/x", "value": 1}"#).unwrap();
        assert_eq!(op, add("/x", json!(1)));
        let splice: PatchOperation = serde_json::from_str(
            r#"{"op": "splice", "path": "/arr", "index": 0, "remove": 0, "add": [1]}"#,
        )
        .unwrap();
        assert!(matches!(splice, PatchOperation::Splice { .. }));
    }
}
