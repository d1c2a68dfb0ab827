use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Normalizes a method name to the camelCase form used on the wire.
///
/// `OnCreateFile`, `on_create_file` and `onCreateFile` all become
/// `onCreateFile`. A leading run of capitals is lowered as a unit, so
/// `URLChanged` becomes `urlChanged`.
pub fn to_camel_case(name: &str) -> String {
    let mut segments = name.split(['_', '-']).filter(|segment| !segment.is_empty());
    let mut out = String::with_capacity(name.len());

    if let Some(first) = segments.next() {
        out.push_str(&lower_leading_capitals(first));
    }
    for segment in segments {
        let mut chars = segment.chars();
        if let Some(head) = chars.next() {
            out.extend(head.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    out
}

/// Inverse of [`to_camel_case`] for plain camelCase keys: `fileName` becomes
/// `file_name`
pub(crate) fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Rewrites every object key in `value`, at any depth, to camelCase.
///
/// Map keys are rewritten too, the same as struct fields.
pub(crate) fn camel_case_keys(value: Value) -> Value {
    rewrite_keys(value, &to_camel_case)
}

fn snake_case_keys(value: Value) -> Value {
    rewrite_keys(value, &to_snake_case)
}

fn rewrite_keys(value: Value, rename: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::Object(object) => Value::Object(
            object
                .into_iter()
                .map(|(key, value)| (rename(&key), rewrite_keys(value, rename)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|item| rewrite_keys(item, rename)).collect())
        }
        other => other,
    }
}

/// Serializes `value` with camelCase keys
pub(crate) fn to_wire<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Value> {
    serde_json::to_value(value).map(camel_case_keys)
}

/// Decodes a camelCase payload.
///
/// Types that declare camelCase names themselves match the wire directly;
/// plain snake_case structs are retried with their keys mapped back. The
/// first error is reported if neither fits.
pub(crate) fn from_wire<T: DeserializeOwned>(value: Value) -> serde_json::Result<T> {
    match serde_json::from_value(value.clone()) {
        Ok(decoded) => Ok(decoded),
        Err(e) if has_objects(&value) => {
            serde_json::from_value(snake_case_keys(value)).map_err(|_| e)
        }
        Err(e) => Err(e),
    }
}

fn has_objects(value: &Value) -> bool {
    match value {
        Value::Object(_) => true,
        Value::Array(items) => items.iter().any(has_objects),
        _ => false,
    }
}

fn lower_leading_capitals(segment: &str) -> String {
    let chars: Vec<char> = segment.chars().collect();
    let mut out = String::with_capacity(segment.len());

    let mut lowering = true;
    for (i, &c) in chars.iter().enumerate() {
        if lowering {
            if i == 1 && !c.is_uppercase() {
                lowering = false;
            } else if i > 0 && chars.get(i + 1).is_some_and(|next| !next.is_uppercase()) {
                // Last capital of a run starts the next word
                lowering = false;
            }
        }
        if lowering {
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pascal_and_snake_names_normalize() {
        assert_eq!(to_camel_case("OnCreateFile"), "onCreateFile");
        assert_eq!(to_camel_case("on_create_file"), "onCreateFile");
        assert_eq!(to_camel_case("onCreateFile"), "onCreateFile");
        assert_eq!(to_camel_case("on-create-file"), "onCreateFile");
        assert_eq!(to_camel_case("Ping"), "ping");
    }

    #[test]
    fn capital_runs() {
        assert_eq!(to_camel_case("URLChanged"), "urlChanged");
        assert_eq!(to_camel_case("ID"), "id");
        assert_eq!(to_camel_case("X"), "x");
    }

    #[test]
    fn degenerate_names() {
        assert_eq!(to_camel_case(""), "");
        assert_eq!(to_camel_case("__private"), "private");
        assert_eq!(to_camel_case("get_2d_point"), "get2dPoint");
    }

    #[test]
    fn snake_case_inverts_plain_camel_keys() {
        assert_eq!(to_snake_case("fileName"), "file_name");
        assert_eq!(to_snake_case("accessRow"), "access_row");
        assert_eq!(to_snake_case("id"), "id");
        assert_eq!(to_snake_case("file_name"), "file_name");
    }

    #[test]
    fn nested_keys_are_camel_cased() {
        let value = serde_json::json!({
            "file_name": "a",
            "open_flags": [{"read_only": true}],
            "owner": {"user_id": 7},
        });
        assert_eq!(
            camel_case_keys(value),
            serde_json::json!({
                "fileName": "a",
                "openFlags": [{"readOnly": true}],
                "owner": {"userId": 7},
            })
        );
    }

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Plain {
        file_name: String,
        rows:      Vec<Row>,
    }

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Row {
        access_mask: u32,
    }

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Declared {
        file_name: String,
    }

    #[test]
    fn wire_form_fits_plain_and_declared_structs() {
        let plain = Plain {
            file_name: "/etc/hosts".into(),
            rows:      vec![Row { access_mask: 3 }],
        };
        let wire = to_wire(&plain).unwrap();
        assert_eq!(wire["fileName"], "/etc/hosts");
        assert_eq!(wire["rows"][0]["accessMask"], 3);
        assert_eq!(from_wire::<Plain>(wire.clone()).unwrap(), plain);

        let declared: Declared = from_wire(wire).unwrap();
        assert_eq!(declared.file_name, "/etc/hosts");
    }

    #[test]
    fn mismatched_payload_keeps_first_error() {
        let err = from_wire::<Plain>(serde_json::json!({"other": 1})).unwrap_err();
        assert!(err.to_string().contains("file_name"));
    }
}
