//! Write payload normalization

use super::{Next, Stage};
use crate::error::Result;
use crate::types::{Operation, OperationKind};
use async_trait::async_trait;
use serde_json::Value;

/// Trim leading/trailing whitespace from every string leaf of `value`
///
/// Arrays and objects are walked recursively; numbers, booleans and null
/// pass through unchanged.
pub fn trim_strings(value: Value) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.len() == s.len() {
                Value::String(s)
            } else {
                Value::String(trimmed.to_string())
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(trim_strings).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, trim_strings(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Normalizes write payloads before they reach the store
pub struct InputNormalizer;

impl InputNormalizer {
    /// Rewrite the payload(s) of `op` in place
    pub fn apply(op: &mut Operation) {
        match op.kind {
            OperationKind::Upsert => {
                op.args.create = op.args.create.take().map(trim_strings);
                op.args.update = op.args.update.take().map(trim_strings);
            }
            kind if kind.is_write() => {
                op.args.data = op.args.data.take().map(trim_strings);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Stage for InputNormalizer {
    async fn handle(&self, mut op: Operation, next: Next<'_>) -> Result<Value> {
        Self::apply(&mut op);
        next.run(op).await
    }

    fn name(&self) -> &str {
        "normalize"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueryArgs;
    use serde_json::json;

    #[test]
    fn test_trim_flat_object() {
        let out = trim_strings(json!({"name": "  Foo  ", "age": 5, "active": true}));
        assert_eq!(out, json!({"name": "Foo", "age": 5, "active": true}));
    }

    #[test]
    fn test_trim_nested() {
        let out = trim_strings(json!({
            "vendor": {"name": "\tAcme ", "tags": [" a", "b ", 3, null]},
            "lines": [{"sku": " X1 "}, {"qty": 2.5}],
            "note": null
        }));
        assert_eq!(
            out,
            json!({
                "vendor": {"name": "Acme", "tags": ["a", "b", 3, null]},
                "lines": [{"sku": "X1"}, {"qty": 2.5}],
                "note": null
            })
        );
    }

    #[test]
    fn test_trim_preserves_key_order() {
        let out = trim_strings(json!({"z": " 1 ", "a": " 2 "}));
        let keys: Vec<_> = out.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["z", "a"]);
    }

    #[test]
    fn test_keys_not_trimmed() {
        let out = trim_strings(json!({" key ": " v "}));
        assert_eq!(out, json!({" key ": "v"}));
    }

    #[test]
    fn test_apply_upsert_branches() {
        let mut op = Operation::new(
            "tb_vendor",
            OperationKind::Upsert,
            QueryArgs {
                filter: Some(json!({"code": " V1 "}).as_object().unwrap().clone()),
                create: Some(json!({"code": " V1 ", "name": " New "})),
                update: Some(json!({"name": " Renamed "})),
                ..Default::default()
            },
        );
        InputNormalizer::apply(&mut op);
        assert_eq!(op.args.create, Some(json!({"code": "V1", "name": "New"})));
        assert_eq!(op.args.update, Some(json!({"name": "Renamed"})));
        // filters are matched as given
        assert_eq!(op.args.filter_value(), json!({"code": " V1 "}));
    }

    #[test]
    fn test_apply_batch_create() {
        let mut op = Operation::new(
            "tb_unit",
            OperationKind::CreateMany,
            QueryArgs::data(json!([{"name": " KG "}, {"name": "L "}])),
        );
        InputNormalizer::apply(&mut op);
        assert_eq!(op.args.data, Some(json!([{"name": "KG"}, {"name": "L"}])));
    }

    #[test]
    fn test_apply_ignores_reads() {
        let mut op = Operation::new(
            "tb_unit",
            OperationKind::FindMany,
            QueryArgs {
                data: Some(json!({"name": " x "})),
                ..Default::default()
            },
        );
        InputNormalizer::apply(&mut op);
        assert_eq!(op.args.data, Some(json!({"name": " x "})));
    }
}
