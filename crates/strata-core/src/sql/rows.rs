//! Reassembly of flat result rows into nested items.
//!
//! Statements alias every column by its dot-qualified path
//! (`table.column`, or `table.alias.column` for joins). This module builds
//! the nested object back from those paths.
//!
//! Null-collapsing rule: an object all of whose properties are null
//! collapses to `null`, applied bottom-up. An outer-joined absent related
//! row therefore decodes as `null`, not as an object of nulls.

use serde_json::{Map, Value};

use crate::table::TableDef;

/// Build a nested object from dot-qualified (alias path, value) pairs,
/// then collapse all-null objects bottom-up.
pub fn assemble<I>(pairs: I) -> Value
where
    I: IntoIterator<Item = (String, Value)>,
{
    let mut root = Map::new();
    for (path, value) in pairs {
        let segments: Vec<&str> = path.split('.').collect();
        insert_path(&mut root, &segments, value);
    }
    collapse(Value::Object(root))
}

fn insert_path(node: &mut Map<String, Value>, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [leaf] => {
            node.insert((*leaf).to_string(), value);
        }
        [head, rest @ ..] => {
            let child = node
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(map) = child {
                insert_path(map, rest, value);
            }
        }
    }
}

fn collapse(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let collapsed: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, collapse(v)))
                .collect();
            if !collapsed.is_empty() && collapsed.values().all(Value::is_null) {
                Value::Null
            } else {
                Value::Object(collapsed)
            }
        }
        other => other,
    }
}

/// Decode one fetched row for the table: reassemble the alias tree, pick the
/// table's subtree, backfill defaults, and validate. A row absent entirely
/// (all columns null) or failing validation decodes as `None`.
pub fn decode_row(table: &TableDef, flat: Vec<(String, Value)>) -> Option<Value> {
    let tree = assemble(flat);
    let row = tree.get(table.storage_name()).cloned().unwrap_or(Value::Null);
    if row.is_null() {
        return None;
    }
    table.finalize_row(row)
}

/// Decode the old/new image pair returned by a pre-image update statement.
pub fn decode_images(table: &TableDef, flat: Vec<(String, Value)>) -> (Option<Value>, Option<Value>) {
    let tree = assemble(flat);
    let pick = |key: &str| -> Option<Value> {
        let image = tree.get(key).cloned().unwrap_or(Value::Null);
        if image.is_null() {
            None
        } else {
            table.finalize_row(image)
        }
    };
    (pick("old"), pick("new"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Field, Resource};
    use crate::table::Join;
    use serde_json::json;

    fn contacts_with_org() -> TableDef {
        let org = Resource::builder("org")
            .field("id", Field::string())
            .field("title", Field::string())
            .identity_key("id")
            .build()
            .unwrap();
        let resource = Resource::builder("contact")
            .field("id", Field::string())
            .field("name", Field::string())
            .field("org_id", Field::string().optional())
            .identity_key("id")
            .build()
            .unwrap();
        TableDef::new("contacts", resource)
            .join(Join {
                alias: "org".to_string(),
                table: "orgs".to_string(),
                resource: org,
                local_key: "org_id".to_string(),
                foreign_key: "id".to_string(),
            })
            .unwrap()
    }

    #[test]
    fn test_assemble_nests_by_path() {
        let value = assemble(vec![
            ("contacts.id".to_string(), json!("a")),
            ("contacts.org.id".to_string(), json!("o1")),
            ("contacts.org.title".to_string(), json!("acme")),
        ]);
        assert_eq!(
            value,
            json!({"contacts": {"id": "a", "org": {"id": "o1", "title": "acme"}}})
        );
    }

    #[test]
    fn test_all_null_nested_object_collapses_to_null() {
        let value = assemble(vec![
            ("contacts.id".to_string(), json!("a")),
            ("contacts.org.id".to_string(), Value::Null),
            ("contacts.org.title".to_string(), Value::Null),
        ]);
        assert_eq!(value, json!({"contacts": {"id": "a", "org": null}}));
    }

    #[test]
    fn test_partially_null_object_stays_an_object() {
        let value = assemble(vec![
            ("contacts.org.id".to_string(), json!("o1")),
            ("contacts.org.title".to_string(), Value::Null),
        ]);
        assert_eq!(
            value,
            json!({"contacts": {"org": {"id": "o1", "title": null}}})
        );
    }

    #[test]
    fn test_collapse_propagates_upward() {
        // Every column null: the whole row collapses away.
        let value = assemble(vec![
            ("contacts.id".to_string(), Value::Null),
            ("contacts.org.id".to_string(), Value::Null),
        ]);
        assert_eq!(value, Value::Null);
    }

    #[test]
    fn test_decode_row_with_absent_join() {
        let table = contacts_with_org();
        let row = decode_row(
            &table,
            vec![
                ("contacts.id".to_string(), json!("a")),
                ("contacts.name".to_string(), json!("x")),
                ("contacts.org_id".to_string(), Value::Null),
                ("contacts.org.id".to_string(), Value::Null),
                ("contacts.org.title".to_string(), Value::Null),
            ],
        )
        .unwrap();
        assert_eq!(row["org"], Value::Null);
        assert_eq!(row["id"], "a");
    }

    #[test]
    fn test_decode_row_drops_invalid_after_defaulting() {
        let table = contacts_with_org();
        // name is required and there is no default: row is dropped.
        let row = decode_row(
            &table,
            vec![
                ("contacts.id".to_string(), json!("a")),
                ("contacts.name".to_string(), Value::Null),
            ],
        );
        assert!(row.is_none());
    }

    #[test]
    fn test_decode_images_splits_old_and_new() {
        let resource = Resource::builder("contact")
            .field("id", Field::string())
            .field("name", Field::string())
            .identity_key("id")
            .build()
            .unwrap();
        let table = TableDef::new("contacts", resource);
        let (old, new) = decode_images(
            &table,
            vec![
                ("old.id".to_string(), json!("a")),
                ("old.name".to_string(), json!("x")),
                ("new.id".to_string(), json!("a")),
                ("new.name".to_string(), json!("y")),
            ],
        );
        assert_eq!(old.unwrap()["name"], "x");
        assert_eq!(new.unwrap()["name"], "y");
    }
}
