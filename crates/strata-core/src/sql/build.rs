//! Pure SQL statement builders: select, upsert-style insert, update with an
//! optional locked pre-image, delete, count, batched identity select, and
//! aggregation counter increments.

use serde_json::Value;

use crate::error::{QueryError, Result};
use crate::query::{Direction, Filter, WriteSet, WriteValue};
use crate::resource::{FieldKind, Identity};
use crate::sql::{SelectColumn, SqlParam, Statement, infer_param, param_from};
use crate::table::TableDef;

/// Positional parameter accumulator. `push` returns the `$n` placeholder.
struct Params {
    list: Vec<SqlParam>,
}

impl Params {
    fn new() -> Self {
        Self { list: Vec::new() }
    }

    fn push(&mut self, param: SqlParam) -> String {
        self.list.push(param);
        format!("${}", self.list.len())
    }
}

fn quote(ident: &str) -> String {
    format!("\"{ident}\"")
}

/// Resolve an attribute reference to its qualified SQL expression plus
/// column type, walking the join graph for `alias.attr` names.
fn column_expr(table: &TableDef, name: &str) -> Result<(String, FieldKind)> {
    let kind = table.resolve_column(name)?;
    let expr = match name.split_once('.') {
        None => format!("{}.{}", quote(table.storage_name()), quote(name)),
        Some((alias, attr)) => format!("{}.{}", quote(alias), quote(attr)),
    };
    Ok((expr, kind))
}

/// Render one filter as a SQL condition. An empty membership set collapses
/// to `FALSE`, never to an invalid empty `IN ()`.
fn filter_condition(
    table: &TableDef,
    name: &str,
    filter: &Filter,
    params: &mut Params,
) -> Result<String> {
    let (expr, kind) = column_expr(table, name)?;
    Ok(match filter {
        Filter::Eq(Value::Null) => format!("{expr} IS NULL"),
        Filter::Eq(value) => {
            let p = params.push(param_from(name, kind, value)?);
            format!("{expr} = {p}")
        }
        Filter::In(values) if values.is_empty() => "FALSE".to_string(),
        Filter::In(values) => {
            let mut placeholders = Vec::with_capacity(values.len());
            for value in values {
                placeholders.push(params.push(param_from(name, kind, value)?));
            }
            format!("{expr} IN ({})", placeholders.join(", "))
        }
    })
}

/// Identity equality conjunction (identity keys plus version, if present).
fn identity_condition(table: &TableDef, identity: &Identity, params: &mut Params) -> Result<String> {
    let mut parts = Vec::new();
    for (name, value) in identity.pairs() {
        parts.push(filter_condition(
            table,
            name,
            &Filter::Eq(value.clone()),
            params,
        )?);
    }
    Ok(parts.join(" AND "))
}

/// The full select list: base columns plus every join's columns, each
/// aliased by its dot-qualified path.
fn select_columns(table: &TableDef) -> (String, Vec<SelectColumn>) {
    let base = table.storage_name();
    let mut exprs = Vec::new();
    let mut columns = Vec::new();
    for (name, field) in table.resource().fields() {
        let alias = format!("{base}.{name}");
        exprs.push(format!("{}.{} AS {}", quote(base), quote(name), quote(&alias)));
        columns.push(SelectColumn {
            alias,
            kind: field.kind,
        });
    }
    for join in table.joins() {
        for (name, field) in join.resource.fields() {
            let alias = format!("{base}.{}.{name}", join.alias);
            exprs.push(format!(
                "{}.{} AS {}",
                quote(&join.alias),
                quote(name),
                quote(&alias)
            ));
            columns.push(SelectColumn {
                alias,
                kind: field.kind,
            });
        }
    }
    (exprs.join(", "), columns)
}

/// LEFT OUTER JOIN clauses for the given aliases (or all declared joins).
fn join_clauses(table: &TableDef, only_aliases: Option<&[&str]>) -> String {
    let base = table.storage_name();
    let mut out = String::new();
    for join in table.joins() {
        if let Some(aliases) = only_aliases {
            if !aliases.contains(&join.alias.as_str()) {
                continue;
            }
        }
        out.push_str(&format!(
            " LEFT OUTER JOIN {} AS {} ON {}.{} = {}.{}",
            quote(&join.table),
            quote(&join.alias),
            quote(&join.alias),
            quote(&join.foreign_key),
            quote(base),
            quote(&join.local_key),
        ));
    }
    out
}

/// Build a filtered, optionally ordered and limited select over the table
/// and its declared joins.
pub fn select(
    table: &TableDef,
    filters: &[(String, Filter)],
    order: Option<(&str, Direction, Option<&Value>)>,
    limit: Option<usize>,
) -> Result<Statement> {
    let mut params = Params::new();
    let (select_list, columns) = select_columns(table);
    let mut text = format!(
        "SELECT {select_list} FROM {}{}",
        quote(table.storage_name()),
        join_clauses(table, None)
    );

    let mut conditions = Vec::new();
    for (name, filter) in filters {
        conditions.push(filter_condition(table, name, filter, &mut params)?);
    }
    if let Some((ordering, direction, since)) = order {
        if let Some(bound) = since {
            let (expr, kind) = column_expr(table, ordering)?;
            let p = params.push(param_from(ordering, kind, bound)?);
            let op = match direction {
                Direction::Asc => ">",
                Direction::Desc => "<",
            };
            conditions.push(format!("{expr} {op} {p}"));
        }
    }
    if !conditions.is_empty() {
        text.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
    }
    if let Some((ordering, direction, _)) = order {
        let (expr, _) = column_expr(table, ordering)?;
        let dir = match direction {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        };
        text.push_str(&format!(" ORDER BY {expr} {dir}"));
    }
    if let Some(n) = limit {
        text.push_str(&format!(" LIMIT {n}"));
    }

    Ok(Statement {
        text,
        params: params.list,
        columns,
    })
}

/// Render one `SET` assignment. Increments compile to an atomic
/// `col = COALESCE(col, 0) + $n` so concurrent increments compose without
/// read-modify-write races.
fn assignment(
    table: &TableDef,
    name: &str,
    value: &WriteValue,
    params: &mut Params,
) -> Result<String> {
    // Assignments target the base table only. A join-qualified name would
    // render as one malformed quoted identifier, so it is unknown here.
    let kind = match table.resource().field(name) {
        Some(field) => field.kind,
        None => {
            return Err(QueryError::UnknownColumn {
                table: table.storage_name().to_string(),
                column: name.to_string(),
            }
            .into());
        }
    };
    Ok(match value {
        WriteValue::Set(v) => {
            let p = params.push(param_from(name, kind, v)?);
            format!("{} = {p}", quote(name))
        }
        WriteValue::Increment(n) => {
            let p = params.push(SqlParam::Int(Some(*n)));
            format!(
                "{} = COALESCE({}.{}, 0) + {p}",
                quote(name),
                quote(table.storage_name()),
                quote(name)
            )
        }
    })
}

/// Build an insert. With `update` values this is an upsert
/// (`ON CONFLICT ... DO UPDATE`); without, a pure create
/// (`ON CONFLICT DO NOTHING` — a conflicting identity returns zero rows).
///
/// The returned row carries `(xmax = 0) AS "strata.inserted"`: a nonzero
/// `xmax` marks the row as updated rather than freshly inserted, letting
/// callers distinguish create-vs-already-existed without a second query.
pub fn insert(table: &TableDef, item: &Value, update: Option<&WriteSet>) -> Result<Statement> {
    let mut params = Params::new();
    let base = table.storage_name();

    let mut names = Vec::new();
    let mut values = Vec::new();
    for (name, field) in table.resource().fields() {
        names.push(quote(name));
        let value = item.get(name).cloned().unwrap_or(Value::Null);
        values.push(params.push(param_from(name, field.kind, &value)?));
    }

    let conflict_keys = table
        .resource()
        .identity_keys()
        .iter()
        .map(|k| quote(k))
        .collect::<Vec<_>>()
        .join(", ");

    let conflict = match update {
        None => "DO NOTHING".to_string(),
        Some(changes) => {
            let mut assignments = Vec::with_capacity(changes.len());
            for (name, value) in changes {
                assignments.push(assignment(table, name, value, &mut params)?);
            }
            format!("DO UPDATE SET {}", assignments.join(", "))
        }
    };

    let mut returning = vec![format!("(xmax = 0) AS {}", quote("strata.inserted"))];
    let mut columns = vec![SelectColumn {
        alias: "strata.inserted".to_string(),
        kind: FieldKind::Boolean,
    }];
    for (name, field) in table.resource().fields() {
        let alias = format!("{base}.{name}");
        returning.push(format!("{}.{} AS {}", quote(base), quote(name), quote(&alias)));
        columns.push(SelectColumn {
            alias,
            kind: field.kind,
        });
    }

    let text = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({conflict_keys}) {conflict} RETURNING {}",
        quote(base),
        names.join(", "),
        values.join(", "),
        returning.join(", ")
    );

    Ok(Statement {
        text,
        params: params.list,
        columns,
    })
}

/// Build an update by identity (and version precondition, when present).
///
/// With `with_pre_image` the statement joins a `FOR UPDATE` sub-select so a
/// single round trip atomically returns both the old and the new row image
/// (aliased `old.*` / `new.*`) — there is no separate read-then-write race
/// window for aggregation maintenance to fall into.
pub fn update(
    table: &TableDef,
    identity: &Identity,
    changes: &WriteSet,
    with_pre_image: bool,
) -> Result<Statement> {
    let mut params = Params::new();
    let base = table.storage_name();

    let mut assignments = Vec::with_capacity(changes.len());
    for (name, value) in changes {
        assignments.push(assignment(table, name, value, &mut params)?);
    }
    let set_clause = assignments.join(", ");

    if !with_pre_image {
        let condition = identity_condition(table, identity, &mut params)?;
        let mut returning = Vec::new();
        let mut columns = Vec::new();
        for (name, field) in table.resource().fields() {
            let alias = format!("{base}.{name}");
            returning.push(format!("{}.{} AS {}", quote(base), quote(name), quote(&alias)));
            columns.push(SelectColumn {
                alias,
                kind: field.kind,
            });
        }
        let text = format!(
            "UPDATE {} SET {set_clause} WHERE {condition} RETURNING {}",
            quote(base),
            returning.join(", ")
        );
        return Ok(Statement {
            text,
            params: params.list,
            columns,
        });
    }

    // Inner locked select of the pre-update row. Unqualified names are
    // unambiguous inside the single-table sub-select.
    let mut inner_condition = Vec::new();
    for (name, value) in identity.pairs() {
        let kind = table.resolve_column(name)?;
        match value {
            Value::Null => inner_condition.push(format!("{} IS NULL", quote(name))),
            v => {
                let p = params.push(param_from(name, kind, v)?);
                inner_condition.push(format!("{} = {p}", quote(name)));
            }
        }
    }
    let inner_columns = table
        .resource()
        .fields()
        .iter()
        .map(|(name, _)| quote(name))
        .collect::<Vec<_>>()
        .join(", ");

    let join_condition = table
        .resource()
        .identity_keys()
        .iter()
        .map(|key| format!("{}.{} = {}.{}", quote(base), quote(key), quote("old"), quote(key)))
        .collect::<Vec<_>>()
        .join(" AND ");

    let mut returning = Vec::new();
    let mut columns = Vec::new();
    for (name, field) in table.resource().fields() {
        let alias = format!("old.{name}");
        returning.push(format!("{}.{} AS {}", quote("old"), quote(name), quote(&alias)));
        columns.push(SelectColumn {
            alias,
            kind: field.kind,
        });
    }
    for (name, field) in table.resource().fields() {
        let alias = format!("new.{name}");
        returning.push(format!("{}.{} AS {}", quote(base), quote(name), quote(&alias)));
        columns.push(SelectColumn {
            alias,
            kind: field.kind,
        });
    }

    let text = format!(
        "UPDATE {base_q} SET {set_clause} FROM (SELECT {inner_columns} FROM {base_q} WHERE {} FOR UPDATE) AS {old_q} WHERE {join_condition} RETURNING {}",
        inner_condition.join(" AND "),
        returning.join(", "),
        base_q = quote(base),
        old_q = quote("old"),
    );

    Ok(Statement {
        text,
        params: params.list,
        columns,
    })
}

/// Build a delete by identity, returning the deleted row image.
pub fn delete(table: &TableDef, identity: &Identity) -> Result<Statement> {
    let mut params = Params::new();
    let base = table.storage_name();
    let condition = identity_condition(table, identity, &mut params)?;

    let mut returning = Vec::new();
    let mut columns = Vec::new();
    for (name, field) in table.resource().fields() {
        let alias = format!("{base}.{name}");
        returning.push(format!("{}.{} AS {}", quote(base), quote(name), quote(&alias)));
        columns.push(SelectColumn {
            alias,
            kind: field.kind,
        });
    }

    let text = format!(
        "DELETE FROM {} WHERE {condition} RETURNING {}",
        quote(base),
        returning.join(", ")
    );
    Ok(Statement {
        text,
        params: params.list,
        columns,
    })
}

/// Build an exact count under the same filter semantics as `select`.
/// Joins are only emitted for aliases the filters actually reference, so an
/// unfiltered count never multiplies rows through an outer join.
pub fn count(table: &TableDef, filters: &[(String, Filter)]) -> Result<Statement> {
    let mut params = Params::new();
    let referenced: Vec<&str> = filters
        .iter()
        .filter_map(|(name, _)| name.split_once('.').map(|(alias, _)| alias))
        .collect();

    let mut conditions = Vec::new();
    for (name, filter) in filters {
        conditions.push(filter_condition(table, name, filter, &mut params)?);
    }

    let mut text = format!(
        "SELECT COUNT(*) AS {} FROM {}{}",
        quote("strata.count"),
        quote(table.storage_name()),
        join_clauses(table, Some(&referenced))
    );
    if !conditions.is_empty() {
        text.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
    }

    Ok(Statement {
        text,
        params: params.list,
        columns: vec![SelectColumn {
            alias: "strata.count".to_string(),
            kind: FieldKind::Integer,
        }],
    })
}

/// Build one statement selecting every given identity via an `OR` of
/// per-identity conjunctions. The caller reassembles results positionally.
pub fn batch_select(table: &TableDef, identities: &[Identity]) -> Result<Statement> {
    let mut params = Params::new();
    let (select_list, columns) = select_columns(table);

    let mut alternatives = Vec::with_capacity(identities.len());
    for identity in identities {
        let condition = identity_condition(table, identity, &mut params)?;
        alternatives.push(format!("({condition})"));
    }

    let text = format!(
        "SELECT {select_list} FROM {}{} WHERE {}",
        quote(table.storage_name()),
        join_clauses(table, None),
        alternatives.join(" OR ")
    );
    Ok(Statement {
        text,
        params: params.list,
        columns,
    })
}

/// Build an aggregation counter adjustment against a target table the
/// source table only knows by name.
pub fn increment(
    target: &str,
    field: &str,
    key: &[(String, Value)],
    delta: i64,
) -> Statement {
    let mut params = Params::new();
    let p = params.push(SqlParam::Int(Some(delta)));
    let mut conditions = Vec::with_capacity(key.len());
    for (name, value) in key {
        let kp = params.push(infer_param(value));
        conditions.push(format!("{}.{} = {kp}", quote(target), quote(name)));
    }
    let text = format!(
        "UPDATE {target_q} SET {field_q} = COALESCE({target_q}.{field_q}, 0) + {p} WHERE {}",
        conditions.join(" AND "),
        target_q = quote(target),
        field_q = quote(field),
    );
    Statement {
        text,
        params: params.list,
        columns: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Field, Resource};
    use crate::table::Join;
    use serde_json::json;

    fn contacts() -> TableDef {
        let resource = Resource::builder("contact")
            .field("id", Field::string())
            .field("version", Field::integer())
            .field("name", Field::string())
            .identity_key("id")
            .version_key("version")
            .build()
            .unwrap();
        TableDef::new("contacts", resource)
    }

    fn contacts_with_org() -> TableDef {
        let org = Resource::builder("org")
            .field("id", Field::string())
            .field("title", Field::string())
            .identity_key("id")
            .build()
            .unwrap();
        let resource = Resource::builder("contact")
            .field("id", Field::string())
            .field("version", Field::integer())
            .field("name", Field::string())
            .field("org_id", Field::string().optional())
            .identity_key("id")
            .version_key("version")
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
    fn test_select_simple() {
        let table = contacts();
        let stmt = select(
            &table,
            &[("id".to_string(), Filter::Eq(json!("a")))],
            None,
            Some(1),
        )
        .unwrap();
        assert_eq!(
            stmt.text,
            "SELECT \"contacts\".\"id\" AS \"contacts.id\", \
             \"contacts\".\"version\" AS \"contacts.version\", \
             \"contacts\".\"name\" AS \"contacts.name\" \
             FROM \"contacts\" WHERE \"contacts\".\"id\" = $1 LIMIT 1"
        );
        assert_eq!(stmt.params, vec![SqlParam::Text(Some("a".to_string()))]);
        assert_eq!(stmt.columns.len(), 3);
    }

    #[test]
    fn test_select_order_and_since() {
        let table = contacts();
        let since = json!(5);
        let stmt = select(
            &table,
            &[],
            Some(("version", Direction::Asc, Some(&since))),
            Some(100),
        )
        .unwrap();
        assert!(stmt.text.contains("WHERE \"contacts\".\"version\" > $1"));
        assert!(stmt.text.ends_with("ORDER BY \"contacts\".\"version\" ASC LIMIT 100"));
        assert_eq!(stmt.params, vec![SqlParam::Int(Some(5))]);

        let stmt = select(
            &table,
            &[],
            Some(("version", Direction::Desc, Some(&since))),
            None,
        )
        .unwrap();
        assert!(stmt.text.contains("\"contacts\".\"version\" < $1"));
        assert!(stmt.text.contains("DESC"));
    }

    #[test]
    fn test_select_empty_membership_collapses_to_false() {
        let table = contacts();
        let stmt = select(&table, &[("id".to_string(), Filter::In(vec![]))], None, None).unwrap();
        assert!(stmt.text.contains("WHERE FALSE"));
        assert!(!stmt.text.contains("IN ()"));
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_select_membership_filter() {
        let table = contacts();
        let stmt = select(
            &table,
            &[(
                "name".to_string(),
                Filter::In(vec![json!("x"), json!("y")]),
            )],
            None,
            None,
        )
        .unwrap();
        assert!(stmt.text.contains("\"contacts\".\"name\" IN ($1, $2)"));
        assert_eq!(stmt.params.len(), 2);
    }

    #[test]
    fn test_select_null_equality_uses_is_null() {
        let table = contacts_with_org();
        let stmt = select(
            &table,
            &[("org_id".to_string(), Filter::Eq(Value::Null))],
            None,
            None,
        )
        .unwrap();
        assert!(stmt.text.contains("\"contacts\".\"org_id\" IS NULL"));
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_select_unknown_column_is_build_error() {
        let table = contacts();
        let err = select(
            &table,
            &[("nope".to_string(), Filter::Eq(json!(1)))],
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Query(QueryError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_select_joins_nested_resource() {
        let table = contacts_with_org();
        let stmt = select(
            &table,
            &[("org.title".to_string(), Filter::Eq(json!("acme")))],
            None,
            None,
        )
        .unwrap();
        assert!(stmt.text.contains(
            "LEFT OUTER JOIN \"orgs\" AS \"org\" ON \"org\".\"id\" = \"contacts\".\"org_id\""
        ));
        assert!(stmt.text.contains("\"org\".\"title\" AS \"contacts.org.title\""));
        assert!(stmt.text.contains("WHERE \"org\".\"title\" = $1"));
    }

    #[test]
    fn test_insert_create_does_nothing_on_conflict() {
        let table = contacts();
        let item = json!({"id": "a", "version": 1, "name": "x"});
        let stmt = insert(&table, &item, None).unwrap();
        assert!(stmt.text.starts_with(
            "INSERT INTO \"contacts\" (\"id\", \"version\", \"name\") VALUES ($1, $2, $3) \
             ON CONFLICT (\"id\") DO NOTHING RETURNING (xmax = 0) AS \"strata.inserted\""
        ));
        assert_eq!(
            stmt.params,
            vec![
                SqlParam::Text(Some("a".to_string())),
                SqlParam::Int(Some(1)),
                SqlParam::Text(Some("x".to_string())),
            ]
        );
        assert_eq!(stmt.columns[0].alias, "strata.inserted");
    }

    #[test]
    fn test_insert_upsert_sets_values_and_increments() {
        let table = contacts();
        let item = json!({"id": "a", "version": 1, "name": "x"});
        let changes = vec![
            ("name".to_string(), WriteValue::Set(json!("y"))),
            ("version".to_string(), WriteValue::Increment(1)),
        ];
        let stmt = insert(&table, &item, Some(&changes)).unwrap();
        assert!(stmt.text.contains(
            "ON CONFLICT (\"id\") DO UPDATE SET \"name\" = $4, \
             \"version\" = COALESCE(\"contacts\".\"version\", 0) + $5"
        ));
    }

    #[test]
    fn test_update_plain_returns_new_image() {
        let table = contacts();
        let identity =
            Identity::new([("id", json!("a"))]).with_version("version", json!(1));
        let changes = vec![("name".to_string(), WriteValue::Set(json!("y")))];
        let stmt = update(&table, &identity, &changes, false).unwrap();
        assert_eq!(
            stmt.text,
            "UPDATE \"contacts\" SET \"name\" = $1 \
             WHERE \"contacts\".\"id\" = $2 AND \"contacts\".\"version\" = $3 \
             RETURNING \"contacts\".\"id\" AS \"contacts.id\", \
             \"contacts\".\"version\" AS \"contacts.version\", \
             \"contacts\".\"name\" AS \"contacts.name\""
        );
    }

    #[test]
    fn test_update_with_pre_image_locks_old_row() {
        let table = contacts();
        let identity = Identity::new([("id", json!("a"))]);
        let changes = vec![("name".to_string(), WriteValue::Set(json!("y")))];
        let stmt = update(&table, &identity, &changes, true).unwrap();
        assert!(stmt.text.contains(
            "FROM (SELECT \"id\", \"version\", \"name\" FROM \"contacts\" \
             WHERE \"id\" = $2 FOR UPDATE) AS \"old\""
        ));
        assert!(stmt.text.contains("WHERE \"contacts\".\"id\" = \"old\".\"id\""));
        assert!(stmt.text.contains("\"old\".\"name\" AS \"old.name\""));
        assert!(stmt.text.contains("\"contacts\".\"name\" AS \"new.name\""));
        // old image columns precede new image columns
        assert_eq!(stmt.columns[0].alias, "old.id");
        assert_eq!(stmt.columns[3].alias, "new.id");
    }

    #[test]
    fn test_assignments_reject_join_qualified_names() {
        let table = contacts_with_org();
        let identity = Identity::new([("id", json!("a"))]);
        let changes = vec![("org.title".to_string(), WriteValue::Set(json!("boss")))];

        let err = update(&table, &identity, &changes, false).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Query(QueryError::UnknownColumn { column, .. })
                if column == "org.title"
        ));

        // Upsert conflict assignments go through the same guard.
        let item = json!({"id": "a", "version": 1, "name": "x"});
        let err = insert(&table, &item, Some(&changes)).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Query(QueryError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_delete_returns_old_image() {
        let table = contacts();
        let identity = Identity::new([("id", json!("a"))]);
        let stmt = delete(&table, &identity).unwrap();
        assert!(stmt.text.starts_with("DELETE FROM \"contacts\" WHERE \"contacts\".\"id\" = $1 RETURNING"));
        assert_eq!(stmt.columns.len(), 3);
    }

    #[test]
    fn test_count_skips_unreferenced_joins() {
        let table = contacts_with_org();
        let stmt = count(&table, &[("name".to_string(), Filter::Eq(json!("x")))]).unwrap();
        assert!(!stmt.text.contains("JOIN"));

        let stmt = count(&table, &[("org.title".to_string(), Filter::Eq(json!("x")))]).unwrap();
        assert!(stmt.text.contains("LEFT OUTER JOIN \"orgs\""));
    }

    #[test]
    fn test_batch_select_or_of_conjunctions() {
        let table = contacts();
        let ids = vec![
            Identity::new([("id", json!("a"))]),
            Identity::new([("id", json!("b"))]).with_version("version", json!(2)),
        ];
        let stmt = batch_select(&table, &ids).unwrap();
        assert!(stmt.text.contains(
            "WHERE (\"contacts\".\"id\" = $1) OR \
             (\"contacts\".\"id\" = $2 AND \"contacts\".\"version\" = $3)"
        ));
        assert_eq!(stmt.params.len(), 3);
    }

    #[test]
    fn test_increment_statement() {
        let stmt = increment(
            "threads",
            "message_count",
            &[("id".to_string(), json!("t1"))],
            -1,
        );
        assert_eq!(
            stmt.text,
            "UPDATE \"threads\" SET \"message_count\" = \
             COALESCE(\"threads\".\"message_count\", 0) + $1 \
             WHERE \"threads\".\"id\" = $2"
        );
        assert_eq!(
            stmt.params,
            vec![
                SqlParam::Int(Some(-1)),
                SqlParam::Text(Some("t1".to_string()))
            ]
        );
    }
}
