//! Translates source indexes into destination `CREATE INDEX` statements.
//!
//! The destination can only index one array per compound index, and array
//! traversal must be spelled out explicitly:
//!
//! ```text
//! k2[].n1k1[].n2k1  ->  ALL ARRAY (ALL ARRAY `l2Item`.`n2k1` FOR `l2Item` IN `l1Item`.`n1k1` END) FOR `l1Item` IN `k2` END
//! ```
//!
//! All array-rooted keys of one index must therefore share the same array
//! root; they are folded into a single expression that projects every leaf
//! with `FLATTEN_KEYS`.

use bson::Bson;
use std::fmt;

use super::predicate::{FieldCondition, FieldOperator, LogicalOp, Predicate};
use super::{
    sanitize_index_name, CompileError, Index, IndexFieldPath, IndexKey, Keyspace, ARRAY_MARKER,
    DEFER_BUILD, META_ID,
};
use crate::document::datetime_to_rfc3339;

const ASC: &str = " ASC";
const DESC: &str = " DESC";
const INCLUDE_MISSING: &str = " INCLUDE MISSING";

/// Source `$type` aliases and numeric codes mapped to destination type names.
const TYPE_ALIASES: &[(i32, &str, &str)] = &[
    (1, "double", "number"),
    (2, "string", "string"),
    (3, "object", "object"),
    (4, "array", "array"),
    (5, "binData", "binary"),
    (6, "undefined", "null"),
    (7, "objectId", "string"),
    (8, "bool", "bool"),
    (9, "date", "string"),
    (10, "null", "null"),
    (13, "javascript", "string"),
    (14, "symbol", "string"),
    (15, "javascriptWithScope", "string"),
    (16, "int", "number"),
    (17, "timestamp", "number"),
    (18, "long", "number"),
    (19, "decimal", "number"),
];

/// One leaf of an array group: the path below the array root plus its key attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayFragment {
    /// Path after the last array marker, e.g. `.n2k1.n3k1`.
    pub path: String,
    /// Order and include-missing qualifiers, e.g. ` ASC INCLUDE MISSING`.
    pub attributes: String,
}

/// Array-rooted keys of one index folded under their shared root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayKeyGroup {
    /// Root up to and including the last array marker, e.g. `k2[].n1k1[]`.
    pub prefix: String,
    /// Leaves in key order.
    pub fragments: Vec<ArrayFragment>,
}

impl fmt::Display for ArrayKeyGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix)?;
        for (i, fragment) in self.fragments.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}{}", fragment.path, fragment.attributes)?;
        }
        Ok(())
    }
}

impl ArrayKeyGroup {
    /// Builds the nested `ALL ARRAY ... FOR ... IN ... END` expression.
    #[must_use]
    pub fn to_expression(&self) -> String {
        let root = self
            .prefix
            .strip_suffix(ARRAY_MARKER)
            .unwrap_or(&self.prefix);
        let levels: Vec<&str> = root.split(ARRAY_MARKER).map(trim_dot).collect();
        build_array_expression(&levels, &self.fragments, "", 1)
    }
}

fn trim_dot(segment: &str) -> &str {
    segment.strip_prefix('.').unwrap_or(segment)
}

fn build_array_expression(
    levels: &[&str],
    fragments: &[ArrayFragment],
    parent: &str,
    depth: usize,
) -> String {
    let Some((level, rest)) = levels.split_first() else {
        return project_leaves(fragments, parent);
    };

    let item = format!("`l{}Item`", depth);
    let items = member_ref(parent, level);
    let inner = build_array_expression(rest, fragments, &item, depth + 1);

    if parent.is_empty() {
        format!("ALL ARRAY {} FOR {} IN {} END", inner, item, items)
    } else {
        format!("(ALL ARRAY {} FOR {} IN {} END)", inner, item, items)
    }
}

fn project_leaves(fragments: &[ArrayFragment], parent: &str) -> String {
    let leaf = |fragment: &ArrayFragment| {
        format!(
            "{}{}",
            member_ref(parent, trim_dot(&fragment.path)),
            fragment.attributes
        )
    };

    match fragments {
        [single] => leaf(single),
        _ => format!(
            "FLATTEN_KEYS({})",
            fragments.iter().map(leaf).collect::<Vec<_>>().join(",")
        ),
    }
}

/// `parent.`a`.`b``, or `parent` alone for an empty member.
fn member_ref(parent: &str, member: &str) -> String {
    match (parent.is_empty(), member.is_empty()) {
        (_, true) => parent.to_string(),
        (true, false) => field_ref(member),
        (false, false) => format!("{}.{}", parent, field_ref(member)),
    }
}

/// Backtick-quotes every segment of a dotted path.
pub fn field_ref(field: &str) -> String {
    if field == META_ID {
        return field.to_string();
    }
    format!("`{}`", field.replace('.', "`.`"))
}

/// Order keyword plus the optional include-missing qualifier.
#[must_use]
pub fn lead_key_attributes(order: i32, include_missing: bool) -> String {
    let order = if order == -1 { DESC } else { ASC };
    if include_missing {
        format!("{}{}", order, INCLUDE_MISSING)
    } else {
        order.to_string()
    }
}

fn is_array_rooted(field: &str) -> bool {
    field.find(ARRAY_MARKER).is_some_and(|pos| pos > 0)
}

/// Folds resolved array-rooted keys into one group.
///
/// Keys without an array marker are ignored. Per-key attributes are only
/// attached when more than one key is grouped; `include_missing` applies to
/// the first grouped key.
///
/// # Errors
///
/// [`CompileError::MultipleArrayReference`] when two keys have different roots.
pub fn group_and_combine(
    keys: &[IndexKey],
    include_missing: bool,
) -> Result<Option<ArrayKeyGroup>, CompileError> {
    let mut group: Option<ArrayKeyGroup> = None;

    for (i, key) in keys.iter().enumerate() {
        let Some(last) = key.field.rfind(ARRAY_MARKER) else {
            continue;
        };
        let (prefix, suffix) = key.field.split_at(last + ARRAY_MARKER.len());

        let attributes = if keys.len() > 1 {
            lead_key_attributes(key.order, include_missing && i == 0)
        } else {
            String::new()
        };
        let fragment = ArrayFragment {
            path: suffix.to_string(),
            attributes,
        };

        match group.as_mut() {
            None => {
                group = Some(ArrayKeyGroup {
                    prefix: prefix.to_string(),
                    fragments: vec![fragment],
                })
            }
            Some(existing) if existing.prefix == prefix => existing.fragments.push(fragment),
            Some(existing) => {
                return Err(CompileError::MultipleArrayReference {
                    first: existing.prefix.clone(),
                    second: prefix.to_string(),
                })
            }
        }
    }

    Ok(group)
}

/// Compiles one index into a `CREATE INDEX` statement.
///
/// # Errors
///
/// Returns the index's own error when it is not supported, and any array
/// grouping or predicate translation failure.
pub fn create_index_query(
    keyspace: &Keyspace,
    index: &Index,
    field_path: &IndexFieldPath,
) -> Result<String, CompileError> {
    if let Some(err) = &index.error {
        return Err(err.clone());
    }
    if index.keys.is_empty() {
        return Err(CompileError::NotSupported(format!(
            "index {} has no keys",
            index.name
        )));
    }

    let keys: Vec<IndexKey> = index
        .keys
        .iter()
        .map(|k| IndexKey::new(field_path.get(&k.field), k.order))
        .collect();

    let array_keys: Vec<IndexKey> = keys
        .iter()
        .filter(|k| is_array_rooted(&k.field))
        .cloned()
        .collect();
    let array_first = is_array_rooted(&keys[0].field);
    let group = group_and_combine(&array_keys, !index.sparse && array_first)?;

    let mut fields = Vec::with_capacity(keys.len());
    let mut array_emitted = false;
    for (i, key) in keys.iter().enumerate() {
        let include_missing = i == 0 && !index.sparse;
        if !is_array_rooted(&key.field) {
            fields.push(format!(
                "{}{}",
                field_ref(&key.field),
                lead_key_attributes(key.order, include_missing)
            ));
            continue;
        }
        if array_emitted {
            continue;
        }
        array_emitted = true;
        if let Some(group) = &group {
            let mut expression = group.to_expression();
            if group.fragments.len() == 1 {
                expression.push_str(&lead_key_attributes(key.order, include_missing));
            }
            fields.push(expression);
        }
    }

    let mut statement = format!(
        "CREATE INDEX `{}` ON {}({})",
        sanitize_index_name(&index.name),
        keyspace,
        fields.join(",")
    );
    if let Some(predicate) = &index.partial_expression {
        statement.push_str(" WHERE ");
        statement.push_str(&translate_predicate(predicate, field_path)?);
    }
    statement.push_str(" USING GSI WITH ");
    statement.push_str(DEFER_BUILD);
    Ok(statement)
}

/// Translates a predicate tree into a destination boolean expression.
///
/// Logical nodes are always parenthesised. Conditions on array-annotated
/// paths become nested `ANY ... SATISFIES ... END` tests.
///
/// # Errors
///
/// Unknown operators and unmapped `$type` aliases.
pub fn translate_predicate(
    predicate: &Predicate,
    field_path: &IndexFieldPath,
) -> Result<String, CompileError> {
    match predicate {
        Predicate::Logical {
            op: LogicalOp::Not,
            children,
        } => {
            let [child] = children.as_slice() else {
                return Err(CompileError::InvalidPredicate(
                    "NOT takes exactly one operand".to_string(),
                ));
            };
            Ok(format!("NOT ({})", translate_predicate(child, field_path)?))
        }
        Predicate::Logical { op, children } => {
            let parts = children
                .iter()
                .map(|child| translate_predicate(child, field_path))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(format!(
                "({})",
                parts.join(&format!(" {} ", op.keyword()))
            ))
        }
        Predicate::Field(condition) => translate_condition(condition, field_path),
    }
}

fn translate_condition(
    condition: &FieldCondition,
    field_path: &IndexFieldPath,
) -> Result<String, CompileError> {
    let field = field_path.get(&condition.field);
    let mut is_type = false;

    let (operator, value) = match &condition.operator {
        FieldOperator::Eq => ("=", literal(&condition.value, field)),
        FieldOperator::Ne => ("!=", literal(&condition.value, field)),
        FieldOperator::Gt => (">", literal(&condition.value, field)),
        FieldOperator::Gte => (">=", literal(&condition.value, field)),
        FieldOperator::Lt => ("<", literal(&condition.value, field)),
        FieldOperator::Lte => ("<=", literal(&condition.value, field)),
        FieldOperator::In => ("IN", literal(&condition.value, field)),
        FieldOperator::Nin => ("NOT IN", literal(&condition.value, field)),
        FieldOperator::Exists => {
            let exists = matches!(condition.value, Bson::Boolean(true));
            (if exists { "IS NOT" } else { "IS" }, "NULL".to_string())
        }
        FieldOperator::Type => {
            is_type = true;
            match &condition.value {
                Bson::Array(aliases) => {
                    let types = aliases
                        .iter()
                        .map(|alias| destination_type(alias).map(quote))
                        .collect::<Result<Vec<_>, _>>()?;
                    ("IN", format!("[{}]", types.join(",")))
                }
                alias => ("=", quote(destination_type(alias)?)),
            }
        }
        FieldOperator::Unsupported(op) => {
            return Err(CompileError::UnsupportedOperator(op.clone()));
        }
    };

    let condition = format!("{} {}", operator, value);
    if field.contains(ARRAY_MARKER) {
        return Ok(array_filter_expression(field, is_type, &condition));
    }
    if is_type {
        Ok(format!("type({}) {}", field_ref(field), condition))
    } else {
        Ok(format!("{} {}", field_ref(field), condition))
    }
}

/// Wraps `condition` in one `ANY` scope per array level of `field`.
fn array_filter_expression(field: &str, is_type: bool, condition: &str) -> String {
    let mut parts: Vec<&str> = field.split(ARRAY_MARKER).map(trim_dot).collect();
    if is_type {
        if parts.last().is_some_and(|p| p.is_empty()) {
            parts.pop();
        }
        if let [single] = parts.as_slice() {
            return format!("type({}) {}", field_ref(single), condition);
        }
    }
    any_expression(&parts, "", 1, is_type, condition)
}

fn any_expression(
    parts: &[&str],
    parent: &str,
    depth: usize,
    is_type: bool,
    condition: &str,
) -> String {
    match parts {
        [] => format!("{} {}", parent, condition),
        [leaf] => {
            let target = member_ref(parent, leaf);
            if is_type {
                format!("type({}) {}", target, condition)
            } else {
                format!("{} {}", target, condition)
            }
        }
        [level, rest @ ..] => {
            let item = format!("`l{}Item`", depth);
            let items = member_ref(parent, level);
            let inner = any_expression(rest, &item, depth + 1, is_type, condition);
            format!("ANY {} IN {} SATISFIES ({}) END", item, items, inner)
        }
    }
}

fn quote(text: &str) -> String {
    serde_json::Value::String(text.to_string()).to_string()
}

/// Maps a `$type` alias or numeric code to a destination type name.
fn destination_type(alias: &Bson) -> Result<&'static str, CompileError> {
    let key = match alias {
        Bson::String(name) => name.clone(),
        Bson::Int32(code) => code.to_string(),
        Bson::Int64(code) => code.to_string(),
        Bson::Double(code) if code.fract() == 0.0 => (*code as i64).to_string(),
        other => other.to_string(),
    };

    if key == "number" {
        return Ok("number");
    }
    TYPE_ALIASES
        .iter()
        .find(|(code, name, _)| *name == key || code.to_string() == key)
        .map(|(_, _, destination)| *destination)
        .ok_or(CompileError::UnknownType(key))
}

/// Renders a comparison value as a destination literal.
///
/// Document ids are always strings, so scalars compared with the id are quoted.
fn literal(value: &Bson, field: &str) -> String {
    match value {
        Bson::String(s) => quote(s),
        Bson::ObjectId(oid) => quote(&oid.to_hex()),
        Bson::DateTime(dt) => quote(&datetime_to_rfc3339(dt)),
        Bson::Decimal128(d) => quote(&d.to_string()),
        Bson::Array(items) => format!(
            "[{}]",
            items
                .iter()
                .map(|item| literal(item, field))
                .collect::<Vec<_>>()
                .join(",")
        ),
        Bson::Null | Bson::Undefined => "NULL".to_string(),
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Boolean(_) => {
            let text = match value {
                Bson::Int32(n) => n.to_string(),
                Bson::Int64(n) => n.to_string(),
                Bson::Double(n) => n.to_string(),
                _ => matches!(value, Bson::Boolean(true)).to_string(),
            };
            if field == META_ID {
                quote(&text)
            } else {
                text
            }
        }
        other => other.clone().into_relaxed_extjson().to_string(),
    }
}

#[cfg(test)]
#[path = "compiler_tests.rs"]
mod tests;
