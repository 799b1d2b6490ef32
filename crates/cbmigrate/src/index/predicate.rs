//! Partial-filter predicate tree.
//!
//! Filters follow MongoDB query semantics:
//! - a document is an implicit AND of its entries
//! - `{ "field": value }` is an implicit `$eq`
//! - `{ "field": { "$gt": v, "$lt": w } }` is one condition per operator
//! - `$and` / `$or` take an array of filter documents, `$not` a single one

use bson::{Bson, Document};

use super::CompileError;

/// Boolean connective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    /// All children hold.
    And,
    /// Any child holds.
    Or,
    /// The single child does not hold.
    Not,
}

impl LogicalOp {
    /// Keyword in the destination query language.
    #[must_use]
    pub fn keyword(self) -> &'static str {
        match self {
            LogicalOp::And => "AND",
            LogicalOp::Or => "OR",
            LogicalOp::Not => "NOT",
        }
    }
}

/// Comparison applied to a single field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldOperator {
    /// `$eq` or an implicit equality.
    Eq,
    /// `$ne`
    Ne,
    /// `$gt`
    Gt,
    /// `$gte`
    Gte,
    /// `$lt`
    Lt,
    /// `$lte`
    Lte,
    /// `$in`
    In,
    /// `$nin`
    Nin,
    /// `$exists`, value is a boolean.
    Exists,
    /// `$type`, value is an alias, a type code, or a list of them.
    Type,
    /// Anything else. Kept so translation can report it.
    Unsupported(String),
}

impl FieldOperator {
    fn from_key(key: &str) -> Self {
        match key {
            "$eq" => FieldOperator::Eq,
            "$ne" => FieldOperator::Ne,
            "$gt" => FieldOperator::Gt,
            "$gte" => FieldOperator::Gte,
            "$lt" => FieldOperator::Lt,
            "$lte" => FieldOperator::Lte,
            "$in" => FieldOperator::In,
            "$nin" => FieldOperator::Nin,
            "$exists" => FieldOperator::Exists,
            "$type" => FieldOperator::Type,
            other => FieldOperator::Unsupported(other.to_string()),
        }
    }
}

/// A single `field <operator> value` condition.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldCondition {
    /// Declared dotted path.
    pub field: String,
    /// Comparison.
    pub operator: FieldOperator,
    /// Right-hand side.
    pub value: Bson,
}

/// Node of a predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Connective over child predicates.
    Logical {
        /// Connective.
        op: LogicalOp,
        /// Operands; exactly one for `Not`.
        children: Vec<Predicate>,
    },
    /// Leaf condition.
    Field(FieldCondition),
}

impl Predicate {
    /// Parses a filter document.
    ///
    /// # Errors
    ///
    /// Returns [`CompileError::InvalidPredicate`] for malformed documents and
    /// [`CompileError::UnsupportedOperator`] for unknown top-level operators.
    pub fn parse(doc: &Document) -> Result<Self, CompileError> {
        let mut children = Vec::with_capacity(doc.len());

        for (key, value) in doc {
            let child = match key.as_str() {
                "$and" => parse_logical_array(LogicalOp::And, value)?,
                "$or" => parse_logical_array(LogicalOp::Or, value)?,
                "$not" => match value {
                    Bson::Document(sub) => Predicate::not(Predicate::parse(sub)?),
                    _ => {
                        return Err(CompileError::InvalidPredicate(
                            "$not value must be a document".to_string(),
                        ))
                    }
                },
                k if k.starts_with('$') => {
                    return Err(CompileError::UnsupportedOperator(k.to_string()));
                }
                field => parse_field_condition(field, value)?,
            };
            children.push(child);
        }

        match children.len() {
            0 => Err(CompileError::InvalidPredicate(
                "empty filter document".to_string(),
            )),
            1 => Ok(children.remove(0)),
            _ => Ok(Predicate::Logical {
                op: LogicalOp::And,
                children,
            }),
        }
    }

    /// Leaf condition helper.
    pub fn field(field: impl Into<String>, operator: FieldOperator, value: impl Into<Bson>) -> Self {
        Predicate::Field(FieldCondition {
            field: field.into(),
            operator,
            value: value.into(),
        })
    }

    /// Negation helper.
    #[must_use]
    pub fn not(child: Predicate) -> Self {
        Predicate::Logical {
            op: LogicalOp::Not,
            children: vec![child],
        }
    }

    /// Distinct field names referenced anywhere in the tree, in document order.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        let mut fields = Vec::new();
        self.collect_fields(&mut fields);
        fields
    }

    fn collect_fields<'a>(&'a self, fields: &mut Vec<&'a str>) {
        match self {
            Predicate::Logical { children, .. } => {
                for child in children {
                    child.collect_fields(fields);
                }
            }
            Predicate::Field(cond) => {
                if !fields.contains(&cond.field.as_str()) {
                    fields.push(&cond.field);
                }
            }
        }
    }
}

fn parse_logical_array(op: LogicalOp, value: &Bson) -> Result<Predicate, CompileError> {
    let Bson::Array(items) = value else {
        return Err(CompileError::InvalidPredicate(format!(
            "${} value must be an array",
            op.keyword().to_lowercase()
        )));
    };

    let children = items
        .iter()
        .map(|item| match item {
            Bson::Document(sub) => Predicate::parse(sub),
            _ => Err(CompileError::InvalidPredicate(
                "$and/$or array elements must be documents".to_string(),
            )),
        })
        .collect::<Result<Vec<_>, _>>()?;

    if children.is_empty() {
        return Err(CompileError::InvalidPredicate(
            "$and/$or array must not be empty".to_string(),
        ));
    }

    Ok(Predicate::Logical { op, children })
}

fn is_operator_doc(doc: &Document) -> bool {
    doc.keys().next().is_some_and(|k| k.starts_with('$'))
}

fn parse_field_condition(field: &str, value: &Bson) -> Result<Predicate, CompileError> {
    match value {
        Bson::Document(ops) if is_operator_doc(ops) => parse_operator_doc(field, ops),
        _ => Ok(Predicate::field(field, FieldOperator::Eq, value.clone())),
    }
}

fn parse_operator_doc(field: &str, ops: &Document) -> Result<Predicate, CompileError> {
    let mut conditions = Vec::with_capacity(ops.len());

    for (key, value) in ops {
        let condition = match (key.as_str(), value) {
            ("$not", Bson::Document(inner)) if is_operator_doc(inner) => {
                Predicate::not(parse_operator_doc(field, inner)?)
            }
            ("$exists", value) => {
                let exists = match value {
                    Bson::Boolean(b) => *b,
                    Bson::Int32(n) => *n != 0,
                    Bson::Int64(n) => *n != 0,
                    Bson::Double(n) => *n != 0.0,
                    _ => {
                        return Err(CompileError::InvalidPredicate(
                            "$exists value must be a boolean".to_string(),
                        ))
                    }
                };
                Predicate::field(field, FieldOperator::Exists, exists)
            }
            (key, value) => Predicate::field(field, FieldOperator::from_key(key), value.clone()),
        };
        conditions.push(condition);
    }

    if conditions.len() == 1 {
        Ok(conditions.remove(0))
    } else {
        Ok(Predicate::Logical {
            op: LogicalOp::And,
            children: conditions,
        })
    }
}
