//! Compiles a query [`Expr`] into a SQL `WHERE` fragment plus bound parameters --
//! every field lives in one JSON column, so a term becomes a
//! `CAST(json_extract(properties, '$.field') AS TYPE)` comparison rather than
//! a join against a separate per-field index table, mirroring the original
//! implementation's `_StoreSubset` ad hoc SQL generation (`store.py`).

use super::ast::Expr;
use crate::error::{QualiaError, Result};
use crate::schema::{FieldSchema, FieldType};
use rusqlite::types::Value as SqlValue;

/// A compiled filter: a `WHERE`-clause fragment (without the `WHERE` keyword) and its
/// positionally-bound parameters.
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

pub fn compile(expr: &Expr, schema: &FieldSchema) -> Result<CompiledQuery> {
    let mut params = Vec::new();
    let sql = compile_expr(expr, schema, &mut params)?;
    Ok(CompiledQuery { sql, params })
}

fn json_extract(field: &str, field_type: FieldType) -> String {
    let cast_as = match field_type {
        FieldType::Number => "REAL",
        FieldType::Id | FieldType::Datetime | FieldType::ExactText | FieldType::Text | FieldType::Keyword => "TEXT",
    };
    format!("CAST(json_extract(properties, '$.{field}') AS {cast_as})")
}

fn resolve_column<'a>(field: &str, schema: &'a FieldSchema) -> Result<String> {
    let descriptor = schema.require(field)?;
    Ok(json_extract(&descriptor.name, descriptor.field_type))
}

fn compile_expr(expr: &Expr, schema: &FieldSchema, params: &mut Vec<SqlValue>) -> Result<String> {
    match expr {
        Expr::Empty => Ok("TRUE".to_string()),

        // `CAST(properties.prop AS TEXT) = ?`, value rendered as text.
        Expr::Equals { field, value } => {
            let column = resolve_column(field, schema)?;
            params.push(SqlValue::Text(value.clone()));
            Ok(format!("{column} = ?"))
        }

        // `CAST(properties.prop AS TEXT) REGEXP \bphrase\b` via the registered
        // Unicode-aware `regexp` scalar function (see `index::register_regexp`).
        Expr::Phrase { field, phrase } => {
            let column = resolve_column(field, schema)?;
            params.push(SqlValue::Text(format!(r"\b{}\b", regex::escape(phrase))));
            Ok(format!("{column} REGEXP ?"))
        }

        // `CAST(properties.prop AS TEXT) BETWEEN ? AND ?`, ISO date strings.
        Expr::BetweenDates { field, min, max } => {
            let column = resolve_column(field, schema)?;
            params.push(SqlValue::Text(min.format("%Y-%m-%d").to_string()));
            params.push(SqlValue::Text(max.format("%Y-%m-%d").to_string()));
            Ok(format!("{column} BETWEEN ? AND ?"))
        }

        // `CAST(properties.prop AS REAL) BETWEEN ? AND ?`
        Expr::BetweenNumbers { field, min, max } => {
            let column = resolve_column(field, schema)?;
            params.push(SqlValue::Real(*min));
            params.push(SqlValue::Real(*max));
            Ok(format!("{column} BETWEEN ? AND ?"))
        }

        Expr::And(terms) => {
            let mut clauses = Vec::with_capacity(terms.len());
            for term in terms {
                clauses.push(format!("({})", compile_expr(term, schema, params)?));
            }
            Ok(clauses.join(" AND "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse;

    #[test]
    fn equality_compiles_to_equals() {
        let schema = FieldSchema::new();
        let expr = parse("filename: exactly note.txt").unwrap();
        let compiled = compile(&expr, &schema).unwrap();
        assert!(compiled.sql.contains(" = ?"));
        assert_eq!(compiled.params.len(), 1);
    }

    #[test]
    fn bare_term_compiles_to_regexp() {
        let schema = FieldSchema::new();
        let expr = parse("tags:rust").unwrap();
        let compiled = compile(&expr, &schema).unwrap();
        assert!(compiled.sql.contains("REGEXP"));
        assert_eq!(compiled.params, vec![SqlValue::Text(r"\brust\b".to_string())]);
    }

    #[test]
    fn unknown_field_errors() {
        let schema = FieldSchema::new();
        let expr = parse("nonexistent:value").unwrap();
        assert!(matches!(compile(&expr, &schema), Err(QualiaError::FieldDoesNotExist(_))));
    }

    #[test]
    fn empty_query_matches_all() {
        let schema = FieldSchema::new();
        let compiled = compile(&Expr::Empty, &schema).unwrap();
        assert_eq!(compiled.sql, "TRUE");
        assert!(compiled.params.is_empty());
    }

    #[test]
    fn and_joins_clauses() {
        let schema = FieldSchema::new();
        let expr = parse(r#"tags:rust, comments: "fast""#).unwrap();
        let compiled = compile(&expr, &schema).unwrap();
        assert!(compiled.sql.contains(" AND "));
        assert_eq!(compiled.params.len(), 2);
    }

    #[test]
    fn between_numbers_compiles_to_real_range() {
        let schema = FieldSchema::new();
        let mut schema = schema;
        schema
            .declare(crate::schema::FieldDescriptor::new("value", FieldType::Number))
            .unwrap();
        let expr = parse("value: between 2 and 3").unwrap();
        let compiled = compile(&expr, &schema).unwrap();
        assert!(compiled.sql.contains("AS REAL) BETWEEN ? AND ?"));
        assert_eq!(compiled.params, vec![SqlValue::Real(2.0), SqlValue::Real(3.0)]);
    }
}
