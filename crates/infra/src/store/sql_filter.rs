//! Translation of predicate trees into parameterized SQL over a JSONB document column.
//!
//! Every leaf is emitted as a two-valued expression (`TRUE`/`FALSE`, never
//! `NULL`), so `NOT` and the boolean connectives behave exactly like in-memory
//! evaluation: a comparison against a missing or null field is false, except
//! `IS NULL`.
//!
//! Field names are bound as parameters, never spliced into the SQL text. The
//! translation assumes the JSON type of a document field matches the kind of the
//! operand it is compared with (text, number, boolean; uuids and timestamps are
//! JSON strings).

use thiserror::Error;

use bizhub_core::specification::{Comparator, Comparison, Expr, FieldValue, FilterTranslator, Predicate, Variable};

/// The predicate could not be expressed as SQL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    /// A leaf references a variable other than the predicate's parameter.
    #[error("leaf on `{field}` references unbound variable {variable} (parameter is {parameter})")]
    UnboundVariable {
        field: &'static str,
        variable: Variable,
        parameter: Variable,
    },
}

/// A `WHERE` fragment and the values for its placeholders, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFilter {
    pub sql: String,
    pub params: Vec<FieldValue>,
}

/// Translates predicates into Postgres SQL over a JSONB column.
#[derive(Debug, Clone, Copy)]
pub struct SqlFilterTranslator {
    document_column: &'static str,
    first_placeholder: usize,
}

impl SqlFilterTranslator {
    /// `first_placeholder` is the number of the first `$n` this fragment may use.
    pub fn new(document_column: &'static str, first_placeholder: usize) -> Self {
        Self {
            document_column,
            first_placeholder,
        }
    }
}

impl<T> FilterTranslator<T> for SqlFilterTranslator {
    type Filter = SqlFilter;
    type Error = TranslateError;

    fn translate(&self, predicate: &Predicate<T>) -> Result<SqlFilter, TranslateError> {
        let mut writer = Writer {
            column: self.document_column,
            parameter: predicate.parameter(),
            next: self.first_placeholder,
            params: Vec::new(),
        };
        let sql = writer.expr(predicate.body())?;
        Ok(SqlFilter {
            sql,
            params: writer.params,
        })
    }
}

struct Writer {
    column: &'static str,
    parameter: Variable,
    next: usize,
    params: Vec<FieldValue>,
}

impl Writer {
    fn bind(&mut self, value: FieldValue) -> String {
        let placeholder = format!("${}", self.next);
        self.next += 1;
        self.params.push(value);
        placeholder
    }

    fn expr(&mut self, expr: &Expr) -> Result<String, TranslateError> {
        Ok(match expr {
            Expr::Literal(true) => "TRUE".to_string(),
            Expr::Literal(false) => "FALSE".to_string(),
            Expr::Compare(c) => self.comparison(c)?,
            Expr::And(a, b) => format!("({} AND {})", self.expr(a)?, self.expr(b)?),
            Expr::Or(a, b) => format!("({} OR {})", self.expr(a)?, self.expr(b)?),
            Expr::Not(e) => format!("(NOT {})", self.expr(e)?),
        })
    }

    fn comparison(&mut self, c: &Comparison) -> Result<String, TranslateError> {
        if c.variable != self.parameter {
            return Err(TranslateError::UnboundVariable {
                field: c.field,
                variable: c.variable,
                parameter: self.parameter,
            });
        }

        let field = self.bind(FieldValue::from(c.field));
        let json = format!("({} -> {field}::text)", self.column);
        let text = format!("({} ->> {field}::text)", self.column);

        Ok(match &c.comparator {
            Comparator::IsNull => format!("(COALESCE(jsonb_typeof({json}), 'null') = 'null')"),
            Comparator::Eq(v) => self.typed(&json, &text, "=", v),
            Comparator::Lt(v) => self.typed(&json, &text, "<", v),
            Comparator::Le(v) => self.typed(&json, &text, "<=", v),
            Comparator::Gt(v) => self.typed(&json, &text, ">", v),
            Comparator::Ge(v) => self.typed(&json, &text, ">=", v),
            Comparator::Ne(v) if v.is_null() => "FALSE".to_string(),
            Comparator::Ne(v) => {
                // Any non-null value of another kind is "not equal".
                let eq = self.typed(&json, &text, "=", v);
                format!("(COALESCE(jsonb_typeof({json}), 'null') <> 'null' AND NOT {eq})")
            }
            Comparator::Contains(needle) => {
                let p = self.bind(FieldValue::from(needle.as_str()));
                format!("((CASE WHEN jsonb_typeof({json}) = 'string' THEN strpos({text}, {p}) > 0 END) IS TRUE)")
            }
            Comparator::StartsWith(prefix) => {
                let p = self.bind(FieldValue::from(prefix.as_str()));
                format!("((CASE WHEN jsonb_typeof({json}) = 'string' THEN starts_with({text}, {p}) END) IS TRUE)")
            }
            Comparator::In(values) => {
                let leaves: Vec<String> = values
                    .iter()
                    .filter(|v| !v.is_null())
                    .map(|v| self.typed(&json, &text, "=", v))
                    .collect();
                if leaves.is_empty() {
                    "FALSE".to_string()
                } else {
                    format!("({})", leaves.join(" OR "))
                }
            }
        })
    }

    /// `field <op> value`, guarded by the field's JSON type so that kind
    /// mismatches and nulls yield FALSE instead of a cast error or NULL.
    fn typed(&mut self, json: &str, text: &str, op: &str, value: &FieldValue) -> String {
        let (json_type, cast) = match value {
            FieldValue::Null => return "FALSE".to_string(),
            FieldValue::Bool(_) => ("boolean", "::boolean"),
            FieldValue::Int(_) => ("number", "::bigint"),
            FieldValue::Text(_) => ("string", ""),
            FieldValue::Uuid(_) => ("string", "::uuid"),
            FieldValue::Timestamp(_) => ("string", "::timestamptz"),
        };
        let p = self.bind(value.clone());
        format!("((CASE WHEN jsonb_typeof({json}) = '{json_type}' THEN {text}{cast} {op} {p} END) IS TRUE)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bizhub_core::Specification;
    use bizhub_core::specification::Fields;

    struct Doc;

    impl Fields for Doc {
        fn field(&self, _name: &str) -> FieldValue {
            FieldValue::Null
        }
    }

    fn translate(spec: &Specification<Doc>) -> SqlFilter {
        spec.to_filter(&SqlFilterTranslator::new("data", 3)).unwrap()
    }

    #[test]
    fn equality_binds_field_name_and_value() {
        let filter = translate(&Specification::new(|d| d.field("name").equals("Acme")));

        assert_eq!(
            filter.sql,
            "((CASE WHEN jsonb_typeof((data -> $3::text)) = 'string' THEN (data ->> $3::text) = $4 END) IS TRUE)"
        );
        assert_eq!(filter.params, vec![FieldValue::from("name"), FieldValue::from("Acme")]);
    }

    #[test]
    fn connectives_nest_in_call_order() {
        let a = Specification::<Doc>::new(|d| d.field("name").equals("Acme"));
        let b = Specification::<Doc>::new(|d| d.field("tax_id").equals("1"));
        let c = Specification::<Doc>::new(|d| d.field("score").greater_than(3));

        let filter = translate(&a.and(&b).or(&c.not()));

        assert!(filter.sql.starts_with("(("));
        assert!(filter.sql.contains(" AND "));
        assert!(filter.sql.contains(" OR (NOT "));
        assert!(filter.sql.contains("::bigint > $8"));
        // name, "Acme", tax_id, "1", score, 3
        assert_eq!(filter.params.len(), 6);
    }

    #[test]
    fn null_tests_and_literals() {
        let filter = translate(&Specification::new(|d| d.field("deleted_at").is_null()));
        assert_eq!(filter.sql, "(COALESCE(jsonb_typeof((data -> $3::text)), 'null') = 'null')");

        assert_eq!(translate(&Specification::any()).sql, "TRUE");
        assert_eq!(translate(&Specification::none()).sql, "FALSE");
    }

    #[test]
    fn empty_in_list_is_false() {
        let filter = translate(&Specification::new(|d| d.field("role").is_in(Vec::<String>::new())));
        assert_eq!(filter.sql, "FALSE");
        // Only the field name was bound.
        assert_eq!(filter.params.len(), 1);
    }

    #[test]
    fn unbound_variable_is_rejected() {
        let a = Predicate::<Doc>::bind(|d| d.field("name").equals("A"));
        let b = Predicate::<Doc>::bind(|d| d.field("name").equals("B"));
        let mixed = Predicate::<Doc>::from_parts(a.parameter(), a.body().clone().and(b.body().clone()));

        let err = SqlFilterTranslator::new("data", 1).translate(&mixed).unwrap_err();
        match err {
            TranslateError::UnboundVariable { field, variable, parameter } => {
                assert_eq!(field, "name");
                assert_eq!(variable, b.parameter());
                assert_eq!(parameter, a.parameter());
            }
        }
    }
}
