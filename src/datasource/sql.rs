//! Translation of query specs into parameterized SQL.
//!
//! Statements are assembled from quoted identifiers and placeholders only;
//! every value travels as a bound parameter. Backend quirks live behind the
//! [`Dialect`] trait, implemented inside each connector module.

use super::schema::{ColumnInfo, TableTarget};
use crate::error::{DataError, Result};
use crate::query::{
    Combinator, Condition, ConditionList, DeleteSpec, Direction, FilterNode, InsertSpec, Operand,
    Operator, QuerySpec, UpdateSpec, Value,
};

/// Backend-specific SQL syntax.
pub trait Dialect: Send + Sync {
    /// Quote an identifier so it is taken literally.
    fn quote_ident(&self, ident: &str) -> String;

    /// Placeholder for the 1-based parameter `index`.
    fn placeholder(&self, index: usize) -> String;

    /// Pattern match of `column` against the bound pattern `placeholder`.
    ///
    /// `%` and `_` are wildcards and `\` escapes them on every backend.
    fn like(&self, column: &str, placeholder: &str) -> String;

    /// Insert statement for a row made entirely of defaults.
    fn insert_defaults(&self, table: &str) -> String {
        format!("INSERT INTO {table} DEFAULT VALUES")
    }

    /// Select-list expression for a column, aliased back to its own name.
    fn select_column(&self, column: &ColumnInfo) -> String {
        self.quote_ident(&column.name)
    }

    /// Placeholder for `value` bound against `column`.
    fn bind_placeholder(&self, placeholder: String, _column: &ColumnInfo, _value: &Value) -> String {
        placeholder
    }
}

/// SQL text plus its bound parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

struct Builder<'a> {
    dialect: &'a dyn Dialect,
    target: &'a TableTarget,
    params: Vec<Value>,
}

impl<'a> Builder<'a> {
    fn new(dialect: &'a dyn Dialect, target: &'a TableTarget) -> Self {
        Self {
            dialect,
            target,
            params: Vec::new(),
        }
    }

    fn ident(&self, name: &str) -> String {
        self.dialect.quote_ident(name)
    }

    fn table(&self) -> String {
        self.ident(self.target.table())
    }

    /// Bind a value, emitting the NULL keyword instead of an untyped null parameter.
    fn bind(&mut self, value: Value) -> String {
        if value.is_null() {
            return "NULL".to_string();
        }
        self.params.push(value);
        self.dialect.placeholder(self.params.len())
    }

    fn bind_for(&mut self, column: &str, value: &Value) -> Result<String> {
        let (target, dialect) = (self.target, self.dialect);
        let info = target.column(column)?;
        let coerced = info.coerce(value.clone());
        if coerced.is_null() {
            return Ok(self.bind(coerced));
        }
        let placeholder = self.bind(coerced.clone());
        Ok(dialect.bind_placeholder(placeholder, info, &coerced))
    }

    fn filter(&mut self, list: &ConditionList) -> Result<String> {
        let joiner = match list.combinator() {
            Combinator::And => " AND ",
            Combinator::Or => " OR ",
        };
        let parts = list
            .children()
            .iter()
            .map(|child| match child {
                FilterNode::Condition(c) => self.condition(c),
                FilterNode::List(l) => self.filter(l),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("({})", parts.join(joiner)))
    }

    fn condition(&mut self, c: &Condition) -> Result<String> {
        let column = self.target.column(c.field())?.name.clone();
        let col = self.ident(&column);

        let sql = match (c.op(), c.value()) {
            (Operator::Eq, Operand::Scalar(Value::Null)) => format!("{col} IS NULL"),
            (Operator::Ne, Operand::Scalar(Value::Null)) => format!("{col} IS NOT NULL"),
            (Operator::In, Operand::List(items)) => {
                let placeholders = items
                    .iter()
                    .map(|v| self.bind_for(&column, v))
                    .collect::<Result<Vec<_>>>()?;
                format!("{col} IN ({})", placeholders.join(", "))
            }
            (Operator::Like, Operand::Scalar(pattern)) => {
                let ph = self.bind(pattern.clone());
                self.dialect.like(&col, &ph)
            }
            (op, Operand::Scalar(v)) => {
                let ph = self.bind_for(&column, v)?;
                format!("{col} {} {ph}", comparison(op)?)
            }
            (op, Operand::List(_)) => {
                return Err(DataError::QuerySyntax(format!(
                    "`{op}` cannot take a list operand"
                )))
            }
        };
        Ok(sql)
    }

    fn key_clause(&mut self, key: &Value) -> Result<String> {
        let pk = self.target.primary_key()?.name.clone();
        let ph = self.bind_for(&pk, key)?;
        Ok(format!("{} = {ph}", self.ident(&pk)))
    }

    fn column_list(&self) -> String {
        self.target
            .columns()
            .iter()
            .map(|c| self.dialect.select_column(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn finish(self, sql: String) -> Statement {
        Statement {
            sql,
            params: self.params,
        }
    }
}

fn comparison(op: Operator) -> Result<&'static str> {
    match op {
        Operator::Eq => Ok("="),
        Operator::Ne => Ok("<>"),
        Operator::Gt => Ok(">"),
        Operator::Gte => Ok(">="),
        Operator::Lt => Ok("<"),
        Operator::Lte => Ok("<="),
        Operator::Like | Operator::In => Err(DataError::QuerySyntax(format!(
            "`{op}` is not a scalar comparison"
        ))),
    }
}

/// `SELECT` with filter, ordering and bound `LIMIT`/`OFFSET`.
pub fn select(dialect: &dyn Dialect, target: &TableTarget, spec: &QuerySpec) -> Result<Statement> {
    let mut b = Builder::new(dialect, target);
    let mut sql = format!("SELECT {} FROM {}", b.column_list(), b.table());

    if let Some(filter) = spec.filter() {
        let clause = b.filter(filter)?;
        sql.push_str(" WHERE ");
        sql.push_str(&clause);
    }

    if !spec.order().is_empty() {
        let parts = spec
            .order()
            .iter()
            .map(|item| -> Result<String> {
                let column = target.column(&item.field)?;
                let dir = match item.direction {
                    Direction::Asc => "ASC",
                    Direction::Desc => "DESC",
                };
                Ok(format!("{} {dir}", b.ident(&column.name)))
            })
            .collect::<Result<Vec<_>>>()?;
        sql.push_str(" ORDER BY ");
        sql.push_str(&parts.join(", "));
    }

    let limit = b.bind(Value::Integer(i64::from(spec.limit())));
    let offset = b.bind(Value::Integer(
        i64::try_from(spec.offset()).unwrap_or(i64::MAX),
    ));
    sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));

    Ok(b.finish(sql))
}

/// `SELECT` of the full row with the given primary key.
pub fn select_row(dialect: &dyn Dialect, target: &TableTarget, key: &Value) -> Result<Statement> {
    let mut b = Builder::new(dialect, target);
    let clause = b.key_clause(key)?;
    let sql = format!(
        "SELECT {} FROM {} WHERE {clause}",
        b.column_list(),
        b.table()
    );
    Ok(b.finish(sql))
}

pub fn insert(dialect: &dyn Dialect, target: &TableTarget, spec: &InsertSpec) -> Result<Statement> {
    target.check_insert(spec)?;
    let mut b = Builder::new(dialect, target);

    if spec.values().is_empty() {
        let sql = dialect.insert_defaults(&b.table());
        return Ok(b.finish(sql));
    }

    let mut columns = Vec::with_capacity(spec.values().len());
    let mut values = Vec::with_capacity(spec.values().len());
    for (name, value) in spec.values() {
        columns.push(b.ident(name));
        values.push(b.bind_for(name, value)?);
    }
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        b.table(),
        columns.join(", "),
        values.join(", ")
    );
    Ok(b.finish(sql))
}

pub fn update(dialect: &dyn Dialect, target: &TableTarget, spec: &UpdateSpec) -> Result<Statement> {
    target.check_update(spec)?;
    let mut b = Builder::new(dialect, target);

    let mut assignments = Vec::with_capacity(spec.values().len());
    for (name, value) in spec.values() {
        let ph = b.bind_for(name, value)?;
        assignments.push(format!("{} = {ph}", b.ident(name)));
    }
    let clause = b.key_clause(spec.key())?;
    let sql = format!(
        "UPDATE {} SET {} WHERE {clause}",
        b.table(),
        assignments.join(", ")
    );
    Ok(b.finish(sql))
}

pub fn delete(dialect: &dyn Dialect, target: &TableTarget, spec: &DeleteSpec) -> Result<Statement> {
    let mut b = Builder::new(dialect, target);
    let clause = b.key_clause(spec.key())?;
    let sql = format!("DELETE FROM {} WHERE {clause}", b.table());
    Ok(b.finish(sql))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::schema::tests::users_columns;
    use crate::query::{OrderItem, QuerySpec};

    /// Numbered-placeholder dialect for exercising the builder.
    struct Numbered;

    impl Dialect for Numbered {
        fn quote_ident(&self, ident: &str) -> String {
            format!("\"{}\"", ident.replace('"', "\"\""))
        }

        fn placeholder(&self, index: usize) -> String {
            format!("${index}")
        }

        fn like(&self, column: &str, placeholder: &str) -> String {
            format!("{column} LIKE {placeholder}")
        }
    }

    fn target() -> TableTarget {
        TableTarget::new("users", users_columns()).unwrap()
    }

    #[test]
    fn test_select_binds_every_value() {
        let filter = ConditionList::or(vec![
            Condition::parse("name", "like", "O'Brien%").unwrap().into(),
            ConditionList::and(vec![
                Condition::parse("id", ">=", Value::from("2")).unwrap().into(),
                Condition::new("age", Operator::In, vec![Value::Integer(30), Value::Integer(40)])
                    .unwrap()
                    .into(),
            ])
            .unwrap()
            .into(),
        ])
        .unwrap();
        let spec = QuerySpec::builder()
            .filter(filter)
            .order_by(OrderItem::desc("id"))
            .limit(10)
            .offset(20)
            .build()
            .unwrap();

        let stmt = select(&Numbered, &target(), &spec).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT \"id\", \"name\", \"age\" FROM \"users\" WHERE (\"name\" LIKE $1 OR \
             (\"id\" >= $2 AND \"age\" IN ($3, $4))) ORDER BY \"id\" DESC LIMIT $5 OFFSET $6"
        );
        assert_eq!(
            stmt.params,
            vec![
                Value::from("O'Brien%"),
                Value::Integer(2),
                Value::Integer(30),
                Value::Integer(40),
                Value::Integer(10),
                Value::Integer(20),
            ]
        );
        assert!(!stmt.sql.contains("O'Brien"));
    }

    #[test]
    fn test_null_comparisons_use_keywords() {
        let filter = ConditionList::and(vec![
            Condition::eq("age", Value::Null).unwrap().into(),
            Condition::new("name", Operator::Ne, Value::Null).unwrap().into(),
        ])
        .unwrap();
        let spec = QuerySpec::builder().filter(filter).build().unwrap();
        let stmt = select(&Numbered, &target(), &spec).unwrap();
        assert!(stmt.sql.contains("\"age\" IS NULL AND \"name\" IS NOT NULL"));
        assert_eq!(stmt.params.len(), 2);
    }

    #[test]
    fn test_unknown_fields_fail_translation() {
        let filter = ConditionList::and(vec![Condition::eq("email", "x").unwrap().into()]).unwrap();
        let spec = QuerySpec::builder().filter(filter).build().unwrap();
        assert!(matches!(
            select(&Numbered, &target(), &spec),
            Err(DataError::QuerySyntax(_))
        ));

        let spec = QuerySpec::builder()
            .order_by(OrderItem::asc("nope"))
            .build()
            .unwrap();
        assert!(select(&Numbered, &target(), &spec).is_err());
    }

    #[test]
    fn test_hostile_identifiers_are_quoted() {
        let mut columns = users_columns();
        columns[1].name = "na\"me".into();
        let target = TableTarget::new("users", columns).unwrap();
        let spec = UpdateSpec::new(1, [("na\"me", "x")]).unwrap();
        let stmt = update(&Numbered, &target, &spec).unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE \"users\" SET \"na\"\"me\" = $1 WHERE \"id\" = $2"
        );
    }

    #[test]
    fn test_insert_update_delete_statements() {
        let stmt = insert(
            &Numbered,
            &target(),
            &InsertSpec::new([("id", Value::Integer(1)), ("name", Value::from("Alice"))]),
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"users\" (\"id\", \"name\") VALUES ($1, $2)"
        );

        let stmt = update(
            &Numbered,
            &target(),
            &UpdateSpec::new(Value::from("1"), [("age", Value::Null)]).unwrap(),
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE \"users\" SET \"age\" = NULL WHERE \"id\" = $1"
        );
        assert_eq!(stmt.params, vec![Value::Integer(1)]);

        let stmt = delete(&Numbered, &target(), &DeleteSpec::new(1).unwrap()).unwrap();
        assert_eq!(stmt.sql, "DELETE FROM \"users\" WHERE \"id\" = $1");
    }
}
