/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Structured record queries for the application layer.
//!
//! Screens filter and page through records without writing SQL: a [`Filter`]
//! tree compiles to a parameterized WHERE clause, and `SyncDb::query_records`
//! runs it against the right table. Column names are validated against a
//! plain-identifier rule before they reach SQL, so a filter can never smuggle
//! syntax in.
//!
//! Pair with `SyncDb::add_observer` to re-run a query when its table
//! changes; that's the "live query" the UI sees.

use crate::error::{Error, Result};
use rusqlite::types::{ToSql, ToSqlOutput};
use types::Timestamp;

/// A value a filter can compare against.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Text(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Time(Timestamp),
}

impl ToSql for QueryValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            QueryValue::Text(s) => ToSqlOutput::from(s.as_str()),
            QueryValue::Integer(i) => ToSqlOutput::from(*i),
            QueryValue::Real(f) => ToSqlOutput::from(*f),
            QueryValue::Boolean(b) => ToSqlOutput::from(*b),
            QueryValue::Time(ts) => ToSqlOutput::from(ts.as_millis_i64()),
        })
    }
}

impl From<&str> for QueryValue {
    fn from(s: &str) -> Self {
        QueryValue::Text(s.to_string())
    }
}

impl From<i64> for QueryValue {
    fn from(i: i64) -> Self {
        QueryValue::Integer(i)
    }
}

impl From<f64> for QueryValue {
    fn from(f: f64) -> Self {
        QueryValue::Real(f)
    }
}

impl From<bool> for QueryValue {
    fn from(b: bool) -> Self {
        QueryValue::Boolean(b)
    }
}

impl From<Timestamp> for QueryValue {
    fn from(ts: Timestamp) -> Self {
        QueryValue::Time(ts)
    }
}

/// A predicate over one table's columns.
#[derive(Debug, Clone)]
pub enum Filter {
    Eq(&'static str, QueryValue),
    Ne(&'static str, QueryValue),
    Gt(&'static str, QueryValue),
    Ge(&'static str, QueryValue),
    Lt(&'static str, QueryValue),
    Le(&'static str, QueryValue),
    In(&'static str, Vec<QueryValue>),
    Like(&'static str, String),
    IsNull(&'static str),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Ordering, paging - everything about a query that isn't the predicate.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub order_by: Option<(&'static str, SortDirection)>,
    pub limit: Option<u32>,
    pub skip: Option<u32>,
}

fn check_column(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::MalformedRecord(format!(
            "invalid column name in query: {:?}",
            name
        )))
    }
}

impl Filter {
    /// Render this predicate to SQL, pushing bound values onto `params`.
    pub(crate) fn to_sql(&self, params: &mut Vec<QueryValue>) -> Result<String> {
        let comparison = |column: &'static str,
                          op: &str,
                          value: &QueryValue,
                          params: &mut Vec<QueryValue>|
         -> Result<String> {
            check_column(column)?;
            params.push(value.clone());
            Ok(format!("{} {} ?", column, op))
        };
        match self {
            Filter::Eq(column, value) => comparison(column, "=", value, params),
            Filter::Ne(column, value) => comparison(column, "<>", value, params),
            Filter::Gt(column, value) => comparison(column, ">", value, params),
            Filter::Ge(column, value) => comparison(column, ">=", value, params),
            Filter::Lt(column, value) => comparison(column, "<", value, params),
            Filter::Le(column, value) => comparison(column, "<=", value, params),
            Filter::Like(column, pattern) => {
                check_column(column)?;
                params.push(QueryValue::Text(pattern.clone()));
                Ok(format!("{} LIKE ?", column))
            }
            Filter::IsNull(column) => {
                check_column(column)?;
                Ok(format!("{} IS NULL", column))
            }
            Filter::In(column, values) => {
                check_column(column)?;
                if values.is_empty() {
                    // Empty membership matches nothing, by definition.
                    return Ok("0 = 1".to_string());
                }
                let placeholders = vec!["?"; values.len()].join(", ");
                params.extend(values.iter().cloned());
                Ok(format!("{} IN ({})", column, placeholders))
            }
            Filter::And(filters) => combine(filters, " AND ", params),
            Filter::Or(filters) => combine(filters, " OR ", params),
        }
    }
}

fn combine(filters: &[Filter], joiner: &str, params: &mut Vec<QueryValue>) -> Result<String> {
    if filters.is_empty() {
        return Ok("1 = 1".to_string());
    }
    let rendered = filters
        .iter()
        .map(|f| f.to_sql(params))
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("({})", rendered.join(joiner)))
}

/// Full SELECT for `table`; returns the SQL plus its bound parameters in
/// order.
pub(crate) fn build_select(
    table: &str,
    filter: Option<&Filter>,
    options: &QueryOptions,
) -> Result<(String, Vec<QueryValue>)> {
    let mut params = Vec::new();
    let mut sql = format!("SELECT * FROM {}", table);
    if let Some(filter) = filter {
        sql.push_str(" WHERE ");
        sql.push_str(&filter.to_sql(&mut params)?);
    }
    if let Some((column, direction)) = options.order_by {
        check_column(column)?;
        sql.push_str(" ORDER BY ");
        sql.push_str(column);
        sql.push_str(match direction {
            SortDirection::Ascending => " ASC",
            SortDirection::Descending => " DESC",
        });
    }
    if let Some(limit) = options.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    } else if options.skip.is_some() {
        // sqlite requires a LIMIT for OFFSET to parse.
        sql.push_str(" LIMIT -1");
    }
    if let Some(skip) = options.skip {
        sql.push_str(&format!(" OFFSET {}", skip));
    }
    Ok((sql, params))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_comparisons() {
        let mut params = Vec::new();
        let sql = Filter::Eq("status", "open".into()).to_sql(&mut params).unwrap();
        assert_eq!(sql, "status = ?");
        assert_eq!(params, vec![QueryValue::Text("open".into())]);

        let mut params = Vec::new();
        let sql = Filter::Ge("time_spent_minutes", 30i64.into())
            .to_sql(&mut params)
            .unwrap();
        assert_eq!(sql, "time_spent_minutes >= ?");
    }

    #[test]
    fn test_nested_and_or() {
        let filter = Filter::And(vec![
            Filter::Eq("site_id", "site-9".into()),
            Filter::Or(vec![
                Filter::Eq("priority", "emergency".into()),
                Filter::Eq("priority", "high".into()),
            ]),
        ]);
        let mut params = Vec::new();
        let sql = filter.to_sql(&mut params).unwrap();
        assert_eq!(sql, "(site_id = ? AND (priority = ? OR priority = ?))");
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_membership_and_like() {
        let filter = Filter::And(vec![
            Filter::In(
                "status",
                vec!["open".into(), "in_progress".into()],
            ),
            Filter::Like("title", "%hose%".to_string()),
        ]);
        let mut params = Vec::new();
        let sql = filter.to_sql(&mut params).unwrap();
        assert_eq!(sql, "(status IN (?, ?) AND title LIKE ?)");
        assert_eq!(params.len(), 3);

        let mut params = Vec::new();
        assert_eq!(
            Filter::In("status", vec![]).to_sql(&mut params).unwrap(),
            "0 = 1"
        );
    }

    #[test]
    fn test_build_select_with_paging() {
        let (sql, params) = build_select(
            "work_orders",
            Some(&Filter::Eq("sync_status", 1i64.into())),
            &QueryOptions {
                order_by: Some(("local_updated_at", SortDirection::Descending)),
                limit: Some(20),
                skip: Some(40),
            },
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM work_orders WHERE sync_status = ? \
             ORDER BY local_updated_at DESC LIMIT 20 OFFSET 40"
        );
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_bad_column_is_rejected() {
        let mut params = Vec::new();
        assert!(Filter::Eq("status; DROP TABLE assets", "x".into())
            .to_sql(&mut params)
            .is_err());
        assert!(Filter::IsNull("").to_sql(&mut params).is_err());
    }
}
