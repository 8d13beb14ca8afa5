use crate::engine::{Object, Snapshot};
use crate::error::KelpError;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

type Predicate = dyn Fn(&Value) -> bool + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// A re-runnable read over one table.
///
/// Queries carry everything needed to evaluate them again on another
/// thread against another snapshot, so they are cheap to clone and `Send`.
#[derive(Clone)]
pub struct Query {
    table: String,
    predicate: Option<Arc<Predicate>>,
    sort: Option<(String, Order)>,
    limit: Option<usize>,
}

impl Query {
    pub fn all(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            predicate: None,
            sort: None,
            limit: None,
        }
    }

    /// Find-first: at most one matching object.
    pub fn first(table: impl Into<String>) -> Self {
        Self::all(table).limit(1)
    }

    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Sorts by a top-level field; objects missing it sort first.
    pub fn sorted_by(mut self, field: impl Into<String>, order: Order) -> Self {
        self.sort = Some((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn evaluate(&self, snapshot: &Snapshot) -> Result<Vec<Object>, KelpError> {
        let table = snapshot.table(&self.table)?;
        let mut out: Vec<Object> = table
            .iter()
            .filter(|(_, value)| self.predicate.as_ref().is_none_or(|p| p(value)))
            .map(|(id, value)| Object {
                table: self.table.clone(),
                id,
                value: value.clone(),
            })
            .collect();
        if let Some((field, order)) = &self.sort {
            out.sort_by(|a, b| {
                let ord = compare_values(a.value.get(field), b.value.get(field));
                match order {
                    Order::Asc => ord,
                    Order::Desc => ord.reverse(),
                }
            });
        }
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        Ok(out)
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("table", &self.table)
            .field("filtered", &self.predicate.is_some())
            .field("sort", &self.sort)
            .field("limit", &self.limit)
            .finish()
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::{Order, Query};
    use crate::engine::{Snapshot, WriteTxn};
    use crate::error::KelpError;
    use crate::version::VersionId;
    use serde_json::json;

    fn dogs() -> Snapshot {
        let mut txn = WriteTxn::new(&Snapshot::empty(VersionId::new(0, 0)));
        txn.create_table("dogs");
        for (name, age) in [("rex", 3), ("fido", 9), ("max", 1), ("bo", 9)] {
            txn.insert("dogs", json!({"name": name, "age": age}))
                .expect("insert");
        }
        txn.into_snapshot(VersionId::new(0, 1))
    }

    #[test]
    fn filter_sort_and_limit() {
        let snap = dogs();
        let rows = Query::all("dogs")
            .filter(|v| v["age"].as_i64().unwrap_or(0) > 2)
            .sorted_by("name", Order::Asc)
            .evaluate(&snap)
            .expect("query");
        let names: Vec<_> = rows.iter().map(|o| o.value["name"].clone()).collect();
        assert_eq!(names, vec![json!("bo"), json!("fido"), json!("rex")]);

        let oldest = Query::first("dogs")
            .sorted_by("age", Order::Desc)
            .evaluate(&snap)
            .expect("first");
        assert_eq!(oldest.len(), 1);
        assert_eq!(oldest[0].value["age"], json!(9));
    }

    #[test]
    fn unknown_table_is_an_error() {
        let err = Query::all("cats").evaluate(&dogs()).expect_err("missing");
        assert!(matches!(err, KelpError::TableNotFound(t) if t == "cats"));
    }
}
