//! The query plan produced by translation.
//!
//! A [`QueryPlan`] is created empty, mutated by the clause translators
//! during a single build, then handed to the caller. Flat fields drive the
//! `find`-family operations; `pipeline` drives `aggregate`. The two are
//! mutually exclusive: an aggregate plan folds its flat fields into
//! pipeline stages.

use bson::Document;
use serde::Serialize;

/// The MongoDB operation family a plan executes as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Find,
    FindOne,
    Count,
    Distinct,
    Aggregate,
}

impl Operation {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "find" => Some(Operation::Find),
            "findone" => Some(Operation::FindOne),
            "count" => Some(Operation::Count),
            "distinct" => Some(Operation::Distinct),
            "aggregate" => Some(Operation::Aggregate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Find => "find",
            Operation::FindOne => "findone",
            Operation::Count => "count",
            Operation::Distinct => "distinct",
            Operation::Aggregate => "aggregate",
        }
    }

    /// Position in the promotion lattice. `Find` is the floor; the
    /// specialised operations sit between it and `Aggregate`.
    fn rank(self) -> u8 {
        match self {
            Operation::Find => 1,
            Operation::FindOne | Operation::Count | Operation::Distinct => 2,
            Operation::Aggregate => 3,
        }
    }
}

/// A MongoDB query configuration built from a SQL statement or from
/// request parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    /// The operation family, once one has been chosen.
    pub operation: Option<Operation>,

    /// Target collection name, case preserved from the SQL.
    pub collection: String,

    /// Document-level match criteria, in SQL clause order.
    pub filter: Document,

    /// Field projection; `None` means all fields.
    pub projection: Option<Document>,

    /// Sort specification for flat queries.
    pub sort: Document,

    /// Maximum number of documents to return.
    pub limit: Option<i64>,

    /// Number of documents to skip.
    pub offset: Option<i64>,

    /// Aggregation pipeline stages, in canonical order.
    pub pipeline: Vec<Document>,

    /// Diagnostic comment attached to the query.
    pub comment: String,
}

impl QueryPlan {
    pub fn new() -> Self {
        Self {
            operation: None,
            collection: String::new(),
            filter: Document::new(),
            projection: None,
            sort: Document::new(),
            limit: None,
            offset: None,
            pipeline: Vec::new(),
            comment: "data request".to_string(),
        }
    }

    /// Monotone operation promotion. `Aggregate` is terminal and absorbs
    /// every later promotion; `Find` never displaces a more specific
    /// operation.
    pub fn promote(&mut self, op: Operation) {
        match self.operation {
            Some(Operation::Aggregate) => {}
            Some(current) if op.rank() < current.rank() => {}
            _ => self.operation = Some(op),
        }
    }

    /// True while the plan is missing an operation or a collection and is
    /// therefore not executable.
    pub fn is_incomplete(&self) -> bool {
        self.operation.is_none() || self.collection.is_empty()
    }
}

impl Default for QueryPlan {
    fn default() -> Self {
        Self::new()
    }
}
