//! The translation driver.
//!
//! [`Statement`] parses a raw SQL string and walks the resulting AST,
//! dispatching each clause to its translator. The translators fill the
//! stage buckets of a [`Builder`]; once the walk completes, `finish`
//! decides the operation family and assembles either the flat plan fields
//! or the canonical aggregation pipeline.

use std::collections::HashMap;

use bson::{Bson, Document};
use sqlparser::ast::{Query, Select, SetExpr, Statement as SqlStatement};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use crate::plan::{Operation, QueryPlan};
use crate::{Error, Result};

/// A SQL statement awaiting translation.
pub struct Statement {
    raw: String,
}

impl Statement {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// Parse the statement and populate `plan`.
    ///
    /// Parse errors abort before translation begins and pass through
    /// verbatim. Translation errors are best-effort: the walk continues,
    /// the partial plan stays in `plan`, and the first recorded error is
    /// returned.
    pub fn build(&self, plan: &mut QueryPlan) -> Result<()> {
        let statements = Parser::parse_sql(&MySqlDialect {}, &self.raw)?;
        let statement = statements
            .into_iter()
            .next()
            .ok_or_else(|| Error::Unsupported("empty input".to_string()))?;

        let query = match statement {
            SqlStatement::Query(query) => query,
            _ => {
                return Err(Error::Unsupported(
                    "only SELECT statements are supported".to_string(),
                ))
            }
        };

        let mut builder = Builder::new(plan);
        builder.translate_query(&query);
        builder.finish()
    }
}

/// A GROUP BY key: a plain column or a lowered expression.
pub(crate) enum GroupKey {
    Column(String),
    Expr(Bson),
}

/// Accumulates pipeline fragments during one walk.
///
/// Clause translators append to the buckets; nothing is written to the
/// plan's flat fields or pipeline until `finish` runs, which keeps the
/// emitted stage order canonical regardless of walk order.
pub(crate) struct Builder<'a> {
    pub(crate) plan: &'a mut QueryPlan,
    pub(crate) errors: Vec<Error>,

    pub(crate) base_alias: Option<String>,
    pub(crate) join_as: HashMap<String, String>,
    pub(crate) multi_from: bool,
    pub(crate) has_join: bool,
    pub(crate) has_having: bool,

    pub(crate) lookups: Vec<Document>,
    pub(crate) filter: Document,
    pub(crate) group_keys: Vec<GroupKey>,
    pub(crate) group_key_aliases: Vec<String>,
    pub(crate) agg_fields: Vec<(String, Bson)>,
    pub(crate) agg_aliases: HashMap<String, String>,
    pub(crate) set_aliases: Vec<String>,
    pub(crate) having: Document,
    pub(crate) project: Document,
    pub(crate) projection_cleared: bool,
    pub(crate) sort: Document,
    pub(crate) limit: Option<i64>,
    pub(crate) offset: Option<i64>,
}

impl<'a> Builder<'a> {
    pub(crate) fn new(plan: &'a mut QueryPlan) -> Self {
        // Absorb anything a previous pass (e.g. the request adapter) left
        // in the flat fields so it participates in stage assembly.
        let filter = std::mem::take(&mut plan.filter);
        let project = plan.projection.take().unwrap_or_default();
        let sort = std::mem::take(&mut plan.sort);
        let lookups = std::mem::take(&mut plan.pipeline);
        let limit = plan.limit.take();
        let offset = plan.offset.take();

        Self {
            plan,
            errors: Vec::new(),
            base_alias: None,
            join_as: HashMap::new(),
            multi_from: false,
            has_join: false,
            has_having: false,
            lookups,
            filter,
            group_keys: Vec::new(),
            group_key_aliases: Vec::new(),
            agg_fields: Vec::new(),
            agg_aliases: HashMap::new(),
            set_aliases: Vec::new(),
            having: Document::new(),
            project,
            projection_cleared: false,
            sort,
            limit,
            offset,
        }
    }

    pub(crate) fn translate_query(&mut self, query: &Query) {
        let select: &Select = match &*query.body {
            SetExpr::Select(select) => select,
            other => {
                debug!(kind = %other, "unhandled query body");
                self.errors.push(Error::Unsupported(
                    "only plain SELECT bodies are supported".to_string(),
                ));
                return;
            }
        };

        self.translate_from(&select.from);
        self.translate_group_by(&select.group_by);
        self.translate_select(select);
        if let Some(selection) = &select.selection {
            self.translate_where(selection);
        }
        if let Some(having) = &select.having {
            self.has_having = true;
            self.translate_having(having);
        }
        self.translate_order_by(&query.order_by);
        self.translate_limit(query.limit.as_ref(), query.offset.as_ref());
    }

    /// Record a translation error and keep walking.
    pub(crate) fn record(&mut self, error: Error) {
        debug!(error = %error, "translation error, continuing best-effort");
        self.errors.push(error);
    }

    /// Decide the operation family and assemble the plan.
    pub(crate) fn finish(mut self) -> Result<()> {
        let forcing = self.has_join
            || self.multi_from
            || self.has_having
            || !self.group_keys.is_empty()
            || !self.sort.is_empty();

        if forcing && self.plan.operation != Some(Operation::Count) {
            self.plan.promote(Operation::Aggregate);
        }
        if self.plan.operation.is_none() {
            self.plan.operation = Some(Operation::Find);
        }
        if self.plan.operation == Some(Operation::Find) && self.limit == Some(1) {
            self.plan.operation = Some(Operation::FindOne);
        }

        if self.plan.operation == Some(Operation::Aggregate) {
            self.assemble_pipeline();
        } else {
            self.assemble_flat();
        }

        if self.plan.operation == Some(Operation::FindOne) {
            self.plan.limit = Some(1);
        }

        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors.remove(0))
        }
    }

    fn assemble_flat(&mut self) {
        self.plan.filter = std::mem::take(&mut self.filter);
        self.plan.projection = if self.projection_cleared || self.project.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.project))
        };
        self.plan.sort = std::mem::take(&mut self.sort);
        self.plan.limit = self.limit;
        self.plan.offset = self.offset;
    }

    /// Canonical stage order: lookups and unwinds in join order, the WHERE
    /// match, the group, the HAVING match, the projection, then sort,
    /// limit and skip.
    fn assemble_pipeline(&mut self) {
        let mut pipeline = std::mem::take(&mut self.lookups);

        if !self.filter.is_empty() {
            let mut stage = Document::new();
            stage.insert("$match", std::mem::take(&mut self.filter));
            pipeline.push(stage);
        }

        let grouped = if let Some(group) = self.build_group() {
            let mut stage = Document::new();
            stage.insert("$group", group);
            pipeline.push(stage);
            true
        } else {
            false
        };

        if !self.having.is_empty() {
            let mut stage = Document::new();
            stage.insert("$match", std::mem::take(&mut self.having));
            pipeline.push(stage);
        }

        if let Some(project) = self.build_project(grouped) {
            let mut stage = Document::new();
            stage.insert("$project", project);
            pipeline.push(stage);
        }

        if !self.sort.is_empty() {
            let mut stage = Document::new();
            stage.insert("$sort", std::mem::take(&mut self.sort));
            pipeline.push(stage);
        }
        if let Some(limit) = self.limit {
            let mut stage = Document::new();
            stage.insert("$limit", Bson::Int64(limit));
            pipeline.push(stage);
        }
        if let Some(offset) = self.offset {
            let mut stage = Document::new();
            stage.insert("$skip", Bson::Int64(offset));
            pipeline.push(stage);
        }

        self.plan.pipeline = pipeline;
        self.plan.projection = None;
        self.plan.limit = None;
        self.plan.offset = None;
    }
}
