//! JOIN lowering: every join becomes a `$lookup` followed by an `$unwind`.
//!
//! INNER joins unwind with the bare path; LEFT joins preserve rows with no
//! match. A correlated scalar subquery in the ON clause becomes a single
//! `$lookup` in the `let`/`pipeline` form evaluated against the outer row.

use bson::{Bson, Document};
use sqlparser::ast::{
    BinaryOperator, Expr, Join, JoinConstraint, JoinOperator, Query, Select, SelectItem, SetExpr,
    TableFactor,
};
use tracing::debug;

use crate::expr::column_name;
use crate::plan::Operation;
use crate::statement::Builder;
use crate::translate::object_name;

impl Builder<'_> {
    pub(crate) fn translate_join(&mut self, join: &Join) {
        self.plan.promote(Operation::Aggregate);
        self.has_join = true;

        let TableFactor::Table { name, alias, .. } = &join.relation else {
            debug!("unhandled JOIN relation kind");
            return;
        };
        let right = object_name(name);
        if let Some(alias) = alias {
            self.join_as.insert(alias.name.value.clone(), right.clone());
        }
        self.join_as.insert(right.clone(), right.clone());

        let (constraint, preserve) = match &join.join_operator {
            JoinOperator::Inner(c) => (c, false),
            JoinOperator::LeftOuter(c) => (c, true),
            JoinOperator::RightOuter(c) | JoinOperator::FullOuter(c) => (c, true),
            other => {
                debug!(kind = ?other, "unhandled JOIN operator");
                return;
            }
        };
        let JoinConstraint::On(on) = constraint else {
            debug!("unhandled JOIN constraint");
            return;
        };

        let Expr::BinaryOp { left, op, right: rhs } = on else {
            debug!("unhandled ON expression");
            return;
        };
        if *op != BinaryOperator::Eq {
            debug!(operator = %op, "unhandled ON operator");
            return;
        }

        if let Expr::Subquery(subquery) = rhs.as_ref() {
            self.join_on_subquery(&right, subquery, preserve);
            return;
        }

        let (Some(mut local), Some(mut foreign)) = (column_name(left), column_name(rhs)) else {
            debug!("unhandled ON operands");
            return;
        };

        // Orient the sides: the one qualified by the joined table is the
        // foreign field.
        if let Expr::CompoundIdentifier(idents) = left.as_ref() {
            if idents
                .first()
                .map_or(false, |q| self.join_as.contains_key(&q.value))
            {
                std::mem::swap(&mut local, &mut foreign);
            }
        }

        let mut lookup = Document::new();
        lookup.insert("from", right.clone());
        lookup.insert("localField", local);
        lookup.insert("foreignField", foreign);
        lookup.insert("as", right.clone());

        self.push_lookup(lookup, &right, preserve);
    }

    /// `ON l.id = (SELECT col FROM t WHERE t.x = l.y ORDER BY … LIMIT 1)`
    /// becomes one `$lookup` whose inner pipeline replays the subquery
    /// against the outer row.
    fn join_on_subquery(&mut self, right: &str, subquery: &Query, preserve: bool) {
        let SetExpr::Select(inner) = &*subquery.body else {
            debug!("unhandled subquery body in ON clause");
            return;
        };

        let Some(from) = inner
            .from
            .first()
            .and_then(|t| match &t.relation {
                TableFactor::Table { name, .. } => Some(object_name(name)),
                _ => None,
            })
        else {
            debug!("subquery in ON clause has no table");
            return;
        };

        let select_field = inner.projection.first().and_then(|item| match item {
            SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => {
                column_name(e)
            }
            _ => None,
        });

        let Some((inner_field, outer_field)) = correlation(inner) else {
            debug!("subquery in ON clause has no correlation");
            return;
        };

        let mut pipeline: Vec<Bson> = Vec::new();

        let mut eq = Document::new();
        eq.insert(
            "$eq",
            Bson::Array(vec![
                Bson::String(format!("${inner_field}")),
                Bson::String(format!("$${inner_field}")),
            ]),
        );
        let mut expr_doc = Document::new();
        expr_doc.insert("$expr", eq);
        let mut match_stage = Document::new();
        match_stage.insert("$match", expr_doc);
        pipeline.push(Bson::Document(match_stage));

        if let Some(order) = subquery.order_by.first() {
            if let Some(col) = column_name(&order.expr) {
                let direction = if order.asc == Some(false) { -1 } else { 1 };
                let mut sort = Document::new();
                sort.insert(col, Bson::Int32(direction));
                let mut sort_stage = Document::new();
                sort_stage.insert("$sort", sort);
                pipeline.push(Bson::Document(sort_stage));
            }
        }

        let limit = match &subquery.limit {
            Some(Expr::Value(v)) => match crate::value::literal(v) {
                Bson::Int32(n) => i64::from(n),
                Bson::Int64(n) => n,
                _ => 1,
            },
            _ => 1,
        };
        let mut limit_stage = Document::new();
        limit_stage.insert("$limit", Bson::Int64(limit));
        pipeline.push(Bson::Document(limit_stage));

        if let Some(field) = select_field {
            let mut project = Document::new();
            project.insert(field, Bson::Int32(1));
            let mut project_stage = Document::new();
            project_stage.insert("$project", project);
            pipeline.push(Bson::Document(project_stage));
        }

        let mut bindings = Document::new();
        bindings.insert(inner_field.clone(), format!("${outer_field}"));

        let mut lookup = Document::new();
        lookup.insert("from", from);
        lookup.insert("let", bindings);
        lookup.insert("pipeline", Bson::Array(pipeline));
        lookup.insert("as", right.to_string());

        self.push_lookup(lookup, right, preserve);
    }

    pub(crate) fn push_lookup(&mut self, lookup: Document, as_name: &str, preserve: bool) {
        let mut stage = Document::new();
        stage.insert("$lookup", lookup);
        self.lookups.push(stage);

        let mut unwind = Document::new();
        if preserve {
            let mut spec = Document::new();
            spec.insert("path", format!("${as_name}"));
            spec.insert("preserveNullAndEmptyArrays", true);
            unwind.insert("$unwind", spec);
        } else {
            unwind.insert("$unwind", format!("${as_name}"));
        }
        self.lookups.push(unwind);
    }
}

/// Find the correlation predicate of a subquery: an equality between two
/// qualified columns, one naming the subquery's own table. Returns
/// `(inner_field, outer_field)`.
pub(crate) fn correlation(inner: &Select) -> Option<(String, String)> {
    let selection = inner.selection.as_ref()?;
    correlation_in(selection, inner)
}

fn correlation_in(expr: &Expr, inner: &Select) -> Option<(String, String)> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            let (Expr::CompoundIdentifier(l), Expr::CompoundIdentifier(r)) =
                (left.as_ref(), right.as_ref())
            else {
                return None;
            };
            let inner_names = inner_qualifiers(inner);
            let lq = l.first()?.value.clone();
            let (inner_side, outer_side) = if inner_names.contains(&lq) { (l, r) } else { (r, l) };
            Some((
                inner_side.last()?.value.clone(),
                outer_side.last()?.value.clone(),
            ))
        }
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => correlation_in(left, inner).or_else(|| correlation_in(right, inner)),
        Expr::Nested(e) => correlation_in(e, inner),
        _ => None,
    }
}

/// Names by which the subquery's own table can be qualified.
fn inner_qualifiers(inner: &Select) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(first) = inner.from.first() {
        if let TableFactor::Table { name, alias, .. } = &first.relation {
            names.push(object_name(name));
            if let Some(alias) = alias {
                names.push(alias.name.value.clone());
            }
        }
    }
    names
}
