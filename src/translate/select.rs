//! SELECT projection lowering.
//!
//! Plain columns accumulate in the projection bucket. Aggregate functions
//! contribute `$group` fields, scalar functions and computed expressions
//! contribute `$project` fields, and both force the aggregate operation.
//! A star cancels the projection and stops item processing.

use bson::{Bson, Document};
use sqlparser::ast::{Distinct, Expr, Function, Query, Select, SelectItem, SetExpr, TableFactor};
use tracing::debug;

use crate::expr::{column_name, function_args, has_star_arg, wrap};
use crate::plan::Operation;
use crate::statement::{Builder, GroupKey};
use crate::translate::{join::correlation, object_name};
use crate::Error;

impl Builder<'_> {
    pub(crate) fn translate_select(&mut self, select: &Select) {
        if matches!(select.distinct, Some(Distinct::Distinct)) {
            self.plan.promote(Operation::Distinct);
        }

        if let Some(func) = bare_count(select) {
            if !func_has_column(func) || has_star_arg(func) {
                if self.group_keys.is_empty() {
                    self.plan.promote(Operation::Count);
                    return;
                }
            }
        }

        for item in &select.projection {
            match item {
                SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => {
                    self.projection_cleared = true;
                    self.project.clear();
                    return;
                }
                SelectItem::UnnamedExpr(expr) => self.select_item(expr, None),
                SelectItem::ExprWithAlias { expr, alias } => {
                    self.select_item(expr, Some(alias.value.clone()))
                }
            }
        }
    }

    fn select_item(&mut self, expr: &Expr, alias: Option<String>) {
        match expr {
            Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
                self.select_column(expr, alias);
            }
            Expr::Value(v) => {
                let Some(alias) = alias else {
                    debug!("literal select item without alias");
                    return;
                };
                self.project.insert(alias, crate::value::literal(v));
            }
            Expr::Function(func) => self.select_function(func, alias),
            Expr::Case { .. } | Expr::Substring { .. } => {
                self.select_computed(expr, alias);
            }
            Expr::BinaryOp { .. } => {
                self.select_computed(expr, alias);
            }
            Expr::Nested(inner) => self.select_item(inner, alias),
            Expr::Subquery(query) => self.select_subquery(query, alias),
            other => debug!(kind = %other, "unhandled SELECT expression"),
        }
    }

    /// A plain column. The key is the alias when one renames the column;
    /// join-qualified columns project the joined document's path.
    fn select_column(&mut self, expr: &Expr, alias: Option<String>) {
        let Some(column) = column_name(expr) else {
            return;
        };

        let reference = match expr {
            Expr::CompoundIdentifier(idents) => {
                let path = self.field_path(idents);
                if path == column {
                    None
                } else {
                    Some(format!("${path}"))
                }
            }
            _ => None,
        };

        match (alias, reference) {
            (Some(alias), Some(path)) => {
                self.project.insert(alias, path);
            }
            (Some(alias), None) if alias != column => {
                self.project.insert(alias, format!("${column}"));
            }
            (_, Some(path)) => {
                self.project.insert(column, path);
            }
            (_, None) => {
                self.project.insert(column, Bson::Int32(1));
            }
        }
    }

    /// CASE, boolean combinators and comparisons in the projection force
    /// the aggregate operation and land in the `$project` payload.
    fn select_computed(&mut self, expr: &Expr, alias: Option<String>) {
        self.plan.promote(Operation::Aggregate);
        let lowered = match self.lower_expr(expr) {
            Ok(b) => b,
            Err(e) => {
                self.record(e);
                return;
            }
        };
        let Some(alias) = alias else {
            debug!("computed select item without alias");
            return;
        };
        self.project.insert(alias, lowered);
    }

    fn select_function(&mut self, func: &Function, alias: Option<String>) {
        let name = func.name.to_string().to_lowercase();

        self.plan.promote(Operation::Aggregate);

        match name.as_str() {
            "count" => self.select_count(func, alias),
            "sum" | "avg" | "min" | "max" => self.select_aggregate(func, &name, alias),
            _ => self.select_scalar_function(func, alias),
        }
    }

    fn select_count(&mut self, func: &Function, alias: Option<String>) {
        let column = function_args(func).first().and_then(|e| column_name(e));
        let alias = self.aggregate_alias(alias, "count", column.as_deref());

        if func.distinct {
            let Some(arg) = function_args(func).into_iter().next() else {
                self.record(Error::UnknownFunction(func.name.to_string()));
                return;
            };
            match self.lower_expr(arg) {
                Ok(lowered) => {
                    self.set_aliases.push(alias.clone());
                    self.agg_fields.push((alias, wrap("$addToSet", lowered)));
                }
                Err(e) => self.record(e),
            }
            return;
        }

        if has_star_arg(func) {
            self.agg_fields
                .push((alias, wrap("$sum", Bson::Int32(1))));
            return;
        }

        // COUNT(col) counts documents where the column is non-null.
        let Some(arg) = function_args(func).into_iter().next() else {
            self.agg_fields
                .push((alias, wrap("$sum", Bson::Int32(1))));
            return;
        };
        match self.lower_expr(arg) {
            Ok(lowered) => {
                let mut ne = Document::new();
                ne.insert("$ne", Bson::Array(vec![lowered, Bson::Null]));
                let cond = Bson::Array(vec![
                    Bson::Document(ne),
                    Bson::Int32(1),
                    Bson::Int32(0),
                ]);
                self.agg_fields
                    .push((alias, wrap("$sum", wrap("$cond", cond))));
            }
            Err(e) => self.record(e),
        }
    }

    fn select_aggregate(&mut self, func: &Function, name: &str, alias: Option<String>) {
        let column = function_args(func).first().and_then(|e| column_name(e));
        let alias = self.aggregate_alias(alias, name, column.as_deref());

        let Some(arg) = function_args(func).into_iter().next() else {
            self.record(Error::UnknownFunction(func.name.to_string()));
            return;
        };
        match self.lower_expr(arg) {
            Ok(lowered) => {
                self.agg_fields.push((alias, wrap(&format!("${name}"), lowered)));
            }
            Err(e) => self.record(e),
        }
    }

    /// Scalar functions project a computed value. When the lowered form
    /// equals a GROUP BY expression key, the item instead projects the
    /// group `_id`.
    fn select_scalar_function(&mut self, func: &Function, alias: Option<String>) {
        let lowered = match self.lower_function(func) {
            Ok(b) => b,
            Err(e) => {
                self.record(e);
                return;
            }
        };

        let name = func.name.to_string().to_lowercase();
        let column = function_args(func).first().and_then(|e| column_name(e));
        let alias = alias.unwrap_or_else(|| match &column {
            Some(c) => format!("{name}_{c}"),
            None => name,
        });

        let matches_group_key = self.group_keys.iter().any(|key| match key {
            GroupKey::Expr(b) => *b == lowered,
            GroupKey::Column(_) => false,
        });
        if matches_group_key {
            self.group_key_aliases.push(alias);
        } else {
            self.project.insert(alias, lowered);
        }
    }

    /// A scalar subquery becomes a `$lookup` plus `$addFields`; the added
    /// field is carried through the later `$project`.
    fn select_subquery(&mut self, query: &Query, alias: Option<String>) {
        self.plan.promote(Operation::Aggregate);

        let Some(alias) = alias else {
            debug!("scalar subquery without alias");
            return;
        };
        let SetExpr::Select(inner) = &*query.body else {
            debug!("unhandled subquery body in SELECT");
            return;
        };
        let Some(from) = inner.from.first().and_then(|t| match &t.relation {
            TableFactor::Table { name, .. } => Some(object_name(name)),
            _ => None,
        }) else {
            debug!("subquery without a table in SELECT");
            return;
        };

        let Some(SelectItem::UnnamedExpr(Expr::Function(func)) | SelectItem::ExprWithAlias {
            expr: Expr::Function(func),
            ..
        }) = inner.projection.first()
        else {
            debug!("unhandled subquery projection in SELECT");
            return;
        };

        let name = func.name.to_string().to_lowercase();
        let correlated = correlation(inner);

        match (name.as_str(), correlated) {
            ("count", Some((inner_field, outer_field))) => {
                let mut lookup = Document::new();
                lookup.insert("from", from);
                lookup.insert("localField", outer_field);
                lookup.insert("foreignField", inner_field);
                lookup.insert("as", "subquery_result");
                let mut stage = Document::new();
                stage.insert("$lookup", lookup);
                self.lookups.push(stage);

                self.push_add_fields(&alias, wrap("$size", Bson::String("$subquery_result".into())));
            }
            (agg @ ("sum" | "avg" | "min" | "max"), Some((inner_field, outer_field))) => {
                let Some(column) = function_args(func).first().and_then(|e| column_name(e))
                else {
                    debug!("aggregate subquery without a column");
                    return;
                };
                let mut lookup = Document::new();
                lookup.insert("from", from);
                lookup.insert("localField", outer_field);
                lookup.insert("foreignField", inner_field);
                lookup.insert("as", "subquery_result");
                let mut stage = Document::new();
                stage.insert("$lookup", lookup);
                self.lookups.push(stage);

                self.push_add_fields(
                    &alias,
                    wrap(
                        &format!("${agg}"),
                        Bson::String(format!("$subquery_result.{column}")),
                    ),
                );
            }
            (agg @ ("count" | "sum" | "avg" | "min" | "max"), None) => {
                // Uncorrelated: evaluate the aggregate inside the lookup.
                let value = if agg == "count" {
                    wrap("$sum", Bson::Int32(1))
                } else {
                    let Some(column) = function_args(func).first().and_then(|e| column_name(e))
                    else {
                        debug!("aggregate subquery without a column");
                        return;
                    };
                    wrap(&format!("${agg}"), Bson::String(format!("${column}")))
                };

                let mut group = Document::new();
                group.insert("_id", Bson::Null);
                group.insert(alias.clone(), value);
                let mut group_stage = Document::new();
                group_stage.insert("$group", group);

                let mut lookup = Document::new();
                lookup.insert("from", from);
                lookup.insert("pipeline", Bson::Array(vec![Bson::Document(group_stage)]));
                lookup.insert("as", "subquery_result");
                let mut stage = Document::new();
                stage.insert("$lookup", lookup);
                self.lookups.push(stage);

                self.push_add_fields(
                    &alias,
                    wrap(
                        "$first",
                        Bson::String(format!("$subquery_result.{alias}")),
                    ),
                );
            }
            _ => {
                self.record(Error::UnknownFunction(func.name.to_string()));
                return;
            }
        }

        self.project.insert(alias, Bson::Int32(1));
    }

    fn push_add_fields(&mut self, alias: &str, value: Bson) {
        let mut fields = Document::new();
        fields.insert(alias, value);
        let mut stage = Document::new();
        stage.insert("$addFields", fields);
        self.lookups.push(stage);
    }

    /// The output field name for an aggregate, recording the derived
    /// `name_column` form so HAVING can find the select alias later.
    fn aggregate_alias(
        &mut self,
        alias: Option<String>,
        name: &str,
        column: Option<&str>,
    ) -> String {
        let derived = match column {
            Some(column) => format!("{name}_{column}"),
            None => name.to_string(),
        };
        let actual = alias.unwrap_or_else(|| derived.clone());
        self.agg_aliases.insert(derived, actual.clone());
        actual
    }
}

/// The sole, unaliased `COUNT(*)`-shaped item of a projection, if that is
/// the whole SELECT list.
fn bare_count(select: &Select) -> Option<&Function> {
    if select.projection.len() != 1 {
        return None;
    }
    let SelectItem::UnnamedExpr(Expr::Function(func)) = &select.projection[0] else {
        return None;
    };
    if func.name.to_string().to_lowercase() != "count" || func.distinct {
        return None;
    }
    Some(func)
}

fn func_has_column(func: &Function) -> bool {
    !function_args(func).is_empty()
}
