//! GROUP BY and HAVING lowering, plus `$group`/`$project` assembly.

use bson::{Bson, Document};
use sqlparser::ast::{BinaryOperator, Expr, Function, GroupByExpr};
use tracing::debug;

use crate::expr::{column_name, function_args};
use crate::statement::{Builder, GroupKey};
use crate::translate::push_filter;
use crate::value;

impl Builder<'_> {
    pub(crate) fn translate_group_by(&mut self, group_by: &GroupByExpr) {
        let GroupByExpr::Expressions(exprs) = group_by else {
            return;
        };

        for expr in exprs {
            match expr {
                Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
                    if let Some(field) = self.filter_field(expr) {
                        self.group_keys.push(GroupKey::Column(field));
                    }
                }
                other => match self.lower_expr(other) {
                    Ok(lowered) => self.group_keys.push(GroupKey::Expr(lowered)),
                    Err(e) => self.record(e),
                },
            }
        }
    }

    /// HAVING becomes a `$match` on the grouped output. The match field is
    /// the aggregate's select alias when one exists, otherwise the derived
    /// `function_column` name.
    pub(crate) fn translate_having(&mut self, expr: &Expr) {
        let mut having = std::mem::take(&mut self.having);
        self.having_expr(&mut having, expr);
        self.having = having;
    }

    fn having_expr(&mut self, out: &mut Document, expr: &Expr) {
        match expr {
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                self.having_expr(out, left);
                self.having_expr(out, right);
            }
            Expr::Nested(inner) => self.having_expr(out, inner),
            Expr::BinaryOp { left, op, right } => {
                let field = match left.as_ref() {
                    Expr::Identifier(ident) => ident.value.clone(),
                    Expr::Function(func) => self.having_field(func),
                    other => {
                        debug!(kind = %other, "unhandled HAVING subject");
                        return;
                    }
                };

                let operator = match op {
                    BinaryOperator::Eq => "$eq",
                    BinaryOperator::NotEq => "$ne",
                    BinaryOperator::Gt => "$gt",
                    BinaryOperator::GtEq => "$gte",
                    BinaryOperator::Lt => "$lt",
                    BinaryOperator::LtEq => "$lte",
                    other => {
                        debug!(operator = %other, "unhandled HAVING operator");
                        return;
                    }
                };

                let value = match right.as_ref() {
                    Expr::Value(v) => value::literal(v),
                    other => {
                        debug!(kind = %other, "unhandled HAVING value");
                        return;
                    }
                };

                let mut doc = Document::new();
                doc.insert(operator, value);
                push_filter(out, &field, Bson::Document(doc));
            }
            other => debug!(kind = %other, "unhandled HAVING expression"),
        }
    }

    fn having_field(&mut self, func: &Function) -> String {
        let name = func.name.to_string().to_lowercase();
        let derived = match function_args(func).first().and_then(|e| column_name(e)) {
            Some(column) => format!("{name}_{column}"),
            None => name,
        };
        self.agg_aliases
            .get(&derived)
            .cloned()
            .unwrap_or(derived)
    }

    /// The `$group` payload: `_id` from the group keys (or null when only
    /// aggregates are present), a `$first` carry per column key, then the
    /// aggregate fields in select order.
    pub(crate) fn build_group(&mut self) -> Option<Document> {
        if self.group_keys.is_empty() && self.agg_fields.is_empty() {
            return None;
        }

        let mut group = Document::new();
        group.insert("_id", self.group_id());

        for key in &self.group_keys {
            if let GroupKey::Column(column) = key {
                let mut first = Document::new();
                first.insert("$first", format!("${column}"));
                group.insert(column, first);
            }
        }
        for (alias, fragment) in &self.agg_fields {
            group.insert(alias, fragment.clone());
        }

        Some(group)
    }

    fn group_id(&self) -> Bson {
        match self.group_keys.as_slice() {
            [] => Bson::Null,
            [GroupKey::Column(column)] => Bson::String(format!("${column}")),
            [GroupKey::Expr(lowered)] => lowered.clone(),
            keys => {
                let mut id = Document::new();
                for key in keys {
                    match key {
                        GroupKey::Column(column) => {
                            id.insert(column, format!("${column}"));
                        }
                        GroupKey::Expr(_) => {
                            debug!("expression key in multi-column GROUP BY dropped from _id")
                        }
                    }
                }
                Bson::Document(id)
            }
        }
    }

    /// The `$project` payload following the group stage, or the select
    /// projection when no grouping happened.
    pub(crate) fn build_project(&mut self, grouped: bool) -> Option<Document> {
        if !grouped {
            if self.projection_cleared || self.project.is_empty() {
                return None;
            }
            return Some(std::mem::take(&mut self.project));
        }

        // Expression group keys referenced from the SELECT list surface
        // the group _id under their alias.
        if !self.group_key_aliases.is_empty() {
            let mut project = Document::new();
            for alias in std::mem::take(&mut self.group_key_aliases) {
                project.insert(alias, "$_id");
            }
            for (alias, _) in &self.agg_fields {
                if self.set_aliases.contains(alias) {
                    let mut size = Document::new();
                    size.insert("$size", format!("${alias}"));
                    project.insert(alias, size);
                } else {
                    project.insert(alias, Bson::Int32(1));
                }
            }
            project.insert("_id", Bson::Int32(0));
            return Some(project);
        }

        // COUNT(DISTINCT …) collects a set in the group stage; the project
        // collapses it to a size and carries every other grouped field.
        if !self.set_aliases.is_empty() {
            let mut project = Document::new();
            for key in &self.group_keys {
                if let GroupKey::Column(column) = key {
                    project.insert(column, Bson::Int32(1));
                }
            }
            for (alias, _) in &self.agg_fields {
                if self.set_aliases.contains(alias) {
                    let mut size = Document::new();
                    size.insert("$size", format!("${alias}"));
                    project.insert(alias, size);
                } else {
                    project.insert(alias, Bson::Int32(1));
                }
            }
            return Some(project);
        }

        None
    }
}
