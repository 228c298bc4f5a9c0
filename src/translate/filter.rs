//! WHERE clause lowering into document-form filters.
//!
//! Top-level conjuncts append in source order; a top-level OR collapses to
//! one `$or` entry whose arms are built against fresh documents. Conjuncts
//! that name an already-filtered field merge into that field's operator
//! document, preserving conjunction semantics.

use bson::{Bson, Document};
use sqlparser::ast::{BinaryOperator, Expr, Function, Value as SqlValue};
use tracing::debug;

use crate::expr::{column_name, function_args};
use crate::statement::Builder;
use crate::value;

impl Builder<'_> {
    pub(crate) fn translate_where(&mut self, expr: &Expr) {
        let mut filter = std::mem::take(&mut self.filter);
        self.where_expr(&mut filter, expr);
        self.filter = filter;
    }

    fn where_expr(&mut self, out: &mut Document, expr: &Expr) {
        match expr {
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                self.where_expr(out, left);
                self.where_expr(out, right);
            }
            Expr::BinaryOp {
                left,
                op: BinaryOperator::Or,
                right,
            } => {
                let mut lhs = Document::new();
                self.where_expr(&mut lhs, left);
                let mut rhs = Document::new();
                self.where_expr(&mut rhs, right);
                push_filter(
                    out,
                    "$or",
                    Bson::Array(vec![Bson::Document(lhs), Bson::Document(rhs)]),
                );
            }
            Expr::Nested(inner) => self.where_expr(out, inner),
            Expr::BinaryOp { left, op, right } => self.where_comparison(out, left, op, right),
            Expr::Like {
                negated,
                expr,
                pattern,
                ..
            } => self.where_like(out, expr, pattern, *negated),
            Expr::InList {
                expr,
                list,
                negated,
            } => self.where_in_list(out, expr, list, *negated),
            Expr::Between {
                expr,
                negated,
                low,
                high,
            } => self.where_between(out, expr, low, high, *negated),
            Expr::IsNull(inner) => {
                if let Some(field) = self.filter_field(inner) {
                    push_filter(out, &field, Bson::Null);
                }
            }
            Expr::IsNotNull(inner) => {
                if let Some(field) = self.filter_field(inner) {
                    let mut ne = Document::new();
                    ne.insert("$ne", Bson::Null);
                    push_filter(out, &field, Bson::Document(ne));
                }
            }
            Expr::Function(func) => self.where_function(out, func),
            other => debug!(kind = %other, "unhandled expression in WHERE clause"),
        }
    }

    fn where_comparison(
        &mut self,
        out: &mut Document,
        left: &Expr,
        op: &BinaryOperator,
        right: &Expr,
    ) {
        match left {
            Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
                let Some(field) = self.filter_field(left) else {
                    return;
                };
                let value = match right {
                    Expr::Value(v) => value::comparison_value(v, &field, &self.plan.collection),
                    Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
                        match self.filter_field(right) {
                            Some(path) => Bson::String(path),
                            None => return,
                        }
                    }
                    Expr::UnaryOp { .. } => match self.lower_expr(right) {
                        Ok(
                            value @ (Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)),
                        ) => value,
                        _ => {
                            debug!("unhandled signed comparison value in WHERE clause");
                            return;
                        }
                    },
                    other => {
                        debug!(kind = %other, "unhandled comparison value in WHERE clause");
                        return;
                    }
                };

                let operator = match op {
                    BinaryOperator::Eq => {
                        push_filter(out, &field, value);
                        return;
                    }
                    BinaryOperator::NotEq => "$ne",
                    BinaryOperator::Gt => "$gt",
                    BinaryOperator::GtEq => "$gte",
                    BinaryOperator::Lt => "$lt",
                    BinaryOperator::LtEq => "$lte",
                    other => {
                        debug!(operator = %other, "unhandled comparison operator in WHERE clause");
                        return;
                    }
                };
                let mut doc = Document::new();
                doc.insert(operator, value);
                push_filter(out, &field, Bson::Document(doc));
            }
            Expr::Function(func) => self.where_function_comparison(out, func, op, right),
            other => debug!(kind = %other, "unhandled comparison subject in WHERE clause"),
        }
    }

    /// `LOWER(col) = 'v'` and `UPPER(col) = 'v'` become anchored
    /// case-insensitive regex matches on the bare column.
    fn where_function_comparison(
        &mut self,
        out: &mut Document,
        func: &Function,
        op: &BinaryOperator,
        right: &Expr,
    ) {
        let name = func.name.to_string().to_lowercase();
        if !matches!(name.as_str(), "lower" | "upper") || *op != BinaryOperator::Eq {
            debug!(function = %func.name, "unhandled function comparison in WHERE clause");
            return;
        }
        let Some(field) = function_args(func).first().and_then(|e| column_name(e)) else {
            return;
        };
        let Expr::Value(SqlValue::SingleQuotedString(text) | SqlValue::DoubleQuotedString(text)) =
            right
        else {
            debug!("unhandled case-folded comparison value");
            return;
        };

        let mut regex = Document::new();
        regex.insert("$regex", format!("^{text}$"));
        regex.insert("$options", "i");
        push_filter(out, &field, Bson::Document(regex));
    }

    fn where_like(&mut self, out: &mut Document, expr: &Expr, pattern: &Expr, negated: bool) {
        let Some(field) = self.filter_field(expr) else {
            return;
        };
        let Expr::Value(SqlValue::SingleQuotedString(raw) | SqlValue::DoubleQuotedString(raw)) =
            pattern
        else {
            debug!("unhandled LIKE pattern");
            return;
        };

        let mut regex = Document::new();
        regex.insert("$regex", raw.replace('%', ".*").replace('_', "."));
        regex.insert("$options", "i");

        if negated {
            let mut not = Document::new();
            not.insert("$not", regex);
            push_filter(out, &field, Bson::Document(not));
        } else {
            push_filter(out, &field, Bson::Document(regex));
        }
    }

    fn where_in_list(&mut self, out: &mut Document, expr: &Expr, list: &[Expr], negated: bool) {
        let Some(field) = self.filter_field(expr) else {
            return;
        };

        let mut values = Vec::with_capacity(list.len());
        for item in list {
            match item {
                Expr::Value(v) => {
                    values.push(value::comparison_value(v, &field, &self.plan.collection))
                }
                Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
                    if let Some(path) = self.filter_field(item) {
                        values.push(Bson::String(path));
                    }
                }
                other => debug!(kind = %other, "unhandled IN list member"),
            }
        }

        let operator = if negated { "$nin" } else { "$in" };
        let mut doc = Document::new();
        doc.insert(operator, Bson::Array(values));
        push_filter(out, &field, Bson::Document(doc));
    }

    fn where_between(
        &mut self,
        out: &mut Document,
        expr: &Expr,
        low: &Expr,
        high: &Expr,
        negated: bool,
    ) {
        if negated {
            debug!("unhandled NOT BETWEEN in WHERE clause");
            return;
        }
        let Some(field) = self.filter_field(expr) else {
            return;
        };
        let (Expr::Value(low), Expr::Value(high)) = (low, high) else {
            debug!("unhandled BETWEEN bounds");
            return;
        };

        let mut range = Document::new();
        range.insert("$gte", value::literal(low));
        range.insert("$lte", value::literal(high));
        push_filter(out, &field, Bson::Document(range));
    }

    /// Bare boolean functions in the WHERE clause. `ARRAY_CONTAINS(col, v)`
    /// becomes a `$in` membership test and cancels the projection.
    fn where_function(&mut self, out: &mut Document, func: &Function) {
        let name = func.name.to_string().to_lowercase();
        if name != "array_contains" {
            debug!(function = %func.name, "unhandled function in WHERE clause");
            return;
        }

        let args = function_args(func);
        if args.len() != 2 {
            debug!(arguments = args.len(), "ARRAY_CONTAINS expects two arguments");
            return;
        }
        let Some(field) = column_name(args[0]) else {
            return;
        };

        let member = match args[1] {
            Expr::Value(SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s)) => {
                match value::coerce_id(s, &field, &self.plan.collection) {
                    Ok(v) => v,
                    Err(_) => Bson::String(s.clone()),
                }
            }
            Expr::Value(v) => value::literal(v),
            other => {
                debug!(kind = %other, "unhandled ARRAY_CONTAINS value");
                return;
            }
        };

        let mut doc = Document::new();
        doc.insert("$in", Bson::Array(vec![member]));
        push_filter(out, &field, Bson::Document(doc));

        self.projection_cleared = true;
        self.project.clear();
    }

    /// The dotted, alias-resolved field a filter applies to.
    pub(crate) fn filter_field(&self, expr: &Expr) -> Option<String> {
        match expr {
            Expr::Identifier(ident) => Some(ident.value.clone()),
            Expr::CompoundIdentifier(idents) => Some(self.field_path(idents)),
            Expr::Nested(inner) => self.filter_field(inner),
            _ => None,
        }
    }
}

/// Insert a filter entry, merging conjuncts that name an already-filtered
/// field into one operator document and stacking repeated `$or` groups
/// under `$and`. A bare equality meeting an operator document on either
/// side is folded in as `$eq`.
pub(crate) fn push_filter(out: &mut Document, key: &str, value: Bson) {
    if key == "$or" && out.contains_key("$or") {
        let Some(previous) = out.remove("$or") else {
            return;
        };
        let mut first = Document::new();
        first.insert("$or", previous);
        let mut second = Document::new();
        second.insert("$or", value);
        match out.get_mut("$and") {
            Some(Bson::Array(groups)) => {
                groups.push(Bson::Document(first));
                groups.push(Bson::Document(second));
            }
            _ => {
                out.insert(
                    "$and",
                    Bson::Array(vec![Bson::Document(first), Bson::Document(second)]),
                );
            }
        }
        return;
    }

    let existing_is_operators =
        matches!(out.get(key), Some(Bson::Document(d)) if is_operator_doc(d));
    if existing_is_operators {
        if let Some(Bson::Document(existing)) = out.get_mut(key) {
            match value {
                Bson::Document(incoming) if is_operator_doc(&incoming) => {
                    for (k, v) in incoming {
                        existing.insert(k, v);
                    }
                }
                bare => {
                    existing.insert("$eq", bare);
                }
            }
        }
        return;
    }

    if out.contains_key(key) {
        if let Bson::Document(incoming) = &value {
            if is_operator_doc(incoming) {
                let Some(previous) = out.remove(key) else {
                    return;
                };
                let mut merged = Document::new();
                merged.insert("$eq", previous);
                for (k, v) in incoming {
                    merged.insert(k, v.clone());
                }
                out.insert(key, merged);
                return;
            }
        }
    }

    out.insert(key, value);
}

fn is_operator_doc(doc: &Document) -> bool {
    !doc.is_empty() && doc.keys().all(|k| k.starts_with('$'))
}
