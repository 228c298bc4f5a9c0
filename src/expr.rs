//! Recursive lowering of SQL scalar expressions into pipeline-expression
//! fragments.
//!
//! These are the `$`-prefixed field references, operator documents and
//! `$cond` ladders that appear inside `$project`, `$group` and `$expr`
//! payloads. Document-form WHERE predicates are lowered separately in
//! `translate::filter`.

use bson::{Bson, Document};
use sqlparser::ast::{
    BinaryOperator, Expr, Function, FunctionArg, FunctionArgExpr, Ident, UnaryOperator,
};
use tracing::debug;

use crate::statement::Builder;
use crate::value;
use crate::{Error, Result};

impl Builder<'_> {
    /// Lower an expression to its pipeline form.
    pub(crate) fn lower_expr(&mut self, expr: &Expr) -> Result<Bson> {
        match expr {
            Expr::Identifier(ident) => Ok(Bson::String(format!("${}", ident.value))),
            Expr::CompoundIdentifier(idents) => {
                Ok(Bson::String(format!("${}", self.field_path(idents))))
            }
            Expr::Value(v) => Ok(value::literal(v)),
            Expr::Nested(inner) => self.lower_expr(inner),
            Expr::BinaryOp { left, op, right } => self.lower_binary_op(left, op, right),
            Expr::UnaryOp { op, expr } => self.lower_unary_op(op, expr),
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => self.lower_case(operand.as_deref(), conditions, results, else_result.as_deref()),
            Expr::Function(func) => self.lower_function(func),
            Expr::Substring {
                expr,
                substring_from,
                substring_for,
                ..
            } => self.lower_substring(expr, substring_from.as_deref(), substring_for.as_deref()),
            other => {
                debug!(kind = %other, "unhandled expression kind");
                Err(Error::Unsupported(format!("expression: {other}")))
            }
        }
    }

    fn lower_binary_op(&mut self, left: &Expr, op: &BinaryOperator, right: &Expr) -> Result<Bson> {
        let operator = match op {
            BinaryOperator::Eq => "$eq",
            BinaryOperator::NotEq => "$ne",
            BinaryOperator::Gt => "$gt",
            BinaryOperator::GtEq => "$gte",
            BinaryOperator::Lt => "$lt",
            BinaryOperator::LtEq => "$lte",
            BinaryOperator::And => "$and",
            BinaryOperator::Or => "$or",
            BinaryOperator::Plus => "$add",
            BinaryOperator::Minus => "$subtract",
            BinaryOperator::Multiply => "$multiply",
            BinaryOperator::Divide => "$divide",
            BinaryOperator::Modulo => "$mod",
            other => {
                debug!(operator = %other, "unhandled binary operator");
                return Err(Error::Unsupported(format!("operator: {other}")));
            }
        };

        let lhs = self.lower_expr(left)?;
        let rhs = self.lower_expr(right)?;
        let mut doc = Document::new();
        doc.insert(operator, Bson::Array(vec![lhs, rhs]));
        Ok(Bson::Document(doc))
    }

    fn lower_unary_op(&mut self, op: &UnaryOperator, expr: &Expr) -> Result<Bson> {
        match op {
            UnaryOperator::Minus => match self.lower_expr(expr)? {
                Bson::Int32(n) => Ok(Bson::Int32(-n)),
                Bson::Int64(n) => Ok(Bson::Int64(-n)),
                Bson::Double(f) => Ok(Bson::Double(-f)),
                other => Ok(wrap("$multiply", Bson::Array(vec![Bson::Int32(-1), other]))),
            },
            UnaryOperator::Plus => self.lower_expr(expr),
            UnaryOperator::Not => {
                let inner = self.lower_expr(expr)?;
                Ok(wrap("$not", Bson::Array(vec![inner])))
            }
            other => {
                debug!(operator = %other, "unhandled unary operator");
                Err(Error::Unsupported(format!("operator: {other}")))
            }
        }
    }

    /// Lower a CASE expression into a `$cond` ladder. Simple CASE is
    /// rewritten to searched CASE by comparing the scrutinee with each WHEN
    /// value; a missing ELSE lowers to `{$literal: null}` on the terminal
    /// branch. The first WHEN ends up outermost, matching SQL evaluation
    /// order.
    fn lower_case(
        &mut self,
        operand: Option<&Expr>,
        conditions: &[Expr],
        results: &[Expr],
        else_result: Option<&Expr>,
    ) -> Result<Bson> {
        let mut tail = match else_result {
            Some(e) => self.lower_expr(e)?,
            None => {
                let mut literal = Document::new();
                literal.insert("$literal", Bson::Null);
                Bson::Document(literal)
            }
        };

        for (condition, result) in conditions.iter().zip(results.iter()).rev() {
            let test = match operand {
                Some(scrutinee) => {
                    let lhs = self.lower_expr(scrutinee)?;
                    let rhs = self.lower_expr(condition)?;
                    let mut eq = Document::new();
                    eq.insert("$eq", Bson::Array(vec![lhs, rhs]));
                    Bson::Document(eq)
                }
                None => self.lower_expr(condition)?,
            };

            let mut cond = Document::new();
            cond.insert("if", test);
            cond.insert("then", self.lower_expr(result)?);
            cond.insert("else", tail);

            let mut stage = Document::new();
            stage.insert("$cond", cond);
            tail = Bson::Document(stage);
        }

        Ok(tail)
    }

    /// Lower a function call in expression position. Aggregate functions
    /// emit their `$group` operators; string and null-handling functions
    /// map onto the corresponding pipeline operators. Anything else is an
    /// unknown function.
    pub(crate) fn lower_function(&mut self, func: &Function) -> Result<Bson> {
        let name = func.name.to_string().to_lowercase();
        let args = function_args(func);

        let fragment = match name.as_str() {
            "count" => {
                if func.distinct {
                    let arg = self.required_arg(&args, &name)?;
                    wrap("$addToSet", arg)
                } else {
                    let mut sum = Document::new();
                    sum.insert("$sum", Bson::Int32(1));
                    Bson::Document(sum)
                }
            }
            "sum" | "avg" | "min" | "max" => {
                let arg = self.required_arg(&args, &name)?;
                wrap(&format!("${name}"), arg)
            }
            "concat" => {
                let mut parts = Vec::with_capacity(args.len());
                for arg in &args {
                    parts.push(self.lower_expr(arg)?);
                }
                wrap("$concat", Bson::Array(parts))
            }
            "upper" | "toupper" => wrap("$toUpper", self.required_arg(&args, &name)?),
            "lower" | "tolower" => wrap("$toLower", self.required_arg(&args, &name)?),
            "length" => wrap("$strLenCP", self.required_arg(&args, &name)?),
            "locate" => {
                if args.len() < 2 {
                    return Err(Error::UnknownFunction(func.name.to_string()));
                }
                let needle = self.lower_expr(args[0])?;
                let haystack = self.lower_expr(args[1])?;
                wrap("$indexOfCP", Bson::Array(vec![haystack, needle]))
            }
            "coalesce" | "ifnull" => {
                let mut parts = Vec::with_capacity(args.len());
                for arg in &args {
                    parts.push(self.lower_expr(arg)?);
                }
                wrap("$ifNull", Bson::Array(parts))
            }
            "date_format" => {
                if args.len() < 2 {
                    return Err(Error::UnknownFunction(func.name.to_string()));
                }
                let date = self.lower_expr(args[0])?;
                let format = self.lower_expr(args[1])?;
                let mut spec = Document::new();
                spec.insert("format", format);
                spec.insert("date", date);
                wrap("$dateToString", Bson::Document(spec))
            }
            "substring" | "substr" => {
                if args.len() < 3 {
                    return Err(Error::UnknownFunction(func.name.to_string()));
                }
                let subject = self.lower_expr(args[0])?;
                let start = one_based_start(self.lower_expr(args[1])?);
                let length = self.lower_expr(args[2])?;
                wrap("$substr", Bson::Array(vec![subject, start, length]))
            }
            _ => return Err(Error::UnknownFunction(func.name.to_string())),
        };

        Ok(fragment)
    }

    fn lower_substring(
        &mut self,
        subject: &Expr,
        from: Option<&Expr>,
        length: Option<&Expr>,
    ) -> Result<Bson> {
        let subject = self.lower_expr(subject)?;
        let start = match from {
            Some(e) => one_based_start(self.lower_expr(e)?),
            None => Bson::Int32(0),
        };
        let length = match length {
            Some(e) => self.lower_expr(e)?,
            None => Bson::Int32(-1),
        };
        Ok(wrap("$substr", Bson::Array(vec![subject, start, length])))
    }

    fn required_arg(&mut self, args: &[&Expr], name: &str) -> Result<Bson> {
        match args.first() {
            Some(arg) => self.lower_expr(arg),
            None => Err(Error::UnknownFunction(name.to_string())),
        }
    }

    /// Resolve a (possibly qualified) column to a dotted field path. The
    /// base table's qualifier strips away; a join alias rewrites to the
    /// joined document's name; anything else stays dotted as written.
    pub(crate) fn field_path(&self, idents: &[Ident]) -> String {
        match idents {
            [column] => column.value.clone(),
            [qualifier, column] => {
                if self.is_base_qualifier(&qualifier.value) {
                    column.value.clone()
                } else if let Some(joined) = self.join_as.get(&qualifier.value) {
                    format!("{}.{}", joined, column.value)
                } else {
                    format!("{}.{}", qualifier.value, column.value)
                }
            }
            _ => idents
                .iter()
                .map(|i| i.value.as_str())
                .collect::<Vec<_>>()
                .join("."),
        }
    }

    pub(crate) fn is_base_qualifier(&self, qualifier: &str) -> bool {
        self.base_alias.as_deref() == Some(qualifier) || self.plan.collection == qualifier
    }
}

/// SQL `SUBSTRING` counts from 1, `$substr` from 0.
fn one_based_start(start: Bson) -> Bson {
    match start {
        Bson::Int32(n) => Bson::Int32(n - 1),
        Bson::Int64(n) => Bson::Int64(n - 1),
        other => {
            let mut adjust = Document::new();
            adjust.insert("$subtract", Bson::Array(vec![other, Bson::Int32(1)]));
            Bson::Document(adjust)
        }
    }
}

pub(crate) fn wrap(operator: &str, value: Bson) -> Bson {
    let mut doc = Document::new();
    doc.insert(operator, value);
    Bson::Document(doc)
}

/// Positional expression arguments of a function call; wildcards and named
/// arguments are skipped.
pub(crate) fn function_args(func: &Function) -> Vec<&Expr> {
    func.args
        .iter()
        .filter_map(|arg| match arg {
            FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => Some(e),
            _ => None,
        })
        .collect()
}

/// Whether the call is `f(*)` or `f(t.*)`.
pub(crate) fn has_star_arg(func: &Function) -> bool {
    func.args.is_empty()
        || func.args.iter().any(|arg| {
            matches!(
                arg,
                FunctionArg::Unnamed(FunctionArgExpr::Wildcard)
                    | FunctionArg::Unnamed(FunctionArgExpr::QualifiedWildcard(_))
            )
        })
}

/// The unqualified column name of an identifier expression, unwrapping
/// nesting.
pub(crate) fn column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(idents) => idents.last().map(|i| i.value.clone()),
        Expr::Nested(inner) => column_name(inner),
        _ => None,
    }
}
