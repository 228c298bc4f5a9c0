//! LIMIT and OFFSET lowering.
//!
//! The MySQL `LIMIT offset, count` comma form arrives from the parser with
//! both parts populated. The FindOne promotion for `LIMIT 1` happens at
//! finalisation, once it is known that nothing forced an aggregate.

use sqlparser::ast::{Expr, Offset, Value as SqlValue};
use tracing::debug;

use crate::statement::Builder;

impl Builder<'_> {
    pub(crate) fn translate_limit(&mut self, limit: Option<&Expr>, offset: Option<&Offset>) {
        if let Some(expr) = limit {
            match parse_count(expr) {
                Some(n) => self.limit = Some(n),
                None => debug!(expression = %expr, "unhandled LIMIT expression"),
            }
        }
        if let Some(offset) = offset {
            match parse_count(&offset.value) {
                Some(n) => self.offset = Some(n),
                None => debug!(expression = %offset.value, "unhandled OFFSET expression"),
            }
        }
    }
}

fn parse_count(expr: &Expr) -> Option<i64> {
    match expr {
        Expr::Value(SqlValue::Number(n, _)) => n.parse::<i64>().ok(),
        _ => None,
    }
}
