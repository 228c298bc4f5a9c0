//! ORDER BY lowering. ASC maps to 1, DESC to -1.

use bson::Bson;
use sqlparser::ast::OrderByExpr;

use crate::statement::Builder;

impl Builder<'_> {
    pub(crate) fn translate_order_by(&mut self, order_by: &[OrderByExpr]) {
        for order in order_by {
            if let Some(field) = self.filter_field(&order.expr) {
                let direction = if order.asc == Some(false) { -1 } else { 1 };
                self.sort.insert(field, Bson::Int32(direction));
            }
        }
    }
}
