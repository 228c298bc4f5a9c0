//! FROM clause handling: the base collection and its alias.

use sqlparser::ast::{ObjectName, TableFactor, TableWithJoins};
use tracing::debug;

use crate::statement::Builder;

impl Builder<'_> {
    pub(crate) fn translate_from(&mut self, from: &[TableWithJoins]) {
        if from.len() > 1 {
            self.multi_from = true;
        }

        let Some(first) = from.first() else {
            return;
        };

        match &first.relation {
            TableFactor::Table { name, alias, .. } => {
                self.plan.collection = object_name(name);
                self.base_alias = alias.as_ref().map(|a| a.name.value.clone());
            }
            other => debug!(kind = %other, "unhandled FROM relation"),
        }

        for join in &first.joins {
            self.translate_join(join);
        }
    }
}

/// The unqualified table name, unwrapping any schema qualifier and quoting.
pub(crate) fn object_name(name: &ObjectName) -> String {
    name.0.last().map(|i| i.value.clone()).unwrap_or_default()
}
