//! SQL to MongoDB Query-Plan Translation
//!
//! This crate accepts a raw SQL `SELECT` statement, parses it with
//! [`sqlparser`], and lowers the AST into a [`QueryPlan`]: either a flat
//! filter/projection/sort tuple for `find`-family operations or an ordered
//! aggregation pipeline. Downstream code hands the plan to a MongoDB driver
//! for execution.
//!
//! ```no_run
//! use squill::{QueryPlan, Statement};
//!
//! let mut plan = QueryPlan::new();
//! Statement::new("SELECT * FROM users WHERE age > 25").build(&mut plan)?;
//! # Ok::<(), squill::Error>(())
//! ```
//!
//! Translation is pure, single-threaded and synchronous; a [`Statement`]
//! holds no global state, so independent statements may be built
//! concurrently on separate threads.

use thiserror::Error as ThisError;

pub mod plan;
pub mod request;
pub mod statement;
pub mod value;

mod expr;
mod translate;

pub use plan::{Operation, QueryPlan};
pub use request::{parse_request, RequestDefaults};
pub use statement::Statement;
pub use value::csuuid;

/// Errors surfaced by translation and the request adapter.
///
/// Parser errors pass through verbatim. Translation errors are recorded
/// during the walk and returned after it completes, so the partial plan is
/// still available to the caller.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("{0}")]
    Parse(#[from] sqlparser::parser::ParserError),

    #[error("unhandled function: {0}")]
    UnknownFunction(String),

    #[error("unsupported statement: {0}")]
    Unsupported(String),

    #[error("malformed uuid: {0}")]
    Uuid(String),

    #[error("unable to parse time: {0}")]
    Time(String),

    #[error("invalid value for parameter {name}: {value}")]
    Parameter { name: String, value: String },
}

pub type Result<T> = std::result::Result<T, Error>;
