//! Query AST.
//!
//! One variant per grammar production, dispatched with an exhaustive `match` in
//! [`crate::query::compiler`], rather than a per-node-type dict of visitor callbacks:
//! a new production becomes a compile error at every site that needs to know about it.

use chrono::NaiveDate;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// The empty query; matches every object.
    Empty,
    /// `field: exactly value` -- exact text match.
    Equals { field: String, value: String },
    /// `field: value` (quoted or bare) -- word-boundary phrase match.
    Phrase { field: String, phrase: String },
    /// `field: between dates D and D` over a datetime field. Both bounds are required.
    BetweenDates { field: String, min: NaiveDate, max: NaiveDate },
    /// `field: between N and N` over a numeric field. Both bounds are required.
    BetweenNumbers { field: String, min: f64, max: f64 },
    /// Comma-separated terms, all of which must match.
    And(Vec<Expr>),
}

impl Expr {
    pub fn and(mut terms: Vec<Expr>) -> Expr {
        terms.retain(|t| *t != Expr::Empty);
        match terms.len() {
            0 => Expr::Empty,
            1 => terms.into_iter().next().unwrap(),
            _ => Expr::And(terms),
        }
    }
}
