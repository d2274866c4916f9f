//! The hard-filter expression DSL: a conjunction of `Annot op value`
//! comparisons evaluated to a failure bitmask.

use std::fmt;

use eyre::Result;
use thiserror::Error;

use crate::table::Columns;

/// Predicates per filter set are indexable by a 64-bit failure mask.
pub const MAX_TERMS: usize = 63;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("could not parse filter expression: [{0}]")]
    Malformed(String),
    #[error("no such annotation is available: [{0}]")]
    UnknownAnnotation(String),
    #[error("could not parse the threshold value in: [{0}]")]
    BadValue(String),
    #[error("too many filter terms ({0}), at most {MAX_TERMS} are supported")]
    TooManyTerms(usize),
}

/// The five comparison operators of the filter DSL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl CmpOp {
    fn parse(tok: &str) -> Option<Self> {
        match tok {
            "<" => Some(CmpOp::Lt),
            "<=" => Some(CmpOp::Le),
            "==" | "=" => Some(CmpOp::Eq),
            ">=" => Some(CmpOp::Ge),
            ">" => Some(CmpOp::Gt),
            _ => None,
        }
    }

    /// The comparison read from the other side: `5 <= QUAL` is `QUAL >= 5`.
    pub fn swapped(self) -> Self {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Eq => CmpOp::Eq,
            CmpOp::Ge => CmpOp::Le,
            CmpOp::Gt => CmpOp::Lt,
        }
    }

    fn fails(self, val: f64, threshold: f64) -> bool {
        match self {
            CmpOp::Ge => val < threshold,
            CmpOp::Gt => val <= threshold,
            CmpOp::Eq => val != threshold,
            CmpOp::Lt => val >= threshold,
            CmpOp::Le => val > threshold,
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tok = match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "==",
            CmpOp::Ge => ">=",
            CmpOp::Gt => ">",
        };
        f.write_str(tok)
    }
}

/// One parsed `Annot op value` comparison.
#[derive(Debug, Clone)]
pub struct Predicate {
    pub model_idx: usize,
    pub op: CmpOp,
    pub value: f64,
    pub name: String,
    /// Original term text, kept for reporting.
    pub desc: String,
}

/// A conjunction of predicates; a non-zero failure mask rejects the site.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    preds: Vec<Predicate>,
}

impl FilterSet {
    /// Parses `TERM ('&' TERM)*` after stripping whitespace. Exactly one
    /// side of each term must name a table annotation; naming a column
    /// outside the current model silently pulls it into the model.
    pub fn parse(expr: &str, columns: &mut Columns) -> Result<Self> {
        let stripped: String = expr.chars().filter(|c| !c.is_whitespace()).collect();
        let mut preds = Vec::new();
        for term in stripped.split('&').filter(|t| !t.is_empty()) {
            preds.push(parse_term(term, columns)?);
        }
        if preds.len() > MAX_TERMS {
            return Err(ExprError::TooManyTerms(preds.len()).into());
        }
        Ok(FilterSet { preds })
    }

    pub fn is_empty(&self) -> bool {
        self.preds.is_empty()
    }

    pub fn len(&self) -> usize {
        self.preds.len()
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.preds
    }

    /// 64-bit mask with bit `i` set when predicate `i` rejects the vector.
    pub fn failed(&self, vals: &[f64]) -> u64 {
        let mut mask = 0;
        for (i, pred) in self.preds.iter().enumerate() {
            if pred.op.fails(vals[pred.model_idx], pred.value) {
                mask |= 1 << i;
            }
        }
        mask
    }
}

fn parse_term(term: &str, columns: &mut Columns) -> Result<Predicate> {
    let malformed = || ExprError::Malformed(term.to_string());
    let start = term.find(['<', '>', '=']).ok_or_else(malformed)?;
    let oplen = term[start..]
        .find(|c| !matches!(c, '<' | '>' | '='))
        .ok_or_else(malformed)?;
    let op = CmpOp::parse(&term[start..start + oplen]).ok_or_else(malformed)?;
    let left = &term[..start];
    let right = &term[start + oplen..];
    if left.is_empty() || right.is_empty() {
        return Err(malformed().into());
    }

    let (column, value_text, op) = match (
        columns.find_annotation(left),
        columns.find_annotation(right),
    ) {
        (Some(column), _) => (column, right, op),
        (None, Some(column)) => (column, left, op.swapped()),
        (None, None) => return Err(ExprError::UnknownAnnotation(term.to_string()).into()),
    };
    let value: f64 = value_text
        .parse()
        .map_err(|_| ExprError::BadValue(term.to_string()))?;
    let model_idx = match columns.model_of(column) {
        Some(idx) => idx,
        None => columns.extend(column)?,
    };
    Ok(Predicate {
        model_idx,
        op,
        value,
        name: columns.name_of(column).to_string(),
        desc: term.to_string(),
    })
}
