//! SQL dialect rules used by the compiler

use thiserror::Error;

/// Longest identifier PostgreSQL keeps without truncation (NAMEDATALEN - 1)
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Reasons an identifier cannot be rendered
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("identifier is empty")]
    Empty,

    #[error("identifier \"{0}\" exceeds 63 bytes")]
    TooLong(String),

    #[error("identifier contains a NUL byte")]
    NulByte,
}

/// Syntax rules of a target SQL engine
pub trait Dialect: Send + Sync {
    /// Short name, e.g. `postgresql`
    fn name(&self) -> &'static str;

    /// Quote an identifier so it is never case-folded or read as a keyword.
    ///
    /// # Errors
    /// Returns an `IdentifierError` when the name cannot be represented.
    fn quote_identifier(&self, name: &str) -> Result<String, IdentifierError>;

    /// Placeholder for the 1-based parameter ordinal `n`
    fn placeholder(&self, n: usize) -> String;

    /// Keyword for a join kind
    fn join_keyword(&self, join_type: &crate::builder::JoinType) -> &'static str {
        use crate::builder::JoinType;
        match join_type {
            JoinType::Inner | JoinType::Unsupported(_) => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
            JoinType::Right => "RIGHT JOIN",
            JoinType::Full => "FULL JOIN",
        }
    }
}

/// PostgreSQL: double-quoted identifiers, `$n` placeholders
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn quote_identifier(&self, name: &str) -> Result<String, IdentifierError> {
        if name.is_empty() {
            return Err(IdentifierError::Empty);
        }
        if name.len() > MAX_IDENTIFIER_LEN {
            return Err(IdentifierError::TooLong(name.to_string()));
        }
        if name.contains('\0') {
            return Err(IdentifierError::NulByte);
        }
        Ok(format!("\"{}\"", name.replace('"', "\"\"")))
    }

    fn placeholder(&self, n: usize) -> String {
        format!("${n}")
    }
}
