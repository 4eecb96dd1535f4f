// ironlinq-core/src/error.rs
use thiserror::Error;

/// Errors raised while translating, executing or materializing a query
#[derive(Error, Debug)]
pub enum LinqError {
    /// A node or method shape has no translation rule
    #[error("Unsupported query: {0}")]
    Unsupported(String),

    /// The expression front-end broke an internal invariant
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// first()/single() over an empty result
    #[error("Sequence contains no elements")]
    NoElements,

    /// single() over more than one row
    #[error("Sequence contains more than one element")]
    MoreThanOneElement,

    #[error("Value cannot be null. (Parameter '{0}')")]
    ArgumentNull(String),

    /// Error reported by the document store, passed through verbatim
    #[error("Store error: {0}")]
    Store(String),

    #[error("Query was cancelled")]
    Cancelled,

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LinqError {
    pub fn unsupported(what: impl std::fmt::Display) -> Self {
        LinqError::Unsupported(what.to_string())
    }

    pub fn contract(what: impl std::fmt::Display) -> Self {
        LinqError::ContractViolation(what.to_string())
    }

    /// Not-found and too-many-results are expected, caller-recoverable outcomes
    pub fn is_data_shape(&self) -> bool {
        matches!(self, LinqError::NoElements | LinqError::MoreThanOneElement)
    }
}

pub type Result<T> = std::result::Result<T, LinqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_shape_classification() {
        assert!(LinqError::NoElements.is_data_shape());
        assert!(LinqError::MoreThanOneElement.is_data_shape());
        assert!(!LinqError::unsupported("Foo").is_data_shape());
        assert!(!LinqError::Store("boom".into()).is_data_shape());
    }

    #[test]
    fn test_messages_carry_node_name() {
        let err = LinqError::unsupported("method Aggregate");
        assert!(err.to_string().contains("Aggregate"));
        let err = LinqError::ArgumentNull("source".into());
        assert!(err.to_string().contains("source"));
    }
}
