//! AST for `@` reference expressions

/// A parsed `@` reference, before evaluation against a [`super::RefContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// `@input` or `@input.<path>`
    Input(Vec<String>),

    /// `@output` or `@output.<path>` — only meaningful when resolving trigger input
    Output(Vec<String>),

    /// `@item` or `@item.<path>` — only valid inside a `forEach` iteration
    Item(Vec<String>),

    /// `@index` — only valid inside a `forEach` iteration, never has a path
    Index,

    /// `@<stepName>` or `@<stepName>.<path>`
    ///
    /// A leading `output` path segment is stripped at parse time (historical
    /// alias: `@step.output.foo` and `@step.foo` are equivalent).
    Step(String, Vec<String>),
}

/// Failure resolving a [`Reference`] against a context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// `@<stepName>` did not match any known step output
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// A path segment had no matching key/index in the current value
    #[error("unknown path segment {segment:?} in {reference}")]
    UnknownPath { reference: String, segment: String },

    /// A path segment attempted to index a scalar value
    #[error("type mismatch indexing scalar at {segment:?} in {reference}")]
    TypeMismatch { reference: String, segment: String },

    /// `@item`/`@index` used outside a `forEach` iteration
    #[error("{0} is not bound in the current context")]
    NotBound(&'static str),

    /// `@output` used outside trigger resolution
    #[error("workflow output is not available in this context")]
    OutputNotBound,
}
