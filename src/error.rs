//! Error taxonomy for the parser, evaluator, and renderer.
//!
//! Every variant here is terminal at the point it is raised; the engine does
//! not retry. The one deferred case is [`Error::EvaluationFailed`], which
//! surfaces the phore's accumulated `errors` counter at the end of Phase 3
//! rather than aborting the walk early.

use crate::span::SpanId;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors raised while turning source text into a [`crate::span::Template`].
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// A `<|` was opened but no matching `|>` was found before end of input.
    #[error("unclosed tag starting at byte {start}")]
    UnclosedTag {
        /// Byte offset of the opening `<|`.
        start: usize,
    },

    /// A quoted argument inside a tag body was never closed.
    #[error("mismatched quote in tag body at byte {start}")]
    QuoteError {
        /// Byte offset of the tag body.
        start: usize,
    },

    /// A `<>` attribute was given with an empty value.
    #[error("`<>` attribute has an empty value at byte {start}")]
    EmptyAngleAttr {
        /// Byte offset of the tag body.
        start: usize,
    },

    /// A content-emitting span appeared with no role established and no
    /// implicit system ego could be inserted.
    #[error("no role established for span at byte {start}")]
    NoRoleForSpan {
        /// Byte offset of the offending span's tag.
        start: usize,
    },
}

/// Errors raised while evaluating a [`crate::span::Template`].
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// A `Class` span's name resolved neither in `env` nor the class
    /// registry.
    #[error("class `{name}` not found (span {span:?})")]
    ClassNotFound {
        /// The unresolved class name.
        name: String,
        /// The span that referenced it.
        span: SpanId,
    },

    /// A `Class` span's bound object defines neither `__holo__` nor carries
    /// a `body`.
    #[error("class span {0:?} has neither a `__holo__` hook nor a body")]
    EmptyClassSpan(SpanId),

    /// Phase 3 ran with a nonzero `errors` counter on the phore (one or more
    /// `Sample` spans failed during Phase 2).
    #[error("evaluation finished with {0} unrecovered error(s)")]
    EvaluationFailed(u32),
}

/// Errors raised while reverse-parsing rendered text back into a [`crate::context::Context`].
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// `from_delimited_text` found no `<|im_start|>...<|im_end|>` blocks.
    #[error("no delimited message blocks found in input")]
    NoDelimitedBlocks,
}

/// The crate's unified error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A parser error.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// An evaluator error.
    #[error(transparent)]
    Eval(#[from] EvalError),

    /// A renderer error.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// The template loader could not read a template file.
    #[error("failed to load template `{name}`: {source}")]
    Load {
        /// The requested template name.
        name: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The template loader exhausted its search path.
    #[error("template `{0}` not found on any search path")]
    TemplateNotFound(String),
}
