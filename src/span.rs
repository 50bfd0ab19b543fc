//! The compiled span tree: the parser's output and the evaluator's input.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A machine-unique identifier for a span, stable for the lifetime of one
/// evaluation. Assigned sequentially by the parser as it builds a template,
/// including nested sub-templates attached as class bodies — ids are never
/// reused across a template and its descendants so that `span_bindings` and
/// `span_fragments` in the phore stay unambiguous when a class's body is
/// walked as a sub-template.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SpanId(pub(crate) u32);

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out sequential [`SpanId`]s for one parse, including all nested
/// sub-templates it recurses into.
#[derive(Debug, Default)]
pub(crate) struct SpanIdGen(u32);

impl SpanIdGen {
    pub(crate) fn next(&mut self) -> SpanId {
        let id = SpanId(self.0);
        self.0 += 1;
        id
    }
}

/// A speaker role. The three well-known roles are distinguished so that the
/// renderer's role-normalization rule (§4.4) can tell them apart from a
/// human handle or a raw/custom ego.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Role {
    System,
    User,
    Assistant,
    /// A role given verbatim by the template author that is none of the
    /// three well-known ones (the `raw` case in the span's role field).
    Raw(String),
}

impl Role {
    /// The role name as it appears on the wire (`to_api_messages`,
    /// `to_completion_string`).
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Raw(s) => s.as_str(),
        }
    }

    /// Parses a wire role name back into a [`Role`], mapping the three
    /// well-known names to their variant and anything else to `Raw`.
    #[must_use]
    pub fn from_str(s: &str) -> Role {
        match s {
            "system" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => Role::Raw(other.to_string()),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Serialized as the plain wire role string, not a tagged enum, so a
// dumped `Rollout` reads the same role spelling a pipeline would see
// from `to_api_messages`.
impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Role::from_str(&String::deserialize(deserializer)?))
    }
}

/// Positional and keyword arguments parsed from a tag body, shared by every
/// span variant.
#[derive(Clone, Debug, Default)]
pub struct Args {
    pub kargs: Vec<String>,
    pub kwargs: IndexMap<String, String>,
}

impl Args {
    /// Looks up a kwarg by key.
    #[must_use]
    pub fn kwarg(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).map(String::as_str)
    }
}

/// One node of a compiled [`Template`].
#[derive(Clone, Debug)]
pub enum SpanKind {
    /// Plain literal text, emitted verbatim under the current role.
    Text { text: String },

    /// Sets the current role for subsequent spans. Emits no fragment.
    Ego { role: Role, handle: Option<String> },

    /// Starts a new context and clears the current role back to `system`.
    /// Emits no fragment.
    Reset { train: bool },

    /// Injects the first bound variable found in `env` among `var_ids`.
    Obj { var_ids: Vec<String> },

    /// Invokes a bound object, either via its `__holo__` hook or by
    /// recursively evaluating its `body` sub-template.
    Class {
        class_name: String,
        body: Option<Box<Template>>,
    },

    /// Calls the external sampler and appends its output as a REINFORCE
    /// fragment.
    Sample {
        fence: Option<String>,
        payload_id: Option<String>,
    },
}

/// One node in the compiled span tree: a [`SpanKind`] plus its identity and
/// shared argument data.
#[derive(Clone, Debug)]
pub struct Span {
    pub id: SpanId,
    pub kind: SpanKind,
    pub args: Args,
    /// Byte offset of this span's originating tag within the buffer it was
    /// parsed from (local to that buffer — a nested class body's offsets
    /// are relative to the dedented body text, not the top-level source).
    /// Used only for error messages.
    pub start: usize,
}

impl Span {
    #[must_use]
    pub fn is_text(&self) -> bool {
        matches!(self.kind, SpanKind::Text { .. })
    }

    /// The span's text, if it is a [`SpanKind::Text`].
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            SpanKind::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// The compiled form of one DSL source file (or one class span's indented
/// body, recursively).
#[derive(Clone, Debug, Default)]
pub struct Template {
    /// A display name, typically the source filename or `"<body>"` for a
    /// nested class body.
    pub name: String,
    pub spans: Vec<Span>,
}

impl Template {
    #[must_use]
    pub fn new(name: impl Into<String>, spans: Vec<Span>) -> Self {
        Self {
            name: name.into(),
            spans,
        }
    }

    /// Indices of contexts that follow a training-enabled `Reset`.
    ///
    /// The implicit first context (before any `Reset` is encountered) has
    /// index 0. The context counter only holds steady for a `Reset` that is
    /// literally the first span in the template — any span preceding the
    /// first `Reset` (e.g. a leading `Ego`, `Text`, ...) means that `Reset`
    /// still advances the counter when it's reached, because it closes out
    /// a context (index 0) that real content already landed in. Every
    /// subsequent `Reset` advances the counter by one regardless of its
    /// `train` flag; only resets whose `train` flag is set contribute their
    /// resulting index to this list.
    #[must_use]
    pub fn trained_contexts(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut current = 0usize;

        for (i, span) in self.spans.iter().enumerate() {
            if let SpanKind::Reset { train } = &span.kind {
                if i > 0 {
                    current += 1;
                }
                if *train {
                    out.push(current);
                }
            }
        }

        out
    }

    /// The set of variable ids referenced by any `Obj` span in this
    /// template, in first-seen order. Not used by the evaluator itself;
    /// exposed so a caller can know what environment keys a template
    /// consumes before evaluating it.
    #[must_use]
    pub fn obj_ids(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for span in &self.spans {
            if let SpanKind::Obj { var_ids } = &span.kind {
                for id in var_ids {
                    if seen.insert(id.clone()) {
                        out.push(id.clone());
                    }
                }
            }
        }
        out
    }

    /// The first span (searching this template's own span list only, not
    /// recursing into class bodies) for which `predicate` returns true.
    #[must_use]
    pub fn first_span_of<F>(&self, predicate: F) -> Option<&Span>
    where
        F: Fn(&Span) -> bool,
    {
        self.spans.iter().find(|s| predicate(s))
    }

    /// The first `Text` span in this template, if any. A common enough
    /// accessor (used by bound objects that want to read a class body's
    /// literal content) to warrant a dedicated method.
    #[must_use]
    pub fn first_text_span(&self) -> Option<&Span> {
        self.first_span_of(Span::is_text)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Template {:?}", self.name)?;
        fn write_span(f: &mut fmt::Formatter<'_>, span: &Span, indent: usize) -> fmt::Result {
            let pad = "  ".repeat(indent);
            match &span.kind {
                SpanKind::Text { text } => writeln!(f, "{pad}{} Text {:?}", span.id, text),
                SpanKind::Ego { role, handle } => {
                    writeln!(f, "{pad}{} Ego {role} {handle:?}", span.id)
                }
                SpanKind::Reset { train } => writeln!(f, "{pad}{} Reset train={train}", span.id),
                SpanKind::Obj { var_ids } => {
                    writeln!(f, "{pad}{} Obj {var_ids:?}", span.id)
                }
                SpanKind::Class { class_name, body } => {
                    writeln!(f, "{pad}{} Class {class_name}", span.id)?;
                    if let Some(body) = body {
                        for child in &body.spans {
                            write_span(f, child, indent + 1)?;
                        }
                    }
                    Ok(())
                }
                SpanKind::Sample { fence, payload_id } => {
                    writeln!(f, "{pad}{} Sample fence={fence:?} id={payload_id:?}", span.id)
                }
            }
        }
        for span in &self.spans {
            write_span(f, span, 1)?;
        }
        Ok(())
    }
}
