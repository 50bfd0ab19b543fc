//! The bound-object lifecycle contract (§4.5).
//!
//! The source dispatches lifecycle hooks by walking a class's MRO and
//! probing for method names at call time. That only works in a language
//! with runtime reflection. Here a bound object instead declares its
//! capability set up front as a trait with optional methods — an absent
//! override is simply the default no-op, so the engine never needs to ask
//! "does this object implement `__holo__`" at dispatch time, only "did this
//! call return `Some`".

use std::cell::RefCell;
use std::rc::Rc;

use crate::phore::Phore;
use crate::span::{Args, Span};

/// A bound object usable as the target of a `Class` span.
///
/// All three hooks are optional; the engine calls whichever are overridden,
/// in lifecycle order (`holo_init` during Phase 1, `holo` during Phase 2,
/// `holo_end` during Phase 3), each at most once per span.
pub trait BoundObject {
    /// Called once in Phase 1, immediately after construction. Returning
    /// `Some` replaces this object's own binding for the rest of the
    /// evaluation (mirrors the source's "`__holo_init__` may return a
    /// replacement instance" behavior).
    fn holo_init(&mut self, _phore: &mut Phore, _span: &Span) -> Option<SharedBound> {
        None
    }

    /// Called once in Phase 2 when this object's `Class` span is reached.
    /// Returning `Some(text)` appends `text` as one FROZEN fragment.
    fn holo(&mut self, _phore: &mut Phore, _span: &Span) -> Option<String> {
        None
    }

    /// Called once in Phase 3, after the main walk completes, for every
    /// span with a binding that overrides this hook.
    fn holo_end(&mut self, _phore: &mut Phore, _span: &Span) {}

    /// Whether this object overrides [`BoundObject::holo`]. The default
    /// implementation of `holo` returns `None`, which is indistinguishable
    /// from "no fragment this time" versus "no such hook" — dispatch needs
    /// to know which, to decide between invoking `holo` and falling back to
    /// a span's `body`, so implementors that do define a real `holo` must
    /// also flip this to `true`.
    fn has_holo(&self) -> bool {
        false
    }

    /// Whether this object overrides [`BoundObject::holo_end`]. See
    /// [`BoundObject::has_holo`] for why this exists.
    fn has_holo_end(&self) -> bool {
        false
    }
}

/// A reference-counted, interior-mutable handle to one bound object
/// instance, shared between the phore's `span_bindings` map and (for
/// holostatic classes) the class registry itself.
pub type SharedBound = Rc<RefCell<dyn BoundObject>>;

/// One entry in a [`ClassRegistry`].
pub enum ClassDef {
    /// A holostatic class: never instantiated, the same shared object plays
    /// the instance role for every span that references it.
    Holostatic(SharedBound),
    /// An ordinary class: constructed fresh for every `Class` span that
    /// references it, from the span's parsed [`Args`].
    Factory(Box<dyn Fn(&Args) -> SharedBound>),
}

impl ClassDef {
    /// Convenience constructor for an ordinary (non-holostatic) class.
    pub fn factory<F>(f: F) -> Self
    where
        F: Fn(&Args) -> SharedBound + 'static,
    {
        ClassDef::Factory(Box::new(f))
    }
}

/// The external class-name lookup collaborator (§6).
///
/// Class resolution goes exclusively through this registry: `env` here is
/// typed as `IndexMap<String, serde_json::Value>`, so it can never hold a
/// bound-object instance the way the source's dynamically typed `env` could
/// (see DESIGN.md's "Open Questions resolved"). A caller wanting a
/// per-evaluation override supplies a custom `ClassRegistry`.
pub trait ClassRegistry {
    fn lookup(&self, name: &str) -> Option<&ClassDef>;
}

/// A [`ClassRegistry`] with no entries, useful when a template is known to
/// never reference a `Class` span resolved outside `env`.
#[derive(Debug, Default)]
pub struct EmptyRegistry;

impl ClassRegistry for EmptyRegistry {
    fn lookup(&self, _name: &str) -> Option<&ClassDef> {
        None
    }
}
