//! The append-only fragment log and the rollout it lives in.

use serde::{Deserialize, Serialize};

use crate::fragment::{Fragment, Mask};
use crate::span::Role;

/// A stable reference to one fragment within a [`Rollout`], used by the
/// phore's `span_fragments` map so the whitespace-optimization pass can
/// mutate a span's own emitted fragments in place without re-scanning the
/// whole rollout.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FragmentRef {
    pub context: usize,
    pub fragment: usize,
}

/// An ordered sequence of fragments corresponding to one conversational
/// transcript.
///
/// Fragments are append-only during evaluation; the only permitted mutation
/// is the whitespace-optimization pass rewriting a fragment's `text` in
/// place (role and mask are never touched after append).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Context {
    fragments: Vec<Fragment>,
}

impl Context {
    #[must_use]
    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub(crate) fn push(&mut self, fragment: Fragment) -> usize {
        self.fragments.push(fragment);
        self.fragments.len() - 1
    }

    /// Rewrites the text of the fragment at `index` in place. Used only by
    /// the whitespace-optimization pass.
    pub(crate) fn set_text(&mut self, index: usize, text: String) {
        self.fragments[index].text = text;
    }

    pub(crate) fn fragment_mut(&mut self, index: usize) -> &mut Fragment {
        &mut self.fragments[index]
    }
}

/// An ordered list of contexts: the evaluator's external deliverable.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Rollout {
    contexts: Vec<Context>,
}

impl Rollout {
    /// Starts with *no* contexts at all — the first one is created lazily,
    /// either by the first `add_frag` (via [`Rollout::ensure_context`]) or
    /// by an explicit leading `Reset` (via [`Rollout::new_context`]).
    /// Pre-populating context 0 here would leave it permanently empty and
    /// unused whenever a template's very first span is a `Reset`, shifting
    /// every real context one index too high.
    #[must_use]
    pub fn new() -> Self {
        Self {
            contexts: Vec::new(),
        }
    }

    #[must_use]
    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }

    /// Starts a new, empty context unconditionally and makes it the active
    /// one, even if no context existed yet (in which case this becomes
    /// context 0).
    pub fn new_context(&mut self) -> usize {
        self.contexts.push(Context::default());
        self.contexts.len() - 1
    }

    /// The active context's index, lazily creating context 0 if no context
    /// exists yet. Unlike [`Rollout::new_context`], this never creates a
    /// context when one is already active.
    fn ensure_context(&mut self) -> usize {
        if self.contexts.is_empty() {
            self.contexts.push(Context::default());
        }
        self.contexts.len() - 1
    }

    /// Appends a fragment to the active (last) context, returning a
    /// [`FragmentRef`] so the caller can record which span produced it.
    pub fn add_frag(&mut self, role: Option<Role>, mask: Mask, text: impl Into<String>) -> FragmentRef {
        let context = self.ensure_context();
        let fragment = self.contexts[context].push(Fragment::new(text, role, mask));
        FragmentRef {
            context,
            fragment,
        }
    }

    pub(crate) fn fragment_ref_mut(&mut self, r: FragmentRef) -> &mut Fragment {
        self.contexts[r.context].fragment_mut(r.fragment)
    }

    pub(crate) fn set_text(&mut self, r: FragmentRef, text: String) {
        self.contexts[r.context].set_text(r.fragment, text);
    }
}
