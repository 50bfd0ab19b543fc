//! The evaluator's per-run state carrier.
//!
//! The source models this as a thin façade over the rollout that delegates
//! unknown attribute access down to whichever inner object happens to have
//! it (`__getattr__`/`__setattr__`). That pattern has no static-typing
//! equivalent worth chasing, so here `Phore` just owns the rollout plus its
//! own evaluation-only bookkeeping behind plain methods.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde_json::Value;

use crate::bound::SharedBound;
use crate::context::{FragmentRef, Rollout};
use crate::fragment::Mask;
use crate::span::{Role, SpanId};

/// Per-evaluation runtime state.
pub struct Phore {
    /// The rollout being built. Public because `Obj`/`Sample`/`Text`
    /// dispatch append to it directly via [`Phore::add_frag`] and
    /// [`Phore::new_context`]; exposing the underlying rollout too lets a
    /// caller inspect partial results if evaluation aborts.
    pub rollout: Rollout,

    /// Free variables visible to `Obj` lookups and bound-object hooks.
    pub env: IndexMap<String, Value>,

    current_role: Role,
    active_span: Option<SpanId>,
    span_bindings: HashMap<SpanId, SharedBound>,
    span_fragments: HashMap<SpanId, Vec<FragmentRef>>,
    template_stack: Vec<String>,
    errors: u32,
}

impl Phore {
    #[must_use]
    pub fn new(env: IndexMap<String, Value>) -> Self {
        Self {
            rollout: Rollout::new(),
            env,
            current_role: Role::System,
            active_span: None,
            span_bindings: HashMap::new(),
            span_fragments: HashMap::new(),
            template_stack: Vec::new(),
            errors: 0,
        }
    }

    #[must_use]
    pub fn current_role(&self) -> &Role {
        &self.current_role
    }

    pub(crate) fn set_current_role(&mut self, role: Role) {
        self.current_role = role;
    }

    #[must_use]
    pub fn active_span(&self) -> Option<SpanId> {
        self.active_span
    }

    pub(crate) fn set_active_span(&mut self, id: SpanId) {
        self.active_span = Some(id);
    }

    /// Starts a new context and resets the current role to `system`, per
    /// the `Reset` dispatch rule.
    pub(crate) fn reset_context(&mut self) {
        self.rollout.new_context();
        self.current_role = Role::System;
    }

    /// Appends a fragment to the active context under the current role and
    /// records it against `span` for the whitespace-optimization pass.
    pub(crate) fn add_frag(&mut self, span: SpanId, mask: Mask, text: impl Into<String>) {
        let role = Some(self.current_role.clone());
        let frag_ref = self.rollout.add_frag(role, mask, text);
        self.span_fragments.entry(span).or_default().push(frag_ref);
    }

    #[must_use]
    pub fn fragments_of(&self, span: SpanId) -> &[FragmentRef] {
        self.span_fragments.get(&span).map_or(&[], Vec::as_slice)
    }

    pub(crate) fn bind(&mut self, span: SpanId, instance: SharedBound) {
        self.span_bindings.insert(span, instance);
    }

    #[must_use]
    pub fn binding(&self, span: SpanId) -> Option<SharedBound> {
        self.span_bindings.get(&span).cloned()
    }

    pub(crate) fn push_template(&mut self, name: String) {
        self.template_stack.push(name);
    }

    pub(crate) fn pop_template(&mut self) {
        self.template_stack.pop();
    }

    #[must_use]
    pub fn template_stack(&self) -> &[String] {
        &self.template_stack
    }

    pub(crate) fn record_error(&mut self) {
        self.errors += 1;
    }

    #[must_use]
    pub fn errors(&self) -> u32 {
        self.errors
    }
}
