//! The template evaluator: three-phase walk, span dispatch, whitespace
//! optimization, and think-tag collapsing (§4.2–§4.3).

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::bound::{ClassDef, ClassRegistry, SharedBound};
use crate::error::{EvalError, Result};
use crate::fragment::Mask;
use crate::phore::Phore;
use crate::sampler::Sampler;
use crate::span::{Span, SpanKind, Template};

/// Walks a [`Template`] against a [`Phore`], calling out to a
/// [`ClassRegistry`] to resolve `Class` spans and a [`Sampler`] to resolve
/// `Sample` spans.
///
/// One evaluator is built per evaluation; it borrows its collaborators for
/// the duration of the walk and carries no state of its own between calls.
pub struct Evaluator<'a> {
    registry: &'a dyn ClassRegistry,
    sampler: &'a mut dyn Sampler,
}

impl<'a> Evaluator<'a> {
    #[must_use]
    pub fn new(registry: &'a dyn ClassRegistry, sampler: &'a mut dyn Sampler) -> Self {
        Self { registry, sampler }
    }

    /// Evaluates `template` against a fresh [`Phore`] seeded with `env`,
    /// returning the completed rollout or an error.
    pub fn evaluate(
        &mut self,
        template: &Template,
        env: indexmap::IndexMap<String, Value>,
    ) -> Result<crate::context::Rollout> {
        let mut phore = Phore::new(env);
        phore.push_template(template.name.clone());
        self.walk(template, &mut phore)?;
        phore.pop_template();

        let mut class_spans = Vec::new();
        collect_class_spans(template, &mut class_spans);
        for span in class_spans {
            if let Some(binding) = phore.binding(span.id)
                && binding.borrow().has_holo_end()
            {
                binding.borrow_mut().holo_end(&mut phore, span);
            }
        }

        if phore.errors() > 0 {
            log::error!("evaluation finished with {} unrecovered error(s)", phore.errors());
            return Err(EvalError::EvaluationFailed(phore.errors()).into());
        }

        Ok(phore.rollout)
    }

    /// Runs Phase 1 (instantiation) then Phase 2 (main walk) of `template`
    /// against `phore`. Does not run Phase 3: finalization happens exactly
    /// once, at the top of [`Evaluator::evaluate`], over every binding
    /// accumulated across the whole template tree (span ids are unique
    /// across nested bodies, so this also covers sub-templates walked here).
    fn walk(&mut self, template: &Template, phore: &mut Phore) -> Result<()> {
        self.instantiate(template, phore)?;
        self.main_walk(template, phore)?;
        Ok(())
    }

    /// Phase 1: resolve and bind every `Class` span's target.
    fn instantiate(&mut self, template: &Template, phore: &mut Phore) -> Result<()> {
        for span in &template.spans {
            let SpanKind::Class { class_name, .. } = &span.kind else {
                continue;
            };

            let def = self
                .registry
                .lookup(class_name)
                .ok_or_else(|| EvalError::ClassNotFound {
                    name: class_name.clone(),
                    span: span.id,
                })?;

            let bound: SharedBound = match def {
                ClassDef::Holostatic(shared) => shared.clone(),
                ClassDef::Factory(make) => make(&span.args),
            };
            phore.bind(span.id, bound.clone());

            let replacement = bound.borrow_mut().holo_init(phore, span);
            if let Some(replacement) = replacement {
                phore.bind(span.id, replacement);
            }
        }
        Ok(())
    }

    /// Phase 2: dispatch every span in order, running whitespace
    /// optimization and think-tag collapsing after each.
    fn main_walk(&mut self, template: &Template, phore: &mut Phore) -> Result<()> {
        for (i, span) in template.spans.iter().enumerate() {
            phore.set_active_span(span.id);
            self.dispatch(span, phore)?;
            collapse_think_tags(phore, span.id);
            if i >= 1 {
                optimize_window(template, i, phore);
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, span: &Span, phore: &mut Phore) -> Result<()> {
        log::debug!("dispatching span {} ({:?})", span.id, span.kind);
        match &span.kind {
            SpanKind::Text { text } => {
                phore.add_frag(span.id, Mask::Frozen, text.clone());
            }
            SpanKind::Ego { role, .. } => {
                phore.set_current_role(role.clone());
            }
            SpanKind::Reset { .. } => {
                phore.reset_context();
            }
            SpanKind::Obj { var_ids } => {
                self.dispatch_obj(span, var_ids, phore);
            }
            SpanKind::Class { body, .. } => {
                self.dispatch_class(span, body.as_deref(), phore)?;
            }
            SpanKind::Sample { fence, payload_id } => {
                self.dispatch_sample(span, fence.as_deref(), payload_id.as_deref(), phore);
            }
        }
        Ok(())
    }

    fn dispatch_obj(&mut self, span: &Span, var_ids: &[String], phore: &mut Phore) {
        for var_id in var_ids {
            let Some(value) = phore.env.get(var_id).cloned() else {
                continue;
            };
            let rendered = display_value(&value);
            phore.add_frag(span.id, Mask::Frozen, format!("<obj id={var_id}>"));
            phore.add_frag(span.id, Mask::Frozen, rendered);
            phore.add_frag(span.id, Mask::Frozen, "</obj>");
            phore.add_frag(span.id, Mask::Frozen, "\n");
            break;
        }
    }

    fn dispatch_class(
        &mut self,
        span: &Span,
        body: Option<&Template>,
        phore: &mut Phore,
    ) -> Result<()> {
        let binding = phore
            .binding(span.id)
            .expect("phase 1 binds every class span before phase 2 dispatches it");

        if binding.borrow().has_holo() {
            let text = binding.borrow_mut().holo(phore, span);
            if let Some(text) = text {
                phore.add_frag(span.id, Mask::Frozen, text);
            }
            return Ok(());
        }

        if let Some(body) = body {
            phore.push_template(body.name.clone());
            self.walk(body, phore)?;
            phore.pop_template();
            return Ok(());
        }

        Err(EvalError::EmptyClassSpan(span.id).into())
    }

    fn dispatch_sample(
        &mut self,
        span: &Span,
        fence: Option<&str>,
        payload_id: Option<&str>,
        phore: &mut Phore,
    ) {
        let mut stop_sequences = Vec::new();
        if let Some(fence) = fence {
            phore.add_frag(span.id, Mask::Frozen, format!("<{fence}>"));
            stop_sequences.push(format!("</{fence}>"));
        }

        let sample = self.sampler.sample(&phore.rollout, &stop_sequences);
        let Some(sample) = sample.filter(|s| !s.is_empty()) else {
            log::warn!("sample failed for span {}", span.id);
            phore.record_error();
            return;
        };

        let mut repaired = sample.clone();
        if let Some(fence) = fence {
            let close = format!("</{fence}>");
            if !repaired.ends_with(&close) {
                repaired.push_str(&close);
            }
        }
        phore.add_frag(span.id, Mask::Reinforce, repaired);

        if let Some(id) = payload_id {
            let mut payload = sample.as_str();
            if let Some(fence) = fence {
                if let Some(rest) = payload.strip_prefix(&format!("<{fence}>")) {
                    payload = rest;
                }
                if let Some(rest) = payload.strip_suffix(&format!("</{fence}>")) {
                    payload = rest;
                }
            }
            phore
                .env
                .insert(id.to_string(), Value::String(payload.trim().to_string()));
        }
    }
}

/// Collects every `Class` span in `template`, recursing into nested class
/// bodies, so Phase 3 can finalize bindings regardless of nesting depth.
fn collect_class_spans<'t>(template: &'t Template, out: &mut Vec<&'t Span>) {
    for span in &template.spans {
        if let SpanKind::Class { body, .. } = &span.kind {
            out.push(span);
            if let Some(body) = body {
                collect_class_spans(body, out);
            }
        }
    }
}

/// Renders an `env` value the way `Obj` dispatch needs it: strings pass
/// through unquoted, everything else uses its JSON text form.
fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Whether `text` looks like the output of a tag-block span: either a
/// matching `<tag ...>...</tag>` pair, or a self-opening `<obj id=...>`.
/// Hand-rolled rather than a single backreference regex (the `regex` crate
/// does not support backreferences, and the original's `\1` pattern is
/// exactly that).
fn looks_like_tag_block(text: &str) -> bool {
    static OBJ_OPEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<obj\s+id=").unwrap());
    static OPEN_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<(\w+)[^>]*>").unwrap());

    if OBJ_OPEN.is_match(text) {
        return true;
    }

    let Some(caps) = OPEN_TAG.captures(text) else {
        return false;
    };
    let name = &caps[1];
    text[caps.get(0).unwrap().end()..].contains(&format!("</{name}>"))
}

/// Runs the whitespace-optimization pass for the window ending at main-walk
/// index `i` (0-based): the middle span is `i - 1`. No-op unless the middle
/// span exists and has a predecessor (`i >= 2`... in practice called for
/// every `i >= 1`, but it only does anything once a middle and a
/// predecessor both exist).
///
/// Unconditionally prepends three newlines to the middle span's first
/// fragment and appends three to its last, rather than topping up to a
/// 3-newline boundary. The original's `count_head`/`count_tail` helpers were
/// meant to measure how much padding the neighboring spans already supply so
/// only the shortfall gets added, but `count_head` is implemented identically
/// to `count_tail` (both `rstrip` before counting), so the counted length is
/// always 0 and the "top up" never has anything to subtract from the fixed
/// 3. Matched here rather than "fixed", since several templates in the wild
/// depend on the always-pad-3 behavior and changing it would silently
/// shrink their rendered whitespace.
fn optimize_window(template: &Template, i: usize, phore: &mut Phore) {
    if i < 2 {
        return;
    }
    let middle = &template.spans[i - 1];
    let refs = phore.fragments_of(middle.id).to_vec();
    if refs.is_empty() {
        return;
    }

    let combined: String = refs
        .iter()
        .map(|r| phore.rollout.contexts()[r.context].fragments()[r.fragment].text.as_str())
        .collect();

    if !looks_like_tag_block(&combined) {
        return;
    }
    log::trace!("padding whitespace around span {}", middle.id);

    let first = refs[0];
    let text = {
        let frag = phore.rollout.fragment_ref_mut(first);
        format!("\n\n\n{}", frag.text)
    };
    phore.rollout.set_text(first, text);

    let last = refs[refs.len() - 1];
    let text = {
        let frag = phore.rollout.fragment_ref_mut(last);
        format!("{}\n\n\n", frag.text)
    };
    phore.rollout.set_text(last, text);
}

/// Rewrites any fragment emitted by `span` whose text matches
/// `<think>\s*\n*\s*</think>` to the literal `<think></think>`.
fn collapse_think_tags(phore: &mut Phore, span: crate::span::SpanId) {
    static THINK_EMPTY: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)<think>\s*\n*\s*</think>").unwrap());

    let refs = phore.fragments_of(span).to_vec();
    for r in refs {
        let text = phore.rollout.fragment_ref_mut(r).text.clone();
        if THINK_EMPTY.is_match(&text) {
            let replaced = THINK_EMPTY.replace_all(&text, "<think></think>").into_owned();
            phore.rollout.set_text(r, replaced);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use indexmap::IndexMap;

    use super::*;
    use crate::bound::{BoundObject, EmptyRegistry};
    use crate::config::Configuration;
    use crate::parser::Parser;
    use crate::render::{self, Message};
    use crate::sampler::NullSampler;

    fn parse(source: &str) -> Template {
        let _ = env_logger::try_init();
        Parser::new(&Configuration::default())
            .parse(source, "<test>")
            .unwrap()
    }

    struct MockSampler {
        reply: String,
    }

    impl Sampler for MockSampler {
        fn sample(&mut self, _rollout: &crate::context::Rollout, _stop_sequences: &[String]) -> Option<String> {
            Some(self.reply.clone())
        }
    }

    struct FailingSampler;

    impl Sampler for FailingSampler {
        fn sample(&mut self, _rollout: &crate::context::Rollout, _stop_sequences: &[String]) -> Option<String> {
            None
        }
    }

    #[test]
    fn scenario_simple_text() {
        let template = parse("Hello, world!");
        let mut sampler = NullSampler;
        let mut evaluator = Evaluator::new(&EmptyRegistry, &mut sampler);
        let rollout = evaluator.evaluate(&template, IndexMap::new()).unwrap();
        let messages = render::to_api_messages(&rollout.contexts()[0], false);
        assert_eq!(
            messages,
            vec![Message {
                role: "system".into(),
                content: "Hello, world!".into(),
            }]
        );
    }

    #[test]
    fn scenario_ego_change() {
        let template = parse("<|o_o|>User message.<|@_@|>Assistant response.");
        let mut sampler = NullSampler;
        let mut evaluator = Evaluator::new(&EmptyRegistry, &mut sampler);
        let rollout = evaluator.evaluate(&template, IndexMap::new()).unwrap();
        let messages = render::to_api_messages(&rollout.contexts()[0], false);
        assert_eq!(
            messages,
            vec![
                Message {
                    role: "user".into(),
                    content: "User message.".into(),
                },
                Message {
                    role: "assistant".into(),
                    content: "Assistant response.".into(),
                },
            ]
        );
    }

    #[test]
    fn scenario_object_injection() {
        let template = parse("<|o_o|>Value is <|my_var|>.");
        let mut env = IndexMap::new();
        env.insert("my_var".to_string(), Value::String("injected_value".to_string()));
        let mut sampler = NullSampler;
        let mut evaluator = Evaluator::new(&EmptyRegistry, &mut sampler);
        let rollout = evaluator.evaluate(&template, env).unwrap();
        let messages = render::to_api_messages(&rollout.contexts()[0], false);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].content.contains("<obj id=my_var>injected_value</obj>"));
    }

    #[test]
    fn scenario_cross_context_data_binding() {
        let template = parse(
            "<|+++|><|o_o|>Source.\n<|@_@:compressed <>compress|><|+++|><|o_o|>Injected: <|compressed|>",
        );
        let mut sampler = MockSampler {
            reply: "mocked_sample".to_string(),
        };
        let mut evaluator = Evaluator::new(&EmptyRegistry, &mut sampler);
        let rollout = evaluator.evaluate(&template, IndexMap::new()).unwrap();
        assert_eq!(rollout.contexts().len(), 2);

        let second = render::to_api_messages(&rollout.contexts()[1], false);
        let joined = second.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join(" ");
        assert!(joined.contains("<obj id=compressed>mocked_sample</obj>"));
    }

    #[test]
    fn scenario_reset_reset() {
        let template = parse("<|o_o|>First context.<|+++|>Second context.");
        let mut sampler = NullSampler;
        let mut evaluator = Evaluator::new(&EmptyRegistry, &mut sampler);
        let rollout = evaluator.evaluate(&template, IndexMap::new()).unwrap();
        assert_eq!(rollout.contexts().len(), 2);

        let first = render::to_api_messages(&rollout.contexts()[0], false);
        assert_eq!(
            first,
            vec![Message {
                role: "user".into(),
                content: "First context.".into(),
            }]
        );

        let second = render::to_api_messages(&rollout.contexts()[1], false);
        assert_eq!(
            second,
            vec![Message {
                role: "system".into(),
                content: "Second context.".into(),
            }]
        );
    }

    struct BodyClass;

    impl BoundObject for BodyClass {
        fn holo(&mut self, _phore: &mut Phore, span: &Span) -> Option<String> {
            let SpanKind::Class { body, .. } = &span.kind else {
                return None;
            };
            let first_text = body.as_ref()?.first_text_span()?.text()?.to_string();
            Some(format!("Body text: {first_text}"))
        }

        fn has_holo(&self) -> bool {
            true
        }
    }

    struct BodyRegistry {
        body: ClassDef,
    }

    impl BodyRegistry {
        fn new() -> Self {
            Self {
                body: ClassDef::factory(|_args| -> SharedBound { Rc::new(RefCell::new(BodyClass)) }),
            }
        }
    }

    impl ClassRegistry for BodyRegistry {
        fn lookup(&self, name: &str) -> Option<&ClassDef> {
            (name == "Body").then_some(&self.body)
        }
    }

    #[test]
    fn scenario_class_with_body() {
        let template = parse("<|o_o|>\n<|Body|>\n    I am a body.");
        let registry = BodyRegistry::new();
        let mut sampler = NullSampler;
        let mut evaluator = Evaluator::new(&registry, &mut sampler);
        let rollout = evaluator.evaluate(&template, IndexMap::new()).unwrap();
        let messages = render::to_api_messages(&rollout.contexts()[0], false);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].content.contains("Body text: I am a body."));
    }

    struct ThingClass;

    impl BoundObject for ThingClass {
        fn holo(&mut self, _phore: &mut Phore, _span: &Span) -> Option<String> {
            Some("\n\n\n\n<obj id=x>v</obj>".to_string())
        }

        fn has_holo(&self) -> bool {
            true
        }
    }

    struct ThingRegistry(ClassDef);

    impl ThingRegistry {
        fn new() -> Self {
            Self(ClassDef::factory(|_args| -> SharedBound { Rc::new(RefCell::new(ThingClass)) }))
        }
    }

    impl ClassRegistry for ThingRegistry {
        fn lookup(&self, name: &str) -> Option<&ClassDef> {
            (name == "Thing").then_some(&self.0)
        }
    }

    #[test]
    fn whitespace_optimization_always_adds_three_newlines_even_with_pre_existing_padding() {
        let template = parse("<|o_o|>A<|Thing|>B");
        let registry = ThingRegistry::new();
        let mut sampler = NullSampler;
        let mut evaluator = Evaluator::new(&registry, &mut sampler);
        let rollout = evaluator.evaluate(&template, IndexMap::new()).unwrap();

        let text: String = rollout.contexts()[0]
            .fragments()
            .iter()
            .map(|f| f.text.as_str())
            .collect();
        let tag_pos = text.find("<obj id=x>").unwrap();
        let leading_newlines = text[..tag_pos].chars().rev().take_while(|c| *c == '\n').count();
        assert_eq!(leading_newlines, 7, "4 pre-existing + 3 unconditionally added");

        let after_close = &text[text.find("</obj>").unwrap() + "</obj>".len()..];
        let trailing_newlines = after_close.chars().take_while(|c| *c == '\n').count();
        assert_eq!(trailing_newlines, 3);
    }

    struct Counter {
        calls: Rc<Cell<u32>>,
    }

    impl BoundObject for Counter {
        fn holo_end(&mut self, _phore: &mut Phore, _span: &Span) {
            self.calls.set(self.calls.get() + 1);
        }

        fn has_holo_end(&self) -> bool {
            true
        }
    }

    struct CounterRegistry(ClassDef);

    impl ClassRegistry for CounterRegistry {
        fn lookup(&self, name: &str) -> Option<&ClassDef> {
            (name == "Counter").then_some(&self.0)
        }
    }

    #[test]
    fn holo_end_invoked_exactly_once() {
        let template = parse("<|o_o|>\n<|Counter|>\n    noop");
        let calls = Rc::new(Cell::new(0u32));
        let shared: SharedBound = Rc::new(RefCell::new(Counter { calls: calls.clone() }));
        let registry = CounterRegistry(ClassDef::Holostatic(shared));

        let mut sampler = NullSampler;
        let mut evaluator = Evaluator::new(&registry, &mut sampler);
        evaluator.evaluate(&template, IndexMap::new()).unwrap();

        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn sample_failure_surfaces_as_evaluation_failed() {
        let template = parse("<|@_@ <>think|>");
        let mut sampler = FailingSampler;
        let mut evaluator = Evaluator::new(&EmptyRegistry, &mut sampler);
        let err = evaluator.evaluate(&template, IndexMap::new()).unwrap_err();
        assert!(matches!(err, crate::error::Error::Eval(EvalError::EvaluationFailed(1))));
    }

    #[test]
    fn sample_with_id_and_fence_strips_delimiters_into_env() {
        let template = parse("<|@_@:compressed <>compress|>");
        let mut sampler = MockSampler {
            reply: "the gist".to_string(),
        };
        let mut evaluator = Evaluator::new(&EmptyRegistry, &mut sampler);

        let mut phore = Phore::new(IndexMap::new());
        phore.push_template(template.name.clone());
        evaluator.walk(&template, &mut phore).unwrap();

        assert_eq!(
            phore.env.get("compressed"),
            Some(&Value::String("the gist".to_string()))
        );
    }

    #[test]
    fn think_tag_collapsing_normalizes_empty_think_block() {
        let template = parse("<|@_@ <>think|>");
        let mut sampler = MockSampler {
            reply: "<think>\n   \n</think>".to_string(),
        };
        let mut evaluator = Evaluator::new(&EmptyRegistry, &mut sampler);
        let rollout = evaluator.evaluate(&template, IndexMap::new()).unwrap();
        let messages = render::to_api_messages(&rollout.contexts()[0], false);
        assert!(messages[0].content.contains("<think></think>"));
    }

    #[test]
    fn trained_contexts_counts_from_reset_encounter_order() {
        let template = parse("<|+++|><|o_o|>A.<|===|>B.<|+++|>C.");
        assert_eq!(template.trained_contexts(), vec![0, 2]);
    }
}
