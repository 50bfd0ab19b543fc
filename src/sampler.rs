//! The external sampler collaborator (§6).

use crate::context::Rollout;

/// An LLM completion sampler, opaque to the evaluator beyond this single
/// method. `None` or an empty string is treated as a failed sample.
pub trait Sampler {
    fn sample(&mut self, rollout: &Rollout, stop_sequences: &[String]) -> Option<String>;
}

/// A sampler that always fails. Useful as a placeholder when a template has
/// no `Sample` spans, or in tests that assert a particular span is never
/// reached.
#[derive(Debug, Default)]
pub struct NullSampler;

impl Sampler for NullSampler {
    fn sample(&mut self, _rollout: &Rollout, _stop_sequences: &[String]) -> Option<String> {
        None
    }
}
