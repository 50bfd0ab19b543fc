//! The minimal `(text, role, mask)` unit appended to a [`crate::context::Context`].

use serde::{Deserialize, Serialize};

use crate::span::Role;

/// Training mask on a fragment.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mask {
    /// Excluded from the training loss (an input the model should not be
    /// scored on producing).
    Frozen,
    /// Included in the training loss.
    Reinforce,
}

/// One appended unit of a [`crate::context::Context`].
///
/// Serializable so a finished [`crate::context::Rollout`] can be dumped as
/// the training pipeline's on-disk record format.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Fragment {
    pub text: String,
    /// `None` means "inherits context / system default" — only ever
    /// produced by reverse-parsing, never by the forward evaluator, which
    /// always resolves a concrete role before appending.
    pub role: Option<Role>,
    pub mask: Mask,
}

impl Fragment {
    #[must_use]
    pub fn new(text: impl Into<String>, role: Option<Role>, mask: Mask) -> Self {
        Self {
            text: text.into(),
            role,
            mask,
        }
    }
}
