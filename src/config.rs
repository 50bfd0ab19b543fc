//! Parser configuration: the sigil tables the grammar dispatch rule reads,
//! injected rather than hardcoded so an embedder can extend the DSL without
//! forking the scanner.

use phf::{Map, Set, phf_map, phf_set};

/// Ego sigils (mapped to the role name they set), reset sigils, the sigil
/// that additionally sets `train = true`, and the `<>` attribute key name.
///
/// A `Default` impl supplies the DSL's standard table; most callers never
/// need to construct one of these by hand.
#[derive(Clone, Copy, Debug)]
pub struct Configuration {
    /// Maps an ego sigil (`o_o`, `@_@`, `x_x`) to the role name it sets
    /// (`"user"`, `"assistant"`, `"system"`).
    pub ego_sigils: Map<&'static str, &'static str>,

    /// Sigils recognized as a `Reset` span. All but [`Configuration::train_sigil`]
    /// set `train = false`.
    pub reset_sigils: Set<&'static str>,

    /// The one reset sigil that sets `train = true`.
    pub train_sigil: &'static str,

    /// The kwarg key that also introduces a `Sample` span's fence, besides
    /// the literal `fence=` kwarg.
    pub angle_attr_key: &'static str,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            ego_sigils: EGO_SIGILS,
            reset_sigils: RESET_SIGILS,
            train_sigil: "+++",
            angle_attr_key: "<>",
        }
    }
}

static EGO_SIGILS: Map<&'static str, &'static str> = phf_map! {
    "o_o" => "user",
    "@_@" => "assistant",
    "x_x" => "system",
};

/// Reset sigils. `+++` is the only one that sets `train = true`; the rest
/// are accepted and treated identically to `===` (§9 Open Question: the
/// source never differentiates them further).
static RESET_SIGILS: Set<&'static str> = phf_set! {
    "+++", "===", "---", "^^^", "###", "@@@", "\"\"\"", "***", "%%%",
};
