//! Rendering a [`Context`] to chat messages and completion-style delimited
//! text, and the reverse direction (§4.4).

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::{RenderError, Result};
use crate::fragment::{Fragment, Mask};
use crate::span::Role;

/// One rendered chat message.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// The normalized role a fragment contributes to message coalescing: one of
/// the three well-known roles, or a custom one passed through verbatim.
fn normalize_role(role: Option<&Role>, is_first: bool) -> String {
    match role {
        Some(Role::System) => "system".to_string(),
        Some(Role::User) => "user".to_string(),
        Some(Role::Assistant) => "assistant".to_string(),
        None if is_first => "system".to_string(),
        _ => "user".to_string(),
    }
}

/// Coalesces `context`'s fragments into chat messages, grouping consecutive
/// fragments whose normalized role is the same.
///
/// With `dry = false` (the normal mode), messages whose stripped content is
/// empty are dropped. `dry = true` keeps them, so that masked scaffolding
/// (FROZEN fragments with no visible text) stays visible for debugging.
///
/// Asymmetric by design: a mid-stream flush (triggered by a role change)
/// strips its buffered content, but the final tail flush after the loop
/// does not — it appends the buffer verbatim. This mirrors the ground
/// truth's own `to_api_messages` (a `.strip()` on the role-change flush, a
/// bare, unstripped buffer on the trailing flush).
#[must_use]
pub fn to_api_messages(context: &Context, dry: bool) -> Vec<Message> {
    let mut messages = Vec::new();
    let mut current_role: Option<String> = None;
    let mut buffer = String::new();

    let mid_flush = |role: &Option<String>, buffer: &mut String, messages: &mut Vec<Message>| {
        let Some(role) = role else { return };
        let content = buffer.trim().to_string();
        if !content.is_empty() || dry {
            messages.push(Message {
                role: role.clone(),
                content,
            });
        }
        buffer.clear();
    };

    for (i, frag) in context.fragments().iter().enumerate() {
        let role = normalize_role(frag.role.as_ref(), i == 0);
        if current_role.as_deref() != Some(role.as_str()) {
            mid_flush(&current_role, &mut buffer, &mut messages);
            current_role = Some(role);
        }
        buffer.push_str(&frag.text);
    }

    if let Some(role) = current_role {
        if !buffer.trim().is_empty() || dry {
            messages.push(Message {
                role,
                content: buffer,
            });
        }
    }

    messages
}

/// Renders `context` as a sequence of `<|im_start|>role\ncontent\n<|im_end|>`
/// blocks joined by newlines.
///
/// If the last raw fragment normalizes to `"assistant"` and has empty text,
/// an open tail `<|im_start|>assistant` is appended (replacing the closed
/// block for that final turn, if `to_api_messages` would have produced one)
/// to cue completion-style sampling.
#[must_use]
pub fn to_completion_string(context: &Context) -> String {
    let messages = to_api_messages(context, false);
    let mut blocks: Vec<String> = messages
        .iter()
        .map(|m| format!("<|im_start|>{}\n{}\n<|im_end|>", m.role, m.content))
        .collect();

    let open_tail = context.fragments().last().is_some_and(|frag: &Fragment| {
        frag.text.is_empty() && normalize_role(frag.role.as_ref(), context.fragments().len() == 1) == "assistant"
    });

    if open_tail {
        if messages.last().is_some_and(|m| m.role == "assistant" && m.content.is_empty()) {
            blocks.pop();
        }
        blocks.push("<|im_start|>assistant".to_string());
    }

    blocks.join("\n")
}

static DELIMITED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<\|im_start\|>(?P<role>[^\n\r]+)\r?\n(?P<content>.*?)\r?\n<\|im_end\|>").unwrap()
});

/// Reverses [`to_completion_string`]'s block form.
pub fn from_delimited_text(text: &str) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    for caps in DELIMITED_BLOCK.captures_iter(text) {
        messages.push(Message {
            role: caps["role"].to_string(),
            content: caps["content"].to_string(),
        });
    }
    if messages.is_empty() {
        return Err(RenderError::NoDelimitedBlocks.into());
    }
    Ok(messages)
}

/// A masking policy used to reconstruct a [`Context`] from already-rendered
/// messages, since rendered text carries no mask information of its own.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AutoMask {
    FreezeAll,
    ReinforceAll,
    ReinforceUser,
    ReinforceAssistant,
}

impl AutoMask {
    fn mask_for(self, role: &str) -> Mask {
        match self {
            AutoMask::FreezeAll => Mask::Frozen,
            AutoMask::ReinforceAll => Mask::Reinforce,
            AutoMask::ReinforceUser if role == "user" => Mask::Reinforce,
            AutoMask::ReinforceAssistant if role == "assistant" => Mask::Reinforce,
            _ => Mask::Frozen,
        }
    }
}

/// Builds a [`Context`] from a list of already-rendered chat messages,
/// applying `mask` to decide each message's training mask.
#[must_use]
pub fn from_api_chat(messages: &[Message], mask: AutoMask) -> Context {
    let mut context = Context::default();
    for message in messages {
        context.push(Fragment::new(
            message.content.clone(),
            Some(Role::from_str(&message.role)),
            mask.mask_for(&message.role),
        ));
    }
    context
}

/// Builds a [`Context`] from completion-style delimited text, applying
/// `mask` to decide each message's training mask.
pub fn from_text(text: &str, mask: AutoMask) -> Result<Context> {
    let messages = from_delimited_text(text)?;
    Ok(from_api_chat(&messages, mask))
}

static XML_TAG_UNCLOSED: &str = r"(?s)<{name}>\s*(.*?)\s*(?:</{name}>|$)";

/// Scans `messages` in reverse for the last message of `role`, then returns
/// the inner text of the last `<name>...</name>` (or unclosed `<name>...`)
/// found in that message.
#[must_use]
pub fn extract_xml_tag(messages: &[Message], name: &str, role: &str) -> Option<String> {
    let message = messages.iter().rev().find(|m| m.role == role)?;
    let pattern = XML_TAG_UNCLOSED.replace("{name}", &regex::escape(name));
    let re = Regex::new(&pattern).ok()?;
    re.captures_iter(&message.content)
        .last()
        .map(|c| c[1].to_string())
}

static JSON_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").unwrap());
static JSON_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\}").unwrap());

/// On the latest message of `role`, returns the body of the first fenced
/// ` ```json ` block; failing that, the first balanced (to one level of
/// nesting) JSON object.
#[must_use]
pub fn extract_markdown_json(messages: &[Message], role: &str) -> Option<String> {
    let message = messages.iter().rev().find(|m| m.role == role)?;
    if let Some(caps) = JSON_FENCE.captures(&message.content) {
        return Some(caps[1].to_string());
    }
    JSON_OBJECT
        .find(&message.content)
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::fragment::Fragment;

    fn push(context: &mut Context, role: Option<Role>, mask: Mask, text: &str) {
        context.push(Fragment::new(text, role, mask));
    }

    #[test]
    fn coalesces_consecutive_same_role_fragments() {
        let mut context = Context::default();
        push(&mut context, Some(Role::User), Mask::Frozen, "Hello");
        push(&mut context, Some(Role::User), Mask::Frozen, ", world!");
        push(&mut context, Some(Role::Assistant), Mask::Reinforce, "Hi there.");

        let messages = to_api_messages(&context, false);
        assert_eq!(
            messages,
            vec![
                Message {
                    role: "user".into(),
                    content: "Hello, world!".into(),
                },
                Message {
                    role: "assistant".into(),
                    content: "Hi there.".into(),
                },
            ]
        );
    }

    #[test]
    fn mid_stream_flush_strips_but_tail_flush_preserves_whitespace() {
        let mut context = Context::default();
        push(&mut context, Some(Role::User), Mask::Frozen, "  padded user  ");
        push(&mut context, Some(Role::Assistant), Mask::Frozen, "  padded assistant  ");

        let messages = to_api_messages(&context, false);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].content, "padded user");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].content, "  padded assistant  ");
    }

    #[test]
    fn empty_messages_dropped_unless_dry() {
        let mut context = Context::default();
        push(&mut context, Some(Role::System), Mask::Frozen, "   ");
        push(&mut context, Some(Role::User), Mask::Frozen, "hi");

        assert_eq!(to_api_messages(&context, false).len(), 1);
        assert_eq!(to_api_messages(&context, true).len(), 2);
    }

    #[test]
    fn null_role_normalizes_to_system_only_at_first_position() {
        let mut context = Context::default();
        push(&mut context, None, Mask::Frozen, "first");
        push(&mut context, None, Mask::Frozen, "second");

        let messages = to_api_messages(&context, false);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "user");
    }

    #[test]
    fn completion_string_round_trips_through_delimited_text() {
        let mut context = Context::default();
        push(&mut context, Some(Role::User), Mask::Frozen, "Hello.");
        push(&mut context, Some(Role::Assistant), Mask::Frozen, "Hi.");

        let rendered = to_completion_string(&context);
        let parsed = from_delimited_text(&rendered).unwrap();
        assert_eq!(parsed, to_api_messages(&context, false));
    }

    #[test]
    fn completion_string_opens_trailing_assistant_turn() {
        let mut context = Context::default();
        push(&mut context, Some(Role::User), Mask::Frozen, "Question?");
        push(&mut context, Some(Role::Assistant), Mask::Frozen, "");

        let rendered = to_completion_string(&context);
        assert!(rendered.ends_with("<|im_start|>assistant"));
        assert!(!rendered.contains("<|im_start|>assistant\n\n<|im_end|>"));
    }

    #[test]
    fn from_delimited_text_fails_with_no_blocks() {
        let err = from_delimited_text("plain text, no blocks").unwrap_err();
        assert!(matches!(err, Error::Render(RenderError::NoDelimitedBlocks)));
    }

    #[test]
    fn from_api_chat_applies_auto_mask_policy() {
        let messages = vec![
            Message {
                role: "user".into(),
                content: "hi".into(),
            },
            Message {
                role: "assistant".into(),
                content: "hello".into(),
            },
        ];
        let context = from_api_chat(&messages, AutoMask::ReinforceAssistant);
        assert_eq!(context.fragments()[0].mask, Mask::Frozen);
        assert_eq!(context.fragments()[1].mask, Mask::Reinforce);
    }

    #[test]
    fn extract_xml_tag_finds_last_closed_tag_in_latest_message() {
        let messages = vec![Message {
            role: "assistant".into(),
            content: "<think>first</think> then <think>second</think>".into(),
        }];
        assert_eq!(
            extract_xml_tag(&messages, "think", "assistant"),
            Some("second".to_string())
        );
    }

    #[test]
    fn extract_xml_tag_handles_unclosed_tail() {
        let messages = vec![Message {
            role: "assistant".into(),
            content: "<answer>42".into(),
        }];
        assert_eq!(extract_xml_tag(&messages, "answer", "assistant"), Some("42".to_string()));
    }

    #[test]
    fn extract_markdown_json_prefers_fenced_block() {
        let messages = vec![Message {
            role: "assistant".into(),
            content: "here:\n```json\n{\"a\": 1}\n```\nand {\"b\": 2}".into(),
        }];
        assert_eq!(
            extract_markdown_json(&messages, "assistant"),
            Some("{\"a\": 1}".to_string())
        );
    }

    #[test]
    fn extract_markdown_json_falls_back_to_balanced_object() {
        let messages = vec![Message {
            role: "assistant".into(),
            content: "the answer is {\"b\": 2} indeed".into(),
        }];
        assert_eq!(
            extract_markdown_json(&messages, "assistant"),
            Some("{\"b\": 2}".to_string())
        );
    }

    #[test]
    fn extract_markdown_json_balances_one_level_of_nesting() {
        let messages = vec![Message {
            role: "assistant".into(),
            content: "the answer is {\"a\": {\"b\": 1}} indeed".into(),
        }];
        assert_eq!(
            extract_markdown_json(&messages, "assistant"),
            Some("{\"a\": {\"b\": 1}}".to_string())
        );
    }
}
