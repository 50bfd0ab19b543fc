//! The DSL parser: escape-aware scanner, tag lexer, grammar dispatch,
//! indented-body attachment, implicit-role inference, text normalization
//! (§4.1).
//!
//! Deliberately not a regex or `peg`-grammar parser: escape counting needs a
//! backward scan at every candidate `<|`, and indented-body collection needs
//! to hand line-level control back to a block collector mid-scan, neither of
//! which fits a grammar production cleanly. A single hand-rolled forward
//! pass, using `memchr` to jump between candidate `<` bytes, does both.

use memchr::memchr_iter;

use crate::config::Configuration;
use crate::error::{ParseError, Result};
use crate::span::{Args, Role, Span, SpanId, SpanIdGen, SpanKind, Template};

/// Compiles DSL source text into a [`Template`].
pub struct Parser<'a> {
    config: &'a Configuration,
    ids: SpanIdGen,
}

impl<'a> Parser<'a> {
    #[must_use]
    pub fn new(config: &'a Configuration) -> Self {
        Self {
            config,
            ids: SpanIdGen::default(),
        }
    }

    /// Parses `source` (a whole file) into a named [`Template`].
    pub fn parse(&mut self, source: &str, name: impl Into<String>) -> Result<Template> {
        let filtered = filter_comments(source);
        let spans = self.parse_level(&filtered)?;
        Ok(Template::new(name, spans))
    }

    /// Parses one level of the span tree — either the whole (comment-
    /// filtered) file, or a dedented class body — returning its fully
    /// normalized span list.
    fn parse_level(&mut self, source: &str) -> Result<Vec<Span>> {
        let raw = self.scan(source)?;
        finalize_roles(raw, &mut self.ids)
    }

    /// The forward scan: produces `Text`, `Ego`, `Reset`, `Obj`, `Class`, and
    /// `Sample` spans in source order, with indented-body attachment for
    /// `Class` spans, but *before* implicit-role insertion/coalescing and
    /// text normalization — those run once over the whole list afterward.
    fn scan(&mut self, source: &str) -> Result<Vec<Span>> {
        let mut spans = Vec::new();
        let mut pos = 0;

        while pos < source.len() {
            let Some(tag_start) = next_unescaped_tag(source, pos) else {
                push_text(&mut spans, &mut self.ids, pos, &decode_escapes(&source[pos..]));
                break;
            };

            if tag_start > pos {
                push_text(
                    &mut spans,
                    &mut self.ids,
                    pos,
                    &decode_escapes(&source[pos..tag_start]),
                );
            }

            let body_start = tag_start + 2;
            let Some(rel_end) = source[body_start..].find("|>") else {
                return Err(ParseError::UnclosedTag { start: tag_start }.into());
            };
            let tag_body = &source[body_start..body_start + rel_end];
            let after_tag = body_start + rel_end + 2;

            let tokens = shlex(tag_body)
                .map_err(|()| ParseError::QuoteError { start: tag_start })?;

            pos = after_tag;
            if tokens.is_empty() {
                continue;
            }

            let (base, handle) = split_handle(&tokens[0]);
            let args = classify_args(self.config, &tokens[1..], tag_start)?;

            let kinds = dispatch(self.config, base, handle.clone(), &args);

            for (idx, kind) in kinds.into_iter().enumerate() {
                let id = self.ids.next();
                let is_class = matches!(kind, SpanKind::Class { .. });
                let mut span = Span {
                    id,
                    kind,
                    args: args.clone(),
                    start: tag_start,
                };

                if is_class && idx == 0 {
                    let (body, consumed) = self.collect_indented_body(source, pos)?;
                    if let SpanKind::Class { body: slot, .. } = &mut span.kind {
                        *slot = body.map(Box::new);
                    }
                    pos += consumed;
                }

                spans.push(span);
            }
        }

        Ok(spans)
    }

    /// After a `Class` tag ending at `pos` (immediately past its `|>`),
    /// looks for an indented block to attach as the class's body. Returns
    /// the parsed sub-template (if any) and how many bytes of `source`
    /// (starting at `pos`) it consumed.
    fn collect_indented_body(&mut self, source: &str, pos: usize) -> Result<(Option<Template>, usize)> {
        let rest = &source[pos..];

        // Only the tag's own line may contain nothing else before its
        // newline for a body to attach; trailing content on the same line
        // means there is no body and the normal scan just continues.
        let line_end = rest.find('\n').unwrap_or(rest.len());
        if !rest[..line_end].trim().is_empty() {
            return Ok((None, 0));
        }
        if line_end == rest.len() {
            return Ok((None, 0));
        }

        let after_newline = line_end + 1;
        let mut lines: Vec<(usize, &str)> = Vec::new();
        let mut cursor = after_newline;
        loop {
            let line_len = rest[cursor..].find('\n').unwrap_or(rest.len() - cursor);
            lines.push((cursor, &rest[cursor..cursor + line_len]));
            cursor += line_len;
            if cursor >= rest.len() {
                break;
            }
            cursor += 1; // skip the newline
        }

        let Some(first_idx) = lines.iter().position(|(_, l)| !l.trim().is_empty()) else {
            return Ok((None, 0));
        };
        let indent = leading_spaces(lines[first_idx].1);
        if indent == 0 {
            return Ok((None, 0));
        }

        let mut body_lines = Vec::new();
        let mut consumed_end = after_newline;
        for (offset, line) in &lines[first_idx..] {
            if line.trim().is_empty() {
                body_lines.push(String::new());
                consumed_end = offset + line.len();
                continue;
            }
            let this_indent = leading_spaces(line);
            if this_indent < indent {
                break;
            }
            body_lines.push(dedent(line, indent));
            consumed_end = offset + line.len();
        }

        let body_text = body_lines.join("\n");
        let consumed = consumed_end - pos;
        let spans = self.scan(&body_text)?;
        let spans = finalize_roles(spans, &mut self.ids)?;
        Ok((Some(Template::new("<body>", spans)), consumed))
    }
}

fn push_text(spans: &mut Vec<Span>, ids: &mut SpanIdGen, start: usize, text: &str) {
    if text.is_empty() {
        return;
    }
    spans.push(Span {
        id: ids.next(),
        kind: SpanKind::Text {
            text: text.to_string(),
        },
        args: Args::default(),
        start,
    });
}

fn leading_spaces(line: &str) -> usize {
    line.chars().take_while(|c| *c == ' ').count()
}

fn dedent(line: &str, n: usize) -> String {
    if line.len() < n {
        String::new()
    } else {
        line[n..].to_string()
    }
}

/// Finds the next unescaped `<|` at or after `from`. A `<|` is escaped iff
/// preceded by an odd number of backslashes.
fn next_unescaped_tag(source: &str, from: usize) -> Option<usize> {
    let bytes = source.as_bytes();
    for i in memchr_iter(b'<', &bytes[from..]) {
        let i = from + i;
        if bytes.get(i + 1) != Some(&b'|') {
            continue;
        }
        let mut backslashes = 0;
        let mut j = i;
        while j > 0 && bytes[j - 1] == b'\\' {
            backslashes += 1;
            j -= 1;
        }
        if backslashes % 2 == 0 {
            return Some(i);
        }
    }
    None
}

/// Decodes `\\` -> `\` and `\<|` -> `<|`; no other escapes are recognized.
fn decode_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some((_, '\\')) => {
                out.push('\\');
                chars.next();
            }
            Some((j, '<')) if text[j..].starts_with("<|") => {
                out.push_str("<|");
                chars.next();
                chars.next();
            }
            _ => out.push('\\'),
        }
    }
    out
}

/// Shell-style quoting split: whitespace-separated tokens, single- and
/// double-quoted substrings allowed. Fails on a mismatched quote.
fn shlex(input: &str) -> core::result::Result<Vec<String>, ()> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut token = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            match c {
                '\'' | '"' => {
                    let quote = c;
                    chars.next();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == quote {
                            closed = true;
                            break;
                        }
                        token.push(c);
                    }
                    if !closed {
                        return Err(());
                    }
                }
                _ => {
                    token.push(c);
                    chars.next();
                }
            }
        }
        tokens.push(token);
    }

    Ok(tokens)
}

/// Splits a base token on its first `:` into `(base, Some(id))`, or
/// `(base, None)` if there is none.
fn split_handle(base: &str) -> (&str, Option<String>) {
    match base.split_once(':') {
        Some((base, id)) => (base, Some(id.to_string())),
        None => (base, None),
    }
}

/// Classifies the tokens after the base into positional `kargs` and keyword
/// `kwargs`.
fn classify_args(config: &Configuration, tokens: &[String], tag_start: usize) -> Result<Args> {
    let mut args = Args::default();
    for token in tokens {
        if let Some(value) = token.strip_prefix(config.angle_attr_key) {
            if value.is_empty() {
                return Err(ParseError::EmptyAngleAttr { start: tag_start }.into());
            }
            args.kwargs
                .insert(config.angle_attr_key.to_string(), value.to_string());
        } else if let Some((key, value)) = token.split_once('=') {
            args.kwargs.insert(key.to_string(), value.to_string());
        } else {
            args.kargs.push(token.clone());
        }
    }
    Ok(args)
}

/// Grammar dispatch on the base string: returns one span kind, or two for
/// the ego+sample combination.
///
/// The ego+sample combination is not gated on `base` being one of the three
/// canonical ego sigils: any base carrying a `fence`/`<>` kwarg is an ego
/// tag, with `base` itself standing in as a raw role name when it isn't one
/// of the known sigils (`<|think:result <>reasoning|>` sets the role to
/// `Raw("think")`, not an object injection).
fn dispatch(config: &Configuration, base: &str, handle: Option<String>, args: &Args) -> Vec<SpanKind> {
    if let Some(fence) = sample_fence(config, args) {
        let role = ego_role(config, base).unwrap_or_else(|| Role::Raw(base.to_string()));
        return vec![
            SpanKind::Ego {
                role,
                handle: handle.clone(),
            },
            SpanKind::Sample {
                fence: Some(fence),
                payload_id: handle,
            },
        ];
    }

    if let Some(role) = ego_role(config, base) {
        return vec![SpanKind::Ego { role, handle }];
    }

    if config.reset_sigils.contains(base) {
        return vec![SpanKind::Reset {
            train: base == config.train_sigil,
        }];
    }

    if base.starts_with(|c: char| c.is_ascii_uppercase()) {
        return vec![SpanKind::Class {
            class_name: base.to_string(),
            body: None,
        }];
    }

    vec![SpanKind::Obj {
        var_ids: base.split('|').map(str::to_string).collect(),
    }]
}

fn ego_role(config: &Configuration, base: &str) -> Option<Role> {
    match *config.ego_sigils.get(base)? {
        "user" => Some(Role::User),
        "assistant" => Some(Role::Assistant),
        "system" => Some(Role::System),
        _ => None,
    }
}

/// The fence name for an accompanying `Sample` span, if `args` carries a
/// `fence` kwarg or the `<>` attribute.
fn sample_fence(config: &Configuration, args: &Args) -> Option<String> {
    args.kwarg("fence")
        .or_else(|| args.kwarg(config.angle_attr_key))
        .map(str::to_string)
}

/// Strips any line whose first non-whitespace character is `#`, replacing
/// it with an empty line (preserving line count for the indentation-body
/// scan). Other `#` occurrences are preserved.
fn filter_comments(source: &str) -> String {
    source
        .split('\n')
        .map(|line| {
            if line.trim_start().starts_with('#') {
                ""
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Applies implicit-ego insertion, ego coalescing, reset-clears-role, and
/// text normalization over one level's raw span list.
///
/// A `Class` span that would be emitted with no role established raises
/// `NoRoleForSpan` rather than getting an implicit ego the way `Obj` and
/// `Sample` do: a bound object's output goes straight into the rollout with
/// no further framing, so its role can't be left to a default the way a
/// plain injected value or sample can.
fn finalize_roles(spans: Vec<Span>, ids: &mut SpanIdGen) -> Result<Vec<Span>> {
    let mut out: Vec<Span> = Vec::with_capacity(spans.len());
    let mut established = false;

    for span in spans {
        match &span.kind {
            SpanKind::Ego { role, .. } => {
                if let Some(SpanKind::Ego { role: prev, .. }) = out.last().map(|s| &s.kind)
                    && prev == role
                {
                    established = true;
                    continue;
                }
                established = true;
                out.push(span);
            }
            SpanKind::Reset { .. } => {
                established = false;
                out.push(span);
            }
            SpanKind::Obj { .. } | SpanKind::Sample { .. } => {
                if !established {
                    out.push(implicit_system_ego(ids, span.start));
                    established = true;
                }
                out.push(span);
            }
            SpanKind::Class { .. } => {
                if !established {
                    return Err(ParseError::NoRoleForSpan { start: span.start }.into());
                }
                out.push(span);
            }
            SpanKind::Text { .. } => out.push(span),
        }
    }

    Ok(normalize_text(out))
}

fn implicit_system_ego(ids: &mut SpanIdGen, start: usize) -> Span {
    Span {
        id: ids.next(),
        kind: SpanKind::Ego {
            role: Role::System,
            handle: None,
        },
        args: Args::default(),
        start,
    }
}

/// Merges consecutive `Text` spans, strips the leading whitespace of a
/// `Text` span that immediately follows a non-text span, and discards
/// purely-whitespace `Text` spans.
fn normalize_text(spans: Vec<Span>) -> Vec<Span> {
    let mut out: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans {
        let SpanKind::Text { text } = &span.kind else {
            out.push(span);
            continue;
        };

        let mut text = text.clone();
        if !matches!(out.last().map(|s| &s.kind), Some(SpanKind::Text { .. })) {
            text = text.trim_start().to_string();
        }

        if let Some(last) = out.last_mut()
            && let SpanKind::Text { text: prev } = &mut last.kind
        {
            prev.push_str(&text);
            continue;
        }

        if text.trim().is_empty() {
            continue;
        }

        out.push(Span {
            id: span.id,
            kind: SpanKind::Text { text },
            args: span.args,
            start: span.start,
        });
    }
    out
}
