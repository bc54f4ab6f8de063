//! Prompt templating and truncation

use std::borrow::Cow;

/// Marker placed where a long prompt was cut
pub const TRUNCATION_MARKER: &str = "\n\n... [TRUNCATED FOR LENGTH] ...\n\n";

/// System message sent with every analysis completion
pub const ANALYST_SYSTEM: &str = "You are an expert data analyst and Python programmer. \
You help users analyze data by writing precise, executable Python code. \
Write clean code, include every import you use, and answer exactly the question asked.";

/// Prompt template with `{name}` placeholders
///
/// Unknown placeholders are left untouched, so literal braces in templates
/// (JSON examples) survive rendering.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate(&'static str);

impl PromptTemplate {
    #[inline]
    #[must_use]
    pub const fn new(text: &'static str) -> Self {
        Self(text)
    }

    /// Substitute `{name}` for each `(name, value)` pair
    #[must_use]
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        let mut out = String::with_capacity(self.0.len());
        let mut rest = self.0;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let tail = &rest[open + 1..];
            let matched = tail.find('}').and_then(|close| {
                let key = &tail[..close];
                vars.iter()
                    .find(|(name, _)| *name == key)
                    .map(|(_, value)| (close, *value))
            });
            match matched {
                Some((close, value)) => {
                    out.push_str(value);
                    rest = &tail[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = tail;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Cut `prompt` to roughly `max_chars` characters, keeping head and tail
///
/// Counts characters, not bytes, so multi-byte text is never split.
#[must_use]
pub fn truncate_prompt(prompt: &str, max_chars: usize) -> Cow<'_, str> {
    let total = prompt.chars().count();
    if total <= max_chars {
        return Cow::Borrowed(prompt);
    }

    let keep = max_chars / 2;
    let head_end = prompt
        .char_indices()
        .nth(keep)
        .map_or(prompt.len(), |(i, _)| i);
    let tail_start = prompt
        .char_indices()
        .nth(total - keep)
        .map_or(prompt.len(), |(i, _)| i);

    let mut out =
        String::with_capacity(head_end + TRUNCATION_MARKER.len() + prompt.len() - tail_start);
    out.push_str(&prompt[..head_end]);
    out.push_str(TRUNCATION_MARKER);
    out.push_str(&prompt[tail_start..]);

    tracing::warn!(
        from_chars = total,
        to_chars = out.chars().count(),
        "prompt truncated"
    );
    Cow::Owned(out)
}
