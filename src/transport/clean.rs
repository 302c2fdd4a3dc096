use std::sync::LazyLock;

use regex::Regex;

/// End-of-turn and control tags some models leak into their output.
pub const CONTROL_TAGS: &[&str] = &["<|eot_id|>", "<|eom_id|>", "<|end_of_text|>", "<|im_end|>"];

static DEFAULT_CLEANER: LazyLock<ContentCleaner> = LazyLock::new(|| {
    ContentCleaner::with_tags(CONTROL_TAGS.iter().copied())
        .expect("escaped literal tags always form a valid pattern")
});

#[derive(Debug, Clone)]
pub struct ContentCleaner {
    pattern: Option<Regex>,
    tags: Vec<String>,
}

impl ContentCleaner {
    pub fn with_tags<'a>(tags: impl IntoIterator<Item = &'a str>) -> Result<Self, regex::Error> {
        let tags: Vec<String> = tags
            .into_iter()
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect();
        if tags.is_empty() {
            return Ok(Self {
                pattern: None,
                tags,
            });
        }
        let alternatives: Vec<String> = tags.iter().map(|tag| regex::escape(tag)).collect();
        let pattern = Regex::new(&alternatives.join("|"))?;
        Ok(Self {
            pattern: Some(pattern),
            tags,
        })
    }

    /// Incremental cleaner for text that arrives in pieces.
    pub fn stream(&self) -> StreamCleaner<'_> {
        StreamCleaner {
            cleaner: self,
            pending: String::new(),
        }
    }

    /// Byte offset where a trailing, possibly incomplete tag begins.
    fn partial_tag_start(&self, text: &str) -> usize {
        text.char_indices()
            .map(|(idx, _)| idx)
            .find(|&idx| {
                let tail = &text[idx..];
                self.tags
                    .iter()
                    .any(|tag| tag.len() > tail.len() && tag.starts_with(tail))
            })
            .unwrap_or(text.len())
    }

    /// Removes every tag, repeating until none is left so that removing one
    /// tag cannot splice a new one together.
    pub fn clean(&self, content: &str) -> String {
        let Some(pattern) = &self.pattern else {
            return content.to_string();
        };

        let mut current = content.to_string();
        while pattern.is_match(&current) {
            current = pattern.replace_all(&current, "").into_owned();
        }
        current
    }
}

/// Cleans streamed deltas, holding back a tail that could still grow into a
/// tag once the next delta arrives.
#[derive(Debug)]
pub struct StreamCleaner<'a> {
    cleaner: &'a ContentCleaner,
    pending: String,
}

impl StreamCleaner<'_> {
    /// Returns the text that is safe to show now.
    pub fn push(&mut self, delta: &str) -> String {
        self.pending.push_str(delta);
        let cleaned = self.cleaner.clean(&self.pending);
        let keep_from = self.cleaner.partial_tag_start(&cleaned);
        self.pending = cleaned[keep_from..].to_string();
        cleaned[..keep_from].to_string()
    }

    /// Releases whatever was held back; an unfinished tag is shown as is.
    pub fn finish(self) -> String {
        self.pending
    }
}

pub fn default_cleaner() -> &'static ContentCleaner {
    &DEFAULT_CLEANER
}

pub fn clean_content(content: &str) -> String {
    DEFAULT_CLEANER.clean(content)
}
