use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

const DEFAULT_INSTRUCTIONS: &str = include_str!("../../prompts/fsi_instructions.txt");
const SYSTEM_MESSAGE: &str = "You are a precise, concise classifier. Use British English.";

/// The two messages sent for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct PromptTemplate {
    system: String,
    instructions: String,
    max_chars: usize,
}

impl PromptTemplate {
    pub fn new(instructions: impl Into<String>, max_chars: usize) -> Self {
        Self {
            system: SYSTEM_MESSAGE.to_string(),
            instructions: instructions.into().trim().to_string(),
            max_chars,
        }
    }

    pub fn bundled(max_chars: usize) -> Self {
        Self::new(DEFAULT_INSTRUCTIONS, max_chars)
    }

    /// Instructions from `path`, or the bundled FSI criteria when `None`.
    pub fn load(path: Option<&Path>, max_chars: usize) -> Result<Self> {
        match path {
            Some(p) => {
                let text = fs::read_to_string(p)
                    .with_context(|| format!("Failed to read prompt file {}", p.display()))?;
                Ok(Self::new(text, max_chars))
            }
            None => Ok(Self::bundled(max_chars)),
        }
    }

    pub fn render(&self, document: &str) -> Prompt {
        let text = truncate_head(document.trim(), self.max_chars);
        Prompt {
            system: self.system.clone(),
            user: format!("{}\n\n---\nTEXT:\n{}", self.instructions, text),
        }
    }
}

/// Keep the first `max_chars` characters (not bytes) of `text`.
pub fn truncate_head(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_pos, _)) => &text[..byte_pos],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_counts_characters() {
        assert_eq!(truncate_head("abcdef", 3), "abc");
        assert_eq!(truncate_head("abc", 3), "abc");
        assert_eq!(truncate_head("abc", 10), "abc");
        assert_eq!(truncate_head("", 5), "");
        assert_eq!(truncate_head("żółw ćma", 4), "żółw");
        assert_eq!(truncate_head("abc", 0), "");
    }

    #[test]
    fn render_is_deterministic_and_keeps_the_head() {
        let t = PromptTemplate::new("Classify.", 5);
        let a = t.render("  Hello world  ");
        let b = t.render("  Hello world  ");
        assert_eq!(a, b);
        assert_eq!(a.user, "Classify.\n\n---\nTEXT:\nHello");
        assert!(a.system.contains("classifier"));
    }

    #[test]
    fn bundled_template_asks_for_a_decision() {
        let p = PromptTemplate::bundled(100).render("community fridge");
        assert!(p.user.contains("\"decision\""));
        assert!(p.user.ends_with("TEXT:\ncommunity fridge"));
    }

    #[test]
    fn load_reads_custom_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.txt");
        fs::write(&path, "Reply INCLUDE or EXCLUDE.\n").unwrap();
        let t = PromptTemplate::load(Some(&path), 100).unwrap();
        assert!(t.render("x").user.starts_with("Reply INCLUDE or EXCLUDE.\n\n---"));
        assert!(PromptTemplate::load(Some(&dir.path().join("missing.txt")), 10).is_err());
    }
}
