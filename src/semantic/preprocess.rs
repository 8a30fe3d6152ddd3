//! Searchable-text composition for embedding input.
//!
//! Every item carries one canonical lowercase string assembled from its
//! text-bearing fields; it is the sole input to the embedding function and
//! is recomposed whenever a contributing field changes.

/// Maximum searchable-text length in characters
const MAX_SEARCHABLE_LENGTH: usize = 4096;

/// The fields that contribute to an item's searchable text, in the order
/// they are concatenated.
#[derive(Debug, Clone, Default)]
pub struct SearchableParts<'a> {
    pub title: &'a str,
    pub content: Option<&'a str>,
    pub filename: Option<&'a str>,
    pub extracted_text: Option<&'a str>,
    pub caption: Option<&'a str>,
    pub llm_title: Option<&'a str>,
    pub llm_keywords: Option<&'a [String]>,
    pub llm_summary: Option<&'a str>,
}

/// Compose the canonical searchable text: lowercase, whitespace-normalised,
/// bounded concatenation of the contributing fields.
pub fn compose_searchable_text(parts: &SearchableParts) -> String {
    let mut sections: Vec<String> = Vec::with_capacity(8);

    push_section(&mut sections, parts.title);
    if let Some(content) = parts.content {
        push_section(&mut sections, content);
    }
    if let Some(filename) = parts.filename {
        push_section(&mut sections, filename);
    }
    if let Some(extracted) = parts.extracted_text {
        push_section(&mut sections, extracted);
    }
    if let Some(caption) = parts.caption {
        push_section(&mut sections, caption);
    }
    if let Some(llm_title) = parts.llm_title {
        push_section(&mut sections, llm_title);
    }
    if let Some(keywords) = parts.llm_keywords {
        push_section(&mut sections, &keywords.join(" "));
    }
    if let Some(summary) = parts.llm_summary {
        push_section(&mut sections, summary);
    }

    truncate(&sections.join(" "))
}

fn push_section(sections: &mut Vec<String>, raw: &str) {
    let cleaned = sanitize(raw);
    if !cleaned.is_empty() {
        sections.push(cleaned);
    }
}

/// Lowercase and collapse runs of whitespace to single spaces.
fn sanitize(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncate(content: &str) -> String {
    if content.chars().count() <= MAX_SEARCHABLE_LENGTH {
        return content.to_string();
    }
    content.chars().take(MAX_SEARCHABLE_LENGTH).collect()
}
