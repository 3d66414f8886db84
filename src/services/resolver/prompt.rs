// Instruction sent upstream: every spine's OCR candidates in one batch

use crate::core::types::OcrCandidateSet;
use std::fmt::Write;

const INSTRUCTIONS: &str = r#"Your task:
1. Infer the correct book titles and authors from the OCR text. Each spine may have several noisy fragments; combine them.
2. For each book detected, return a JSON array with objects containing:
   - "title" (string): The book title
   - "ISBN" (string): ISBN if found, otherwise "N/A"
   - "author" (string): The author name
   - "description" (string): A brief description of the book

CRITICAL OUTPUT REQUIREMENTS:
- You MUST respond with ONLY valid JSON, no other text.
- Start your response with [ and end with ]
- Do NOT use markdown code blocks (no ```json or ```)
- Do NOT include any explanatory text before or after the JSON
- Use double quotes for all strings
- If no books are found, return an empty array: []
- Example format: [{"title": "Book Title", "ISBN": "1234567890", "author": "Author Name", "description": "Book description"}]

Now return the JSON array:
"#;

/// Render all candidate sets, grouped by spine, into a single prompt
pub fn build_prompt(candidate_sets: &[OcrCandidateSet]) -> String {
    let mut prompt = String::from("You are given OCR predictions extracted from book spines:\n\n");

    for (i, set) in candidate_sets.iter().enumerate() {
        let _ = write!(prompt, "Spine {}:", i + 1);
        if set.is_empty() {
            prompt.push_str(" (no text read)");
        }
        for (j, candidate) in set.iter().enumerate() {
            let sep = if j == 0 { " " } else { ", " };
            // JSON-quote so stray quotes in OCR text can't break the listing
            let quoted = serde_json::to_string(&candidate.text)
                .unwrap_or_else(|_| format!("\"{}\"", candidate.text));
            let _ = write!(prompt, "{}{} ({:.2})", sep, quoted, candidate.confidence);
        }
        prompt.push('\n');
    }

    prompt.push('\n');
    prompt.push_str(INSTRUCTIONS);
    prompt
}
