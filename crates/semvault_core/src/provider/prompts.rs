//! Prompt builders for judgment and summary calls.
//!
//! Every list in a prompt is numbered from 1; the parsers in
//! `provider::judgment` rely on that.

pub fn contradiction(statement: &str, other: &str) -> String {
    format!(
        "Do the following two statements contradict each other?\n\
         Statement A: {statement}\n\
         Statement B: {other}\n\
         Answer with a single word: yes or no."
    )
}

pub fn select_children(note_summary: &str, children: &[(String, String)]) -> String {
    let mut prompt = format!(
        "A note must be filed into one or more categories.\n\
         Note summary: {note_summary}\n\
         Categories:\n"
    );
    push_numbered(&mut prompt, children);
    prompt.push_str(
        "Reply with the numbers of every category that fits the note, separated by commas.",
    );
    prompt
}

pub fn leaf_summary(label: &str, note_summaries: &[String]) -> String {
    let mut prompt = format!(
        "Write one sentence describing what the notes in the category `{label}` have in common.\nNotes:\n"
    );
    for (index, summary) in note_summaries.iter().enumerate() {
        prompt.push_str(&format!("{}. {summary}\n", index + 1));
    }
    prompt.push_str("Reply with the sentence only.");
    prompt
}

pub fn internal_summary(label: &str, children: &[(String, String)]) -> String {
    let mut prompt = format!(
        "Write one sentence describing the category `{label}` given its sub-categories.\nSub-categories:\n"
    );
    push_numbered(&mut prompt, children);
    prompt.push_str("Reply with the sentence only.");
    prompt
}

pub fn partition_notes(label: &str, note_summaries: &[String]) -> String {
    let mut prompt = format!(
        "The category `{label}` has grown too large. Split its notes into 2 to 4 thematic groups.\n\
         A note may belong to more than one group.\nNotes:\n"
    );
    for (index, summary) in note_summaries.iter().enumerate() {
        prompt.push_str(&format!("{}. {summary}\n", index + 1));
    }
    prompt.push_str(
        "Reply with JSON only: [{\"label\": \"short topic\", \"members\": [note numbers]}, ...]",
    );
    prompt
}

pub fn group_children(label: &str, children: &[(String, String)]) -> String {
    let mut prompt = format!(
        "The category `{label}` has too many sub-categories. Group them into 2 to 4 broader topics.\n\
         Every sub-category belongs to exactly one group.\nSub-categories:\n"
    );
    push_numbered(&mut prompt, children);
    prompt.push_str(
        "Reply with JSON only: [{\"label\": \"broader topic\", \"members\": [sub-category numbers]}, ...]",
    );
    prompt
}

fn push_numbered(prompt: &mut String, items: &[(String, String)]) {
    for (index, (label, summary)) in items.iter().enumerate() {
        if summary.is_empty() {
            prompt.push_str(&format!("{}. {label}\n", index + 1));
        } else {
            prompt.push_str(&format!("{}. {label}: {summary}\n", index + 1));
        }
    }
}
