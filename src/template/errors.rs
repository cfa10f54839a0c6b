//! Template error types with suggestions

use thiserror::Error;

/// Binding rendering errors
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Referenced variable doesn't exist in the run context
    #[error("undefined variable in '{template}'{}", .suggestion.as_ref().map(|s| format!(", did you mean '{}'?", s)).unwrap_or_default())]
    UndefinedVariable {
        template: String,
        suggestion: Option<String>,
    },

    /// Template syntax or evaluation error
    #[error("template error in '{template}': {message}")]
    Render { template: String, message: String },

    /// Result could not be turned back into JSON
    #[error("cannot convert result of '{template}' to JSON: {message}")]
    Conversion { template: String, message: String },
}

impl TemplateError {
    /// Create an undefined variable error, suggesting a known root name
    pub fn undefined(template: impl Into<String>, unknown_root: Option<&str>, known: &[&str]) -> Self {
        Self::UndefinedVariable {
            template: template.into(),
            suggestion: unknown_root.and_then(|root| suggest_correction(root, known)),
        }
    }

    pub fn render(template: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Render {
            template: template.into(),
            message: message.into(),
        }
    }
}

/// Suggest a correction for a typo using Levenshtein distance
pub fn suggest_correction(typo: &str, candidates: &[&str]) -> Option<String> {
    let max_distance = (typo.len() / 2).max(2);

    candidates
        .iter()
        .map(|candidate| (levenshtein_distance(typo, candidate), candidate))
        .filter(|(distance, _)| *distance <= max_distance)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, candidate)| candidate.to_string())
}

/// Calculate Levenshtein distance between two strings
fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();

    if a_chars.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a_chars.len();
    }

    // Two-row variant of the classic matrix
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0usize; b_chars.len() + 1];

    for (i, ca) in a_chars.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_chars.len()]
}
