//! English plurals for database names.

/// Pluralizes a lower-case singular noun: `user` → `users`,
/// `address` → `addresses`, `category` → `categories`.
pub fn pluralize(word: &str) -> String {
    if word.is_empty() {
        return String::new();
    }

    const SIBILANTS: [&str; 5] = ["s", "x", "z", "ch", "sh"];
    if SIBILANTS.iter().any(|suffix| word.ends_with(suffix)) {
        return format!("{}es", word);
    }

    if let Some(stem) = word.strip_suffix('y') {
        let before = stem.chars().last();
        if matches!(before, Some(c) if !"aeiou".contains(c)) {
            return format!("{}ies", stem);
        }
    }

    format!("{}s", word)
}
