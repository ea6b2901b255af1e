//! Running list of proper names and places, used as spelling context for
//! transcription.
//!
//! The list is capped by a character budget. When it overflows, the oldest
//! entries are evicted first; there is no relevance ranking.

pub const GLOSSARY_CHAR_BUDGET: usize = 600;
pub const TRANSCRIPTION_HINT_MAX_CHARS: usize = 224;

const SEPARATOR: &str = ", ";

/// Appends unseen entries (case-insensitive) and evicts the oldest until the
/// joined list fits in `budget` characters.
pub fn merge_entries<I>(mut entries: Vec<String>, additions: I, budget: usize) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    for addition in additions {
        let addition = addition.trim();
        if addition.is_empty() {
            continue;
        }
        let seen = entries.iter().any(|e| e.eq_ignore_ascii_case(addition));
        if !seen {
            entries.push(addition.to_owned());
        }
    }

    let mut start = 0usize;
    while start < entries.len() && joined_len(&entries[start..]) > budget {
        start += 1;
    }
    entries.drain(..start);
    entries
}

/// The most recent entries that fit in `max_chars`, oldest first.
pub fn transcription_hint(entries: &[String], max_chars: usize) -> String {
    let mut start = entries.len();
    while start > 0 && joined_len(&entries[start - 1..]) <= max_chars {
        start -= 1;
    }
    entries[start..].join(SEPARATOR)
}

fn joined_len(entries: &[String]) -> usize {
    let chars = entries.iter().map(|e| e.chars().count()).sum::<usize>();
    chars + SEPARATOR.len() * entries.len().saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn merge_skips_duplicates_case_insensitively() {
        let merged = merge_entries(
            owned(&["Lyon", "Marcel"]),
            owned(&["lyon", "Annecy", " "]),
            100,
        );
        assert_eq!(merged, owned(&["Lyon", "Marcel", "Annecy"]));
    }

    #[test]
    fn merge_evicts_oldest_first_when_over_budget() {
        // "Bordeaux, Marseille" is 19 characters.
        let merged = merge_entries(
            owned(&["Lyon", "Annecy"]),
            owned(&["Bordeaux", "Marseille"]),
            19,
        );
        assert_eq!(merged, owned(&["Bordeaux", "Marseille"]));
    }

    #[test]
    fn hint_keeps_most_recent_entries() {
        let entries = owned(&["Lyon", "Annecy", "Bordeaux"]);
        assert_eq!(transcription_hint(&entries, 16), "Annecy, Bordeaux");
        assert_eq!(transcription_hint(&entries, 3), "");
        assert_eq!(transcription_hint(&[], 10), "");
    }
}
