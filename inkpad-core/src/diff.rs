//! Single-span differencer.
//!
//! Turns "old text → new text" into one contiguous edit by trimming the
//! longest common prefix and suffix. All offsets are in characters.

/// A contiguous edit: keep `retain` chars, remove `delete` chars, then insert.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextEdit {
    pub retain: usize,
    pub delete: usize,
    pub insert: String,
}

impl TextEdit {
    pub fn is_noop(&self) -> bool {
        self.delete == 0 && self.insert.is_empty()
    }

    /// Apply this edit to `old`, returning the edited text.
    pub fn apply_to(&self, old: &str) -> String {
        let mut out: String = old.chars().take(self.retain).collect();
        out.push_str(&self.insert);
        out.extend(old.chars().skip(self.retain + self.delete));
        out
    }
}

/// Compute the minimal single-span edit from `old` to `new`.
///
/// The suffix is bounded by what remains after the prefix on both sides,
/// so overlapping repeats (`"aa" → "aaa"`) never produce a negative span.
pub fn diff(old: &str, new: &str) -> TextEdit {
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let prefix = old_chars
        .iter()
        .zip(&new_chars)
        .take_while(|(a, b)| a == b)
        .count();

    let max_suffix = (old_chars.len() - prefix).min(new_chars.len() - prefix);
    let suffix = old_chars
        .iter()
        .rev()
        .zip(new_chars.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    TextEdit {
        retain: prefix,
        delete: old_chars.len() - prefix - suffix,
        insert: new_chars[prefix..new_chars.len() - suffix].iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_in_middle() {
        let edit = diff("hello world", "hello there world");
        assert_eq!(
            edit,
            TextEdit {
                retain: 6,
                delete: 0,
                insert: "there ".into()
            }
        );
    }

    #[test]
    fn test_identical_is_noop() {
        assert!(diff("same", "same").is_noop());
        assert!(diff("", "").is_noop());
    }

    #[test]
    fn test_replacement() {
        let edit = diff("abcdef", "abXYef");
        assert_eq!(edit.retain, 2);
        assert_eq!(edit.delete, 2);
        assert_eq!(edit.insert, "XY");
    }

    #[test]
    fn test_overlapping_repeat() {
        let edit = diff("aa", "aaa");
        assert_eq!(edit.retain, 2);
        assert_eq!(edit.delete, 0);
        assert_eq!(edit.insert, "a");
    }

    #[test]
    fn test_clear_and_fill() {
        assert_eq!(diff("abc", "").delete, 3);
        assert_eq!(diff("", "abc").insert, "abc");
    }

    #[test]
    fn test_multibyte_counts_chars() {
        let edit = diff("héllo", "hé✓llo");
        assert_eq!(edit.retain, 2);
        assert_eq!(edit.insert, "✓");
    }

    #[test]
    fn test_apply_to_reproduces_new() {
        let pairs = [
            ("hello world", "hello there world"),
            ("abcdef", "abXYef"),
            ("aa", "aaa"),
            ("quick brown", "brown"),
            ("naïve", "naive"),
        ];
        for (old, new) in pairs {
            assert_eq!(diff(old, new).apply_to(old), new, "{old} -> {new}");
        }
    }
}
