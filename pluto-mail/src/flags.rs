use serde::{Deserialize, Serialize};

/// The system flags Pluto tracks. They are stored in the Maildir info
/// suffix of the message filename, which is also the value kept in the
/// per-folder OR-Set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Seen,
}

pub const ALL_FLAGS: [Flag; 5] = [
    Flag::Answered,
    Flag::Deleted,
    Flag::Draft,
    Flag::Flagged,
    Flag::Seen,
];

/// Separator between the Maildir key and the flag codes.
pub const INFO_PREFIX: &str = ":2,";

impl Flag {
    pub fn imap_name(&self) -> &'static str {
        match self {
            Flag::Answered => "\\Answered",
            Flag::Deleted => "\\Deleted",
            Flag::Draft => "\\Draft",
            Flag::Flagged => "\\Flagged",
            Flag::Seen => "\\Seen",
        }
    }

    /// Maildir info code, per the Maildir convention.
    pub fn code(&self) -> char {
        match self {
            Flag::Answered => 'R',
            Flag::Deleted => 'T',
            Flag::Draft => 'D',
            Flag::Flagged => 'F',
            Flag::Seen => 'S',
        }
    }

    pub fn from_imap(name: &str) -> Option<Flag> {
        match name.to_ascii_lowercase().as_str() {
            "\\answered" => Some(Flag::Answered),
            "\\deleted" => Some(Flag::Deleted),
            "\\draft" => Some(Flag::Draft),
            "\\flagged" => Some(Flag::Flagged),
            "\\seen" => Some(Flag::Seen),
            _ => None,
        }
    }

    pub fn from_code(code: char) -> Option<Flag> {
        match code {
            'R' => Some(Flag::Answered),
            'T' => Some(Flag::Deleted),
            'D' => Some(Flag::Draft),
            'F' => Some(Flag::Flagged),
            'S' => Some(Flag::Seen),
            _ => None,
        }
    }
}

/// Split a folder-set value into its Maildir key and flag set. Unknown
/// info codes are ignored.
pub fn split_value(value: &str) -> (&str, Vec<Flag>) {
    match value.split_once(INFO_PREFIX) {
        Some((key, codes)) => {
            let mut flags: Vec<Flag> = codes.chars().filter_map(Flag::from_code).collect();
            flags.sort();
            flags.dedup();
            (key, flags)
        }
        None => (value, Vec::new()),
    }
}

/// Compose a value from a key and a flag set. No flags means no info
/// suffix; codes are written in ascending ASCII order as Maildir requires.
pub fn compose_value(key: &str, flags: &[Flag]) -> String {
    if flags.is_empty() {
        return key.to_string();
    }
    let mut codes: Vec<char> = flags.iter().map(Flag::code).collect();
    codes.sort_unstable();
    codes.dedup();
    format!("{}{}{}", key, INFO_PREFIX, codes.into_iter().collect::<String>())
}

/// Render a parenthesized IMAP flag list, e.g. `(\Answered \Seen)`.
pub fn format_flag_list(flags: &[Flag]) -> String {
    let mut flags = flags.to_vec();
    flags.sort();
    flags.dedup();
    format!(
        "({})",
        flags
            .iter()
            .map(Flag::imap_name)
            .collect::<Vec<_>>()
            .join(" ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_compose_round_trip() {
        let (key, flags) = split_value("1700000000.Rdeadbeef00000000Q1.pluto:2,RS");
        assert_eq!(key, "1700000000.Rdeadbeef00000000Q1.pluto");
        assert_eq!(flags, vec![Flag::Answered, Flag::Seen]);

        assert_eq!(
            compose_value(key, &flags),
            "1700000000.Rdeadbeef00000000Q1.pluto:2,RS"
        );
        assert_eq!(compose_value(key, &[]), key);
    }

    #[test]
    fn no_suffix_means_no_flags() {
        let (key, flags) = split_value("somekey");
        assert_eq!(key, "somekey");
        assert!(flags.is_empty());
    }

    #[test]
    fn codes_are_ordered_and_deduplicated() {
        let composed = compose_value("k", &[Flag::Seen, Flag::Deleted, Flag::Seen, Flag::Draft]);
        assert_eq!(composed, "k:2,DST");
    }

    #[test]
    fn imap_names_parse_case_insensitively() {
        assert_eq!(Flag::from_imap("\\SEEN"), Some(Flag::Seen));
        assert_eq!(Flag::from_imap("\\answered"), Some(Flag::Answered));
        assert_eq!(Flag::from_imap("\\Recent"), None);
    }

    #[test]
    fn flag_list_formatting() {
        assert_eq!(
            format_flag_list(&[Flag::Seen, Flag::Answered]),
            "(\\Answered \\Seen)"
        );
        assert_eq!(format_flag_list(&[]), "()");
    }
}
