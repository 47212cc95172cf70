//! Avatar names: typed wish names and names built from a pattern of parts.

use thiserror::Error;

pub const MAX_NAME_LENGTH: usize = 32;
const MAX_WORDS: usize = 4;

const TITLES: [&str; 8] = [
    "Captain", "Doctor", "Good ol'", "Little", "Lucky", "Professor", "Sir", "Super",
];
const FIRST_NAMES: [&str; 12] = [
    "Bonzo", "Buster", "Daffy", "Flappy", "Giggles", "Jazzy", "Pickles", "Skippy", "Sparky", "Twinkle",
    "Wacky", "Ziggy",
];
const LAST_PREFIXES: [&str; 8] = [
    "Bumble", "Fizzy", "Giggle", "Jingle", "Nutty", "Poodle", "Wiggle", "Zippen",
];
const LAST_SUFFIXES: [&str; 8] = [
    "berry", "bee", "fish", "nose", "pants", "sniff", "whistle", "zilla",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("name is empty")]
    Empty,
    #[error("name is longer than 32 characters")]
    TooLong,
    #[error("name has more than 4 words")]
    TooManyWords,
    #[error("name must start with a letter")]
    BadStart,
    #[error("character {0:?} is not allowed in names")]
    BadCharacter(char),
    #[error("name repeats a separator")]
    RepeatedSeparator,
    #[error("name part {index} is out of range for slot {slot}")]
    BadPart { slot: usize, index: i16 },
    #[error("a pattern needs a first or a last name")]
    NoName,
    #[error("a last name needs both halves")]
    HalfLastName,
}

/// Checks a typed name and returns it with surrounding whitespace removed.
pub fn check_wish_name(name: &str) -> Result<String, NameError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(NameError::TooLong);
    }
    if name.split(' ').count() > MAX_WORDS {
        return Err(NameError::TooManyWords);
    }
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(NameError::BadStart);
    }

    let mut previous_separator = false;
    for c in name.chars() {
        let separator = matches!(c, ' ' | '-' | '.' | '\'');
        if !separator && !c.is_ascii_alphabetic() {
            return Err(NameError::BadCharacter(c));
        }
        if separator && previous_separator {
            return Err(NameError::RepeatedSeparator);
        }
        previous_separator = separator;
    }
    Ok(name.to_string())
}

/// One `(index, flag)` pair per slot: title, first name, last name prefix
/// and last name suffix. A negative index leaves the slot empty; a non-zero
/// flag on the suffix capitalises it.
pub type NamePattern = [(i16, i16); 4];

pub fn compose_pattern_name(pattern: &NamePattern) -> Result<String, NameError> {
    let tables: [&[&str]; 4] = [&TITLES, &FIRST_NAMES, &LAST_PREFIXES, &LAST_SUFFIXES];
    let mut parts: [Option<&str>; 4] = [None; 4];
    for (slot, (&(index, _), table)) in pattern.iter().zip(tables).enumerate() {
        if index < 0 {
            continue;
        }
        let part = table
            .get(index as usize)
            .copied()
            .ok_or(NameError::BadPart { slot, index })?;
        parts[slot] = Some(part);
    }

    let [title, first, prefix, suffix] = parts;
    let last = match (prefix, suffix) {
        (Some(prefix), Some(suffix)) => {
            let suffix = if pattern[3].1 != 0 {
                capitalise(suffix)
            } else {
                suffix.to_string()
            };
            Some(format!("{}{}", prefix, suffix))
        }
        (None, None) => None,
        _ => return Err(NameError::HalfLastName),
    };
    if first.is_none() && last.is_none() {
        return Err(NameError::NoName);
    }

    let words: Vec<String> = title
        .map(str::to_string)
        .into_iter()
        .chain(first.map(str::to_string))
        .chain(last)
        .collect();
    Ok(words.join(" "))
}

fn capitalise(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
