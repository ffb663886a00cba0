//! Address clean-up for Brazilian street addresses.
//!
//! Everything here is pure: no I/O, no failure mode.

use once_cell::sync::Lazy;
use regex::Regex;

const MIN_LANDMARK_CHARS: usize = 6;
const MIN_NOTE_CHARS: usize = 4;
const MAX_PASSES: usize = 4;

static PARENTHETICAL: Lazy<Regex> = Lazy::new(|| compile(r"\([^)]*\)"));
static POSTAL_CODE: Lazy<Regex> = Lazy::new(|| compile(r"\b\d{5}[-\s]?\d{3}\b"));
static COUNTRY_SUFFIX: Lazy<Regex> = Lazy::new(|| compile(r"(?i),?\s*(?:brasil|brazil)\s*$"));
static NO_NUMBER: Lazy<Regex> = Lazy::new(|| compile(r"(?i)\bs/n\b|\bsem\s+n[úu]mero\b"));
static NO_NUMBER_DOTTED: Lazy<Regex> = Lazy::new(|| compile(r"(?i)\bs\.n\.?(\s|,|$)"));
static HISTORIC_CENTER: Lazy<Regex> = Lazy::new(|| compile(r"(?i)\bcentro\s+hist[óo]rico\b"));
static STATE_CODE: Lazy<Regex> = Lazy::new(|| compile(r",\s*[A-Z]{2}\s*(,|$)"));
static PROXIMITY: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?i)\b(?:próximo|perto|ao lado|em frente|esquina)\s+(?:(?:de|da|do|a|ao)\s+)?")
});
static SPACE_BEFORE_COMMA: Lazy<Regex> = Lazy::new(|| compile(r"\s+,"));
static REPEATED_COMMAS: Lazy<Regex> = Lazy::new(|| compile(r",(?:\s*,)+"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| compile(r"\s+"));

static BRACKETED_NOTE: Lazy<Regex> = Lazy::new(|| compile(r"\(([^)]+)\)"));
static GENERIC_NOTE: Lazy<Regex> =
    Lazy::new(|| compile(r"(?i)^(?:zona|próximo|perto|ao lado|em frente)"));
static TRAILING_NUMBERS: Lazy<Regex> = Lazy::new(|| compile(r"[,\d]+$"));
static LANDMARKS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\b(?:praça|praca)\s+(?:de?\s+)?[a-zà-ÿ\s]+",
        r"(?i)\bparque\s+(?:de?\s+|do?\s+)?[a-zà-ÿ\s]+",
        r"(?i)\blargo\s+(?:de?\s+|do?\s+)?[a-zà-ÿ\s]+",
        r"(?i)\bestação\s+[a-zà-ÿ\s]+",
        r"(?i)\bshopping\s+[a-zà-ÿ\s]+",
        r"(?i)\bmercado\s+(?:de?\s+|do?\s+)?[a-zà-ÿ\s]+",
        r"(?i)\bteatro\s+[a-zà-ÿ\s]+",
        r"(?i)\bigreja\s+(?:de?\s+|da?\s+)?[a-zà-ÿ\s]+",
        r"(?i)\bviaduto\s+(?:do?\s+)?[a-zà-ÿ\s]+",
        r"(?i)\b(?:avenida|av\.?)\s+[a-zà-ÿ\s]+",
    ]
    .into_iter()
    .map(compile)
    .collect()
});

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("normalizer pattern compiles")
}

/// Cleaned address followed by the city, e.g. `"Praça da Sé, São Paulo"`.
///
/// Idempotent: feeding the output back in with the same city yields the
/// same string.
pub fn normalize(address: &str, city: &str) -> String {
    let cleaned = normalize_address(address);
    let city = normalize_address(city);
    if city.is_empty() {
        return cleaned;
    }
    if cleaned.is_empty() {
        return String::new();
    }
    let last_segment = cleaned.rsplit(',').next().unwrap_or_default().trim();
    if last_segment.to_lowercase() == city.to_lowercase() {
        cleaned
    } else {
        format!("{cleaned}, {city}")
    }
}

/// Strips noise from a raw address. Returns an empty string for empty input.
pub fn normalize_address(address: &str) -> String {
    let mut current = clean_once(address);
    for _ in 1..MAX_PASSES {
        let next = clean_once(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn clean_once(address: &str) -> String {
    if address.trim().is_empty() {
        return String::new();
    }

    let text = PARENTHETICAL.replace_all(address, "");
    let text = POSTAL_CODE.replace_all(&text, "");
    let text = COUNTRY_SUFFIX.replace(&text, "");
    let text = NO_NUMBER.replace_all(&text, " ");
    let text = NO_NUMBER_DOTTED.replace_all(&text, "$1");
    let text = HISTORIC_CENTER.replace_all(&text, "Centro");
    let text = replace_until_stable(&STATE_CODE, &text, "$1");
    let text = PROXIMITY.replace_all(&text, "");

    let text = SPACE_BEFORE_COMMA.replace_all(&text, ",");
    let text = REPEATED_COMMAS.replace_all(&text, ",");
    let text = WHITESPACE.replace_all(&text, " ");
    text.trim_matches(|c: char| c == ',' || c.is_whitespace())
        .to_string()
}

fn replace_until_stable(pattern: &Regex, text: &str, replacement: &str) -> String {
    let mut current = text.to_string();
    loop {
        let next = pattern.replace_all(&current, replacement).into_owned();
        if next == current {
            return current;
        }
        current = next;
    }
}

/// Finds a landmark usable as a simpler fallback query.
///
/// A bracketed note wins unless it is a generic proximity remark; after that
/// the first landmark-category prefix followed by a name is used.
pub fn extract_landmark(address: &str) -> Option<String> {
    if address.trim().is_empty() {
        return None;
    }

    if let Some(note) = BRACKETED_NOTE
        .captures(address)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
    {
        let is_number = note.chars().all(|c| c.is_ascii_digit());
        if !GENERIC_NOTE.is_match(note) && note.chars().count() >= MIN_NOTE_CHARS && !is_number {
            return Some(note.to_string());
        }
    }

    LANDMARKS.iter().find_map(|pattern| {
        let found = pattern.find(address)?;
        let trimmed = found.as_str().trim();
        let landmark = TRAILING_NUMBERS.replace(trimmed, "");
        let landmark = landmark.trim();
        (landmark.chars().count() >= MIN_LANDMARK_CHARS).then(|| landmark.to_string())
    })
}
