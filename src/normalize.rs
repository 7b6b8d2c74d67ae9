//! Field normalization shared by tracks, library files and album comparison.
//!
//! Every normalized key in the store is produced here, so tracks and files
//! compare equal only if they went through the same rules. Changing a rule
//! means re-normalizing both catalogs.

use any_ascii::any_ascii;
use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

// ============================================================================
// REGEX PATTERNS
// ============================================================================

/// Title suffix patterns (applied in order, repeatedly stripped from the end).
pub static TITLE_SUFFIX_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // Remaster variants: "- Remastered 2009", "/ 1997 Remastered"
        Regex::new(r"(?i)\s*[-–—/]\s*(?:\d{4}\s+)?(?:digital\s+)?remaster(?:ed)?(?:\s+\d{4})?(?:\s+version)?\s*$").unwrap(),
        // Live/acoustic dash suffix: "- Live at Wembley", "- Acoustic Version"
        Regex::new(r"(?i)\s*[-–—]\s*(?:live(?:\s+(?:at|from|in)\s+.+)?|acoustic(?:\s+version)?)\s*$").unwrap(),
        // Version dash suffix: "- Radio Edit", "- Single Version", "- Mono"
        Regex::new(r"(?i)\s*[-–—]\s*(?:radio\s+edit|single\s+version|album\s+version|lp\s+version|mono|stereo)\s*$").unwrap(),
        // Year suffix: "- 2021", "- 1997 Version"
        Regex::new(r"(?i)\s*[-–—]\s*\d{4}(?:\s+(?:version|mix|edit))?\s*$").unwrap(),
        // Any trailing bracketed group: "(Remastered 2009)", "[Mono]", "(feat. X)"
        Regex::new(r"\s*[\(\[\{][^\)\]\}]*[\)\]\}]\s*$").unwrap(),
    ]
});

/// Featured artists without brackets: "Song feat. Artist", "Artist ft. Someone"
pub static FEATURING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s+(?:feat\.?|ft\.|featuring)\s+.*$").unwrap());

/// Bracketed featured artists anywhere: "Song (feat. X) [Live]"
pub static FEATURING_BRACKETED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*[\(\[](?:feat\.?|ft\.?|featuring)\s+[^\)\]]*[\)\]]").unwrap());

/// Matches file extensions that leak into tag-less titles
pub static FILE_EXTENSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.(?:flac|mp3|wav|m4a|ogg|opus|aac|aiff?|wma)$").unwrap());

/// Regex to collapse whitespace runs into a single space
pub static MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Check if a character is a Unicode combining mark (diacritical mark).
pub fn is_combining_mark(c: char) -> bool {
    matches!(c as u32, 0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF | 0x20D0..=0x20FF | 0xFE20..=0xFE2F)
}

/// Fold Unicode text to lowercase ASCII by applying NFKD decomposition and
/// removing combining marks, then transliterating what is left.
/// e.g., "Sigur Rós" → "sigur ros", "Motörhead" → "motorhead"
pub fn fold_to_ascii(s: &str) -> String {
    let stripped: String = s.nfkd().filter(|c| !is_combining_mark(*c)).collect();
    any_ascii(&stripped).to_lowercase()
}

/// Unify quote characters and spell out ampersands.
pub fn normalize_punctuation(s: &str) -> String {
    s.replace(['\u{2018}', '\u{2019}', '\u{00B4}', '\u{0060}'], "'")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(" & ", " and ")
}

/// Drop apostrophes, turn every other non-alphanumeric character into a space,
/// then collapse and trim whitespace.
fn collapse(s: &str) -> String {
    let spaced: String = s
        .chars()
        .filter(|c| *c != '\'')
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();
    MULTI_SPACE.replace_all(&spaced, " ").trim().to_string()
}

fn strip_title_suffixes(title: &str) -> String {
    let mut result = FEATURING_BRACKETED.replace_all(title, "").to_string();
    // Suffixes can stack: "Song (feat. X) - Remastered 2009 [Mono]"
    loop {
        let before = result.len();
        for pattern in TITLE_SUFFIX_PATTERNS.iter() {
            result = pattern.replace(&result, "").to_string();
        }
        if result.len() == before {
            break;
        }
    }
    FEATURING.replace(&result, "").to_string()
}

// ============================================================================
// NORMALIZATION FUNCTIONS
// ============================================================================

/// Normalize a title for matching.
/// Strips file extensions, featured artists and version/remaster suffixes.
pub fn normalize_title(title: &str) -> String {
    let result = normalize_punctuation(title.trim());
    let result = FILE_EXTENSION.replace(&result, "").to_string();
    let result = strip_title_suffixes(&result);
    let stripped = collapse(&fold_to_ascii(&result));
    if stripped.is_empty() {
        // A title that is nothing but a bracketed group keeps its contents
        // rather than becoming unknown.
        collapse(&fold_to_ascii(&normalize_punctuation(title)))
    } else {
        stripped
    }
}

/// Normalize an artist name for matching. Featured artists are dropped.
pub fn normalize_artist(artist: &str) -> String {
    let result = normalize_punctuation(artist.trim());
    let result = FEATURING_BRACKETED.replace_all(&result, "");
    let result = FEATURING.replace(&result, "");
    collapse(&fold_to_ascii(&result))
}

/// Normalize a single free-text field (album names, path fragments).
pub fn normalize_text(text: &str) -> String {
    collapse(&fold_to_ascii(&normalize_punctuation(text)))
}

/// Build the normalized key for an (artist, title) pair.
///
/// Returns an empty string when either side normalizes to nothing. An empty
/// key means "unknown" and is never used for equality matching.
pub fn normalize_key(artist: &str, title: &str) -> String {
    let artist_norm = normalize_artist(artist);
    let title_norm = normalize_title(title);
    if artist_norm.is_empty() || title_norm.is_empty() {
        return String::new();
    }
    format!("{} {}", artist_norm, title_norm)
}

// ============================================================================
// TESTS
// ============================================================================
