//! FITS header keyword maps and 80-column card images.
//!
//! A [`Header`] keeps keywords in insertion order; inserting an existing
//! keyword replaces its value in place. Card images are what the WCS solver
//! consumes, so only the subset of the FITS card syntax it needs is written
//! and parsed: fixed-format value cards, quoted strings, and an `END` card.

use serde::{Deserialize, Serialize};

pub const CARD_LENGTH: usize = 80;
const KEYWORD_LENGTH: usize = 8;

const WCS_EXACT_KEYS: [&str; 6] = ["DATE-OBS", "EQUINOX", "WCSAXES", "RADESYS", "LONPOLE", "LATPOLE"];
const WCS_INDEXED_PREFIXES: [&str; 6] = ["CTYPE", "CRPIX", "CRVAL", "CUNIT", "CDELT", "CROTA"];
const WCS_OPEN_PREFIXES: [&str; 3] = ["CD", "PC", "PV"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl HeaderValue {
    /// Numeric value of an integer or float entry.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Int(v) => Some(*v as f64),
            HeaderValue::Float(v) => Some(*v),
            HeaderValue::Bool(_) | HeaderValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HeaderValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Value field as written on a card, starting at column 11.
    fn card_text(&self) -> String {
        match self {
            HeaderValue::Bool(true) => "T".to_string(),
            HeaderValue::Bool(false) => "F".to_string(),
            HeaderValue::Int(v) => v.to_string(),
            HeaderValue::Float(v) => format_float(*v),
            HeaderValue::Str(v) => format!("'{}'", v.replace('\'', "''")),
        }
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub key: String,
    pub value: HeaderValue,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Header {
    entries: Vec<HeaderEntry>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`. Keywords are case-insensitive and stored upper-case.
    pub fn insert(&mut self, key: &str, value: impl Into<HeaderValue>) {
        let key = key.trim().to_ascii_uppercase();
        let value = value.into();
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) => entry.value = value,
            None => self.entries.push(HeaderEntry { key, value }),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        let position = self
            .entries
            .iter()
            .position(|e| e.key.eq_ignore_ascii_case(key))?;
        Some(self.entries.remove(position).value)
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.entries
            .iter()
            .find(|e| e.key.eq_ignore_ascii_case(key))
            .map(|e| &e.value)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(HeaderValue::as_f64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(HeaderValue::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(HeaderValue::as_bool)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderEntry> {
        self.entries.iter()
    }

    /// Copy holding only the keywords that describe the world coordinate system.
    pub fn wcs_subset(&self) -> Header {
        Header {
            entries: self
                .entries
                .iter()
                .filter(|e| is_wcs_keyword(&e.key))
                .cloned()
                .collect(),
        }
    }

    /// Serializes every entry as an 80-column card, followed by `END`.
    /// Keywords longer than eight characters cannot be carded and are skipped.
    pub fn to_cards(&self) -> String {
        let mut cards = String::with_capacity((self.entries.len() + 1) * CARD_LENGTH);
        for entry in &self.entries {
            if entry.key.len() > KEYWORD_LENGTH {
                tracing::warn!(key = %entry.key, "keyword too long for a header card, skipped");
                continue;
            }
            let card = format!("{:<8}= {}", entry.key, entry.value.card_text());
            push_card(&mut cards, &card);
        }
        push_card(&mut cards, "END");
        cards
    }

    /// Parses a run of 80-column cards up to the `END` card. Cards without a
    /// value indicator (comments, history, blank) are ignored.
    pub fn parse_cards(cards: &str) -> Header {
        let mut header = Header::new();
        let bytes = cards.as_bytes();
        for chunk in bytes.chunks(CARD_LENGTH) {
            let Ok(card) = std::str::from_utf8(chunk) else {
                continue;
            };
            let keyword = card.get(..KEYWORD_LENGTH.min(card.len())).unwrap_or("").trim();
            if keyword == "END" {
                break;
            }
            if keyword.is_empty() || card.get(KEYWORD_LENGTH..KEYWORD_LENGTH + 2) != Some("= ") {
                continue;
            }
            if let Some(value) = parse_value(&card[KEYWORD_LENGTH + 2..]) {
                header.insert(keyword, value);
            }
        }
        header
    }
}

impl FromIterator<(String, HeaderValue)> for Header {
    fn from_iter<I: IntoIterator<Item = (String, HeaderValue)>>(iter: I) -> Self {
        let mut header = Header::new();
        for (key, value) in iter {
            header.insert(&key, value);
        }
        header
    }
}

/// Whether `key` belongs to the world coordinate system keyword set.
/// Matching is anchored at the start of the keyword and case-insensitive.
pub fn is_wcs_keyword(key: &str) -> bool {
    let key = key.trim().to_ascii_uppercase();

    if WCS_EXACT_KEYS.contains(&key.as_str()) {
        return true;
    }
    if let Some(rest) = key.strip_prefix("NAXIS") {
        return rest.bytes().all(|b| b.is_ascii_digit());
    }
    if WCS_INDEXED_PREFIXES.iter().any(|prefix| {
        key.strip_prefix(prefix)
            .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
    }) {
        return true;
    }
    WCS_OPEN_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
}

/// Appends `card` as exactly 80 bytes. Cards are printable ASCII, so any
/// other character is replaced by `?`.
fn push_card(cards: &mut String, card: &str) {
    let mut replaced = 0;
    let line: String = card
        .chars()
        .map(|c| {
            if c == ' ' || c.is_ascii_graphic() {
                c
            } else {
                replaced += 1;
                '?'
            }
        })
        .take(CARD_LENGTH)
        .collect();
    if replaced > 0 {
        tracing::warn!(card, replaced, "non-ASCII characters replaced in header card");
    }
    cards.push_str(&format!("{line:<80}"));
}

fn format_float(value: f64) -> String {
    if value.is_finite() && value == value.trunc() && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        format!("{value:E}")
    }
}

fn parse_value(field: &str) -> Option<HeaderValue> {
    let field = field.trim_start();
    if let Some(quoted) = field.strip_prefix('\'') {
        return Some(HeaderValue::Str(parse_quoted(quoted)));
    }

    let raw = field.split('/').next().unwrap_or("").trim();
    match raw {
        "" => None,
        "T" => Some(HeaderValue::Bool(true)),
        "F" => Some(HeaderValue::Bool(false)),
        _ => {
            if let Ok(v) = raw.parse::<i64>() {
                Some(HeaderValue::Int(v))
            } else if let Ok(v) = raw.replace(['D', 'd'], "E").parse::<f64>() {
                Some(HeaderValue::Float(v))
            } else {
                Some(HeaderValue::Str(raw.to_string()))
            }
        }
    }
}

/// String body after the opening quote. `''` is an escaped quote; trailing
/// blanks are not significant.
fn parse_quoted(body: &str) -> String {
    let mut out = String::new();
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' {
            if chars.peek() == Some(&'\'') {
                chars.next();
                out.push('\'');
                continue;
            }
            break;
        }
        out.push(c);
    }
    out.trim_end().to_string()
}
