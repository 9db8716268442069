//! Text normalization for speech synthesis.
//!
//! Answers come back with symbols, digits and markup a synthesis voice reads
//! badly or not at all. Normalization rewrites them into plain speakable
//! words:
//!
//! 1. Fold accented Latin letters to ASCII (`café` → `cafe`)
//! 2. Spell out symbols (`+` → "plus", `√` → "square root", ...)
//! 3. Replace anything outside letters, digits, whitespace and `.,'?!` with a space
//! 4. Read numbers aloud (`42` → "forty two", `3.5` → "three point five")
//! 5. Collapse whitespace
//!
//! If nothing speakable is left, the configured fallback phrase is used so
//! the synthesis engine never receives empty input.
//!
//! Output never contains a character that a later pass would rewrite, so
//! normalizing already-normalized text returns it unchanged.

use regex::{Captures, Regex};
use std::sync::LazyLock;

const SYMBOLS: &[(char, &str)] = &[
    ('+', "plus"),
    ('-', "minus"),
    ('*', "times"),
    ('/', "divided by"),
    ('=', "equals"),
    ('%', "percent"),
    ('>', "greater than"),
    ('<', "less than"),
    ('&', "and"),
    ('@', "at"),
    ('#', "number"),
    ('$', "dollar"),
    ('^', "caret"),
    ('√', "square root"),
];

static GROUPED_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,3}(?:,\d{3})+\b").expect("valid regex"));
static DECIMAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+)\.(\d+)\b").expect("valid regex"));
static INTEGER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d+\b").expect("valid regex"));
static UNSAFE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9\s.,'?!]").expect("valid regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Rewrite `text` into speakable plain words.
pub fn normalize(text: &str, fallback: &str) -> String {
    let mut spoken = String::with_capacity(text.len());
    for c in text.chars() {
        if let Some(folded) = fold_accent(c) {
            spoken.push_str(folded);
        } else if let Some((_, word)) = SYMBOLS.iter().find(|(symbol, _)| *symbol == c) {
            spoken.push(' ');
            spoken.push_str(word);
            spoken.push(' ');
        } else if c.is_ascii() {
            spoken.push(c);
        } else {
            spoken.push(' ');
        }
    }

    let spoken = UNSAFE.replace_all(&spoken, " ");
    let spoken = GROUPED_NUMBER.replace_all(&spoken, |caps: &Captures| caps[0].replace(',', ""));
    // Matches are bounded by non-word characters, so the words need no padding.
    let spoken = DECIMAL.replace_all(&spoken, |caps: &Captures| {
        format!("{} point {}", integer_words(&caps[1]), digit_words(&caps[2]))
    });
    let spoken = INTEGER.replace_all(&spoken, |caps: &Captures| integer_words(&caps[0]));
    let spoken = WHITESPACE.replace_all(&spoken, " ");
    let spoken = spoken.trim();

    if spoken.chars().any(char::is_alphanumeric) {
        spoken.to_string()
    } else {
        fallback.to_string()
    }
}

fn fold_accent(c: char) -> Option<&'static str> {
    let folded = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' => "a",
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' | 'Ā' => "A",
        'ç' | 'ć' | 'č' => "c",
        'Ç' | 'Ć' | 'Č' => "C",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ę' | 'ě' => "e",
        'È' | 'É' | 'Ê' | 'Ë' | 'Ē' | 'Ę' | 'Ě' => "E",
        'ì' | 'í' | 'î' | 'ï' | 'ī' => "i",
        'Ì' | 'Í' | 'Î' | 'Ï' | 'Ī' => "I",
        'ñ' | 'ń' | 'ň' => "n",
        'Ñ' | 'Ń' | 'Ň' => "N",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' => "o",
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' | 'Ō' => "O",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' => "u",
        'Ù' | 'Ú' | 'Û' | 'Ü' | 'Ū' | 'Ů' => "U",
        'ý' | 'ÿ' => "y",
        'Ý' | 'Ÿ' => "Y",
        'š' | 'ś' => "s",
        'Š' | 'Ś' => "S",
        'ž' | 'ź' | 'ż' => "z",
        'Ž' | 'Ź' | 'Ż' => "Z",
        'ł' => "l",
        'Ł' => "L",
        'ß' => "ss",
        'æ' => "ae",
        'Æ' => "AE",
        'œ' => "oe",
        'Œ' => "OE",
        '‘' | '’' => "'",
        _ => return None,
    };
    Some(folded)
}

const ONES: [&str; 20] = [
    "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
    "eleven", "twelve", "thirteen", "fourteen", "fifteen", "sixteen", "seventeen", "eighteen",
    "nineteen",
];
const TENS: [&str; 10] = [
    "", "", "twenty", "thirty", "forty", "fifty", "sixty", "seventy", "eighty", "ninety",
];
const SCALES: [(u64, &str); 6] = [
    (1_000_000_000_000_000_000, "quintillion"),
    (1_000_000_000_000_000, "quadrillion"),
    (1_000_000_000_000, "trillion"),
    (1_000_000_000, "billion"),
    (1_000_000, "million"),
    (1_000, "thousand"),
];

/// "1335" → "one thousand three hundred thirty five". Numbers too large for
/// `u64` are read digit by digit.
fn integer_words(digits: &str) -> String {
    match digits.parse::<u64>() {
        Ok(n) => number_words(n),
        Err(_) => digit_words(digits),
    }
}

fn digit_words(digits: &str) -> String {
    digits
        .chars()
        .filter_map(|c| c.to_digit(10))
        .map(|d| ONES[d as usize])
        .collect::<Vec<_>>()
        .join(" ")
}

fn number_words(mut n: u64) -> String {
    if n == 0 {
        return ONES[0].to_string();
    }

    let mut words = Vec::new();
    for (scale, name) in SCALES {
        if n >= scale {
            words.push(below_thousand(n / scale));
            words.push(name.to_string());
            n %= scale;
        }
    }
    if n > 0 {
        words.push(below_thousand(n));
    }
    words.join(" ")
}

fn below_thousand(n: u64) -> String {
    let mut words = Vec::new();
    let hundreds = n / 100;
    let rest = (n % 100) as usize;

    if hundreds > 0 {
        words.push(ONES[hundreds as usize]);
        words.push("hundred");
    }
    if rest >= 20 {
        words.push(TENS[rest / 10]);
        if rest % 10 > 0 {
            words.push(ONES[rest % 10]);
        }
    } else if rest > 0 {
        words.push(ONES[rest]);
    }
    words.join(" ")
}
