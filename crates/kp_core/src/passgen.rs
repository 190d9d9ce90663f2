use crate::app_error::{AppError, AppResult};
use crate::random::fill_random;
use serde::{Deserialize, Serialize};

const LOWER: &str = "abcdefghijklmnopqrstuvwxyz";
const UPPER: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &str = "0123456789";
const SPECIAL: &str = "!@#$%^&*()-_=+[]{};:,.<>?";
const AMBIGUOUS: &str = "O0l1I";

pub const MIN_LENGTH: usize = 4;
pub const MAX_LENGTH: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorOptions {
    #[serde(default = "default_length")]
    pub length: usize,
    #[serde(default = "default_true")]
    pub include_upper: bool,
    #[serde(default = "default_true")]
    pub include_lower: bool,
    #[serde(default = "default_true")]
    pub include_digits: bool,
    #[serde(default)]
    pub include_special: bool,
    #[serde(default)]
    pub exclude_ambiguous: bool,
}

fn default_length() -> usize {
    20
}

fn default_true() -> bool {
    true
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            length: default_length(),
            include_upper: true,
            include_lower: true,
            include_digits: true,
            include_special: false,
            exclude_ambiguous: false,
        }
    }
}

fn effective_alphabet(options: &GeneratorOptions) -> Vec<char> {
    let mut classes: Vec<&str> = Vec::new();
    if options.include_lower {
        classes.push(LOWER);
    }
    if options.include_upper {
        classes.push(UPPER);
    }
    if options.include_digits {
        classes.push(DIGITS);
    }
    if options.include_special {
        classes.push(SPECIAL);
    }
    if classes.is_empty() {
        classes.push(LOWER);
        classes.push(DIGITS);
    }

    classes
        .iter()
        .flat_map(|class| class.chars())
        .filter(|c| !(options.exclude_ambiguous && AMBIGUOUS.contains(*c)))
        .collect()
}

/// Draw one index uniformly from `[0, bound)` using rejection sampling so
/// the distribution over the alphabet carries no modulo bias.
fn uniform_index(bound: usize) -> AppResult<usize> {
    debug_assert!(bound > 0 && bound <= 256);
    let limit = 256 - (256 % bound);
    loop {
        let mut byte = [0u8; 1];
        fill_random(&mut byte)?;
        if (byte[0] as usize) < limit {
            return Ok(byte[0] as usize % bound);
        }
    }
}

pub fn generate_password(options: &GeneratorOptions) -> AppResult<String> {
    let length = options.length.clamp(MIN_LENGTH, MAX_LENGTH);
    let alphabet = effective_alphabet(options);
    if alphabet.is_empty() {
        return Err(AppError::new(
            "KP_INTERNAL_ERROR",
            "passgen",
            "character class configuration produced an empty alphabet",
            false,
            serde_json::json!({ "options": options }),
        ));
    }

    let mut out = String::with_capacity(length);
    for _ in 0..length {
        out.push(alphabet[uniform_index(alphabet.len())?]);
    }
    Ok(out)
}

/// 0..=4: length points at >=8, >=12, >=20 plus variety points at three and
/// four distinct classes, clamped to 4.
pub fn password_strength(password: &str) -> u8 {
    let mut score = 0u8;
    let len = password.chars().count();
    if len >= 8 {
        score += 1;
    }
    if len >= 12 {
        score += 1;
    }
    if len >= 20 {
        score += 1;
    }

    let mut lower = false;
    let mut upper = false;
    let mut digit = false;
    let mut other = false;
    for c in password.chars() {
        if c.is_ascii_lowercase() {
            lower = true;
        } else if c.is_ascii_uppercase() {
            upper = true;
        } else if c.is_ascii_digit() {
            digit = true;
        } else {
            other = true;
        }
    }
    let classes = [lower, upper, digit, other].iter().filter(|v| **v).count();
    if classes >= 3 {
        score += 1;
    }
    if classes >= 4 {
        score += 1;
    }

    score.min(4)
}
