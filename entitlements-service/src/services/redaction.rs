//! Demo-mode PII scrubbing for chat traffic.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

pub const EMAIL_PLACEHOLDER: &str = "[REDACTED_EMAIL]";
pub const PHONE_PLACEHOLDER: &str = "[REDACTED_PHONE]";
pub const CARD_PLACEHOLDER: &str = "[REDACTED_CARD]";
pub const API_KEY_PLACEHOLDER: &str = "[REDACTED_API_KEY]";

/// Raw text held back by [`StreamRedactor`] so a value split across chunks
/// is still seen whole.
const STREAM_HOLDBACK: usize = 64;

/// Past this the holdback ignores word boundaries.
const STREAM_MAX_PENDING: usize = 1024;

static API_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(?:(?:sk|pk|rk)_(?:live|test)_[A-Za-z0-9]{8,}|whsec_[A-Za-z0-9]{16,}|AIza[0-9A-Za-z_\-]{35}|gh[pousr]_[A-Za-z0-9]{20,}|sk-[A-Za-z0-9_\-]{20,}|xox[abpr]-[A-Za-z0-9\-]{10,}|AKIA[0-9A-Z]{16})",
    )
    .expect("api key pattern")
});

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(?:\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}")
        .expect("email pattern")
});

static CARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d[ \-]?){12,18}\d\b").expect("card pattern"));

static PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+\d{1,3}[\s.\-]?)?(?:\(\d{3}\)|\b\d{3})[\s.\-]?\d{3}[\s.\-]?\d{4}\b")
        .expect("phone pattern")
});

fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// Replace emails, phone numbers, card numbers and API-key-like tokens with
/// placeholders.
pub fn redact(text: &str) -> String {
    let text = API_KEY.replace_all(text, API_KEY_PLACEHOLDER);
    let text = EMAIL.replace_all(&text, EMAIL_PLACEHOLDER);
    let text = CARD.replace_all(&text, |caps: &Captures| {
        if luhn_valid(&caps[0]) {
            CARD_PLACEHOLDER.to_string()
        } else {
            caps[0].to_string()
        }
    });
    PHONE.replace_all(&text, PHONE_PLACEHOLDER).into_owned()
}

fn match_spans(text: &str) -> impl Iterator<Item = (usize, usize)> + '_ {
    [&*API_KEY, &*EMAIL, &*CARD, &*PHONE]
        .into_iter()
        .flat_map(move |re| re.find_iter(text).map(|m| (m.start(), m.end())))
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Redacts a stream of text chunks. Output lags the input by a small window
/// so a sensitive value split across chunks is still caught.
#[derive(Debug, Default)]
pub struct StreamRedactor {
    pending: String,
}

impl StreamRedactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the redacted text that is safe to emit now
    /// (possibly empty).
    pub fn push(&mut self, chunk: &str) -> String {
        self.pending.push_str(chunk);
        if self.pending.len() <= STREAM_HOLDBACK {
            return String::new();
        }

        let mut cut = floor_char_boundary(&self.pending, self.pending.len() - STREAM_HOLDBACK);
        if self.pending.len() <= STREAM_MAX_PENDING {
            while cut > 0 && !self.pending[..cut].ends_with(char::is_whitespace) {
                cut = floor_char_boundary(&self.pending, cut - 1);
            }
        }

        // Never split a value the patterns recognise.
        loop {
            let moved = match_spans(&self.pending)
                .filter(|&(start, end)| start < cut && end >= cut)
                .map(|(start, _)| start)
                .min();
            match moved {
                Some(start) => cut = start,
                None => break,
            }
        }

        if cut == 0 {
            return String::new();
        }
        let rest = self.pending.split_off(cut);
        let ready = std::mem::replace(&mut self.pending, rest);
        redact(&ready)
    }

    /// Flush whatever is still held back.
    pub fn finish(self) -> String {
        redact(&self.pending)
    }
}
