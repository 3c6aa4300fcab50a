//! STOP-intent detection.
//!
//! A bare substring match on "stop" produces false positives on ordinary
//! language ("the job is non-stop this week", "stop by our shop"). Opt-out
//! intent requires either the whole message being an opt-out keyword, or an
//! imperative phrase — a messaging verb followed closely by "stop".

use std::sync::LazyLock;

use regex::Regex;

/// The entire (trimmed) message is an opt-out keyword, optionally punctuated.
static BARE_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:stop|stopall|stop\s+all|unsubscribe|cancel|end|quit|opt\s*out)\s*[.!]*\s*$")
        .expect("valid regex")
});

/// A messaging verb followed (within two words) by "stop".
static IMPERATIVE_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:reply|replying|text|texting|send|sending)\b\W+(?:\w+\W+){0,2}?stop\b")
        .expect("valid regex")
});

/// Whether inbound text expresses opt-out intent.
pub fn is_stop_intent(text: &str) -> bool {
    BARE_KEYWORD.is_match(text) || IMPERATIVE_PHRASE.is_match(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_stop_matches() {
        assert!(is_stop_intent("STOP"));
        assert!(is_stop_intent("stop"));
        assert!(is_stop_intent("  Stop. "));
        assert!(is_stop_intent("STOP!"));
        assert!(is_stop_intent("unsubscribe"));
        assert!(is_stop_intent("opt out"));
    }

    #[test]
    fn imperative_phrase_matches() {
        assert!(is_stop_intent("please text STOP to opt out"));
        assert!(is_stop_intent("reply STOP to unsubscribe"));
        assert!(is_stop_intent("send me STOP and I'm done"));
        assert!(is_stop_intent("replying with stop now"));
    }

    #[test]
    fn ordinary_language_with_stop_does_not_match() {
        assert!(!is_stop_intent("the job is non-stop this week"));
        assert!(!is_stop_intent("stop by our shop"));
        assert!(!is_stop_intent("we can stop the leak tomorrow"));
        assert!(!is_stop_intent("the bus stop is next to my house"));
    }

    #[test]
    fn unrelated_text_does_not_match() {
        assert!(!is_stop_intent("yes, 2pm works for me"));
        assert!(!is_stop_intent(""));
        assert!(!is_stop_intent("can you come today?"));
    }
}
