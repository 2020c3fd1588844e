//! Picking a synthesis language from the text itself.

/// Guesses the language of a piece of text.
pub trait LanguageDetector: Send + Sync + 'static {
    /// ISO 639-1 code, or `None` to let the synthesis service decide.
    fn detect(&self, text: &str) -> Option<&'static str>;
}

/// Script-range heuristic.
///
/// Only answers when the writing system gives the language away; Latin text
/// without language-specific letters is left to the service.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptLanguageDetector;

impl LanguageDetector for ScriptLanguageDetector {
    fn detect(&self, text: &str) -> Option<&'static str> {
        let mut kana = false;
        let mut han = false;
        for c in text.chars() {
            match c {
                'ğ' | 'Ğ' | 'ı' | 'İ' | 'ş' | 'Ş' => return Some("tr"),
                '\u{0400}'..='\u{04FF}' => return Some("ru"),
                '\u{AC00}'..='\u{D7AF}' | '\u{1100}'..='\u{11FF}' => return Some("ko"),
                '\u{0600}'..='\u{06FF}' => return Some("ar"),
                '\u{0370}'..='\u{03FF}' => return Some("el"),
                '\u{0590}'..='\u{05FF}' => return Some("he"),
                '\u{0900}'..='\u{097F}' => return Some("hi"),
                '\u{3040}'..='\u{30FF}' => kana = true,
                '\u{4E00}'..='\u{9FFF}' => han = true,
                _ => {}
            }
        }
        // Japanese mixes kanji with kana; kanji alone reads as Chinese.
        if kana {
            Some("ja")
        } else if han {
            Some("zh")
        } else {
            None
        }
    }
}
