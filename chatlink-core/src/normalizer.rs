use unicode_normalization::UnicodeNormalization;

/// Clean user input before it becomes a transcript turn and a request.
/// Unicode NFC normalization + BOM strip + CRLF -> LF + trim.
/// An empty result means "nothing to send".
pub fn normalize_input(s: &str) -> String {
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t.trim().to_string()
}
