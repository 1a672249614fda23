const MAX_LINE_CHARS: usize = 4096;

/// Makes a subprocess line safe to print on a terminal: drops ANSI/OSC escape
/// sequences, CR/LF, other control chars and bidi overrides; tabs become spaces.
pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut kept = 0usize;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            skip_escape(&mut chars);
            continue;
        }
        let c = match c {
            '\t' => ' ',
            '\r' | '\n' => continue,
            c if c.is_control() || is_bidi_control(c) => continue,
            c => c,
        };
        out.push(c);
        kept += 1;
        if kept >= MAX_LINE_CHARS {
            if chars.peek().is_some() {
                out.push_str(" ...[truncated]");
            }
            break;
        }
    }
    out
}

fn skip_escape<I: Iterator<Item = char>>(chars: &mut std::iter::Peekable<I>) {
    match chars.next() {
        // CSI: parameters until a final byte in '@'..='~'.
        Some('[') => {
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
        }
        // OSC ends at BEL; OSC/DCS/SOS/PM/APC all accept ST (ESC \).
        Some(intro @ (']' | 'P' | 'X' | '^' | '_')) => {
            while let Some(c) = chars.next() {
                if intro == ']' && c == '\x07' {
                    break;
                }
                if c == '\x1b' && chars.peek() == Some(&'\\') {
                    chars.next();
                    break;
                }
            }
        }
        _ => {}
    }
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

#[cfg(test)]
mod tests {
    use super::sanitize_log_line;

    #[test]
    fn strips_color_and_title_sequences() {
        let input = "mach \u{1b}[1;31mbuild\u{1b}[0m \u{1b}]0;title\u{7}ok";
        assert_eq!(sanitize_log_line(input), "mach build ok");
    }

    #[test]
    fn strips_string_terminated_sequences() {
        assert_eq!(sanitize_log_line("a\u{1b}Pdata\u{1b}\\b"), "ab");
    }

    #[test]
    fn drops_line_breaks_and_bidi_overrides() {
        assert_eq!(sanitize_log_line("a\tb\r\n\u{202e}c"), "a bc");
    }

    #[test]
    fn truncates_very_long_lines() {
        let long = "x".repeat(5000);
        let got = sanitize_log_line(&long);
        assert!(got.ends_with("...[truncated]"));
        assert_eq!(got.chars().filter(|c| *c == 'x').count(), 4096);
    }
}
