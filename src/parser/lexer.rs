//! Line-level tokenisation: joins backslash-continued lines, strips
//! comments, and recognises the two parser-directive comments
//! (`# syntax=`, `# escape=`).

/// A logical (continuation-joined) line together with the source line
/// number its first physical line started on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalLine {
    pub text: String,
    pub line: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Directives {
    pub syntax: Option<String>,
    pub escape: char,
}

impl Directives {
    fn new() -> Self {
        Directives {
            syntax: None,
            escape: '\\',
        }
    }
}

/// Splits rendered Dockerfile text into logical lines, honouring
/// backslash-newline continuations (using the directive-controlled escape
/// character) and stripping `#`-comments. Parser-directive comments at the
/// very top of the file (`# syntax=`, `# escape=`) are recognised and
/// removed from the instruction stream; `escape` changes the continuation
/// character for the rest of the file.
///
/// Returns an error `(line, col)` on an unterminated continuation (a
/// trailing escape character on the final physical line).
pub fn tokenize(text: &str) -> Result<(Vec<LogicalLine>, Directives), (usize, usize)> {
    let mut directives = Directives::new();
    let mut still_in_directives = true;

    let mut logical_lines = Vec::new();
    let mut pending: Option<(String, usize)> = None;

    let lines: Vec<&str> = text.lines().collect();
    let total = lines.len();

    for (idx, raw_line) in lines.iter().enumerate() {
        let lineno = idx + 1;

        if still_in_directives {
            if let Some(rest) = raw_line.trim_start().strip_prefix('#') {
                let rest = rest.trim();
                if let Some(value) = rest.strip_prefix("syntax=") {
                    directives.syntax = Some(value.trim().to_string());
                    continue;
                }
                if let Some(value) = rest.strip_prefix("escape=") {
                    if let Some(c) = value.trim().chars().next() {
                        directives.escape = c;
                    }
                    continue;
                }
                if raw_line.trim().is_empty() || raw_line.trim_start().starts_with('#') {
                    // plain comment before any instruction: still allowed,
                    // but ends the directive-recognition window once a
                    // non-directive, non-blank line appears.
                }
            } else if !raw_line.trim().is_empty() {
                still_in_directives = false;
            }
        }

        let (content, is_comment) = strip_comment(raw_line);
        if is_comment && pending.is_none() {
            continue;
        }

        let (acc_text, start_line) = pending.take().unwrap_or_else(|| (String::new(), lineno));
        let mut acc_text = acc_text;
        if !acc_text.is_empty() {
            acc_text.push(' ');
        }

        let trimmed_end = content.trim_end();
        if let Some(body) = trimmed_end.strip_suffix(directives.escape) {
            // Continuation: only a continuation if nothing but whitespace
            // follows, and not on the last physical line of the file.
            if idx + 1 >= total {
                return Err((lineno, raw_line.len()));
            }
            acc_text.push_str(body.trim_end());
            pending = Some((acc_text, start_line));
            continue;
        }

        acc_text.push_str(trimmed_end.trim());
        let joined = acc_text.trim().to_string();
        if !joined.is_empty() {
            logical_lines.push(LogicalLine {
                text: joined,
                line: start_line,
            });
        }
    }

    if let Some((text, start_line)) = pending {
        if !text.trim().is_empty() {
            return Err((start_line, text.len()));
        }
    }

    Ok((logical_lines, directives))
}

/// Strips a trailing `#`-comment from a line, honouring the rule that `#`
/// only starts a comment when not inside quotes. This is a line-oriented
/// approximation (adequate for top-level instruction lines; quoted `#` in
/// operand text, e.g. inside a RUN string, is preserved by checking quote
/// parity up to the first `#`).
fn strip_comment(line: &str) -> (String, bool) {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return (String::new(), true);
    }
    let mut in_single = false;
    let mut in_double = false;
    for (i, c) in line.char_indices() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '#' if !in_single && !in_double => {
                return (line[..i].to_string(), false);
            }
            _ => {}
        }
    }
    (line.to_string(), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_backslash_continuations() {
        let text = "RUN echo hello \\\n    world";
        let (lines, _) = tokenize(text).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "RUN echo hello world");
        assert_eq!(lines[0].line, 1);
    }

    #[test]
    fn strips_full_line_comments() {
        let text = "# just a comment\nFROM scratch";
        let (lines, _) = tokenize(text).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "FROM scratch");
    }

    #[test]
    fn recognises_syntax_and_escape_directives() {
        let text = "# syntax=docker/dockerfile:1\n# escape=`\nFROM scratch";
        let (lines, directives) = tokenize(text).unwrap();
        assert_eq!(directives.syntax.as_deref(), Some("docker/dockerfile:1"));
        assert_eq!(directives.escape, '`');
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn unterminated_continuation_on_last_line_is_an_error() {
        let text = "FROM scratch\nRUN echo hi \\";
        let result = tokenize(text);
        assert!(result.is_err());
    }

    #[test]
    fn trailing_comment_after_instruction_is_stripped() {
        let text = "FROM scratch # base image";
        let (lines, _) = tokenize(text).unwrap();
        assert_eq!(lines[0].text, "FROM scratch");
    }
}
