//! Command-line tokenizer and pipe grouping.
//!
//! Escaping rule: a backslash is active everywhere except inside single
//! quotes. When active, `\\` and `\"` always collapse to the escaped
//! character; `\ ` (escaped space) collapses too, but only outside double
//! quotes — inside a double-quoted string a space needs no escaping, so
//! `\ ` there is kept literally as the two characters `\` and ` `. Any
//! other escaped character is preserved literally along with its backslash
//! (so `\n` stays as the two characters `\` `n`). A trailing, unmatched
//! backslash is a parse error.

use crate::error::{Error, ErrorKind};
use crate::task::Program;

fn invalid(msg: &str) -> Error {
    Error::new(ErrorKind::InvalidArgument, msg)
}

/// Consumes one backslash-escaped character from `chars` and appends the
/// resulting text to `buf`.
fn consume_escape(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    buf: &mut String,
    in_double_quotes: bool,
) -> Result<(), Error> {
    match chars.next() {
        None => Err(invalid("unterminated escape sequence at end of command line")),
        Some(e @ ('\\' | '"')) => {
            buf.push(e);
            Ok(())
        }
        Some(' ') if !in_double_quotes => {
            buf.push(' ');
            Ok(())
        }
        Some(other) => {
            buf.push('\\');
            buf.push(other);
            Ok(())
        }
    }
}

fn consume_double_quoted(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    buf: &mut String,
) -> Result<(), Error> {
    loop {
        match chars.next() {
            None => return Err(invalid("unterminated double-quoted string")),
            Some('"') => return Ok(()),
            Some('\\') => consume_escape(chars, buf, true)?,
            Some(other) => buf.push(other),
        }
    }
}

fn consume_single_quoted(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    buf: &mut String,
) -> Result<(), Error> {
    loop {
        match chars.next() {
            None => return Err(invalid("unterminated single-quoted string")),
            Some('\'') => return Ok(()),
            Some(other) => buf.push(other),
        }
    }
}

/// Tokenizes `input` into pipe-separated groups of argument tokens, then
/// turns each group into a `Program`. An empty group (adjacent pipes, or a
/// leading/trailing pipe) is a parse error, same as an unterminated quote
/// or escape.
pub fn parse_pipeline(input: &str) -> Result<Vec<Program>, Error> {
    let mut groups: Vec<Vec<String>> = vec![Vec::new()];
    let mut current: Option<String> = None;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' => {
                if let Some(tok) = current.take() {
                    groups.last_mut().unwrap().push(tok);
                }
            }
            '|' => {
                if let Some(tok) = current.take() {
                    groups.last_mut().unwrap().push(tok);
                }
                groups.push(Vec::new());
            }
            '"' => {
                let buf = current.get_or_insert_with(String::new);
                consume_double_quoted(&mut chars, buf)?;
            }
            '\'' => {
                let buf = current.get_or_insert_with(String::new);
                consume_single_quoted(&mut chars, buf)?;
            }
            '\\' => {
                let buf = current.get_or_insert_with(String::new);
                consume_escape(&mut chars, buf, false)?;
            }
            other => {
                let buf = current.get_or_insert_with(String::new);
                buf.push(other);
            }
        }
    }
    if let Some(tok) = current.take() {
        groups.last_mut().unwrap().push(tok);
    }

    let mut programs = Vec::with_capacity(groups.len());
    for group in groups {
        if group.is_empty() {
            return Err(invalid("empty pipeline segment (leading, trailing, or doubled pipe)"));
        }
        programs.push(Program::new(group)?);
    }
    Ok(programs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(p: &Program) -> &[String] {
        p.argv()
    }

    #[test]
    fn splits_on_whitespace() {
        let programs = parse_pipeline("echo hi there").unwrap();
        assert_eq!(programs.len(), 1);
        assert_eq!(argv(&programs[0]), &["echo", "hi", "there"]);
    }

    #[test]
    fn splits_on_unquoted_pipe() {
        let programs = parse_pipeline("echo a | wc -c").unwrap();
        assert_eq!(programs.len(), 2);
        assert_eq!(argv(&programs[0]), &["echo", "a"]);
        assert_eq!(argv(&programs[1]), &["wc", "-c"]);
    }

    #[test]
    fn double_quotes_preserve_spaces_and_allow_single_quote() {
        let programs = parse_pipeline(r#"echo "hi 'there' world""#).unwrap();
        assert_eq!(argv(&programs[0]), &["echo", "hi 'there' world"]);
    }

    #[test]
    fn single_quotes_preserve_spaces_and_allow_double_quote() {
        let programs = parse_pipeline(r#"echo 'hi "there" world'"#).unwrap();
        assert_eq!(argv(&programs[0]), &["echo", "hi \"there\" world"]);
    }

    #[test]
    fn backslash_collapses_escaped_space_quote_and_backslash() {
        let programs = parse_pipeline(r#"echo a\ b \"q\" a\\b"#).unwrap();
        assert_eq!(argv(&programs[0]), &["echo", "a b", "\"q\"", "a\\b"]);
    }

    #[test]
    fn backslash_preserves_other_escapes_literally() {
        let programs = parse_pipeline(r"echo a\nb").unwrap();
        assert_eq!(argv(&programs[0]), &["echo", "a\\nb"]);
    }

    #[test]
    fn backslash_space_inside_double_quotes_stays_literal() {
        let programs = parse_pipeline(r#"echo "a\ b""#).unwrap();
        assert_eq!(argv(&programs[0]), &["echo", "a\\ b"]);
    }

    #[test]
    fn backslash_is_literal_inside_single_quotes() {
        let programs = parse_pipeline(r"echo 'a\nb'").unwrap();
        assert_eq!(argv(&programs[0]), &["echo", "a\\nb"]);
    }

    #[test]
    fn unterminated_double_quote_is_invalid() {
        assert!(parse_pipeline(r#"echo "unterminated"#).is_err());
    }

    #[test]
    fn unterminated_single_quote_is_invalid() {
        assert!(parse_pipeline("echo 'unterminated").is_err());
    }

    #[test]
    fn trailing_backslash_is_invalid() {
        assert!(parse_pipeline(r"echo a\").is_err());
    }

    #[test]
    fn leading_pipe_is_invalid() {
        assert!(parse_pipeline("| echo a").is_err());
    }

    #[test]
    fn trailing_pipe_is_invalid() {
        assert!(parse_pipeline("echo a |").is_err());
    }

    #[test]
    fn doubled_pipe_is_invalid() {
        assert!(parse_pipeline("echo a || echo b").is_err());
    }

    #[test]
    fn empty_quoted_token_is_preserved() {
        let programs = parse_pipeline(r#"echo """#).unwrap();
        assert_eq!(argv(&programs[0]), &["echo", ""]);
    }
}
