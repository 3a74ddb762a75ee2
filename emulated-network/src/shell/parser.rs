//! The subset of the bash grammar used by scripted commands
//!
//! Supported: words with single/double quotes and backslash escapes, `;`, `&`, `&&`, `||`,
//! comments and output redirections (`>`, `>>`, `2>`, `&>`, `2>&1`). Pipes and input
//! redirections are rejected.

use std::fmt::{Display, Formatter};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("syntax error near unexpected token `{0}'")]
    UnexpectedToken(String),
    #[error("unexpected EOF while looking for matching `{0}'")]
    UnterminatedQuote(char),
    #[error("{0}: not supported by the emulated shell")]
    Unsupported(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
    Both,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RedirectTarget {
    File { path: String, append: bool },
    /// `2>&1` and `1>&2`
    Duplicate(Stream),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Redirect {
    pub stream: Stream,
    pub target: RedirectTarget,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Command {
    pub argv: Vec<String>,
    pub redirects: Vec<Redirect>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connector {
    And,
    Or,
}

/// Commands joined by `&&` and `||`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AndOrList {
    pub first: Command,
    pub rest: Vec<(Connector, Command)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptItem {
    pub list: AndOrList,
    pub background: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    Semicolon,
    Ampersand,
    And,
    Or,
    Redirect(Stream, RedirectKind),
}

#[derive(Debug, PartialEq, Eq)]
enum RedirectKind {
    Truncate,
    Append,
    Duplicate(Stream),
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Word(word) => write!(f, "{word}"),
            Token::Semicolon => write!(f, ";"),
            Token::Ampersand => write!(f, "&"),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Redirect(_, RedirectKind::Append) => write!(f, ">>"),
            Token::Redirect(_, _) => write!(f, ">"),
        }
    }
}

fn tokenize(line: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    let mut word = String::new();
    // Distinguishes `''` (an empty word) from no word at all
    let mut in_word = false;

    fn finish(tokens: &mut Vec<Token>, word: &mut String, in_word: &mut bool) {
        if *in_word {
            tokens.push(Token::Word(std::mem::take(word)));
            *in_word = false;
        }
    }

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' | '\n' => finish(&mut tokens, &mut word, &mut in_word),
            '#' if !in_word => break,
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => return Err(ParseError::UnterminatedQuote('\'')),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => word.push(c),
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => return Err(ParseError::UnterminatedQuote('"')),
                        },
                        Some(c) => word.push(c),
                        None => return Err(ParseError::UnterminatedQuote('"')),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(c) = chars.next() {
                    word.push(c);
                }
            }
            ';' => {
                finish(&mut tokens, &mut word, &mut in_word);
                tokens.push(Token::Semicolon);
            }
            '|' => {
                finish(&mut tokens, &mut word, &mut in_word);
                if chars.next_if_eq(&'|').is_none() {
                    return Err(ParseError::Unsupported("pipes"));
                }
                tokens.push(Token::Or);
            }
            '<' => return Err(ParseError::Unsupported("input redirection")),
            '&' => {
                finish(&mut tokens, &mut word, &mut in_word);
                if chars.next_if_eq(&'&').is_some() {
                    tokens.push(Token::And);
                } else if chars.next_if_eq(&'>').is_some() {
                    let kind = if chars.next_if_eq(&'>').is_some() {
                        RedirectKind::Append
                    } else {
                        RedirectKind::Truncate
                    };
                    tokens.push(Token::Redirect(Stream::Both, kind));
                } else {
                    tokens.push(Token::Ampersand);
                }
            }
            '>' => {
                // A lone unquoted digit right before `>` names the redirected descriptor
                let stream = match (in_word, word.as_str()) {
                    (true, "1") => {
                        word.clear();
                        in_word = false;
                        Stream::Stdout
                    }
                    (true, "2") => {
                        word.clear();
                        in_word = false;
                        Stream::Stderr
                    }
                    _ => {
                        finish(&mut tokens, &mut word, &mut in_word);
                        Stream::Stdout
                    }
                };

                let kind = if chars.next_if_eq(&'>').is_some() {
                    RedirectKind::Append
                } else if chars.next_if_eq(&'&').is_some() {
                    match chars.next() {
                        Some('1') => RedirectKind::Duplicate(Stream::Stdout),
                        Some('2') => RedirectKind::Duplicate(Stream::Stderr),
                        other => {
                            return Err(ParseError::UnexpectedToken(
                                other.map(String::from).unwrap_or("newline".to_string()),
                            ));
                        }
                    }
                } else {
                    RedirectKind::Truncate
                };
                tokens.push(Token::Redirect(stream, kind));
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }

    finish(&mut tokens, &mut word, &mut in_word);
    Ok(tokens)
}

/// Parses a command line into the items it runs, in order
pub fn parse(line: &str) -> Result<Vec<ScriptItem>, ParseError> {
    let mut tokens = tokenize(line)?.into_iter().peekable();
    let mut items = Vec::new();

    let mut list: Option<AndOrList> = None;
    let mut current = Command::default();
    let mut pending_connector: Option<Connector> = None;

    fn close_command(
        list: &mut Option<AndOrList>,
        current: &mut Command,
        connector: Option<Connector>,
        token: &Token,
    ) -> Result<(), ParseError> {
        if current.argv.is_empty() {
            return Err(ParseError::UnexpectedToken(token.to_string()));
        }

        let command = std::mem::take(current);
        match (list.as_mut(), connector) {
            (None, _) => {
                *list = Some(AndOrList {
                    first: command,
                    rest: Vec::new(),
                })
            }
            (Some(list), Some(connector)) => list.rest.push((connector, command)),
            (Some(_), None) => return Err(ParseError::UnexpectedToken(token.to_string())),
        }

        Ok(())
    }

    while let Some(token) = tokens.next() {
        match token {
            Token::Word(word) => current.argv.push(word),
            Token::Redirect(stream, kind) => {
                let target = match kind {
                    RedirectKind::Duplicate(target) => RedirectTarget::Duplicate(target),
                    RedirectKind::Truncate | RedirectKind::Append => match tokens.next() {
                        Some(Token::Word(path)) => RedirectTarget::File {
                            path,
                            append: kind == RedirectKind::Append,
                        },
                        Some(other) => return Err(ParseError::UnexpectedToken(other.to_string())),
                        None => return Err(ParseError::UnexpectedToken("newline".to_string())),
                    },
                };
                current.redirects.push(Redirect { stream, target });
            }
            Token::And | Token::Or => {
                let connector = if token == Token::And {
                    Connector::And
                } else {
                    Connector::Or
                };
                close_command(&mut list, &mut current, pending_connector.take(), &token)?;
                pending_connector = Some(connector);
            }
            Token::Semicolon | Token::Ampersand => {
                close_command(&mut list, &mut current, pending_connector.take(), &token)?;
                if let Some(list) = list.take() {
                    items.push(ScriptItem {
                        list,
                        background: token == Token::Ampersand,
                    });
                }
            }
        }
    }

    if !current.argv.is_empty() {
        close_command(
            &mut list,
            &mut current,
            pending_connector.take(),
            &Token::Semicolon,
        )?;
    } else if pending_connector.is_some() || !current.redirects.is_empty() {
        return Err(ParseError::UnexpectedToken("newline".to_string()));
    }

    if let Some(list) = list {
        items.push(ScriptItem {
            list,
            background: false,
        });
    }

    Ok(items)
}

impl Display for Command {
    /// Renders the command the way `jobs` shows it
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.argv.join(" "))?;
        for redirect in &self.redirects {
            let fd = match redirect.stream {
                Stream::Stdout => "",
                Stream::Stderr => "2",
                Stream::Both => "&",
            };
            match &redirect.target {
                RedirectTarget::File { path, append } => {
                    let op = if *append { ">>" } else { ">" };
                    write!(f, " {fd}{op} {path}")?;
                }
                RedirectTarget::Duplicate(Stream::Stderr) => write!(f, " {fd}>&2")?,
                RedirectTarget::Duplicate(_) => write!(f, " {fd}>&1")?,
            }
        }

        Ok(())
    }
}

impl Display for AndOrList {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.first)?;
        for (connector, command) in &self.rest {
            match connector {
                Connector::And => write!(f, " && {command}")?,
                Connector::Or => write!(f, " || {command}")?,
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn argv(item: &ScriptItem) -> Vec<&str> {
        item.list.first.argv.iter().map(|s| s.as_str()).collect()
    }

    #[test]
    fn test_quotes_and_escapes() {
        let items = parse(r#"echo 'a b' "c \"d\"" e\ f ''"#).unwrap();
        assert_eq!(argv(&items[0]), ["echo", "a b", "c \"d\"", "e f", ""]);
    }

    #[test]
    fn test_background_and_sequences() {
        let items = parse("iperf -s & sleep 1; iperf -c 10.0.0.2 -t 5 # comment").unwrap();
        assert_eq!(items.len(), 3);
        assert!(items[0].background);
        assert_eq!(argv(&items[0]), ["iperf", "-s"]);
        assert!(!items[1].background);
        assert_eq!(argv(&items[2]), ["iperf", "-c", "10.0.0.2", "-t", "5"]);
    }

    #[test]
    fn test_and_or_lists() {
        let items = parse("false && echo no || echo yes").unwrap();
        assert_eq!(items.len(), 1);
        let list = &items[0].list;
        assert_eq!(list.rest.len(), 2);
        assert_eq!(list.rest[0].0, Connector::And);
        assert_eq!(list.rest[1].0, Connector::Or);
        assert_eq!(list.to_string(), "false && echo no || echo yes");
    }

    #[test]
    fn test_redirections() {
        let items = parse("iperf -s > server.log 2>&1 &").unwrap();
        let command = &items[0].list.first;
        assert_eq!(command.argv, ["iperf", "-s"]);
        assert_eq!(
            command.redirects,
            [
                Redirect {
                    stream: Stream::Stdout,
                    target: RedirectTarget::File {
                        path: "server.log".to_string(),
                        append: false
                    },
                },
                Redirect {
                    stream: Stream::Stderr,
                    target: RedirectTarget::Duplicate(Stream::Stdout),
                },
            ]
        );

        let items = parse("tcpdump -i h1-eth0 2>/dev/null >> out.txt").unwrap();
        let command = &items[0].list.first;
        assert_eq!(command.redirects[0].stream, Stream::Stderr);
        assert_eq!(
            command.redirects[1].target,
            RedirectTarget::File {
                path: "out.txt".to_string(),
                append: true
            }
        );

        let items = parse("echo hi &> all.txt").unwrap();
        assert_eq!(items[0].list.first.redirects[0].stream, Stream::Both);
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            parse("ping 10.0.0.2 | grep ttl"),
            Err(ParseError::Unsupported("pipes"))
        );
        assert_eq!(
            parse("&& echo"),
            Err(ParseError::UnexpectedToken("&&".to_string()))
        );
        assert_eq!(
            parse("echo >"),
            Err(ParseError::UnexpectedToken("newline".to_string()))
        );
        assert_eq!(
            parse("echo 'unterminated"),
            Err(ParseError::UnterminatedQuote('\''))
        );
        assert!(parse("   ").unwrap().is_empty());
    }
}
