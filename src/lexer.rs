use std::fmt;

use combine::error::ParseError;
use combine::parser::char::char;
use combine::stream::state::{SourcePosition, State};
use combine::stream::Stream;
use combine::{any, eof, many, optional, position, satisfy, skip_many, Parser};

use crate::error::CompileError;
use crate::syntax::{Loc, Word};

#[derive(Debug, PartialEq, Clone)]
pub enum Tok {
    Ident(String),
    /// `name:`, a label definition.
    Label(String),
    Int(Word),
    Comma,
    Colon,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Macro,
    EndMacro,
    Newline,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Tok::Ident(s) => f.write_str(s),
            Tok::Label(s) => write!(f, "{}:", s),
            Tok::Int(n) => write!(f, "{}", n),
            Tok::Comma => f.write_str(","),
            Tok::Colon => f.write_str(":"),
            Tok::LParen => f.write_str("("),
            Tok::RParen => f.write_str(")"),
            Tok::LBrace => f.write_str("{"),
            Tok::RBrace => f.write_str("}"),
            Tok::Macro => f.write_str("!macro"),
            Tok::EndMacro => f.write_str("!endmacro"),
            Tok::Newline => f.write_str("end of line"),
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct Token {
    pub tok: Tok,
    pub loc: Loc,
}

impl Token {
    pub fn new(tok: Tok, loc: Loc) -> Token {
        Token { tok, loc }
    }
}

/// What the combinator pass recognises. Validation of numbers, directives
/// and stray characters happens afterwards so that errors carry positions.
#[derive(Debug, PartialEq, Clone)]
enum Raw {
    Word(String, bool),
    Number(String),
    Directive(String),
    Punct(char),
    Newline,
    Stray(char),
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

fn trivia<I>() -> impl Parser<Input = I, Output = ()>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    let blank = satisfy(|c: char| c == ' ' || c == '\t' || c == '\r').map(|_| ());
    let comment = char(';').with(skip_many(satisfy(|c: char| c != '\n')));
    skip_many(blank.or(comment))
}

fn raw<I>() -> impl Parser<Input = I, Output = Raw>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    let word = (
        satisfy(|c: char| c.is_ascii_alphabetic() || c == '_'),
        many(satisfy(is_word_char)),
        optional(char(':')),
    )
        .map(|(first, rest, colon): (char, String, Option<char>)| {
            let mut s = first.to_string();
            s.push_str(&rest);
            Raw::Word(s, colon.is_some())
        });

    let number = (
        satisfy(|c: char| c.is_ascii_digit() || c == '-'),
        many(satisfy(is_word_char)),
    )
        .map(|(first, rest): (char, String)| {
            let mut s = first.to_string();
            s.push_str(&rest);
            Raw::Number(s)
        });

    let directive = char('!')
        .with(many(satisfy(is_word_char)))
        .map(|s: String| Raw::Directive(s));

    let newline = char('\n').map(|_| Raw::Newline);
    let punct = satisfy(|c: char| ",:(){}".contains(c)).map(Raw::Punct);

    word.or(number)
        .or(directive)
        .or(newline)
        .or(punct)
        .or(any().map(Raw::Stray))
}

fn raw_lexemes<I>() -> impl Parser<Input = I, Output = Vec<(SourcePosition, Raw)>>
where
    I: Stream<Item = char, Position = SourcePosition>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    trivia()
        .with(many((position(), raw()).skip(trivia())))
        .skip(eof())
}

fn loc_of(pos: SourcePosition) -> Loc {
    Loc::new(pos.line.max(0) as usize, pos.column.max(0) as usize)
}

fn lex_error(loc: Loc, msg: String) -> CompileError {
    CompileError::Lex { loc, msg }
}

fn parse_number(text: &str) -> Option<Word> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = if let Some(hex) = digits.strip_prefix("0x") {
        if hex.is_empty() {
            return None;
        }
        let bits = u32::from_str_radix(hex, 16).ok()?;
        if !negative {
            // Unsigned hex is a bit pattern: 0xFFFFFFFF is -1.
            return Some(bits as Word);
        }
        i64::from(bits)
    } else {
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse::<i64>().ok()?
    };
    let value = if negative { -magnitude } else { magnitude };
    if value < i64::from(Word::MIN) || value > i64::from(Word::MAX) {
        None
    } else {
        Some(value as Word)
    }
}

fn classify(pos: SourcePosition, raw: Raw) -> Result<Token, CompileError> {
    let loc = loc_of(pos);
    let tok = match raw {
        Raw::Word(s, true) => Tok::Label(s),
        Raw::Word(s, false) => Tok::Ident(s),
        Raw::Number(s) => match parse_number(&s) {
            Some(n) => Tok::Int(n),
            None => return Err(lex_error(loc, format!("malformed integer literal `{}`", s))),
        },
        Raw::Directive(s) => match s.as_str() {
            "macro" => Tok::Macro,
            "endmacro" => Tok::EndMacro,
            _ => return Err(lex_error(loc, format!("unknown directive `!{}`", s))),
        },
        Raw::Punct(',') => Tok::Comma,
        Raw::Punct(':') => Tok::Colon,
        Raw::Punct('(') => Tok::LParen,
        Raw::Punct(')') => Tok::RParen,
        Raw::Punct('{') => Tok::LBrace,
        Raw::Punct('}') => Tok::RBrace,
        Raw::Punct(c) | Raw::Stray(c) => {
            return Err(lex_error(loc, format!("unexpected character {:?}", c)))
        }
        Raw::Newline => Tok::Newline,
    };
    Ok(Token::new(tok, loc))
}

/// Checks that every `(`, `{` and `!macro` is closed by its own closer.
fn check_balanced(tokens: &[Token]) -> Result<(), CompileError> {
    let mut open: Vec<&Token> = Vec::new();
    for t in tokens {
        let closes = match t.tok {
            Tok::LParen | Tok::LBrace => {
                open.push(t);
                continue;
            }
            Tok::Macro => {
                if let Some(outer) = open.iter().find(|o| o.tok == Tok::Macro) {
                    return Err(lex_error(
                        t.loc,
                        format!("`!macro` inside the definition opened at {}", outer.loc),
                    ));
                }
                open.push(t);
                continue;
            }
            Tok::RParen => Tok::LParen,
            Tok::RBrace => Tok::LBrace,
            Tok::EndMacro => Tok::Macro,
            _ => continue,
        };
        match open.pop() {
            Some(o) if o.tok == closes => {}
            Some(o) => {
                return Err(lex_error(
                    o.loc,
                    format!("unterminated `{}`: found `{}` at {}", o.tok, t.tok, t.loc),
                ))
            }
            None => return Err(lex_error(t.loc, format!("unmatched `{}`", t.tok))),
        }
    }
    match open.pop() {
        Some(o) => Err(lex_error(o.loc, format!("unterminated `{}`", o.tok))),
        None => Ok(()),
    }
}

pub fn lex(source: &str) -> Result<Vec<Token>, CompileError> {
    let raws = match raw_lexemes().easy_parse(State::new(source)) {
        Ok((raws, _)) => raws,
        Err(e) => return Err(lex_error(loc_of(e.position), format!("{:?}", e.errors))),
    };
    let tokens = raws
        .into_iter()
        .map(|(pos, raw)| classify(pos, raw))
        .collect::<Result<Vec<Token>, CompileError>>()?;
    check_balanced(&tokens)?;
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Tok> {
        lex(source).unwrap().into_iter().map(|t| t.tok).collect()
    }

    fn ident(s: &str) -> Tok {
        Tok::Ident(s.to_string())
    }

    #[test]
    fn lexes_an_instruction_line() {
        assert_eq!(
            kinds("add c, b\n"),
            vec![ident("add"), ident("c"), Tok::Comma, ident("b"), Tok::Newline]
        );
    }

    #[test]
    fn label_definitions_keep_their_colon() {
        assert_eq!(
            kinds("loop:\n  jmp loop"),
            vec![Tok::Label("loop".to_string()), Tok::Newline, ident("jmp"), ident("loop")]
        );
    }

    #[test]
    fn comments_and_blank_lines_yield_only_newlines() {
        assert_eq!(
            kinds("; a comment\n\n   \t\nnop ; trailing\n"),
            vec![Tok::Newline, Tok::Newline, Tok::Newline, ident("nop"), Tok::Newline]
        );
    }

    #[test]
    fn lexes_integers() {
        assert_eq!(
            kinds("set a, -12\nset b, 0xff\nset c, 0xFFFFFFFF"),
            vec![
                ident("set"), ident("a"), Tok::Comma, Tok::Int(-12), Tok::Newline,
                ident("set"), ident("b"), Tok::Comma, Tok::Int(255), Tok::Newline,
                ident("set"), ident("c"), Tok::Comma, Tok::Int(-1),
            ]
        );
        assert_eq!(kinds("-0x80000000"), vec![Tok::Int(Word::MIN)]);
        assert_eq!(kinds("-0x10"), vec![Tok::Int(-16)]);
        assert_eq!(kinds("0x80000000"), vec![Tok::Int(Word::MIN)]);
    }

    #[test]
    fn rejects_malformed_integers() {
        let cases = [
            "set a, 12ab",
            "set a, 0x",
            "set a, -",
            "set a, 99999999999",
            "set a, -0xFFFFFFFF",
            "set a, -0x80000001",
        ];
        for bad in cases.iter() {
            match lex(bad) {
                Err(CompileError::Lex { loc, .. }) => assert_eq!(loc, Loc::new(1, 8)),
                other => panic!("expected lex error for {:?}, got {:?}", bad, other),
            }
        }
    }

    #[test]
    fn tracks_line_and_column() {
        let tokens = lex("main:\n    set a, 1").unwrap();
        assert_eq!(tokens[0].loc, Loc::new(1, 1));
        assert_eq!(tokens[2].loc, Loc::new(2, 5));
        assert_eq!(tokens[5].loc, Loc::new(2, 12));
    }

    #[test]
    fn lexes_macro_directives() {
        assert_eq!(
            kinds("!macro inc(r): add r, 1 !endmacro"),
            vec![
                Tok::Macro, ident("inc"), Tok::LParen, ident("r"), Tok::RParen, Tok::Colon,
                ident("add"), ident("r"), Tok::Comma, Tok::Int(1), Tok::EndMacro,
            ]
        );
    }

    #[test]
    fn rejects_unknown_directive_and_characters() {
        assert!(lex("!include foo").is_err());
        assert!(lex("set a, 1 # nope").is_err());
        assert!(lex("jmp loop$1").is_err());
    }

    #[test]
    fn rejects_unterminated_constructs() {
        match lex("foo(a, b\nnop") {
            Err(CompileError::Lex { loc, .. }) => assert_eq!(loc, Loc::new(1, 4)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(lex("!macro m():\n nop\n").is_err());
        assert!(lex("fun f() { nop )").is_err());
        assert!(lex("nop }").is_err());
        assert!(lex("!macro a(): !macro b(): nop !endmacro !endmacro").is_err());
    }
}
