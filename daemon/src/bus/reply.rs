//! Parses the textual replies printed by `dbus-send --print-reply`.
//!
//! The reply is not treated as a structured document. It is split into tokens, and fields are
//! located by their marker token (e.g. `"xesam:title"`), taking the value token(s) right after.
//! A marker that is missing, or followed by something unexpected, only drops that one field.

use nom::branch::alt;
use nom::bytes::complete::{tag, take_till, take_till1};
use nom::character::complete::{char, digit1, multispace0};
use nom::combinator::{map, map_opt, map_res, opt, recognize, value};
use nom::multi::many0;
use nom::sequence::{pair, preceded};
use nom::{IResult, Parser};

use crate::state::TrackInfo;

const TITLE: &str = "xesam:title";
const ARTIST: &str = "xesam:artist";
const ALBUM: &str = "xesam:album";
const ART_URL: &str = "mpris:artUrl";
const LENGTH: &str = "mpris:length";

/// Turns raw replies into values.
///
/// Kept behind a trait so the bus client does not depend on one textual format.
pub trait ReplyParser {
    /// All names in a `ListNames` reply.
    fn names(&self, reply: &str) -> Vec<String>;
    /// Metadata fields in a `Metadata` property reply.
    fn metadata(&self, reply: &str) -> TrackInfo;
    /// The first floating point value in the reply.
    fn double(&self, reply: &str) -> Option<f64>;
}

/// Parser for `dbus-send --print-reply` output.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrintReply;

impl ReplyParser for PrintReply {
    fn names(&self, reply: &str) -> Vec<String> {
        tokenize(reply)
            .into_iter()
            .filter_map(|token| match token {
                Token::Str(name) => Some(name.to_string()),
                _ => None,
            })
            .collect()
    }

    fn metadata(&self, reply: &str) -> TrackInfo {
        let tokens = tokenize(reply);
        TrackInfo {
            name: scalar_string(&tokens, TITLE),
            artists: string_run(&tokens, ARTIST),
            album: scalar_string(&tokens, ALBUM),
            cover_url: scalar_string(&tokens, ART_URL),
            duration_ms: after_marker(&tokens, LENGTH).and_then(|token| match token {
                Token::Int(text) => text.parse::<u64>().ok().map(|micros| micros / 1000),
                _ => None,
            }),
        }
    }

    fn double(&self, reply: &str) -> Option<f64> {
        tokenize(reply).into_iter().find_map(|token| match token {
            Token::Double(number) => Some(number),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token<'a> {
    /// `string "..."`
    Str(&'a str),
    /// `int64 N`, `uint64 N` and friends, kept as text so both signs fit.
    Int(&'a str),
    /// `double X`
    Double(f64),
    /// `]`, the end of an array.
    Close,
    /// Any other word.
    Other,
}

/// Metadata keys look like `namespace:name`.
fn is_marker(text: &str) -> bool {
    text.starts_with("xesam:") || text.starts_with("mpris:")
}

fn string_token(input: &str) -> IResult<&str, Token<'_>> {
    let (input, _) = tag("string \"")(input)?;
    // The value runs up to the last quote of the line, so quotes inside it survive
    map_opt(take_till(|c: char| c == '\n'), |line: &str| {
        line.rsplit_once('"').map(|(text, _)| Token::Str(text))
    })
    .parse(input)
}

fn int_token(input: &str) -> IResult<&str, Token<'_>> {
    let (input, _) = alt((
        tag("uint64 "),
        tag("int64 "),
        tag("uint32 "),
        tag("int32 "),
        tag("uint16 "),
        tag("int16 "),
    ))
    .parse(input)?;
    map(recognize(pair(opt(char('-')), digit1)), Token::Int).parse(input)
}

fn double_token(input: &str) -> IResult<&str, Token<'_>> {
    let (input, _) = tag("double ")(input)?;
    map_res(take_till1(|c: char| c.is_whitespace()), |text: &str| {
        text.parse::<f64>().map(Token::Double)
    })
    .parse(input)
}

fn close_token(input: &str) -> IResult<&str, Token<'_>> {
    value(Token::Close, char(']')).parse(input)
}

fn other_token(input: &str) -> IResult<&str, Token<'_>> {
    value(Token::Other, take_till1(|c: char| c.is_whitespace())).parse(input)
}

fn tokens(input: &str) -> IResult<&str, Vec<Token<'_>>> {
    many0(preceded(
        multispace0,
        alt((string_token, int_token, double_token, close_token, other_token)),
    ))
    .parse(input)
}

/// Splits a reply into significant tokens, dropping noise words.
fn tokenize(reply: &str) -> Vec<Token<'_>> {
    match tokens(reply) {
        Ok((_, tokens)) => tokens
            .into_iter()
            .filter(|token| *token != Token::Other)
            .collect(),
        Err(err) => {
            log::debug!("Cannot tokenise bus reply: {err}");
            Vec::new()
        }
    }
}

fn marker_position(tokens: &[Token<'_>], marker: &str) -> Option<usize> {
    tokens
        .iter()
        .position(|token| matches!(token, Token::Str(text) if *text == marker))
}

fn after_marker<'a>(tokens: &[Token<'a>], marker: &str) -> Option<Token<'a>> {
    let position = marker_position(tokens, marker)?;
    tokens.get(position + 1).copied()
}

fn scalar_string(tokens: &[Token<'_>], marker: &str) -> Option<String> {
    match after_marker(tokens, marker)? {
        Token::Str(text) if !is_marker(text) => Some(text.to_string()),
        _ => None,
    }
}

/// The run of strings after the marker, up to the end of the array or the next marker.
fn string_run(tokens: &[Token<'_>], marker: &str) -> Option<Vec<String>> {
    let position = marker_position(tokens, marker)?;
    let run: Vec<String> = tokens[position + 1..]
        .iter()
        .map_while(|token| match token {
            Token::Str(text) if !is_marker(text) => Some(text.to_string()),
            _ => None,
        })
        .collect();
    if run.is_empty() { None } else { Some(run) }
}
