use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::take_while1,
    character::complete::{char, multispace1},
    combinator::{opt, recognize},
    error::ErrorKind,
    sequence::{pair, preceded},
};

use crate::Error;
use crate::MAX_PARSE_DEPTH;
use crate::ast::{NumberType, Node, SYMBOL_SPECIAL_CHARS, is_valid_symbol};
use crate::types::type_expr;

/// Convert nom parsing errors to user-friendly messages
fn parse_error_to_message(input: &str, error: nom::Err<nom::error::Error<&str>>) -> String {
    match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            let position = input.len().saturating_sub(e.input.len());
            match e.code {
                ErrorKind::Char => format!("Expected character at position {position}"),
                ErrorKind::Tag => format!("Unexpected token at position {position}"),
                ErrorKind::Verify => format!("Invalid type annotation at position {position}"),
                ErrorKind::TooLarge => {
                    format!("Expression too deeply nested (max depth: {MAX_PARSE_DEPTH})")
                }
                _ => {
                    if position < input.len() {
                        let remaining_chars: String =
                            input.chars().skip(position).take(10).collect();
                        format!("Invalid syntax near '{remaining_chars}'")
                    } else {
                        "Unexpected end of input".into()
                    }
                }
            }
        }
        nom::Err::Incomplete(_) => "Incomplete input".into(),
    }
}

/// Skip whitespace and `;` line comments
fn skip_trivia(mut input: &str) -> IResult<&str, ()> {
    loop {
        if let Ok((rest, _)) = multispace1::<&str, nom::error::Error<&str>>(input) {
            input = rest;
        } else if let Some(comment) = input.strip_prefix(';') {
            input = comment.find('\n').map_or("", |end| &comment[end..]);
        } else {
            return Ok((input, ()));
        }
    }
}

/// Atoms must be followed by a delimiter, so `123abc` is not two atoms
fn atom_boundary(input: &str) -> IResult<&str, ()> {
    match input.chars().next() {
        None => Ok((input, ())),
        Some(c) if c.is_whitespace() || c == '(' || c == ')' || c == ';' => Ok((input, ())),
        Some(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            ErrorKind::Alpha,
        ))),
    }
}

/// Parse a number (integer only, supports decimal and hexadecimal)
fn parse_number(input: &str) -> IResult<&str, Node> {
    let (input, node) = alt((parse_hexadecimal, parse_decimal)).parse(input)?;
    let (input, _) = atom_boundary(input)?;
    Ok((input, node))
}

/// Parse a decimal number
fn parse_decimal(input: &str) -> IResult<&str, Node> {
    let (input, number_str) = recognize(pair(
        opt(char('-')),
        take_while1(|c: char| c.is_ascii_digit()),
    ))
    .parse(input)?;

    match number_str.parse::<NumberType>() {
        Ok(n) => Ok((input, Node::Int(n))),
        // Overflow; symbol parsing rejects a leading digit as well
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            ErrorKind::Digit,
        ))),
    }
}

/// Parse a hexadecimal number (#x or #X prefix)
fn parse_hexadecimal(input: &str) -> IResult<&str, Node> {
    let (input, _) = char('#').parse(input)?;
    let (input, _) = alt((char('x'), char('X'))).parse(input)?;
    let (input, hex_digits) = take_while1(|c: char| c.is_ascii_hexdigit()).parse(input)?;

    match NumberType::from_str_radix(hex_digits, 16) {
        Ok(n) => Ok((input, Node::Int(n))),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            ErrorKind::HexDigit,
        ))),
    }
}

/// Parse `#t` or `#f`; `true` and `false` are handled as identifiers
fn parse_bool(input: &str) -> IResult<&str, Node> {
    let (input, _) = char('#').parse(input)?;
    let (input, flag) = alt((char('t'), char('f'))).parse(input)?;
    let (input, _) = atom_boundary(input)?;
    Ok((input, Node::Bool(flag == 't')))
}

/// Parse an identifier with an optional `:Type` suffix
fn parse_symbol(input: &str) -> IResult<&str, Node> {
    let mut symbol_chars =
        take_while1(|c: char| c.is_alphanumeric() || SYMBOL_SPECIAL_CHARS.contains(c));

    let (remaining, candidate) = symbol_chars.parse(input)?;

    if !is_valid_symbol(candidate) {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            ErrorKind::Alpha,
        )));
    }

    // A bare parametrized type such as `list[int]` in type position
    if remaining.starts_with('[') {
        let (remaining, ty) = type_expr(input)?;
        let (remaining, _) = atom_boundary(remaining)?;
        return Ok((remaining, Node::Annotation(ty)));
    }

    let (remaining, ty) = opt(preceded(char(':'), type_expr)).parse(remaining)?;
    let (remaining, _) = atom_boundary(remaining)?;

    let node = match (candidate, ty) {
        ("true", None) => Node::Bool(true),
        ("false", None) => Node::Bool(false),
        (name, ty) => Node::Symbol {
            name: name.to_owned(),
            ty,
        },
    };
    Ok((remaining, node))
}

/// Parse a standalone `:Type` annotation
fn parse_annotation(input: &str) -> IResult<&str, Node> {
    let (input, ty) = preceded(char(':'), type_expr).parse(input)?;
    let (input, _) = atom_boundary(input)?;
    Ok((input, Node::Annotation(ty)))
}

/// Parse a string literal
fn parse_string(input: &str) -> IResult<&str, Node> {
    let (mut remaining, _) = char('"').parse(input)?;
    let mut chars = String::new();

    loop {
        let mut char_iter = remaining.chars();
        match char_iter.next() {
            Some('"') => {
                return Ok((char_iter.as_str(), Node::Str(chars)));
            }
            Some('\\') => {
                match char_iter.next() {
                    Some('n') => chars.push('\n'),
                    Some('t') => chars.push('\t'),
                    Some('r') => chars.push('\r'),
                    Some('\\') => chars.push('\\'),
                    Some('"') => chars.push('"'),
                    // Unknown escape, or backslash at end of input
                    Some(_) | None => {
                        return Err(nom::Err::Error(nom::error::Error::new(
                            remaining,
                            ErrorKind::Char,
                        )));
                    }
                }
                remaining = char_iter.as_str();
            }
            Some(ch) => {
                chars.push(ch);
                remaining = char_iter.as_str();
            }
            None => {
                // Reached end of input without finding closing quote
                return Err(nom::Err::Error(nom::error::Error::new(
                    remaining,
                    ErrorKind::Char,
                )));
            }
        }
    }
}

/// Parse a parenthesized list; `(quote x)` becomes a quote node
fn parse_list(input: &str, depth: usize) -> IResult<&str, Node> {
    let (mut input, _) = char('(').parse(input)?;
    let mut elements = Vec::new();

    loop {
        let (rest, _) = skip_trivia(input)?;
        if let Some(after) = rest.strip_prefix(')') {
            input = after;
            break;
        }
        let (rest, element) = parse_sexpr(rest, depth + 1)?;
        elements.push(element);
        input = rest;
    }

    let is_quote = matches!(
        elements.as_slice(),
        [Node::Symbol { name, ty: None }, _] if name == "quote"
    );
    if is_quote && let Some(content) = elements.pop() {
        return Ok((input, Node::Quote(Box::new(content))));
    }

    Ok((input, Node::List(elements)))
}

/// Parse quoted expression ('expr)
fn parse_quote(input: &str, depth: usize) -> IResult<&str, Node> {
    let (input, _) = char('\'').parse(input)?;
    let (input, expr) = parse_sexpr(input, depth + 1)?;
    Ok((input, Node::Quote(Box::new(expr))))
}

/// Parse one S-expression, with leading trivia
fn parse_sexpr(input: &str, depth: usize) -> IResult<&str, Node> {
    if depth >= MAX_PARSE_DEPTH {
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            ErrorKind::TooLarge,
        )));
    }
    let (input, _) = skip_trivia(input)?;
    alt((
        |input| parse_quote(input, depth),
        |input| parse_list(input, depth),
        parse_number,
        parse_bool,
        parse_string,
        parse_annotation,
        parse_symbol,
    ))
    .parse(input)
}

/// Parse a complete source text into its top-level forms
pub fn parse_program(input: &str) -> Result<Vec<Node>, Error> {
    let mut forms = Vec::new();
    let mut rest = input;
    loop {
        let (after_trivia, _) =
            skip_trivia(rest).map_err(|e| Error::ParseError(parse_error_to_message(input, e)))?;
        if after_trivia.is_empty() {
            return Ok(forms);
        }
        match parse_sexpr(after_trivia, 0) {
            Ok((remaining, form)) => {
                forms.push(form);
                rest = remaining;
            }
            Err(e) => return Err(Error::ParseError(parse_error_to_message(input, e))),
        }
    }
}

/// Parse exactly one S-expression
pub fn parse_expr(input: &str) -> Result<Node, Error> {
    let mut forms = parse_program(input)?;
    match forms.len() {
        1 => Ok(forms.remove(0)),
        0 => Err(Error::ParseError("Unexpected end of input".into())),
        _ => Err(Error::ParseError(format!(
            "Unexpected remaining input after '{}'",
            forms[0]
        ))),
    }
}
