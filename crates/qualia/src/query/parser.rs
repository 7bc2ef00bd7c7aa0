//! Query grammar, parsed with `nom`:
//!
//! ```text
//! query        = [ term { "," term } ]
//! term         = prop_name ( exact_match | phrase_match | between_dates | between_num )
//! prop_name    = [A-Za-z0-9_.-]+
//! exact_match  = ":" "exactly" value
//! phrase_match = ":" quoted_or_unquoted
//! between_dates= ":" "between" "dates" date "and" date
//! between_num  = ":" "between" number "and" number
//! value        = date | number | quoted | unquoted
//! quoted       = '"' [^"]+ '"'
//! unquoted     = [^,]+   (trailing spaces trimmed)
//! number       = \d+(\.\d*)? | \.\d+
//! date         = YYYY-MM-DD
//! ```
//!
//! Terms combine with implicit conjunction; an empty query matches everything. `nom`
//! is reached for here over a regex-based tokenizer since it composes more cleanly
//! with the keyword/value alternation this grammar needs.
//!
//! Within a term, the more specific productions (`exactly`, `between dates`,
//! `between`) are tried before the catch-all `phrase_match`, since an unquoted value
//! would otherwise swallow the keyword.

use super::ast::Expr;
use chrono::NaiveDate;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, digit0, digit1, multispace0, multispace1, none_of};
use nom::combinator::{eof, map, map_res, opt, recognize};
use nom::multi::{many0, separated_list0};
use nom::sequence::{delimited, pair, preceded, terminated, tuple};
use nom::IResult;

fn is_field_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.' || c == '-'
}

fn prop_name(input: &str) -> IResult<&str, &str> {
    take_while1(is_field_char)(input)
}

fn quoted(input: &str) -> IResult<&str, String> {
    delimited(char('"'), map(many0(none_of("\"")), |chars: Vec<char>| chars.into_iter().collect()), char('"'))(input)
}

fn unquoted(input: &str) -> IResult<&str, String> {
    map(take_while1(|c: char| c != ','), |s: &str| s.trim_end().to_string())(input)
}

/// `quoted_or_unquoted` -- the shared production behind both `value` and
/// `phrase_match`, since neither ever needs to distinguish a quoted date/number from
/// plain text once captured.
fn quoted_or_unquoted(input: &str) -> IResult<&str, String> {
    alt((quoted, unquoted))(input)
}

fn number(input: &str) -> IResult<&str, f64> {
    map_res(
        recognize(alt((recognize(pair(digit1, opt(pair(char('.'), digit0)))), recognize(pair(char('.'), digit1))))),
        |s: &str| s.parse::<f64>(),
    )(input)
}

fn date(input: &str) -> IResult<&str, NaiveDate> {
    map_res(take_while1(|c: char| c.is_ascii_digit() || c == '-'), |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d"))(input)
}

fn exact_match(input: &str) -> IResult<&str, String> {
    preceded(pair(tag("exactly"), multispace0), quoted_or_unquoted)(input)
}

fn between_dates(input: &str) -> IResult<&str, (NaiveDate, NaiveDate)> {
    map(
        tuple((
            tag("between"),
            multispace1,
            tag("dates"),
            multispace1,
            date,
            multispace1,
            tag("and"),
            multispace1,
            date,
        )),
        |(_, _, _, _, min, _, _, _, max)| (min, max),
    )(input)
}

fn between_numbers(input: &str) -> IResult<&str, (f64, f64)> {
    map(
        tuple((tag("between"), multispace1, number, multispace1, tag("and"), multispace1, number)),
        |(_, _, min, _, _, _, max)| (min, max),
    )(input)
}

enum TermValue {
    Exact(String),
    BetweenDates(NaiveDate, NaiveDate),
    BetweenNumbers(f64, f64),
    Phrase(String),
}

fn term_value(input: &str) -> IResult<&str, TermValue> {
    alt((
        map(exact_match, TermValue::Exact),
        map(between_dates, |(min, max)| TermValue::BetweenDates(min, max)),
        map(between_numbers, |(min, max)| TermValue::BetweenNumbers(min, max)),
        map(quoted_or_unquoted, TermValue::Phrase),
    ))(input)
}

fn build_term(field: &str, value: TermValue) -> Expr {
    let field = field.to_string();
    match value {
        TermValue::Exact(value) => Expr::Equals { field, value },
        TermValue::BetweenDates(min, max) => Expr::BetweenDates { field, min, max },
        TermValue::BetweenNumbers(min, max) => Expr::BetweenNumbers { field, min, max },
        TermValue::Phrase(phrase) => Expr::Phrase { field, phrase },
    }
}

fn term(input: &str) -> IResult<&str, Expr> {
    let (input, field) = prop_name(input)?;
    let (input, _) = char(':')(input)?;
    let (input, _) = multispace0(input)?;
    let (input, value) = term_value(input)?;
    Ok((input, build_term(field, value)))
}

fn comma_separator(input: &str) -> IResult<&str, char> {
    delimited(multispace0, char(','), multispace0)(input)
}

fn query(input: &str) -> IResult<&str, Expr> {
    map(separated_list0(comma_separator, term), Expr::and)(input)
}

/// Parse a full query string. An empty (or whitespace-only) string is the grammar's
/// `empty` production, handled up front since `separated_list0` would otherwise try
/// (and fail) to parse a zero-length term out of it.
pub fn parse(input: &str) -> Result<Expr, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Expr::Empty);
    }
    match terminated(query, eof)(trimmed) {
        Ok((_, expr)) => Ok(expr),
        Err(e) => Err(format!("invalid query {input:?}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn empty_query_matches_everything() {
        assert_eq!(parse("").unwrap(), Expr::Empty);
        assert_eq!(parse("   ").unwrap(), Expr::Empty);
    }

    #[test]
    fn bare_term_is_a_phrase_query() {
        assert_eq!(parse("tags:rust").unwrap(), Expr::Phrase { field: "tags".to_string(), phrase: "rust".to_string() });
    }

    #[test]
    fn exactly_term_is_an_equality_query() {
        assert_eq!(
            parse("p: exactly 5").unwrap(),
            Expr::Equals { field: "p".to_string(), value: "5".to_string() }
        );
    }

    #[test]
    fn quoted_phrase_term() {
        assert_eq!(
            parse(r#"comments: "hello world""#).unwrap(),
            Expr::Phrase { field: "comments".to_string(), phrase: "hello world".to_string() }
        );
    }

    #[test]
    fn comma_joined_conjunction() {
        let expr = parse(r#"tags:rust, comments: "fast""#).unwrap();
        assert_eq!(
            expr,
            Expr::And(vec![
                Expr::Phrase { field: "tags".to_string(), phrase: "rust".to_string() },
                Expr::Phrase { field: "comments".to_string(), phrase: "fast".to_string() },
            ])
        );
    }

    #[test]
    fn between_numbers_term() {
        let expr = parse("value: between 2 and 3").unwrap();
        assert_eq!(expr, Expr::BetweenNumbers { field: "value".to_string(), min: 2.0, max: 3.0 });
    }

    #[test]
    fn between_dates_term() {
        let expr = parse("imported-at: between dates 2020-01-01 and 2020-12-31").unwrap();
        assert_eq!(
            expr,
            Expr::BetweenDates {
                field: "imported-at".to_string(),
                min: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                max: NaiveDate::from_ymd_opt(2020, 12, 31).unwrap(),
            }
        );
    }

    #[test]
    fn dotted_field_name_for_aliased_targets() {
        let expr = parse("image.height: exactly 100").unwrap();
        assert_eq!(expr, Expr::Equals { field: "image.height".to_string(), value: "100".to_string() });
    }

    #[test]
    fn malformed_query_errors() {
        assert!(parse(":::").is_err());
    }

    #[test]
    fn parser_never_panics_on_arbitrary_input() {
        for input in ["", ",", "a:", "a:\"unterminated", "a,b,c", "🎉:🎉"] {
            let _ = parse(input);
        }
    }
}
