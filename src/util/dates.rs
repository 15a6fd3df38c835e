//! Lenient date parsing for operator-supplied payload fields.
//!
//! Payloads arrive with dates typed by humans in a handful of US formats.
//! Rather than guess, ambiguity is treated as a parse failure: a string
//! that decodes under more than one surviving interpretation yields `None`
//! and falls back to the raw text upstream.

use chrono::{Datelike, NaiveDate};

const MONTH_FIRST: [&str; 3] = ["%m%d%Y", "%m-%d-%Y", "%m/%d/%Y"];
const YEAR_FIRST: [&str; 3] = ["%Y%m%d", "%Y-%m-%d", "%Y/%m/%d"];

/// Parse a date string against the month-first US formats, admitting
/// year-first formats only when the leading two digits cannot be a month.
/// A candidate survives only if its year is literally present in the input
/// (or is pre-1900, i.e. produced by a two-digit-year misread that the
/// literal check cannot catch). Zero or multiple survivors → `None`.
pub fn parse_flexible_date(input: &str) -> Option<NaiveDate> {
    let mut formats: Vec<&str> = MONTH_FIRST.to_vec();
    if leading_digits_exceed_month(input) {
        formats.extend(YEAR_FIRST);
    }

    let mut candidates: Vec<NaiveDate> = formats
        .iter()
        .filter_map(|fmt| NaiveDate::parse_from_str(input, fmt).ok())
        .filter(|date| input.contains(&date.year().to_string()) || date.year() < 1900)
        .collect();
    candidates.sort_by_key(|date| date.year());

    match candidates.len() {
        1 => candidates.pop(),
        _ => None,
    }
}

fn leading_digits_exceed_month(input: &str) -> bool {
    input
        .get(..2)
        .and_then(|prefix| prefix.parse::<u32>().ok())
        .is_some_and(|n| n > 12)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn month_first_formats_parse() {
        assert_eq!(parse_flexible_date("04152025"), Some(date(2025, 4, 15)));
        assert_eq!(parse_flexible_date("04-15-2025"), Some(date(2025, 4, 15)));
        assert_eq!(parse_flexible_date("04/15/2025"), Some(date(2025, 4, 15)));
    }

    #[test]
    fn year_first_admitted_only_when_prefix_is_not_a_month() {
        assert_eq!(parse_flexible_date("2025-04-15"), Some(date(2025, 4, 15)));
        assert_eq!(parse_flexible_date("2025/04/15"), Some(date(2025, 4, 15)));
        // Prefix "12" is a valid month, so year-first is never tried.
        assert_eq!(parse_flexible_date("1231-04-15"), None);
    }

    #[test]
    fn garbage_and_ambiguity_yield_none() {
        assert_eq!(parse_flexible_date("not a date"), None);
        assert_eq!(parse_flexible_date(""), None);
        assert_eq!(parse_flexible_date("13/45/2025"), None);
    }
}
