//! Month-granularity dates used as the join key.
//!
//! The stream and the two reference tables all spell months differently
//! (`Jan-24`, `01/2024`, ...). Everything is parsed into [`NormalizedDate`]
//! before any comparison happens.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Month, NaiveDate, Utc};
use thiserror::Error;

/// Textual month formats accepted by the loaders and decoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DateFormat {
    /// `MMM-yy`, e.g. `Jan-24`. Two-digit years land in 2000-2099.
    MonthAbbrevShortYear,
    /// `MM/yyyy`, e.g. `01/2024`.
    NumericMonthYear,
    /// `yyyy-MM`, e.g. `2024-01`.
    IsoYearMonth,
}

impl DateFormat {
    pub fn token(&self) -> &'static str {
        match self {
            DateFormat::MonthAbbrevShortYear => "MMM-yy",
            DateFormat::NumericMonthYear => "MM/yyyy",
            DateFormat::IsoYearMonth => "yyyy-MM",
        }
    }
}

impl fmt::Display for DateFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for DateFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "MMM-yy" => Ok(DateFormat::MonthAbbrevShortYear),
            "MM/yyyy" => Ok(DateFormat::NumericMonthYear),
            "yyyy-MM" => Ok(DateFormat::IsoYearMonth),
            other => Err(format!(
                "Unknown date format: {other}, must be one of MMM-yy, MM/yyyy, yyyy-MM"
            )),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DateParseError {
    #[error("empty date")]
    Empty,

    #[error("'{raw}' does not match date format {format}")]
    Malformed { raw: String, format: DateFormat },

    #[error("'{raw}' is not a valid calendar month")]
    OutOfRange { raw: String },
}

/// A calendar month, stored as the first day of that month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedDate(NaiveDate);

impl NormalizedDate {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(Self)
    }

    pub fn parse(raw: &str, format: DateFormat) -> Result<Self, DateParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DateParseError::Empty);
        }

        let malformed = || DateParseError::Malformed {
            raw: trimmed.to_string(),
            format,
        };

        let (year, month) = match format {
            DateFormat::MonthAbbrevShortYear => {
                let (month, year) = trimmed.split_once('-').ok_or_else(malformed)?;
                let month = month.trim();
                if month.len() != 3 {
                    return Err(malformed());
                }
                let month = Month::from_str(month).map_err(|_| malformed())?;
                let year = parse_digits(year, 2, 2).ok_or_else(malformed)?;
                (2000 + year, month.number_from_month())
            }
            DateFormat::NumericMonthYear => {
                let (month, year) = trimmed.split_once('/').ok_or_else(malformed)?;
                let month = parse_digits(month, 1, 2).ok_or_else(malformed)?;
                let year = parse_digits(year, 4, 4).ok_or_else(malformed)?;
                (year, month.unsigned_abs())
            }
            DateFormat::IsoYearMonth => {
                let (year, month) = trimmed.split_once('-').ok_or_else(malformed)?;
                let year = parse_digits(year, 4, 4).ok_or_else(malformed)?;
                let month = parse_digits(month, 1, 2).ok_or_else(malformed)?;
                (year, month.unsigned_abs())
            }
        };

        Self::new(year, month).ok_or_else(|| DateParseError::OutOfRange {
            raw: trimmed.to_string(),
        })
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month(&self) -> u32 {
        self.0.month()
    }

    pub fn first_day(&self) -> NaiveDate {
        self.0
    }

    /// Days between 1970-01-01 and the first day of the month (Arrow `Date32`).
    pub fn days_since_epoch(&self) -> i32 {
        let days = self
            .0
            .signed_duration_since(DateTime::<Utc>::UNIX_EPOCH.date_naive())
            .num_days();
        // NaiveDate spans roughly +/- 262k years, far inside i32 days
        i32::try_from(days).unwrap_or(if days < 0 { i32::MIN } else { i32::MAX })
    }

    pub fn from_days_since_epoch(days: i32) -> Option<Self> {
        let date = DateTime::<Utc>::UNIX_EPOCH
            .date_naive()
            .checked_add_signed(chrono::TimeDelta::days(i64::from(days)))?;
        Self::new(date.year(), date.month())
    }
}

impl fmt::Display for NormalizedDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year(), self.month())
    }
}

fn parse_digits(raw: &str, min_len: usize, max_len: usize) -> Option<i32> {
    let raw = raw.trim();
    if raw.len() < min_len || raw.len() > max_len || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("Jan-24", DateFormat::MonthAbbrevShortYear; "abbreviated month")]
    #[test_case("jan-24", DateFormat::MonthAbbrevShortYear; "lowercase abbreviation")]
    #[test_case(" Jan-24 ", DateFormat::MonthAbbrevShortYear; "surrounding whitespace")]
    #[test_case("01/2024", DateFormat::NumericMonthYear; "numeric month")]
    #[test_case("1/2024", DateFormat::NumericMonthYear; "single digit month")]
    #[test_case("2024-01", DateFormat::IsoYearMonth; "iso year month")]
    fn test_formats_normalize_to_same_month(raw: &str, format: DateFormat) {
        let parsed = NormalizedDate::parse(raw, format).unwrap();
        assert_eq!(parsed, NormalizedDate::new(2024, 1).unwrap());
        assert_eq!(parsed.to_string(), "2024-01");
    }

    #[test]
    fn test_every_month_agrees_across_formats() {
        let abbreviations = [
            "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
        ];
        for year in [2000, 2019, 2024, 2099] {
            for (idx, abbrev) in abbreviations.iter().enumerate() {
                let month = idx + 1;
                let short = format!("{abbrev}-{:02}", year % 100);
                let numeric = format!("{month:02}/{year}");
                let iso = format!("{year}-{month:02}");

                let a = NormalizedDate::parse(&short, DateFormat::MonthAbbrevShortYear).unwrap();
                let b = NormalizedDate::parse(&numeric, DateFormat::NumericMonthYear).unwrap();
                let c = NormalizedDate::parse(&iso, DateFormat::IsoYearMonth).unwrap();
                assert_eq!(a, b, "{short} vs {numeric}");
                assert_eq!(b, c, "{numeric} vs {iso}");
            }
        }
    }

    #[test_case("", DateFormat::MonthAbbrevShortYear; "empty")]
    #[test_case("Jan 24", DateFormat::MonthAbbrevShortYear; "missing separator")]
    #[test_case("Foo-24", DateFormat::MonthAbbrevShortYear; "unknown month")]
    #[test_case("January-24", DateFormat::MonthAbbrevShortYear; "full month name")]
    #[test_case("Jan-2024", DateFormat::MonthAbbrevShortYear; "four digit year")]
    #[test_case("13/2024", DateFormat::NumericMonthYear; "month thirteen")]
    #[test_case("00/2024", DateFormat::NumericMonthYear; "month zero")]
    #[test_case("01/24", DateFormat::NumericMonthYear; "two digit year")]
    #[test_case("Jan-24", DateFormat::NumericMonthYear; "wrong format for table")]
    #[test_case("2024/01", DateFormat::IsoYearMonth; "wrong separator")]
    fn test_rejects_malformed(raw: &str, format: DateFormat) {
        assert!(NormalizedDate::parse(raw, format).is_err());
    }

    #[test]
    fn test_empty_is_reported_as_empty() {
        assert_eq!(
            NormalizedDate::parse("   ", DateFormat::IsoYearMonth),
            Err(DateParseError::Empty)
        );
    }

    #[test]
    fn test_out_of_range_month_error() {
        let err = NormalizedDate::parse("13/2024", DateFormat::NumericMonthYear).unwrap_err();
        assert!(matches!(err, DateParseError::OutOfRange { .. }));
    }

    #[test]
    fn test_ordering_follows_calendar() {
        let dec = NormalizedDate::parse("Dec-23", DateFormat::MonthAbbrevShortYear).unwrap();
        let jan = NormalizedDate::parse("01/2024", DateFormat::NumericMonthYear).unwrap();
        assert!(dec < jan);
    }

    #[test]
    fn test_days_since_epoch_round_trips_through_arrow_representation() {
        let date = NormalizedDate::new(2024, 1).unwrap();
        assert_eq!(date.days_since_epoch(), 19_723);
        assert_eq!(NormalizedDate::from_days_since_epoch(19_723), Some(date));
        assert_eq!(
            NormalizedDate::new(1970, 1).unwrap().days_since_epoch(),
            0
        );
    }

    #[test]
    fn test_format_tokens_parse() {
        for format in [
            DateFormat::MonthAbbrevShortYear,
            DateFormat::NumericMonthYear,
            DateFormat::IsoYearMonth,
        ] {
            assert_eq!(format.token().parse::<DateFormat>(), Ok(format));
        }
        assert!("dd/MM/yyyy".parse::<DateFormat>().is_err());
    }
}
