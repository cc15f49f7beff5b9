// Crontab expression parsing and next-run calculation
//
// Policies are written as classic 5-field crontab lines (minute hour
// day-of-month month day-of-week). The `cron` crate works with a leading
// seconds field and 1-based day-of-week numbering, so expressions are
// translated before parsing.

use crate::errors::ValidationError;
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// Number of fields in a crontab schedule
pub const CRONTAB_FIELDS: usize = 5;

const DAY_NAMES: [&str; 8] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Parse and validate a 5-field crontab expression
pub fn parse_crontab(expression: &str) -> Result<CronSchedule, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidCronExpression {
        expression: expression.to_string(),
        reason,
    };

    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != CRONTAB_FIELDS {
        return Err(invalid(format!(
            "expected {} fields, found {}",
            CRONTAB_FIELDS,
            fields.len()
        )));
    }

    let day_of_week = translate_day_of_week(fields[4]).map_err(invalid)?;
    let with_seconds = format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], day_of_week
    );

    CronSchedule::from_str(&with_seconds).map_err(|e| invalid(e.to_string()))
}

/// Check that an expression is a valid crontab schedule
pub fn is_valid_crontab(expression: &str) -> bool {
    parse_crontab(expression).is_ok()
}

/// Next time the expression fires strictly after `after`
pub fn next_run(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    parse_crontab(expression).ok()?.after(&after).next()
}

/// Rewrite numeric crontab day-of-week values (0-7, Sunday = 0 or 7) as day names.
///
/// Numeric ranges are expanded into explicit day lists: the `cron` crate
/// orders Sun first, so `5-7` as `Fri-Sun` would be a reversed range.
fn translate_day_of_week(field: &str) -> Result<String, String> {
    let parts = field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };

            if let Some((start, end)) = numeric_range(range)? {
                return expand_days(start, end, step);
            }

            let range = range
                .split('-')
                .map(translate_day)
                .collect::<Result<Vec<_>, _>>()?
                .join("-");

            Ok(match step {
                Some(step) => format!("{}/{}", range, step),
                None => range,
            })
        })
        .collect::<Result<Vec<String>, String>>()?;

    Ok(parts.join(","))
}

fn numeric_range(range: &str) -> Result<Option<(usize, usize)>, String> {
    let Some((start, end)) = range.split_once('-') else {
        return Ok(None);
    };
    let is_number = |t: &str| !t.is_empty() && t.chars().all(|c| c.is_ascii_digit());
    if !is_number(start) || !is_number(end) {
        return Ok(None);
    }
    let parse = |t: &str| {
        t.parse::<usize>()
            .map_err(|_| format!("invalid day of week '{}'", t))
    };
    Ok(Some((parse(start)?, parse(end)?)))
}

fn expand_days(start: usize, end: usize, step: Option<&str>) -> Result<String, String> {
    let step = match step {
        Some(step) => step
            .parse::<usize>()
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| format!("invalid day of week step '{}'", step))?,
        None => 1,
    };
    if end >= DAY_NAMES.len() {
        return Err(format!("day of week {} out of range 0-7", end));
    }
    if start > end {
        return Err(format!("day of week range {}-{} is reversed", start, end));
    }

    let mut days: Vec<usize> = (start..=end).step_by(step).map(|d| d % 7).collect();
    days.sort_unstable();
    days.dedup();

    Ok(days
        .into_iter()
        .map(|d| DAY_NAMES[d])
        .collect::<Vec<_>>()
        .join(","))
}

fn translate_day(token: &str) -> Result<String, String> {
    if !token.chars().all(|c| c.is_ascii_digit()) || token.is_empty() {
        return Ok(token.to_string());
    }

    let day: usize = token
        .parse()
        .map_err(|_| format!("invalid day of week '{}'", token))?;

    DAY_NAMES
        .get(day)
        .map(|name| name.to_string())
        .ok_or_else(|| format!("day of week {} out of range 0-7", day))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn test_parse_valid_crontab() {
        assert!(parse_crontab("0 */23 * * *").is_ok());
        assert!(parse_crontab("0 * * * *").is_ok());
        assert!(parse_crontab("30 2 1,15 * *").is_ok());
        assert!(parse_crontab("0 0 * * 1-5").is_ok());
    }

    #[test]
    fn test_sunday_as_zero_and_seven() {
        assert!(parse_crontab("0 0 * * 0").is_ok());
        assert!(parse_crontab("0 0 * * 7").is_ok());
        assert!(parse_crontab("0 0 * * 1-7").is_ok());
        assert!(parse_crontab("0 0 * * 5-7").is_ok());
        assert!(parse_crontab("0 0 * * 0-7").is_ok());
        assert!(parse_crontab("0 0 * * 0-6").is_ok());
        assert!(parse_crontab("0 0 * * 6,0").is_ok());
        assert!(parse_crontab("0 0 * * */2").is_ok());
        assert!(parse_crontab("0 0 * * 1-7/3").is_ok());
    }

    #[test]
    fn test_numeric_day_ranges_expand() {
        assert_eq!(translate_day_of_week("5-7").unwrap(), "Sun,Fri,Sat");
        assert_eq!(translate_day_of_week("1-7/3").unwrap(), "Sun,Mon,Thu");
        assert_eq!(translate_day_of_week("Mon-Fri").unwrap(), "Mon-Fri");
        assert!(translate_day_of_week("6-2").is_err());
        assert!(translate_day_of_week("1-8").is_err());
        assert!(translate_day_of_week("1-5/0").is_err());
    }

    #[test]
    fn test_next_run_on_range_ending_in_seven() {
        // 2024-03-11 is a Monday; 5-7 is Friday through Sunday
        let after = Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap();
        let next = next_run("0 3 * * 5-7", after).unwrap();
        assert_eq!(next.weekday(), Weekday::Fri);

        let saturday = Utc.with_ymd_and_hms(2024, 3, 16, 4, 0, 0).unwrap();
        assert_eq!(next_run("0 3 * * 5-7", saturday).unwrap().weekday(), Weekday::Sun);
    }

    #[test]
    fn test_reject_wrong_field_count() {
        assert!(parse_crontab("* * * *").is_err());
        assert!(parse_crontab("0 0 12 * * * *").is_err());
        assert!(parse_crontab("").is_err());
    }

    #[test]
    fn test_reject_garbage() {
        assert!(parse_crontab("invalid cron string at all").is_err());
        assert!(parse_crontab("61 * * * *").is_err());
        assert!(parse_crontab("0 0 * * 9").is_err());
    }

    #[test]
    fn test_next_run_hourly() {
        let after = Utc.with_ymd_and_hms(2024, 3, 10, 10, 15, 0).unwrap();
        let next = next_run("0 * * * *", after).unwrap();
        assert_eq!(next.hour(), 11);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn test_next_run_respects_sunday_zero() {
        // 2024-03-11 is a Monday
        let after = Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap();
        let next = next_run("0 3 * * 0", after).unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
        assert_eq!(next.hour(), 3);
    }
}
