/// Next fire time computation
///
/// Every schedule expression is parsed once into a [`ScheduleSpec`] and the
/// next fire time is derived from that variant. Nothing else in the crate
/// parses expression strings.
///
/// Cron expressions use standard 5-field Unix syntax
/// (minute, hour, day-of-month, month, day-of-week). The `cron` crate wants
/// 6 fields with seconds, counts weekdays from 1 = Sunday and requires both day
/// fields to match, so expressions are normalized before parsing.

use crate::error::{Error, Result};
use crate::schedule::types::ScheduleType;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

/// Parsed schedule expression
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    Interval(Duration),
    /// One schedule, or two when both day fields are restricted
    Cron {
        expression: String,
        schedules: Vec<cron::Schedule>,
    },
    OneShot(OneShot),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OneShot {
    /// The `"now"` sentinel
    Immediately,
    At(DateTime<Tz>),
}

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

const NAIVE_FORMATS: [&str; 6] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

impl ScheduleSpec {
    /// Parse an expression of the given type; naive instants are localized to `tz`
    pub fn parse(kind: ScheduleType, expression: &str, tz: Tz) -> Result<Self> {
        match kind {
            ScheduleType::Interval => parse_interval(expression).map(ScheduleSpec::Interval),
            ScheduleType::Cron => {
                let schedules = normalize_cron(expression)?
                    .iter()
                    .map(|normalized| {
                        cron::Schedule::from_str(normalized)
                            .map_err(|e| Error::invalid_expression(expression, e.to_string()))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(ScheduleSpec::Cron {
                    expression: expression.to_string(),
                    schedules,
                })
            }
            ScheduleType::Oneshot => parse_oneshot(expression, tz).map(ScheduleSpec::OneShot),
        }
    }

    /// Next fire time strictly after `now` (or exactly `now` for the `"now"` oneshot)
    pub fn next_after(&self, now: DateTime<Tz>) -> Result<DateTime<Tz>> {
        match self {
            ScheduleSpec::Interval(step) => now.checked_add_signed(*step).ok_or_else(|| {
                Error::invalid_expression(
                    &format!("{}s", step.num_seconds()),
                    "interval overflows the calendar",
                )
            }),
            ScheduleSpec::Cron { expression, schedules } => schedules
                .iter()
                .filter_map(|schedule| schedule.after(&now).next())
                .min()
                .ok_or_else(|| Error::invalid_expression(expression, "cron expression never fires again")),
            ScheduleSpec::OneShot(OneShot::Immediately) => Ok(now),
            ScheduleSpec::OneShot(OneShot::At(at)) => {
                if *at <= now {
                    Err(Error::invalid_expression(
                        &at.to_rfc3339(),
                        "oneshot instant must be in the future",
                    ))
                } else {
                    Ok(*at)
                }
            }
        }
    }
}

/// Computes next fire times in the configured zone
#[derive(Debug, Clone, Copy)]
pub struct NextRunCalculator {
    tz: Tz,
}

impl NextRunCalculator {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn parse(&self, kind: ScheduleType, expression: &str) -> Result<ScheduleSpec> {
        ScheduleSpec::parse(kind, expression, self.tz)
    }

    /// Fails with `InvalidScheduleExpression` for malformed input or a past oneshot
    pub fn compute_next(
        &self,
        kind: ScheduleType,
        expression: &str,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Tz>> {
        self.parse(kind, expression)?
            .next_after(now.with_timezone(&self.tz))
    }
}

impl Default for NextRunCalculator {
    fn default() -> Self {
        Self::new(chrono_tz::UTC)
    }
}

/// Parse `"<n><unit>"`, n >= 1, unit in s/m/h/d/w
fn parse_interval(expression: &str) -> Result<Duration> {
    let unit = expression
        .chars()
        .last()
        .ok_or_else(|| Error::invalid_expression(expression, "empty interval"))?;
    let digits = &expression[..expression.len() - unit.len_utf8()];

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::invalid_expression(
            expression,
            "expected <number><unit>, e.g. 30m",
        ));
    }

    let unit_secs: u64 = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3_600,
        'd' => 86_400,
        'w' => 604_800,
        _ => {
            return Err(Error::invalid_expression(
                expression,
                "unit must be one of s, m, h, d, w",
            ))
        }
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| Error::invalid_expression(expression, "interval value too large"))?;
    if value == 0 {
        return Err(Error::invalid_expression(expression, "interval must be at least 1"));
    }

    value
        .checked_mul(unit_secs)
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(Duration::try_seconds)
        .ok_or_else(|| Error::invalid_expression(expression, "interval value too large"))
}

/// Convert a 5-field Unix cron expression to `cron` crate syntax
///
/// Seconds are pinned to 0 and numeric weekdays (0-7, both 0 and 7 = Sunday)
/// are rewritten as names so they keep their Unix meaning. Stepped weekday
/// items are expanded to explicit lists. When both day-of-month and
/// day-of-week are restricted, Unix cron fires on either match, so the
/// expression is split into one expression per day field; the next fire time
/// is the earliest of them.
pub fn normalize_cron(expression: &str) -> Result<Vec<String>> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(Error::invalid_expression(
            expression,
            format!("expected 5 fields (min hour dom mon dow), got {}", fields.len()),
        ));
    }

    let (minute, hour, dom, month) = (fields[0], fields[1], fields[2], fields[3]);
    let dow = normalize_weekdays(fields[4])
        .ok_or_else(|| Error::invalid_expression(expression, "invalid day-of-week field"))?;

    if is_unrestricted(dom) || is_unrestricted(fields[4]) {
        return Ok(vec![format!("0 {} {} {} {} {}", minute, hour, dom, month, dow)]);
    }

    Ok(vec![
        format!("0 {} {} {} {} *", minute, hour, dom, month),
        format!("0 {} {} * {} {}", minute, hour, month, dow),
    ])
}

/// A day field starting with `*` does not restrict the day (Vixie cron rule)
fn is_unrestricted(field: &str) -> bool {
    field.starts_with('*') || field == "?"
}

fn normalize_weekdays(field: &str) -> Option<String> {
    let mut items: Vec<String> = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step.parse::<usize>().ok().filter(|s| *s > 0)?)),
            None => (item, None),
        };

        if let Some(step) = step {
            let (from, to) = match base {
                "*" | "?" => (0, 7),
                _ => match base.split_once('-') {
                    Some((from, to)) => (weekday_number(from)?, weekday_number(to)?),
                    None => (weekday_number(base)?, 7),
                },
            };
            if from > to {
                return None;
            }
            for n in (from..=to).step_by(step) {
                let name = WEEKDAYS[n].to_string();
                if !items.contains(&name) {
                    items.push(name);
                }
            }
            continue;
        }

        match base.split_once('-') {
            Some((from, to)) => {
                let from = weekday_name(from)?;
                // "5-7" ends on Sunday, which the cron crate orders first
                if to == "7" && from != "SUN" {
                    items.push(if from == "SAT" { from } else { format!("{}-SAT", from) });
                    items.push("SUN".to_string());
                } else {
                    items.push(format!("{}-{}", from, weekday_name(to)?));
                }
            }
            None if base == "*" || base == "?" => items.push(base.to_string()),
            None => items.push(weekday_name(base)?),
        }
    }
    Some(items.join(","))
}

fn weekday_name(token: &str) -> Option<String> {
    match token.parse::<usize>() {
        Ok(n) => WEEKDAYS.get(n).map(|name| name.to_string()),
        Err(_) if !token.is_empty() => Some(token.to_ascii_uppercase()),
        Err(_) => None,
    }
}

/// Unix number (0-7) of a numeric or named weekday
fn weekday_number(token: &str) -> Option<usize> {
    match token.parse::<usize>() {
        Ok(n) if n < WEEKDAYS.len() => Some(n),
        Ok(_) => None,
        Err(_) => {
            let upper = token.to_ascii_uppercase();
            WEEKDAYS[..7].iter().position(|name| upper.starts_with(name))
        }
    }
}

fn parse_oneshot(expression: &str, tz: Tz) -> Result<OneShot> {
    let expression = expression.trim();
    if expression == "now" {
        return Ok(OneShot::Immediately);
    }

    if let Ok(at) = DateTime::parse_from_rfc3339(expression) {
        return Ok(OneShot::At(at.with_timezone(&tz)));
    }

    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(expression, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(expression, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| {
            Error::invalid_expression(expression, "expected an ISO-8601 instant or \"now\"")
        })?;

    tz.from_local_datetime(&naive)
        .earliest()
        .map(OneShot::At)
        .ok_or_else(|| Error::invalid_expression(expression, format!("instant does not exist in {}", tz)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn interval_adds_value_times_unit() {
        let calc = NextRunCalculator::default();
        let now = at(2026, 3, 1, 12, 0);
        let cases = [
            ("1s", 1),
            ("45s", 45),
            ("30m", 1_800),
            ("2h", 7_200),
            ("1d", 86_400),
            ("3w", 3 * 604_800),
        ];
        for (expr, secs) in cases {
            let next = calc.compute_next(ScheduleType::Interval, expr, now).unwrap();
            assert_eq!(next.with_timezone(&Utc), now + Duration::seconds(secs), "{}", expr);
        }
    }

    #[test]
    fn malformed_intervals_are_rejected() {
        let calc = NextRunCalculator::default();
        let now = Utc::now();
        for expr in ["0m", "-1h", "abc", "", "10", "m", "5x", "1.5h", "99999999999999999999w"] {
            let err = calc.compute_next(ScheduleType::Interval, expr, now).unwrap_err();
            assert!(
                matches!(err, Error::InvalidScheduleExpression { .. }),
                "{} should be invalid",
                expr
            );
        }
    }

    #[test]
    fn cron_advances_strictly_to_eight_o_clock() {
        let calc = NextRunCalculator::default();
        let mut now = at(2026, 3, 1, 8, 0);
        for _ in 0..5 {
            let next = calc
                .compute_next(ScheduleType::Cron, "0 8 * * *", now)
                .unwrap()
                .with_timezone(&Utc);
            assert!(next > now);
            assert_eq!((next.hour(), next.minute()), (8, 0));
            now = next;
        }
        assert_eq!(now, at(2026, 3, 6, 8, 0));
    }

    #[test]
    fn cron_respects_configured_zone() {
        let calc = NextRunCalculator::new(chrono_tz::Asia::Tokyo);
        let now = at(2026, 3, 1, 0, 0);
        let next = calc.compute_next(ScheduleType::Cron, "0 8 * * *", now).unwrap();
        assert_eq!(next.hour(), 8);
        assert_eq!(next.timezone(), chrono_tz::Asia::Tokyo);
        // 08:00 JST is 23:00 UTC the previous day
        assert_eq!(next.with_timezone(&Utc), at(2026, 3, 1, 23, 0));
    }

    #[test]
    fn cron_weekdays_keep_unix_numbering() {
        let calc = NextRunCalculator::default();
        // 2026-03-01 is a Sunday
        let now = at(2026, 3, 1, 12, 0);
        let next = calc
            .compute_next(ScheduleType::Cron, "0 9 * * 1", now)
            .unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Mon);

        let next = calc
            .compute_next(ScheduleType::Cron, "0 9 * * 0", at(2026, 3, 2, 0, 0))
            .unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Sun);

        let next = calc
            .compute_next(ScheduleType::Cron, "0 9 * * 6-7", at(2026, 3, 2, 0, 0))
            .unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Sat);
    }

    #[test]
    fn malformed_cron_is_rejected() {
        let calc = NextRunCalculator::default();
        for expr in ["", "* * * *", "0 0 * * * *", "61 * * * *", "a b c d e", "0 8 * * 9"] {
            assert!(
                calc.compute_next(ScheduleType::Cron, expr, Utc::now()).is_err(),
                "{:?} should be invalid",
                expr
            );
        }
    }

    #[test]
    fn normalize_pins_seconds_and_names_weekdays() {
        assert_eq!(normalize_cron("*/15 * * * *").unwrap(), vec!["0 */15 * * * *"]);
        assert_eq!(normalize_cron("0 8 * * 1-5").unwrap(), vec!["0 0 8 * * MON-FRI"]);
        assert_eq!(normalize_cron("0 8 * * 0,3").unwrap(), vec!["0 0 8 * * SUN,WED"]);
        assert_eq!(normalize_cron("0 8 * * 5-7").unwrap(), vec!["0 0 8 * * FRI-SAT,SUN"]);
    }

    #[test]
    fn normalize_expands_stepped_weekdays() {
        assert_eq!(normalize_cron("0 9 * * 1-7/2").unwrap(), vec!["0 0 9 * * MON,WED,FRI,SUN"]);
        assert_eq!(normalize_cron("0 9 * * */2").unwrap(), vec!["0 0 9 * * SUN,TUE,THU,SAT"]);
        assert_eq!(normalize_cron("0 9 * * */7").unwrap(), vec!["0 0 9 * * SUN"]);
        assert!(normalize_cron("0 9 * * 5-1/2").is_err());
        assert!(normalize_cron("0 9 * * 1-5/0").is_err());
    }

    #[test]
    fn normalize_splits_restricted_day_fields() {
        assert_eq!(
            normalize_cron("0 0 1 * 1").unwrap(),
            vec!["0 0 0 1 * *", "0 0 0 * * MON"]
        );
        // A starred day field leaves the other one in charge
        assert_eq!(normalize_cron("0 0 */2 * 1").unwrap(), vec!["0 0 0 */2 * MON"]);
    }

    #[test]
    fn cron_day_fields_match_either() {
        let calc = NextRunCalculator::default();
        // Monday 2026-03-02: the next Monday comes before the 1st of April
        let next = calc
            .compute_next(ScheduleType::Cron, "0 0 1 * 1", at(2026, 3, 2, 12, 0))
            .unwrap();
        assert_eq!(next.with_timezone(&Utc), at(2026, 3, 9, 0, 0));

        // Monday 2026-03-30: Wednesday the 1st comes before the next Monday
        let next = calc
            .compute_next(ScheduleType::Cron, "0 0 1 * 1", at(2026, 3, 30, 12, 0))
            .unwrap();
        assert_eq!(next.with_timezone(&Utc), at(2026, 4, 1, 0, 0));
    }

    #[test]
    fn cron_stepped_weekday_range_ending_on_sunday() {
        let calc = NextRunCalculator::default();
        let next = calc
            .compute_next(ScheduleType::Cron, "0 9 * * 1-7/2", at(2026, 3, 2, 12, 0))
            .unwrap();
        assert_eq!(next.with_timezone(&Utc), at(2026, 3, 4, 9, 0));

        // Saturday 2026-03-07 -> Sunday
        let next = calc
            .compute_next(ScheduleType::Cron, "0 9 * * 1-7/2", at(2026, 3, 7, 12, 0))
            .unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Sun);
        assert_eq!(next.with_timezone(&Utc), at(2026, 3, 8, 9, 0));
    }

    #[test]
    fn oneshot_future_instant_is_returned() {
        let calc = NextRunCalculator::default();
        let now = at(2026, 3, 1, 12, 0);
        let target = now + Duration::hours(1);
        let next = calc
            .compute_next(ScheduleType::Oneshot, &target.to_rfc3339(), now)
            .unwrap();
        assert_eq!(next.with_timezone(&Utc), target);
    }

    #[test]
    fn oneshot_past_instant_is_rejected() {
        let calc = NextRunCalculator::default();
        let now = at(2026, 3, 1, 12, 0);
        let target = now - Duration::hours(1);
        let err = calc
            .compute_next(ScheduleType::Oneshot, &target.to_rfc3339(), now)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidScheduleExpression { .. }));

        // equal to now is not strictly future either
        assert!(calc
            .compute_next(ScheduleType::Oneshot, &now.to_rfc3339(), now)
            .is_err());
    }

    #[test]
    fn oneshot_now_fires_immediately() {
        let calc = NextRunCalculator::default();
        let now = at(2026, 3, 1, 12, 0);
        let next = calc.compute_next(ScheduleType::Oneshot, "now", now).unwrap();
        assert_eq!(next.with_timezone(&Utc), now);
    }

    #[test]
    fn oneshot_naive_instant_is_localized() {
        let calc = NextRunCalculator::new(chrono_tz::Europe::Berlin);
        let now = at(2026, 3, 1, 0, 0);
        let next = calc
            .compute_next(ScheduleType::Oneshot, "2026-03-02T09:30:00", now)
            .unwrap();
        assert_eq!(next.timezone(), chrono_tz::Europe::Berlin);
        // CET is UTC+1 in March before the DST switch
        assert_eq!(next.with_timezone(&Utc), at(2026, 3, 2, 8, 30));

        let date_only = calc
            .compute_next(ScheduleType::Oneshot, "2026-03-05", now)
            .unwrap();
        assert_eq!((date_only.day(), date_only.hour()), (5, 0));
    }

    #[test]
    fn oneshot_garbage_is_rejected() {
        let calc = NextRunCalculator::default();
        for expr in ["tomorrow", "", "2026-13-01T00:00:00", "NOW!"] {
            assert!(calc
                .compute_next(ScheduleType::Oneshot, expr, Utc::now())
                .is_err());
        }
    }
}
