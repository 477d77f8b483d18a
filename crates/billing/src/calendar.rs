//! Calendar arithmetic and the ledger's naive wire format
//!
//! The remote ledger exchanges timestamps without an offset
//! (`YYYY-MM-DDTHH:MM:SS`), so every instant in this crate is a
//! `PrimitiveDateTime` in the ledger's local time.

use time::format_description::well_known::Rfc3339;
use time::format_description::FormatItem;
use time::macros::{format_description, time};
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Skips may only be requested before this day of the month.
pub const SKIP_CUTOFF_DAY: u8 = 5;

pub const WIRE_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

pub const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

pub fn is_in_skip_window(now: PrimitiveDateTime) -> bool {
    now.day() < SKIP_CUTOFF_DAY
}

pub fn last_day_of_month(year: i32, month: Month) -> u8 {
    match month {
        Month::February if time::util::is_leap_year(year) => 29,
        Month::February => 28,
        Month::April | Month::June | Month::September | Month::November => 30,
        _ => 31,
    }
}

pub fn start_of_month(at: PrimitiveDateTime) -> PrimitiveDateTime {
    let date = at.date().replace_day(1).unwrap_or(at.date());
    PrimitiveDateTime::new(date, time::Time::MIDNIGHT)
}

/// Last representable instant of the month containing `at`
pub fn end_of_month(at: PrimitiveDateTime) -> PrimitiveDateTime {
    let date = at.date();
    let last = last_day_of_month(date.year(), date.month());
    let date = date.replace_day(last).unwrap_or(date);
    PrimitiveDateTime::new(date, time!(23:59:59.999_999_999))
}

/// Same day-of-month in the following month, clamped to that month's last day
/// (Jan 31 becomes Feb 28/29). `None` only past the calendar's upper bound.
pub fn add_one_month(at: PrimitiveDateTime) -> Option<PrimitiveDateTime> {
    let date = at.date();
    let (year, month) = match date.month() {
        Month::December => (date.year() + 1, Month::January),
        month => (date.year(), month.next()),
    };
    let day = date.day().min(last_day_of_month(year, month));
    Date::from_calendar_date(year, month, day)
        .ok()
        .map(|date| PrimitiveDateTime::new(date, at.time()))
}

/// Strictly inside the month of `now` and strictly after `now`
pub fn is_later_this_month(candidate: PrimitiveDateTime, now: PrimitiveDateTime) -> bool {
    candidate > start_of_month(now) && candidate < end_of_month(now) && candidate > now
}

/// Strictly inside the month of `now`
pub fn is_within_month(candidate: PrimitiveDateTime, now: PrimitiveDateTime) -> bool {
    candidate > start_of_month(now) && candidate < end_of_month(now)
}

pub fn format_wire(at: PrimitiveDateTime) -> String {
    at.format(WIRE_FORMAT).unwrap_or_default()
}

pub fn format_date(at: PrimitiveDateTime) -> String {
    at.format(DATE_FORMAT).unwrap_or_default()
}

/// Parse a ledger timestamp.
///
/// Accepts the naive wire format, a bare date (midnight) and RFC 3339 (the
/// offset is dropped, keeping the wall-clock reading).
pub fn parse_wire(raw: &str) -> Result<PrimitiveDateTime, time::error::Parse> {
    let raw = raw.trim();
    if let Ok(at) = PrimitiveDateTime::parse(raw, WIRE_FORMAT) {
        return Ok(at);
    }
    if let Ok(date) = Date::parse(raw, DATE_FORMAT) {
        return Ok(PrimitiveDateTime::new(date, time::Time::MIDNIGHT));
    }
    let at = OffsetDateTime::parse(raw, &Rfc3339)?;
    Ok(PrimitiveDateTime::new(at.date(), at.time()))
}

/// Source of "now" in the ledger's local time
pub trait Clock: Send + Sync {
    fn now(&self) -> PrimitiveDateTime;
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(utc_offset_hours: i8) -> Self {
        Self {
            offset: UtcOffset::from_hms(utc_offset_hours, 0, 0).unwrap_or(UtcOffset::UTC),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> PrimitiveDateTime {
        let now = OffsetDateTime::now_utc().to_offset(self.offset);
        PrimitiveDateTime::new(now.date(), now.time())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub PrimitiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> PrimitiveDateTime {
        self.0
    }
}
