use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minutes since local midnight. `1440` is end-of-day.
pub type Minute = u16;

/// Unix milliseconds, used only for audit timestamps.
pub type Ms = i64;

pub const MINUTES_PER_DAY: Minute = 1440;

/// Half-open minute range `[start, end)` on a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn try_new(start: Minute, end: Minute) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration(&self) -> Minute {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersect(&self, other: &Span) -> Option<Span> {
        Span::try_new(self.start.max(other.start), self.end.min(other.end))
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", format_clock(self.start), format_clock(self.end))
    }
}

/// A staff member's daily working hours.
pub type WorkingWindow = Span;

/// A reserved range on one calendar date. Never crosses midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeInterval {
    pub date: NaiveDate,
    pub span: Span,
}

impl TimeInterval {
    pub fn new(date: NaiveDate, span: Span) -> Option<Self> {
        (span.end <= MINUTES_PER_DAY).then_some(Self { date, span })
    }

    pub fn weekday(&self) -> Weekday {
        self.date.weekday()
    }

    pub fn overlaps(&self, other: &TimeInterval) -> bool {
        self.date == other.date && self.span.overlaps(&other.span)
    }
}

// ── Clock / date text ────────────────────────────────────────────

/// Parse `HH:MM` into minutes. `24:00` is accepted as end-of-day.
pub fn parse_clock(s: &str) -> Option<Minute> {
    let (h, m) = s.trim().split_once(':')?;
    let two_digits = |part: &str| part.len() == 2 && part.bytes().all(|b| b.is_ascii_digit());
    if !two_digits(h) || !two_digits(m) {
        return None;
    }
    let h: Minute = h.parse().ok()?;
    let m: Minute = m.parse().ok()?;
    if m >= 60 {
        return None;
    }
    let total = h.checked_mul(60)?.checked_add(m)?;
    (total <= MINUTES_PER_DAY).then_some(total)
}

pub fn format_clock(minute: Minute) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

// ── Weekday sets ─────────────────────────────────────────────────

/// Set of weekdays packed into the low 7 bits, Monday first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub const EMPTY: WeekdaySet = WeekdaySet(0);

    fn bit(day: Weekday) -> u8 {
        1 << day.num_days_from_monday()
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & Self::bit(day) != 0
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= Self::bit(day);
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Weekday> + '_ {
        let mut day = Weekday::Mon;
        (0..7).filter_map(move |_| {
            let current = day;
            day = day.succ();
            self.contains(current).then_some(current)
        })
    }
}

impl FromIterator<Weekday> for WeekdaySet {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        let mut set = WeekdaySet::EMPTY;
        for day in iter {
            set.insert(day);
        }
        set
    }
}

/// Comma-separated day names, e.g. `"mon,sunday"`. Empty string is the empty set.
impl FromStr for WeekdaySet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<Weekday>()
                    .map_err(|_| format!("bad weekday: {part}"))
            })
            .collect()
    }
}

impl fmt::Display for WeekdaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .iter()
            .map(|d| d.to_string().to_lowercase())
            .collect();
        f.write_str(&names.join(","))
    }
}

// ── Catalog ──────────────────────────────────────────────────────

/// Salon-wide opening hours, weekly closures and holidays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingPolicy {
    /// `None` means the salon imposes no hours of its own.
    pub hours: Option<Span>,
    pub off_days: WeekdaySet,
    pub holidays: BTreeSet<NaiveDate>,
}

impl Default for OperatingPolicy {
    fn default() -> Self {
        Self {
            hours: Some(Span::new(9 * 60, 21 * 60)),
            off_days: WeekdaySet::EMPTY,
            holidays: BTreeSet::new(),
        }
    }
}

impl OperatingPolicy {
    pub fn is_closed_on(&self, date: NaiveDate) -> bool {
        self.off_days.contains(date.weekday()) || self.holidays.contains(&date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub duration: Minute,
    /// List price in minor currency units.
    pub price: i64,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffSchedule {
    pub id: Ulid,
    /// Login identity of the staff member; drives booking visibility.
    pub user_id: Ulid,
    pub name: String,
    pub window: WorkingWindow,
    pub off_days: WeekdaySet,
    pub services: BTreeSet<Ulid>,
    pub active: bool,
}

impl StaffSchedule {
    pub fn offers(&self, service_id: &Ulid) -> bool {
        self.services.contains(service_id)
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Active bookings hold their slot in the interval store.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "completed" => Ok(BookingStatus::Completed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub service_id: Ulid,
    pub staff_id: Ulid,
    pub interval: TimeInterval,
    pub status: BookingStatus,
    /// Charged amount in minor currency units.
    pub amount: i64,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Soft-delete tombstone. The row is kept for audit.
    pub deleted_at: Option<Ms>,
}

impl Booking {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// ── Identity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Customer,
    Staff,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Staff => "staff",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "customer" => Ok(Role::Customer),
            "staff" => Ok(Role::Staff),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// The authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub id: Ulid,
    pub role: Role,
}

impl Principal {
    pub fn new(role: Role, id: Ulid) -> Self {
        Self { id, role }
    }
}

/// The event types — flat, no nesting beyond the records they carry. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceRegistered {
        service: Service,
    },
    ServiceRetired {
        id: Ulid,
    },
    StaffRegistered {
        staff: StaffSchedule,
    },
    StaffRetired {
        id: Ulid,
    },
    PolicySet {
        policy: OperatingPolicy,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        status: BookingStatus,
        at: Ms,
        deleted: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(540, 600);
        let b = Span::new(570, 630);
        let c = Span::new(600, 660);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // 10:00 end touches 10:00 start
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_contains_and_intersect() {
        let outer = Span::new(540, 1020);
        assert!(outer.contains(&Span::new(540, 1020)));
        assert!(outer.contains(&Span::new(600, 660)));
        assert!(!outer.contains(&Span::new(990, 1050)));
        assert_eq!(outer.intersect(&Span::new(480, 600)), Some(Span::new(540, 600)));
        assert_eq!(outer.intersect(&Span::new(1020, 1100)), None);
    }

    #[test]
    fn span_try_new_rejects_empty() {
        assert!(Span::try_new(600, 600).is_none());
        assert!(Span::try_new(601, 600).is_none());
        assert_eq!(Span::try_new(0, 1440).map(|s| s.duration()), Some(1440));
    }

    #[test]
    fn clock_parsing() {
        assert_eq!(parse_clock("09:00"), Some(540));
        assert_eq!(parse_clock("09:30"), Some(570));
        assert_eq!(parse_clock("9:30"), None);
        assert_eq!(parse_clock("+9:30"), None);
        assert_eq!(parse_clock("09:5"), None);
        assert_eq!(parse_clock("24:00"), Some(1440));
        assert_eq!(parse_clock("24:01"), None);
        assert_eq!(parse_clock("10:60"), None);
        assert_eq!(parse_clock("1000"), None);
        assert_eq!(parse_clock("ab:cd"), None);
        assert_eq!(format_clock(1050), "17:30");
        assert_eq!(format_clock(5), "00:05");
    }

    #[test]
    fn time_interval_never_crosses_midnight() {
        let d = date("2026-03-03");
        assert!(TimeInterval::new(d, Span::new(1380, 1440)).is_some());
        assert!(TimeInterval::new(d, Span::new(1400, 1460)).is_none());
    }

    #[test]
    fn time_interval_overlap_requires_same_date() {
        let a = TimeInterval::new(date("2026-03-03"), Span::new(600, 645)).unwrap();
        let b = TimeInterval::new(date("2026-03-04"), Span::new(600, 645)).unwrap();
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&a));
    }

    #[test]
    fn weekday_set_parse_and_display() {
        let set: WeekdaySet = "Mon, sunday".parse().unwrap();
        assert!(set.contains(Weekday::Mon));
        assert!(set.contains(Weekday::Sun));
        assert!(!set.contains(Weekday::Tue));
        assert_eq!(set.to_string(), "mon,sun");

        let empty: WeekdaySet = "".parse().unwrap();
        assert!(empty.is_empty());
        assert!("funday".parse::<WeekdaySet>().is_err());
    }

    #[test]
    fn default_policy_is_nine_to_nine() {
        let policy = OperatingPolicy::default();
        assert_eq!(policy.hours, Some(Span::new(540, 1260)));
        assert!(policy.off_days.is_empty());
        assert!(!policy.is_closed_on(date("2026-12-25")));
    }

    #[test]
    fn policy_closed_on_holiday_and_off_day() {
        let mut policy = OperatingPolicy::default();
        policy.off_days.insert(Weekday::Sun);
        policy.holidays.insert(date("2026-12-25"));
        assert!(policy.is_closed_on(date("2026-03-08"))); // Sunday
        assert!(policy.is_closed_on(date("2026-12-25")));
        assert!(!policy.is_closed_on(date("2026-03-03")));
    }

    #[test]
    fn status_activity() {
        assert!(BookingStatus::Pending.is_active());
        assert!(BookingStatus::Confirmed.is_active());
        assert!(!BookingStatus::Completed.is_active());
        assert!(!BookingStatus::Cancelled.is_active());
        assert!(BookingStatus::Cancelled.is_terminal());
        assert_eq!("CONFIRMED".parse::<BookingStatus>(), Ok(BookingStatus::Confirmed));
        assert_eq!("canceled".parse::<BookingStatus>(), Ok(BookingStatus::Cancelled));
        assert!("archived".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            booking: Booking {
                id: Ulid::new(),
                customer_id: Ulid::new(),
                service_id: Ulid::new(),
                staff_id: Ulid::new(),
                interval: TimeInterval::new(date("2026-03-03"), Span::new(600, 645)).unwrap(),
                status: BookingStatus::Pending,
                amount: 4500,
                created_at: 1,
                updated_at: 1,
                deleted_at: None,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
