//! Calendar rules: is a requested interval legal under the staff member's
//! schedule and the salon's operating policy? Pure functions, no I/O.
//!
//! Weekdays come from the calendar date alone. The date is never
//! reinterpreted through a timezone.

use std::fmt;

use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::model::*;

/// Why a request was refused before touching the interval store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    StaffCannotPerformService,
    OutsideStaffHours,
    OutsideSalonHours,
    StaffOffDay,
    SalonClosed,
}

impl Rejection {
    /// Stable reason code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::StaffCannotPerformService => "STAFF_CANNOT_PERFORM_SERVICE",
            Rejection::OutsideStaffHours => "OUTSIDE_STAFF_HOURS",
            Rejection::OutsideSalonHours => "OUTSIDE_SALON_HOURS",
            Rejection::StaffOffDay => "STAFF_OFF_DAY",
            Rejection::SalonClosed => "SALON_CLOSED",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Rejection::StaffCannotPerformService => "selected staff member cannot perform this service",
            Rejection::OutsideStaffHours => "booking outside staff working hours",
            Rejection::OutsideSalonHours => "booking outside salon operating hours",
            Rejection::StaffOffDay => "cannot book on staff weekly off day",
            Rejection::SalonClosed => "salon is closed on the selected date",
        };
        write!(f, "{}: {msg}", self.code())
    }
}

impl std::error::Error for Rejection {}

/// Run every rule in order and stop at the first failure.
///
/// `span` may extend past midnight when a long service starts late; such a
/// span can never sit inside a working window and fails the hours check.
pub fn check(
    service_id: &Ulid,
    date: NaiveDate,
    span: Span,
    staff: &StaffSchedule,
    policy: &OperatingPolicy,
) -> Result<(), Rejection> {
    if !staff.offers(service_id) {
        return Err(Rejection::StaffCannotPerformService);
    }
    if !staff.window.contains(&span) {
        return Err(Rejection::OutsideStaffHours);
    }
    if let Some(hours) = policy.hours
        && !hours.contains(&span)
    {
        return Err(Rejection::OutsideSalonHours);
    }
    if staff.off_days.contains(date.weekday()) {
        return Err(Rejection::StaffOffDay);
    }
    if policy.is_closed_on(date) {
        return Err(Rejection::SalonClosed);
    }
    Ok(())
}

/// The bookable window for a staff member on a date, or `None` if either
/// party is off that day or their hours do not intersect.
pub fn open_window(date: NaiveDate, staff: &StaffSchedule, policy: &OperatingPolicy) -> Option<Span> {
    if staff.off_days.contains(date.weekday()) || policy.is_closed_on(date) {
        return None;
    }
    match policy.hours {
        Some(hours) => staff.window.intersect(&hours),
        None => Some(staff.window),
    }
}
