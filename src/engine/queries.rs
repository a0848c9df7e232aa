use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar;
use crate::lifecycle;
use crate::model::*;

use super::availability::free_spans;
use super::{DayKey, Engine, EngineError};

impl Engine {
    /// NotFound for a tombstoned row unless the caller is an admin, then
    /// Forbidden when the caller has no claim on the booking.
    pub(super) fn check_visible(&self, principal: &Principal, booking: &Booking) -> Result<(), EngineError> {
        if booking.is_deleted() && principal.role != Role::Admin {
            return Err(EngineError::NotFound("booking", booking.id));
        }
        let staff_user = self.staff.get(&booking.staff_id).map(|s| s.user_id);
        if lifecycle::can_view(principal, booking, staff_user) {
            Ok(())
        } else {
            Err(EngineError::Forbidden)
        }
    }

    pub fn get_booking(&self, principal: &Principal, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.booking_snapshot(&id)?;
        self.check_visible(principal, &booking)?;
        Ok(booking)
    }

    /// Every booking the caller may see, by date, start, then id.
    pub fn list_bookings(&self, principal: &Principal) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|e| self.check_visible(principal, e.value()).is_ok())
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|b| (b.interval.date, b.interval.span.start, b.id));
        out
    }

    /// Free spans for a staff member on `date`. With a service, only gaps
    /// long enough for it, and nothing at all if the staff member does not
    /// offer it.
    pub async fn availability(
        &self,
        staff_id: Ulid,
        date: NaiveDate,
        service_id: Option<Ulid>,
    ) -> Result<Vec<Span>, EngineError> {
        let staff = self.staff(staff_id)?;
        let min_len = match service_id {
            Some(id) => {
                let service = self.service(id)?;
                if !staff.offers(&id) {
                    return Ok(Vec::new());
                }
                Some(service.duration)
            }
            None => None,
        };

        let Some(open) = calendar::open_window(date, &staff, &self.policy()) else {
            return Ok(Vec::new());
        };
        let key = DayKey { staff_id, date };
        let free = match self.store.existing(&key) {
            Some(sheet) => {
                let guard = sheet.read().await;
                free_spans(open, guard.reservations(), min_len)
            }
            None => free_spans(open, &[], min_len),
        };
        Ok(free)
    }

    // ── Catalog reads ────────────────────────────────────────

    /// Active services only.
    pub fn service(&self, id: Ulid) -> Result<Service, EngineError> {
        self.services
            .get(&id)
            .filter(|s| s.active)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound("service", id))
    }

    /// Active staff only.
    pub fn staff(&self, id: Ulid) -> Result<StaffSchedule, EngineError> {
        self.staff
            .get(&id)
            .filter(|s| s.active)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound("staff", id))
    }

    /// Including retired rows, sorted by id.
    pub fn list_services(&self) -> Vec<Service> {
        let mut out: Vec<Service> = self.services.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn list_staff(&self) -> Vec<StaffSchedule> {
        let mut out: Vec<StaffSchedule> = self.staff.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|s| s.id);
        out
    }
}
