use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar;
use crate::lifecycle;
use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_TOTAL, TRANSITIONS_TOTAL};

use super::conflict::now_ms;
use super::{DayKey, Engine, EngineError};

/// A customer's booking request. `amount` overrides the service list price.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub id: Ulid,
    pub service_id: Ulid,
    pub staff_id: Ulid,
    pub date: NaiveDate,
    pub start: Minute,
    pub amount: Option<i64>,
}

fn require_admin(principal: &Principal) -> Result<(), EngineError> {
    match principal.role {
        Role::Admin => Ok(()),
        Role::Customer | Role::Staff => Err(EngineError::Forbidden),
    }
}

fn check_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Invalid("name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

impl Engine {
    // ── Bookings ─────────────────────────────────────────────

    pub async fn create_booking(
        &self,
        principal: &Principal,
        req: NewBooking,
    ) -> Result<Booking, EngineError> {
        let result = self.try_create_booking(principal, req).await;
        match &result {
            Ok(b) => {
                metrics::counter!(BOOKINGS_TOTAL, "outcome" => "created").increment(1);
                tracing::info!("booking {} created for staff {} at {} {}", b.id, b.staff_id, b.interval.date, b.interval.span);
            }
            Err(e) => {
                metrics::counter!(BOOKINGS_TOTAL, "outcome" => e.reason()).increment(1);
                tracing::debug!("booking refused: {e}");
            }
        }
        result
    }

    async fn try_create_booking(
        &self,
        principal: &Principal,
        req: NewBooking,
    ) -> Result<Booking, EngineError> {
        lifecycle::authorize_create(principal)?;
        if req.start >= MINUTES_PER_DAY {
            return Err(EngineError::Invalid("start_time must be before 24:00"));
        }
        if req.amount.is_some_and(|a| a < 0) {
            return Err(EngineError::Invalid("amount must not be negative"));
        }

        let service = self.service(req.service_id)?;
        let staff = self.staff(req.staff_id)?;

        let span = Span::try_new(req.start, req.start + service.duration)
            .ok_or(EngineError::Invalid("service has no duration"))?;
        calendar::check(&service.id, req.date, span, &staff, &self.policy())?;
        let interval = TimeInterval::new(req.date, span)
            .ok_or(EngineError::Invalid("booking would cross midnight"))?;

        let now = now_ms();
        let booking = Booking {
            id: req.id,
            customer_id: principal.id,
            service_id: service.id,
            staff_id: staff.id,
            interval,
            status: BookingStatus::Pending,
            amount: req.amount.unwrap_or(service.price),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        let key = DayKey {
            staff_id: staff.id,
            date: req.date,
        };
        self.store.claim(booking.id, key)?;
        let result = self.reserve(key, &booking).await;
        if result.is_err() {
            self.store.unclaim(&booking.id);
        }
        result.map(|()| booking)
    }

    /// Check, log and apply under one sheet lock. Any failure leaves the
    /// sheet as it was.
    async fn reserve(&self, key: DayKey, booking: &Booking) -> Result<(), EngineError> {
        let sheet = self.store.sheet(key);
        let mut guard = sheet.write().await;
        if guard.len() >= MAX_RESERVATIONS_PER_SHEET {
            return Err(EngineError::LimitExceeded("too many bookings for this staff member and date"));
        }
        guard.reserve(booking.id, booking.interval.span)?;

        let _gate = self.commit_gate.read().await;
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        if let Err(e) = self.wal_append(event).await {
            guard.release(booking.id);
            return Err(e);
        }
        self.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    pub async fn update_status(
        &self,
        principal: &Principal,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<Booking, EngineError> {
        self.transition(principal, id, status, false).await
    }

    /// Cancel and tombstone. The row stays for audit.
    pub async fn cancel_booking(&self, principal: &Principal, id: Ulid) -> Result<Booking, EngineError> {
        self.transition(principal, id, BookingStatus::Cancelled, true).await
    }

    async fn transition(
        &self,
        principal: &Principal,
        id: Ulid,
        to: BookingStatus,
        delete: bool,
    ) -> Result<Booking, EngineError> {
        let result = self.try_transition(principal, id, to, delete).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.reason(),
        };
        metrics::counter!(TRANSITIONS_TOTAL, "status" => to.as_str(), "outcome" => outcome).increment(1);
        if let Ok(b) = &result {
            tracing::info!("booking {id} is now {}", b.status);
        }
        result
    }

    async fn try_transition(
        &self,
        principal: &Principal,
        id: Ulid,
        to: BookingStatus,
        delete: bool,
    ) -> Result<Booking, EngineError> {
        let key = self.store.key_of(&id).ok_or(EngineError::NotFound("booking", id))?;
        let sheet = self.store.sheet(key);
        let mut guard = sheet.write().await;

        let current = self.booking_snapshot(&id)?;
        self.check_visible(principal, &current)?;
        if delete {
            lifecycle::authorize_transition(principal.role, current.status, to)?;
        } else {
            lifecycle::authorize_status_change(principal.role, current.status, to)?;
        }

        let at = now_ms();
        {
            let _gate = self.commit_gate.read().await;
            self.wal_append(Event::BookingStatusChanged {
                id,
                status: to,
                at,
                deleted: delete,
            })
            .await?;
            self.apply_status(&mut guard, id, to, at, delete);
        }
        self.booking_snapshot(&id)
    }

    pub(super) fn booking_snapshot(&self, id: &Ulid) -> Result<Booking, EngineError> {
        self.bookings
            .get(id)
            .map(|b| b.value().clone())
            .ok_or(EngineError::NotFound("booking", *id))
    }

    // ── Catalog and policy ───────────────────────────────────

    async fn persist_catalog(&self, event: Event) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(event.clone()).await?;
        self.apply_catalog(&event);
        Ok(())
    }

    /// Insert or replace a service.
    pub async fn register_service(&self, principal: &Principal, service: Service) -> Result<Service, EngineError> {
        require_admin(principal)?;
        check_name(&service.name)?;
        if service.duration == 0 || service.duration > MAX_SERVICE_DURATION {
            return Err(EngineError::Invalid("duration must be between 1 and 1440 minutes"));
        }
        if service.price < 0 {
            return Err(EngineError::Invalid("price must not be negative"));
        }

        let _catalog = self.catalog_lock.lock().await;
        if !self.services.contains_key(&service.id) && self.services.len() >= MAX_SERVICES_PER_SALON {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        self.persist_catalog(Event::ServiceRegistered {
            service: service.clone(),
        })
        .await?;
        tracing::info!("service {} registered ({} min)", service.id, service.duration);
        Ok(service)
    }

    pub async fn retire_service(&self, principal: &Principal, id: Ulid) -> Result<Service, EngineError> {
        require_admin(principal)?;
        let _catalog = self.catalog_lock.lock().await;
        let service = self
            .services
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound("service", id))?;
        if service.active {
            self.persist_catalog(Event::ServiceRetired { id }).await?;
        }
        Ok(Service {
            active: false,
            ..service
        })
    }

    /// Insert or replace a staff schedule. Every offered service must exist.
    pub async fn register_staff(
        &self,
        principal: &Principal,
        staff: StaffSchedule,
    ) -> Result<StaffSchedule, EngineError> {
        require_admin(principal)?;
        check_name(&staff.name)?;
        if staff.window.start >= staff.window.end || staff.window.end > MINUTES_PER_DAY {
            return Err(EngineError::Invalid("start_time must be before end_time"));
        }
        if staff.services.len() > MAX_SERVICES_PER_STAFF {
            return Err(EngineError::LimitExceeded("too many services for one staff member"));
        }

        let _catalog = self.catalog_lock.lock().await;
        if let Some(missing) = staff.services.iter().find(|id| !self.services.contains_key(id)) {
            return Err(EngineError::NotFound("service", *missing));
        }
        if !self.staff.contains_key(&staff.id) && self.staff.len() >= MAX_STAFF_PER_SALON {
            return Err(EngineError::LimitExceeded("too many staff"));
        }
        self.persist_catalog(Event::StaffRegistered { staff: staff.clone() })
            .await?;
        tracing::info!("staff {} registered, works {}", staff.id, staff.window);
        Ok(staff)
    }

    pub async fn retire_staff(&self, principal: &Principal, id: Ulid) -> Result<StaffSchedule, EngineError> {
        require_admin(principal)?;
        let _catalog = self.catalog_lock.lock().await;
        let staff = self
            .staff
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound("staff", id))?;
        if staff.active {
            self.persist_catalog(Event::StaffRetired { id }).await?;
        }
        Ok(StaffSchedule {
            active: false,
            ..staff
        })
    }

    /// Replace the salon policy. Readers holding the previous snapshot keep it.
    pub async fn set_policy(
        &self,
        principal: &Principal,
        policy: OperatingPolicy,
    ) -> Result<Arc<OperatingPolicy>, EngineError> {
        require_admin(principal)?;
        if let Some(h) = policy.hours
            && (h.start >= h.end || h.end > MINUTES_PER_DAY)
        {
            return Err(EngineError::Invalid("opening_time must be before closing_time"));
        }
        if policy.holidays.len() > MAX_HOLIDAYS {
            return Err(EngineError::LimitExceeded("too many holidays"));
        }

        let _catalog = self.catalog_lock.lock().await;
        self.persist_catalog(Event::PolicySet { policy }).await?;
        tracing::info!("operating policy replaced");
        Ok(self.policy())
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as a snapshot of current state. Blocks new commits
    /// until the rewrite is done.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let events = self.snapshot();
        let count = events.len();
        self.wal.compact(events).await?;
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await.unwrap_or(0)
    }
}
