mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use availability::{free_spans, merge_overlapping, subtract_intervals};
pub use error::EngineError;
pub use mutations::NewBooking;
pub use store::{DayKey, DaySheet, IntervalStore, Reservation, SharedDaySheet};

use std::io;
use std::path::Path;
use std::sync::{Arc, PoisonError};

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::{Wal, WalHandle};

/// One salon's booking state: catalog, policy, bookings, and the day sheets
/// that enforce non-overlap.
pub struct Engine {
    wal: WalHandle,
    pub(super) store: IntervalStore,
    pub(super) bookings: DashMap<Ulid, Booking>,
    pub(super) services: DashMap<Ulid, Service>,
    pub(super) staff: DashMap<Ulid, StaffSchedule>,
    policy: std::sync::RwLock<Arc<OperatingPolicy>>,
    /// Serializes catalog and policy writes against each other.
    pub(super) catalog_lock: Mutex<()>,
    /// Held shared across every append+apply, exclusively while compaction
    /// snapshots state, so the snapshot never misses a record already on disk.
    pub(super) commit_gate: RwLock<()>,
}

impl Engine {
    /// Replay the log at `wal_path`, then start its writer task. Call inside a
    /// tokio runtime.
    pub fn new(wal_path: &Path) -> io::Result<Self> {
        let events = Wal::replay(wal_path)?;
        let wal = Wal::open(wal_path)?;

        let engine = Self {
            wal: WalHandle::spawn(wal),
            store: IntervalStore::new(),
            bookings: DashMap::new(),
            services: DashMap::new(),
            staff: DashMap::new(),
            policy: std::sync::RwLock::new(Arc::new(OperatingPolicy::default())),
            catalog_lock: Mutex::new(()),
            commit_gate: RwLock::new(()),
        };

        for event in &events {
            engine.replay(event)?;
        }
        tracing::debug!(
            "replayed {} events from {}: {} bookings",
            events.len(),
            wal_path.display(),
            engine.bookings.len()
        );
        Ok(engine)
    }

    // Nothing else holds these locks yet, so try_write never waits. The
    // blocking variants would panic if replay runs on a runtime thread.
    fn replay(&self, event: &Event) -> io::Result<()> {
        match event {
            Event::BookingCreated { booking } => {
                let key = day_key(booking);
                if self.store.claim(booking.id, key).is_err() {
                    tracing::warn!("replay: duplicate booking {} ignored", booking.id);
                    return Ok(());
                }
                if booking.status.is_active() && !booking.is_deleted() {
                    let sheet = self.store.sheet(key);
                    let mut guard = sheet.try_write().map_err(|_| contended())?;
                    if let Err(e) = guard.reserve(booking.id, booking.interval.span) {
                        tracing::warn!("replay: booking {} not reserved: {e}", booking.id);
                    }
                }
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::BookingStatusChanged { id, status, at, deleted } => {
                let Some(key) = self.store.key_of(id) else {
                    return Ok(());
                };
                let sheet = self.store.sheet(key);
                let mut guard = sheet.try_write().map_err(|_| contended())?;
                self.apply_status(&mut guard, *id, *status, *at, *deleted);
            }
            catalog => self.apply_catalog(catalog),
        }
        Ok(())
    }

    pub(super) fn apply_catalog(&self, event: &Event) {
        match event {
            Event::ServiceRegistered { service } => {
                self.services.insert(service.id, service.clone());
            }
            Event::ServiceRetired { id } => {
                if let Some(mut s) = self.services.get_mut(id) {
                    s.active = false;
                }
            }
            Event::StaffRegistered { staff } => {
                self.staff.insert(staff.id, staff.clone());
            }
            Event::StaffRetired { id } => {
                if let Some(mut s) = self.staff.get_mut(id) {
                    s.active = false;
                }
            }
            Event::PolicySet { policy } => {
                *self.policy.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(policy.clone());
            }
            Event::BookingCreated { .. } | Event::BookingStatusChanged { .. } => {}
        }
    }

    /// Move a booking to `status`. A status outside the active set gives the
    /// slot back. The caller holds the booking's sheet lock.
    pub(super) fn apply_status(
        &self,
        sheet: &mut DaySheet,
        id: Ulid,
        status: BookingStatus,
        at: Ms,
        deleted: bool,
    ) {
        if let Some(mut b) = self.bookings.get_mut(&id) {
            b.status = status;
            b.updated_at = at;
            if deleted && b.deleted_at.is_none() {
                b.deleted_at = Some(at);
            }
        }
        if !status.is_active() || deleted {
            sheet.release(id);
        }
    }

    /// Current policy snapshot. Cheap to clone and never changes under the caller.
    pub fn policy(&self) -> Arc<OperatingPolicy> {
        self.policy.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(super) async fn wal_append(&self, event: Event) -> Result<(), EngineError> {
        self.wal.append(event).await.map_err(|e| {
            tracing::error!("WAL append failed: {e}");
            EngineError::from(e)
        })
    }

    /// Minimal event list that rebuilds the current state. Cancelled and
    /// tombstoned bookings are kept for audit.
    pub(super) fn snapshot(&self) -> Vec<Event> {
        let mut events = vec![Event::PolicySet {
            policy: (*self.policy()).clone(),
        }];

        let mut services: Vec<Service> = self.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by_key(|s| s.id);
        events.extend(services.into_iter().map(|service| Event::ServiceRegistered { service }));

        let mut staff: Vec<StaffSchedule> = self.staff.iter().map(|e| e.value().clone()).collect();
        staff.sort_by_key(|s| s.id);
        events.extend(staff.into_iter().map(|staff| Event::StaffRegistered { staff }));

        let mut bookings: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        bookings.sort_by_key(|b| b.id);
        events.extend(bookings.into_iter().map(|booking| Event::BookingCreated { booking }));
        events
    }
}

pub(super) fn day_key(booking: &Booking) -> DayKey {
    DayKey {
        staff_id: booking.staff_id,
        date: booking.interval.date,
    }
}

fn contended() -> io::Error {
    io::Error::other("replay: day sheet contended")
}
