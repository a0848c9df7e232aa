use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;
use super::conflict::check_no_overlap;

/// One staff member on one calendar date: the unit of mutual exclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DayKey {
    pub staff_id: Ulid,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub booking_id: Ulid,
    pub span: Span,
}

/// Active reservations for a [`DayKey`], sorted by start minute.
#[derive(Debug)]
pub struct DaySheet {
    pub key: DayKey,
    reservations: Vec<Reservation>,
}

pub type SharedDaySheet = Arc<RwLock<DaySheet>>;

impl DaySheet {
    pub fn new(key: DayKey) -> Self {
        Self {
            key,
            reservations: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }

    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    /// Admit `span` for `booking_id` unless it collides with an active
    /// reservation. Callers hold the sheet's write lock across check and insert.
    pub fn reserve(&mut self, booking_id: Ulid, span: Span) -> Result<(), EngineError> {
        check_no_overlap(self, &span)?;
        self.insert(Reservation { booking_id, span });
        Ok(())
    }

    fn insert(&mut self, r: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&r.span.start, |x| x.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, r);
    }

    /// Drop the reservation held by `booking_id`. Releasing twice is a no-op.
    pub fn release(&mut self, booking_id: Ulid) -> bool {
        match self.reservations.iter().position(|r| r.booking_id == booking_id) {
            Some(pos) => {
                self.reservations.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Reservations whose span intersects `query`. Everything from the
    /// partition point on starts at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let bound = self.reservations.partition_point(|r| r.span.start < query.end);
        self.reservations[..bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

/// Day sheets plus the booking → sheet index.
///
/// A booking id is claimed in the index before its sheet is locked, so two
/// requests racing on the same id cannot both proceed.
#[derive(Default)]
pub struct IntervalStore {
    sheets: DashMap<DayKey, SharedDaySheet>,
    index: DashMap<Ulid, DayKey>,
}

impl IntervalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sheet for `key`, created empty on first use.
    pub fn sheet(&self, key: DayKey) -> SharedDaySheet {
        self.sheets
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DaySheet::new(key))))
            .value()
            .clone()
    }

    pub fn existing(&self, key: &DayKey) -> Option<SharedDaySheet> {
        self.sheets.get(key).map(|e| e.value().clone())
    }

    pub fn claim(&self, booking_id: Ulid, key: DayKey) -> Result<(), EngineError> {
        match self.index.entry(booking_id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(booking_id)),
            Entry::Vacant(slot) => {
                slot.insert(key);
                Ok(())
            }
        }
    }

    pub fn unclaim(&self, booking_id: &Ulid) {
        self.index.remove(booking_id);
    }

    pub fn key_of(&self, booking_id: &Ulid) -> Option<DayKey> {
        self.index.get(booking_id).map(|e| *e.value())
    }

    pub fn sheet_count(&self) -> usize {
        self.sheets.len()
    }
}
