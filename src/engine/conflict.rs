use crate::model::*;

use super::EngineError;
use super::store::DaySheet;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// The first active reservation on `sheet` that `span` would collide with.
/// Endpoints that only touch are not a collision.
pub(crate) fn check_no_overlap(sheet: &DaySheet, span: &Span) -> Result<(), EngineError> {
    match sheet.overlapping(span).next() {
        Some(hit) => Err(EngineError::SlotTaken(hit.booking_id)),
        None => Ok(()),
    }
}
