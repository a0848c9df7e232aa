//! Hard caps that keep a single salon's memory and WAL bounded.

use crate::model::Minute;

pub const MAX_SALONS: usize = 1024;
pub const MAX_SALON_NAME_LEN: usize = 128;

pub const MAX_SERVICES_PER_SALON: usize = 4096;
pub const MAX_STAFF_PER_SALON: usize = 4096;
pub const MAX_SERVICES_PER_STAFF: usize = 512;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_HOLIDAYS: usize = 1024;

/// A service must fit inside a single day.
pub const MAX_SERVICE_DURATION: Minute = 1440;

/// Active reservations for one staff member on one date.
pub const MAX_RESERVATIONS_PER_SHEET: usize = 1440;
