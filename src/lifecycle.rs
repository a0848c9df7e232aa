//! Booking state machine and the per-role authorization table.
//!
//! ```text
//! PENDING ──► CONFIRMED ──► COMPLETED
//!    │            │
//!    └──► CANCELLED ◄┘
//! ```

use std::fmt;

use crate::model::{Booking, BookingStatus, Principal, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denied {
    /// Role or ownership mismatch.
    Forbidden,
    /// The edge does not exist, or this role may not take it from here.
    InvalidTransition { from: BookingStatus, to: BookingStatus },
}

impl fmt::Display for Denied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denied::Forbidden => write!(f, "FORBIDDEN: not permitted for this user"),
            Denied::InvalidTransition { from, to } => {
                write!(f, "INVALID_TRANSITION: cannot move booking from {from} to {to}")
            }
        }
    }
}

impl std::error::Error for Denied {}

/// Edges of the state machine, independent of who asks.
pub fn is_edge(from: BookingStatus, to: BookingStatus) -> bool {
    use BookingStatus::*;
    matches!(
        (from, to),
        (Pending, Confirmed) | (Confirmed, Completed) | (Pending, Cancelled) | (Confirmed, Cancelled)
    )
}

/// Only customers open bookings, and only for themselves. The engine always
/// books under the caller's own id, so the role is all there is to check.
pub fn authorize_create(principal: &Principal) -> Result<(), Denied> {
    match principal.role {
        Role::Customer => Ok(()),
        Role::Staff | Role::Admin => Err(Denied::Forbidden),
    }
}

/// Whether `principal` may see `booking`. `staff_user` is the login identity
/// linked to the booking's staff record, if any.
pub fn can_view(principal: &Principal, booking: &Booking, staff_user: Option<ulid::Ulid>) -> bool {
    match principal.role {
        Role::Admin => true,
        Role::Staff => staff_user == Some(principal.id),
        Role::Customer => booking.customer_id == principal.id,
    }
}

/// Decide a status change for a caller who can already see the booking.
pub fn authorize_transition(role: Role, from: BookingStatus, to: BookingStatus) -> Result<(), Denied> {
    use BookingStatus::*;
    let invalid = Denied::InvalidTransition { from, to };
    match (role, from, to) {
        (Role::Staff | Role::Admin, _, _) if is_edge(from, to) => Ok(()),
        (Role::Staff | Role::Admin, _, _) => Err(invalid),
        (Role::Customer, Pending, Cancelled) => Ok(()),
        (Role::Customer, _, Cancelled) => Err(invalid),
        (Role::Customer, _, Pending | Confirmed | Completed) => Err(Denied::Forbidden),
    }
}

/// A plain status change. Customers only ever cancel, and they do it by
/// deleting the booking, so this route is closed to them.
pub fn authorize_status_change(role: Role, from: BookingStatus, to: BookingStatus) -> Result<(), Denied> {
    match role {
        Role::Customer => Err(Denied::Forbidden),
        Role::Staff | Role::Admin => authorize_transition(role, from, to),
    }
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;
    use crate::model::*;
    use BookingStatus::*;

    const ALL: [BookingStatus; 4] = [Pending, Confirmed, Completed, Cancelled];

    fn booking(customer: Ulid) -> Booking {
        Booking {
            id: Ulid::new(),
            customer_id: customer,
            service_id: Ulid::new(),
            staff_id: Ulid::new(),
            interval: TimeInterval::new(parse_date("2026-03-03").unwrap(), Span::new(600, 645)).unwrap(),
            status: Pending,
            amount: 100,
            created_at: 0,
            updated_at: 0,
            deleted_at: None,
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for to in ALL {
            assert!(!is_edge(Completed, to));
            assert!(!is_edge(Cancelled, to));
        }
    }

    #[test]
    fn nothing_returns_to_pending() {
        for from in ALL {
            assert!(!is_edge(from, Pending));
        }
    }

    #[test]
    fn staff_and_admin_follow_edges() {
        for role in [Role::Staff, Role::Admin] {
            assert_eq!(authorize_transition(role, Pending, Confirmed), Ok(()));
            assert_eq!(authorize_transition(role, Confirmed, Completed), Ok(()));
            assert_eq!(authorize_transition(role, Confirmed, Cancelled), Ok(()));
            assert_eq!(authorize_transition(role, Pending, Cancelled), Ok(()));
            assert_eq!(
                authorize_transition(role, Pending, Completed),
                Err(Denied::InvalidTransition { from: Pending, to: Completed })
            );
            assert_eq!(
                authorize_transition(role, Cancelled, Confirmed),
                Err(Denied::InvalidTransition { from: Cancelled, to: Confirmed })
            );
        }
    }

    #[test]
    fn customer_cancels_only_pending() {
        assert_eq!(authorize_transition(Role::Customer, Pending, Cancelled), Ok(()));
        assert_eq!(
            authorize_transition(Role::Customer, Confirmed, Cancelled),
            Err(Denied::InvalidTransition { from: Confirmed, to: Cancelled })
        );
        assert_eq!(
            authorize_transition(Role::Customer, Completed, Cancelled),
            Err(Denied::InvalidTransition { from: Completed, to: Cancelled })
        );
    }

    #[test]
    fn customer_cannot_drive_other_transitions() {
        for from in ALL {
            for to in [Pending, Confirmed, Completed] {
                assert_eq!(authorize_transition(Role::Customer, from, to), Err(Denied::Forbidden));
            }
        }
    }

    #[test]
    fn status_change_is_closed_to_customers() {
        for from in ALL {
            for to in ALL {
                assert_eq!(authorize_status_change(Role::Customer, from, to), Err(Denied::Forbidden));
            }
        }
        assert_eq!(authorize_status_change(Role::Staff, Pending, Cancelled), Ok(()));
        assert_eq!(authorize_status_change(Role::Admin, Pending, Confirmed), Ok(()));
    }

    #[test]
    fn only_customers_create() {
        let id = Ulid::new();
        assert!(authorize_create(&Principal::new(Role::Customer, id)).is_ok());
        assert_eq!(authorize_create(&Principal::new(Role::Staff, id)), Err(Denied::Forbidden));
        assert_eq!(authorize_create(&Principal::new(Role::Admin, id)), Err(Denied::Forbidden));
    }

    #[test]
    fn visibility_by_role() {
        let customer = Ulid::new();
        let staff_user = Ulid::new();
        let b = booking(customer);

        assert!(can_view(&Principal::new(Role::Admin, Ulid::new()), &b, None));
        assert!(can_view(&Principal::new(Role::Customer, customer), &b, None));
        assert!(!can_view(&Principal::new(Role::Customer, Ulid::new()), &b, None));
        assert!(can_view(&Principal::new(Role::Staff, staff_user), &b, Some(staff_user)));
        assert!(!can_view(&Principal::new(Role::Staff, Ulid::new()), &b, Some(staff_user)));
        assert!(!can_view(&Principal::new(Role::Staff, staff_user), &b, None));
    }
}
