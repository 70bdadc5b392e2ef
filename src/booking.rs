//! Double-booking detection over approved stays and reservations

use crate::error::LedgerError;
use crate::record::{EventDate, RecordData, StayDetails, TimeOfDay};
use crate::store::RecordStore;
use chrono::{NaiveDateTime, NaiveTime};

/// House defaults when a booking carries dates only.
pub fn default_check_in_time() -> NaiveTime {
    NaiveTime::from_hms_opt(14, 0, 0).unwrap()
}

pub fn default_check_out_time() -> NaiveTime {
    NaiveTime::from_hms_opt(11, 0, 0).unwrap()
}

/// Half-open overlap test on `[s1, e1)` and `[s2, e2)`. Strict inequality:
/// a stay ending exactly when another begins does not conflict.
pub fn intervals_overlap(
    s1: NaiveDateTime,
    e1: NaiveDateTime,
    s2: NaiveDateTime,
    e2: NaiveDateTime,
) -> bool {
    s1 < e2 && e1 > s2
}

/// Occupancy interval of a stay, with the house default times filled in
/// where the record carries none.
pub fn stay_interval(stay: &StayDetails) -> (NaiveDateTime, NaiveDateTime) {
    let start = stay.check_in.date().and_time(
        stay.check_in_time
            .map(|t| t.time())
            .unwrap_or_else(default_check_in_time),
    );
    let end = stay.check_out.date().and_time(
        stay.check_out_time
            .map(|t| t.time())
            .unwrap_or_else(default_check_out_time),
    );
    (start, end)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictSource {
    ActiveStay,
    Reservation,
}

impl ConflictSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictSource::ActiveStay => "active stay",
            ConflictSource::Reservation => "reservation",
        }
    }
}

/// The existing record a requested booking collides with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingConflict {
    pub source: ConflictSource,
    pub record_id: String,
    pub guest_name: String,
    pub room: String,
}

#[derive(Debug, Clone)]
pub struct BookingQuery {
    pub room: String,
    pub check_in: EventDate,
    pub check_out: EventDate,
    pub check_in_time: Option<TimeOfDay>,
    pub check_out_time: Option<TimeOfDay>,
    /// Set when re-checking an existing reservation against the ledger so
    /// it does not conflict with itself.
    pub exclude_id: Option<String>,
}

impl BookingQuery {
    pub fn dates_only(room: impl Into<String>, check_in: EventDate, check_out: EventDate) -> Self {
        Self {
            room: room.into(),
            check_in,
            check_out,
            check_in_time: None,
            check_out_time: None,
            exclude_id: None,
        }
    }
}

/// Pure reader over the approved, non-deleted, latest-version projection.
/// Pending reservations never block a booking; they are unconfirmed.
pub struct ConflictDetector<'a> {
    store: &'a RecordStore,
}

impl<'a> ConflictDetector<'a> {
    pub fn new(store: &'a RecordStore) -> Self {
        Self { store }
    }

    /// Scan active stays first, then approved reservations, returning the
    /// first overlap found and naming which population it came from.
    pub fn has_conflict(&self, query: &BookingQuery) -> Result<Option<BookingConflict>, LedgerError> {
        let start = query.check_in.date().and_time(
            query
                .check_in_time
                .map(|t| t.time())
                .unwrap_or_else(default_check_in_time),
        );
        let end = query.check_out.date().and_time(
            query
                .check_out_time
                .map(|t| t.time())
                .unwrap_or_else(default_check_out_time),
        );
        if start >= end {
            return Err(LedgerError::Validation(format!(
                "check-out {} must fall after check-in {}",
                end, start
            )));
        }

        let live = self.store.latest_visible()?;

        for (source, pick) in [
            (ConflictSource::ActiveStay, true),
            (ConflictSource::Reservation, false),
        ] {
            for record in &live {
                if !record.status.is_approved() {
                    continue;
                }
                if query.exclude_id.as_deref() == Some(record.id.as_str()) {
                    continue;
                }
                let stay = match (&record.data, pick) {
                    (RecordData::RoomBooking(stay), true) => stay,
                    (RecordData::RoomReservation(stay), false) => stay,
                    _ => continue,
                };
                if stay.room != query.room {
                    continue;
                }
                let (s2, e2) = stay_interval(stay);
                if intervals_overlap(start, end, s2, e2) {
                    return Ok(Some(BookingConflict {
                        source,
                        record_id: record.id.clone(),
                        guest_name: stay.guest_name.clone(),
                        room: stay.room.clone(),
                    }));
                }
            }
        }
        Ok(None)
    }

    /// `has_conflict` lifted into an error, for write paths that must not
    /// proceed into an occupied room.
    pub fn ensure_available(&self, query: &BookingQuery) -> Result<(), LedgerError> {
        match self.has_conflict(query)? {
            None => Ok(()),
            Some(conflict) => Err(LedgerError::RoomUnavailable {
                room: conflict.room.clone(),
                occupied_by: conflict.source.as_str().to_string(),
                record_id: conflict.record_id,
                guest_name: conflict.guest_name,
            }),
        }
    }
}
