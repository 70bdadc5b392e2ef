//! Service layer API for ledger workflow operations
//!
//! Every mutation of the ledger goes through [`LedgerService`]; presentation
//! layers are pure consumers that re-read after a successful call. Privilege
//! checks run here, before any write, and every transition is guarded so
//! concurrent actors racing on the same record get exactly one winner.

use crate::actor::Actor;
use crate::booking::{BookingConflict, BookingQuery, ConflictDetector};
use crate::error::LedgerError;
use crate::reconcile::{MonthlyRollup, StockReconciler, StockRow};
use crate::record::{
    Department, EventDate, Money, OperationalRecord, RecordData, RecordStatus, StockMovement,
    TimeStamp,
};
use crate::store::RecordStore;
use crate::utils;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// A caller's credential. `ensure_valid` fails with a transient error when
/// the credential has lapsed; `refresh` re-validates it so the write can be
/// retried.
pub trait Session {
    fn actor(&self) -> &Actor;
    fn ensure_valid(&self) -> Result<(), LedgerError>;
    fn refresh(&self) -> Result<(), LedgerError>;
}

/// A credential that never expires. Suits embedded use and tests; network
/// front-ends supply their own implementation.
pub struct StaticSession {
    actor: Actor,
}

impl StaticSession {
    pub fn new(actor: Actor) -> Self {
        Self { actor }
    }
}

impl Session for StaticSession {
    fn actor(&self) -> &Actor {
        &self.actor
    }
    fn ensure_valid(&self) -> Result<(), LedgerError> {
        Ok(())
    }
    fn refresh(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

/// What a client submits; the service computes the rest of the row.
#[derive(Debug, Clone)]
pub struct RecordDraft {
    pub entity_type: Department,
    pub data: RecordData,
    pub financial_amount: Money,
}

pub struct LedgerService {
    store: RecordStore,
}

impl LedgerService {
    pub fn open(db: Arc<sled::Db>) -> Result<Self, LedgerError> {
        Ok(Self {
            store: RecordStore::open(db)?,
        })
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn reconciler(&self) -> StockReconciler<'_> {
        StockReconciler::new(&self.store)
    }

    pub fn conflicts(&self) -> ConflictDetector<'_> {
        ConflictDetector::new(&self.store)
    }

    /// Retry loop for writes: transient credential failures trigger a
    /// refresh and up to three attempts with linear backoff. Validation,
    /// authorization and state-conflict errors pass straight through.
    fn with_retry<T>(
        &self,
        session: &dyn Session,
        action: &str,
        op: impl Fn() -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut attempt = 0u32;
        loop {
            let result = session.ensure_valid().and_then(|_| op());
            match result {
                Err(err) if err.is_retryable() && attempt < RETRY_ATTEMPTS => {
                    attempt += 1;
                    warn!(action, attempt, error = %err, "transient failure, refreshing session");
                    session.refresh()?;
                    std::thread::sleep(RETRY_BACKOFF * attempt);
                }
                other => return other,
            }
        }
    }

    /// Initial status rule: privileged submitters and same-day reservations
    /// are approved on the spot, everything else queues for review.
    fn initial_status(&self, actor: &Actor, data: &RecordData) -> RecordStatus {
        if actor.role.auto_approves() {
            return RecordStatus::Approved;
        }
        if let RecordData::RoomReservation(stay) = data {
            if stay.check_in == EventDate::today() {
                return RecordStatus::Approved;
            }
        }
        RecordStatus::Pending
    }

    /// Payload checks that must pass before the draft touches the store.
    fn validate_draft(&self, data: &RecordData) -> Result<(), LedgerError> {
        match data {
            RecordData::StockMovement(mv) => self.reconciler().validate_movement(mv),
            RecordData::RoomBooking(stay) | RecordData::RoomReservation(stay) => {
                let (start, end) = crate::booking::stay_interval(stay);
                if start >= end {
                    return Err(LedgerError::Validation(format!(
                        "stay for '{}' has check-out {} at or before check-in {}",
                        stay.guest_name, end, start
                    )));
                }
                if stay.room.trim().is_empty() {
                    return Err(LedgerError::Validation("stay is missing a room".into()));
                }
                Ok(())
            }
            RecordData::ConfigItem { name, .. }
            | RecordData::ConfigCategory { name, .. }
            | RecordData::ConfigCollection { name, .. } => {
                if name.trim().is_empty() {
                    return Err(LedgerError::Validation(
                        "configuration entity is missing a name".into(),
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// A stay may only hold `Approved` status if its room is free for the
    /// whole interval. Non-stay payloads pass through. `exclude_id` names
    /// the visible row the stay replaces or transitions, so a record never
    /// conflicts with itself.
    fn ensure_stay_available(
        &self,
        record: &OperationalRecord,
        exclude_id: &str,
    ) -> Result<(), LedgerError> {
        let stay = match &record.data {
            RecordData::RoomBooking(stay) | RecordData::RoomReservation(stay) => stay,
            _ => return Ok(()),
        };
        self.conflicts().ensure_available(&BookingQuery {
            room: stay.room.clone(),
            check_in: stay.check_in,
            check_out: stay.check_out,
            check_in_time: stay.check_in_time,
            check_out_time: stay.check_out_time,
            exclude_id: Some(exclude_id.to_string()),
        })
    }

    fn build_record(
        &self,
        actor: &Actor,
        draft: &RecordDraft,
        original_id: Option<String>,
        version_no: u32,
        group_id: Option<String>,
    ) -> OperationalRecord {
        let status = self.initial_status(actor, &draft.data);
        let reviewed = status.is_approved();
        OperationalRecord {
            id: utils::new_record_id(),
            original_id,
            version_no,
            entity_type: draft.entity_type,
            data: draft.data.clone(),
            status,
            financial_amount: draft.financial_amount,
            submitted_by: actor.id.clone(),
            reviewed_by: reviewed.then(|| actor.id.clone()),
            created_at: TimeStamp::new(),
            reviewed_at: reviewed.then(TimeStamp::new),
            deleted_at: None,
            group_id,
        }
    }

    /// Submit a new record; returns the stored row, status already computed
    /// by the initial-status rule.
    pub fn submit_record(
        &self,
        session: &dyn Session,
        draft: RecordDraft,
    ) -> Result<OperationalRecord, LedgerError> {
        self.validate_draft(&draft.data)?;

        self.with_retry(session, "submit", || {
            let record = self.build_record(session.actor(), &draft, None, 0, None);
            if record.status.is_approved() {
                self.ensure_stay_available(&record, &record.id)?;
            }
            self.store.append(&record)?;
            info!(id = %record.id, tag = record.data.tag(), department = record.entity_type.as_str(), status = record.status.label(), "record submitted");
            Ok(record)
        })
    }

    /// Submit several records as one group. Every member is its own chain
    /// root (so each replays and edits independently), linked by a shared
    /// group id that a later [`LedgerService::approve_group`] call covers in
    /// one transaction. Used when a config item arrives together with its
    /// opening-stock movement.
    pub fn submit_group(
        &self,
        session: &dyn Session,
        drafts: Vec<RecordDraft>,
    ) -> Result<Vec<OperationalRecord>, LedgerError> {
        if drafts.is_empty() {
            return Err(LedgerError::Validation("empty submission group".into()));
        }
        for draft in &drafts {
            self.validate_draft(&draft.data)?;
        }
        // members are affordable together, not just one at a time
        let movements: Vec<StockMovement> = drafts
            .iter()
            .filter_map(|d| match &d.data {
                RecordData::StockMovement(mv) => Some(mv.clone()),
                _ => None,
            })
            .collect();
        self.reconciler().validate_group(&movements)?;

        self.with_retry(session, "submit group", || {
            let group = utils::new_group_id();
            let records: Vec<OperationalRecord> = drafts
                .iter()
                .map(|draft| {
                    self.build_record(session.actor(), draft, None, 0, Some(group.clone()))
                })
                .collect();
            for record in &records {
                if record.status.is_approved() {
                    self.ensure_stay_available(record, &record.id)?;
                }
            }
            for record in &records {
                self.store.append(record)?;
            }
            info!(group = %group, members = records.len(), "group submitted");
            Ok(records)
        })
    }

    /// Approve one pending record. Stock movements are re-validated against
    /// the ledger as it stands now, not as it stood at submission.
    pub fn approve_record(
        &self,
        session: &dyn Session,
        id: &str,
    ) -> Result<OperationalRecord, LedgerError> {
        let actor = session.actor();
        if !actor.role.can_approve() {
            return Err(LedgerError::Unauthorized {
                actor: actor.name.clone(),
                action: "approve records".into(),
            });
        }

        self.with_retry(session, "approve", || {
            let (record, raw) = self
                .store
                .get_with_raw(id)?
                .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
            if !record.status.is_pending() || !record.is_visible() {
                return Err(LedgerError::StateConflict {
                    id: id.to_string(),
                    expected: "pending".into(),
                    found: record.status.label().into(),
                });
            }
            if let RecordData::StockMovement(mv) = &record.data {
                self.reconciler().validate_movement(mv)?;
            }
            // an active stay is physical occupancy and must be exclusive;
            // an overbooked reservation stays approvable and is resolved at
            // check-in by the conversion path
            if matches!(record.data, RecordData::RoomBooking(_)) {
                self.ensure_stay_available(&record, &record.id)?;
            }

            let mut approved = record.clone();
            approved.status = RecordStatus::Approved;
            approved.reviewed_by = Some(actor.id.clone());
            approved.reviewed_at = Some(TimeStamp::new());
            self.store.swap_guarded(id, &raw, &approved, "pending")?;
            info!(id, reviewer = %actor.name, "record approved");
            Ok(approved)
        })
    }

    /// Approve every pending member of a submission group in one
    /// transaction, given any member's id. Partial approval is impossible:
    /// a member in the wrong state aborts the whole group with a state
    /// conflict.
    pub fn approve_group(
        &self,
        session: &dyn Session,
        member_id: &str,
    ) -> Result<usize, LedgerError> {
        let actor = session.actor();
        if !actor.role.can_approve() {
            return Err(LedgerError::Unauthorized {
                actor: actor.name.clone(),
                action: "approve records".into(),
            });
        }

        self.with_retry(session, "approve group", || {
            let seed = self
                .store
                .get(member_id)?
                .ok_or_else(|| LedgerError::NotFound(member_id.to_string()))?;
            // a record submitted outside a group is a group of one
            let members: Vec<OperationalRecord> = match seed.group_id.as_deref() {
                Some(group) => self
                    .store
                    .latest_visible()?
                    .into_iter()
                    .filter(|m| m.group_id.as_deref() == Some(group) && m.status.is_pending())
                    .collect(),
                None => self
                    .store
                    .chain_versions(seed.chain_root())?
                    .into_iter()
                    .filter(|m| m.status.is_pending())
                    .collect(),
            };
            if members.is_empty() {
                return Err(LedgerError::StateConflict {
                    id: member_id.to_string(),
                    expected: "pending".into(),
                    found: seed.status.label().into(),
                });
            }
            let mut movements: Vec<StockMovement> = Vec::new();
            for member in &members {
                match &member.data {
                    RecordData::StockMovement(mv) => movements.push(mv.clone()),
                    RecordData::RoomBooking(_) => {
                        self.ensure_stay_available(member, &member.id)?;
                    }
                    _ => {}
                }
            }
            self.reconciler().validate_group(&movements)?;

            let ids: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
            let reviewer = actor.id.clone();
            self.store.transition_group(&ids, |mut record| {
                record.status = RecordStatus::Approved;
                record.reviewed_by = Some(reviewer.clone());
                record.reviewed_at = Some(TimeStamp::new());
                Ok(record)
            })?;
            info!(member = member_id, members = ids.len(), reviewer = %actor.name, "group approved");
            Ok(ids.len())
        })
    }

    /// Reject a pending record. The reason is mandatory and checked before
    /// any store access.
    pub fn reject_record(
        &self,
        session: &dyn Session,
        id: &str,
        reason: &str,
    ) -> Result<OperationalRecord, LedgerError> {
        if reason.trim().is_empty() {
            return Err(LedgerError::Validation(
                "a rejection requires a non-empty reason".into(),
            ));
        }
        let actor = session.actor();
        if !actor.role.can_approve() {
            return Err(LedgerError::Unauthorized {
                actor: actor.name.clone(),
                action: "reject records".into(),
            });
        }

        self.with_retry(session, "reject", || {
            let (record, raw) = self
                .store
                .get_with_raw(id)?
                .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
            if !record.status.is_pending() || !record.is_visible() {
                return Err(LedgerError::StateConflict {
                    id: id.to_string(),
                    expected: "pending".into(),
                    found: record.status.label().into(),
                });
            }
            let mut rejected = record.clone();
            rejected.status = RecordStatus::Rejected {
                reason: reason.trim().to_string(),
            };
            rejected.reviewed_by = Some(actor.id.clone());
            rejected.reviewed_at = Some(TimeStamp::new());
            self.store.swap_guarded(id, &raw, &rejected, "pending")?;
            info!(id, reviewer = %actor.name, "record rejected");
            Ok(rejected)
        })
    }

    /// Soft-delete a record that was never approved. Approved configuration
    /// entities must go through [`LedgerService::delete_approved_entity`].
    pub fn soft_delete_record(&self, session: &dyn Session, id: &str) -> Result<(), LedgerError> {
        self.with_retry(session, "soft delete", || {
            let record = self
                .store
                .get(id)?
                .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
            if record.status.is_approved() {
                return Err(LedgerError::Validation(format!(
                    "record {} is approved; use the delete-approved-entity path",
                    id
                )));
            }
            self.store.soft_delete(id)?;
            debug!(id, "record soft-deleted");
            Ok(())
        })
    }

    /// Delete an approved configuration entity, retiring its dependents so
    /// nothing is orphaned: a category takes its collections and items with
    /// it, a collection its items. Applied as one atomic batch.
    pub fn delete_approved_entity(
        &self,
        session: &dyn Session,
        id: &str,
    ) -> Result<usize, LedgerError> {
        let actor = session.actor();
        if !actor.role.can_approve() {
            return Err(LedgerError::Unauthorized {
                actor: actor.name.clone(),
                action: "delete approved entities".into(),
            });
        }

        self.with_retry(session, "delete entity", || {
            let target = self
                .store
                .get(id)?
                .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
            if !target.status.is_approved() || !target.is_visible() {
                return Err(LedgerError::StateConflict {
                    id: id.to_string(),
                    expected: "approved".into(),
                    found: target.status.label().into(),
                });
            }

            let live = self.store.latest_visible()?;
            let mut doomed: Vec<OperationalRecord> = Vec::new();

            // every non-deleted version of the entity's chain is retired,
            // so no stale version can resurface as the head
            let retire_entity = |entity: &OperationalRecord,
                                doomed: &mut Vec<OperationalRecord>|
             -> Result<(), LedgerError> {
                doomed.extend(self.store.chain_versions(entity.chain_root())?);
                Ok(())
            };

            match &target.data {
                RecordData::ConfigItem { .. } => retire_entity(&target, &mut doomed)?,
                RecordData::ConfigCollection { name, .. } => {
                    retire_entity(&target, &mut doomed)?;
                    for record in &live {
                        if let RecordData::ConfigItem { collection, .. } = &record.data {
                            if collection == name {
                                retire_entity(record, &mut doomed)?;
                            }
                        }
                    }
                }
                RecordData::ConfigCategory { name, .. } => {
                    retire_entity(&target, &mut doomed)?;
                    for record in &live {
                        match &record.data {
                            RecordData::ConfigCollection { category, .. }
                            | RecordData::ConfigItem { category, .. }
                                if category == name =>
                            {
                                retire_entity(record, &mut doomed)?;
                            }
                            _ => {}
                        }
                    }
                }
                _ => {
                    return Err(LedgerError::Validation(format!(
                        "record {} is not a configuration entity",
                        id
                    )));
                }
            }

            let count = self.store.soft_delete_batch(&doomed)?;
            info!(id, retired = count, "approved entity deleted with dependents");
            Ok(count)
        })
    }

    /// Edit a record by appending a new version to its chain. The previous
    /// row is untouched; the new version re-enters the approval rule unless
    /// the editor's role auto-approves.
    pub fn edit_record(
        &self,
        session: &dyn Session,
        prev_id: &str,
        data: RecordData,
        financial_amount: Option<Money>,
    ) -> Result<OperationalRecord, LedgerError> {
        self.validate_draft(&data)?;

        self.with_retry(session, "edit", || {
            let prev = self
                .store
                .get(prev_id)?
                .ok_or_else(|| LedgerError::NotFound(prev_id.to_string()))?;
            if prev.data.tag() != data.tag() {
                return Err(LedgerError::Validation(format!(
                    "edit changes payload kind from {} to {}",
                    prev.data.tag(),
                    data.tag()
                )));
            }
            let root = prev.chain_root().to_string();
            let draft = RecordDraft {
                entity_type: prev.entity_type,
                data: data.clone(),
                financial_amount: financial_amount.unwrap_or(prev.financial_amount),
            };
            let record = self.build_record(
                session.actor(),
                &draft,
                Some(root.clone()),
                self.store.next_version(&root)?,
                prev.group_id.clone(),
            );
            if record.status.is_approved() {
                // the chain's own visible head must not block its edit
                let head = self.store.latest(&root)?.map(|h| h.id);
                self.ensure_stay_available(&record, head.as_deref().unwrap_or(prev_id))?;
            }
            self.store.append(&record)?;
            info!(id = %record.id, chain = %root, version = record.version_no, "record edited");
            Ok(record)
        })
    }

    /// Convert an approved reservation into an active stay. Re-checks the
    /// room (excluding the reservation itself), then writes the new booking
    /// and the reservation's terminal state in one transaction; no reader
    /// ever sees a half-converted pair.
    pub fn convert_reservation(
        &self,
        session: &dyn Session,
        reservation_id: &str,
    ) -> Result<OperationalRecord, LedgerError> {
        self.with_retry(session, "convert", || {
            let reservation = self
                .store
                .get(reservation_id)?
                .ok_or_else(|| LedgerError::NotFound(reservation_id.to_string()))?;
            let RecordData::RoomReservation(stay) = &reservation.data else {
                return Err(LedgerError::Validation(format!(
                    "record {} is not a reservation",
                    reservation_id
                )));
            };
            if !reservation.status.is_approved() || !reservation.is_visible() {
                return Err(LedgerError::StateConflict {
                    id: reservation_id.to_string(),
                    expected: "approved".into(),
                    found: reservation.status.label().into(),
                });
            }

            self.conflicts().ensure_available(&BookingQuery {
                room: stay.room.clone(),
                check_in: stay.check_in,
                check_out: stay.check_out,
                check_in_time: stay.check_in_time,
                check_out_time: stay.check_out_time,
                exclude_id: Some(reservation.id.clone()),
            })?;

            let actor = session.actor();
            let root = reservation.chain_root().to_string();
            let booking = OperationalRecord {
                id: utils::new_record_id(),
                original_id: Some(root.clone()),
                version_no: self.store.next_version(&root)?,
                entity_type: Department::FrontDesk,
                data: RecordData::RoomBooking(stay.clone()),
                status: RecordStatus::Approved,
                // the payment follows the active stay; the reservation drops
                // out of revenue once it leaves Approved
                financial_amount: reservation.financial_amount,
                submitted_by: actor.id.clone(),
                reviewed_by: Some(actor.id.clone()),
                created_at: TimeStamp::new(),
                reviewed_at: Some(TimeStamp::new()),
                deleted_at: None,
                group_id: reservation.group_id.clone(),
            };

            // claim the version slot, then commit both writes atomically
            let mut converted = reservation.clone();
            converted.status = RecordStatus::Converted {
                booking_id: booking.id.clone(),
            };
            converted.reviewed_by = Some(actor.id.clone());
            converted.reviewed_at = Some(TimeStamp::new());

            self.store
                .claim_version(&root, booking.version_no, &booking.id)?;
            self.store.commit_conversion(&converted, &booking)?;
            info!(reservation = reservation_id, booking = %booking.id, "reservation converted to stay");
            Ok(booking)
        })
    }

    /// Mark a past, approved, unconverted reservation as expired so it no
    /// longer occupies its room in conflict checks.
    pub fn expire_reservation(&self, session: &dyn Session, id: &str) -> Result<(), LedgerError> {
        self.with_retry(session, "expire", || {
            let (record, raw) = self
                .store
                .get_with_raw(id)?
                .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
            let RecordData::RoomReservation(stay) = &record.data else {
                return Err(LedgerError::Validation(format!(
                    "record {} is not a reservation",
                    id
                )));
            };
            if !record.status.is_approved() || !record.is_visible() {
                return Err(LedgerError::StateConflict {
                    id: id.to_string(),
                    expected: "approved".into(),
                    found: record.status.label().into(),
                });
            }
            if stay.check_out >= EventDate::today() {
                return Err(LedgerError::Validation(format!(
                    "reservation {} has not lapsed yet (check-out {})",
                    id, stay.check_out
                )));
            }
            let mut expired = record.clone();
            expired.status = RecordStatus::Expired;
            self.store.swap_guarded(id, &raw, &expired, "approved")?;
            debug!(id, "reservation expired");
            Ok(())
        })
    }

    /// Double-booking check, exposed for callers that must interpret the
    /// result before deciding to submit.
    pub fn check_double_booking(
        &self,
        query: &BookingQuery,
    ) -> Result<Option<BookingConflict>, LedgerError> {
        self.conflicts().has_conflict(query)
    }

    /// Stock sheet for one department and date. Read-only, approved-only.
    pub fn stock_state(
        &self,
        date: EventDate,
        dept: Department,
        category: Option<&str>,
    ) -> Result<Vec<StockRow>, LedgerError> {
        self.reconciler().stock_state(date, dept, category)
    }

    pub fn monthly_rollup(
        &self,
        item: &str,
        dept: Department,
        year: i32,
        month: u32,
    ) -> Result<MonthlyRollup, LedgerError> {
        self.reconciler().monthly_rollup(item, dept, year, month)
    }

    /// The full audit trail: every row ever written, soft-deleted and
    /// edited-over versions included.
    pub fn audit_trail(&self) -> Result<Vec<OperationalRecord>, LedgerError> {
        self.store.all_records()
    }

    /// Supervisor queue: live records still waiting for review.
    pub fn pending_records(&self) -> Result<Vec<OperationalRecord>, LedgerError> {
        Ok(self
            .store
            .latest_visible()?
            .into_iter()
            .filter(|r| r.status.is_pending())
            .collect())
    }

    /// Approved live records, optionally filtered by department. The listing
    /// every read surface starts from; stale edited-over versions never
    /// appear here.
    pub fn latest_records(
        &self,
        entity_type: Option<Department>,
    ) -> Result<Vec<OperationalRecord>, LedgerError> {
        Ok(self
            .store
            .latest_visible()?
            .into_iter()
            .filter(|r| r.status.is_approved())
            .filter(|r| entity_type.is_none_or(|d| r.entity_type == d))
            .collect())
    }
}
