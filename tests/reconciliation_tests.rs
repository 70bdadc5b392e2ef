//! Reconciliation scenario tests: ledger replay, rollups and the
//! stock-availability gate, end to end against a real store.

use ops_ledger::actor::{Actor, Role};
use ops_ledger::error::LedgerError;
use ops_ledger::record::{
    Department, EventDate, Money, MovementKind, Qty, RecordData, StockMovement,
};
use ops_ledger::service::{LedgerService, RecordDraft, StaticSession};
use ops_ledger::utils;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tempfile::tempdir;

fn open_service(dir: &tempfile::TempDir, name: &str) -> anyhow::Result<LedgerService> {
    let db = sled::open(dir.path().join(name))?;
    db.clear()?;
    Ok(LedgerService::open(Arc::new(db))?)
}

fn manager() -> StaticSession {
    StaticSession::new(Actor::new(utils::new_actor_id(), "duty manager", Role::Manager))
}

fn staff(role: Role, name: &str) -> StaticSession {
    StaticSession::new(Actor::new(utils::new_actor_id(), name, role))
}

fn draft(item: &str, kind: MovementKind, qin: Decimal, qout: Decimal, day: u32) -> RecordDraft {
    let unit_price = Money(dec!(2.00));
    RecordDraft {
        entity_type: Department::Store,
        data: RecordData::StockMovement(StockMovement {
            item: item.into(),
            department: Department::Store,
            kind,
            quantity_in: Qty(qin),
            quantity_out: Qty(qout),
            unit_price,
            total_value: Money(unit_price.0 * qout),
            event_date: EventDate::new(2024, 1, day).unwrap(),
            staff_name: "store clerk".into(),
            notes: None,
        }),
        financial_amount: Money(unit_price.0 * qout),
    }
}

fn date(day: u32) -> EventDate {
    EventDate::new(2024, 1, day).unwrap()
}

/// Opening stock of 10 on the 1st plus a restock of 5 on the 2nd must open
/// the 3rd at 15.
#[test]
fn opening_stock_replays_approved_history() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let service = open_service(&dir, "opening.db")?;
    let session = manager();

    service.submit_record(&session, draft("Eggs", MovementKind::OpeningStock, dec!(10), dec!(0), 1))?;
    service.submit_record(&session, draft("Eggs", MovementKind::Restock, dec!(5), dec!(0), 2))?;

    let opening = service
        .reconciler()
        .opening_stock("Eggs", Department::Store, date(3))?;
    assert_eq!(opening, dec!(15));

    // another department's ledger is untouched
    let opening = service
        .reconciler()
        .opening_stock("Eggs", Department::Kitchen, date(3))?;
    assert_eq!(opening, Decimal::ZERO);

    Ok(())
}

/// The engine's core correctness property: closing stock of any day equals
/// the next day's opening stock while the movement set is unchanged.
#[test]
fn closing_equals_next_opening() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let service = open_service(&dir, "replay.db")?;
    let session = manager();

    service.submit_record(&session, draft("Flour", MovementKind::OpeningStock, dec!(20), dec!(0), 1))?;
    service.submit_record(&session, draft("Flour", MovementKind::Sold, dec!(0), dec!(4), 2))?;
    service.submit_record(&session, draft("Flour", MovementKind::Restock, dec!(10), dec!(0), 3))?;
    service.submit_record(&session, draft("Flour", MovementKind::Consumed, dec!(0), dec!(7), 3))?;
    service.submit_record(&session, draft("Flour", MovementKind::Issued, dec!(0), dec!(2), 5))?;

    let reconciler = service.reconciler();
    for day in 1..=6 {
        let closing = reconciler.closing_stock("Flour", Department::Store, date(day))?;
        let next_opening = reconciler.opening_stock("Flour", Department::Store, date(day).next_day())?;
        assert_eq!(closing, next_opening, "mismatch on day {day}");
    }

    Ok(())
}

/// Replaying the same inputs over an unchanged ledger is idempotent.
#[test]
fn stock_state_is_idempotent() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let service = open_service(&dir, "idempotent.db")?;
    let session = manager();

    service.submit_record(
        &session,
        RecordDraft {
            entity_type: Department::Store,
            data: RecordData::ConfigItem {
                name: "Flour".into(),
                category: "Dry Goods".into(),
                collection: "Bakery".into(),
                unit: "kg".into(),
                unit_price: Money(dec!(2.00)),
                active: true,
            },
            financial_amount: Money::zero(),
        },
    )?;
    service.submit_record(&session, draft("Flour", MovementKind::OpeningStock, dec!(20), dec!(0), 1))?;
    service.submit_record(&session, draft("Flour", MovementKind::Sold, dec!(0), dec!(4), 2))?;

    let first = service.stock_state(date(2), Department::Store, None)?;
    let second = service.stock_state(date(2), Department::Store, None)?;
    assert_eq!(first, second);

    assert_eq!(first.len(), 1);
    assert_eq!(first[0].item, "Flour");
    assert_eq!(first[0].opening, dec!(20));
    assert_eq!(first[0].issued, dec!(4));
    assert_eq!(first[0].closing, dec!(16));

    // category filter drops non-matching items rather than erroring
    let filtered = service.stock_state(date(2), Department::Store, Some("Beverages"))?;
    assert!(filtered.is_empty());

    Ok(())
}

/// Selling 12 when only 10 were ever available must be rejected before the
/// ledger sees it, naming the item.
#[test]
fn oversell_is_rejected_at_submission() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let service = open_service(&dir, "oversell.db")?;
    let session = manager();

    service.submit_record(&session, draft("Eggs", MovementKind::OpeningStock, dec!(6), dec!(0), 1))?;
    service.submit_record(&session, draft("Eggs", MovementKind::Restock, dec!(4), dec!(0), 2))?;

    let err = service
        .submit_record(&session, draft("Eggs", MovementKind::Sold, dec!(0), dec!(12), 2))
        .unwrap_err();
    match err {
        LedgerError::InsufficientStock {
            item,
            requested,
            available,
        } => {
            assert_eq!(item, "Eggs");
            assert_eq!(requested, dec!(12));
            assert_eq!(available, dec!(10));
        }
        other => panic!("expected insufficient stock, got {other}"),
    }

    // nothing reached the store
    let day = service
        .reconciler()
        .daily_movement("Eggs", Department::Store, date(2))?;
    assert_eq!(day.issued, Decimal::ZERO);

    Ok(())
}

/// A movement that was fine at submission is re-validated at approval time:
/// approved movements landing in the interim can invalidate it.
#[test]
fn stale_pending_movement_fails_approval() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let service = open_service(&dir, "stale.db")?;
    let mgr = manager();
    let clerk = StaticSession::new(Actor::new(utils::new_actor_id(), "store clerk", Role::Store));
    let supervisor =
        StaticSession::new(Actor::new(utils::new_actor_id(), "floor supervisor", Role::Supervisor));

    service.submit_record(&mgr, draft("Sugar", MovementKind::OpeningStock, dec!(10), dec!(0), 1))?;

    // valid against the snapshot at submission time
    let pending = service.submit_record(&clerk, draft("Sugar", MovementKind::Sold, dec!(0), dec!(8), 2))?;
    assert!(pending.status.is_pending());

    // meanwhile a privileged sale of 5 lands approved
    service.submit_record(&mgr, draft("Sugar", MovementKind::Sold, dec!(0), dec!(5), 2))?;

    let err = service.approve_record(&supervisor, &pending.id).unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientStock { .. }));
    assert!(service.store().get(&pending.id)?.unwrap().status.is_pending());

    Ok(())
}

/// Every member of an approved group lands in the replay: two grouped
/// 3-unit sales against an opening of 10 must close the day at 4.
#[test]
fn grouped_movements_all_count_in_replay() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let service = open_service(&dir, "group_replay.db")?;
    let session = manager();

    service.submit_record(&session, draft("Eggs", MovementKind::OpeningStock, dec!(10), dec!(0), 1))?;
    let stored = service.submit_group(
        &session,
        vec![
            draft("Eggs", MovementKind::Sold, dec!(0), dec!(3), 2),
            draft("Eggs", MovementKind::Sold, dec!(0), dec!(3), 2),
        ],
    )?;
    assert!(stored.iter().all(|r| r.status.is_approved()));

    let closing = service
        .reconciler()
        .closing_stock("Eggs", Department::Store, date(2))?;
    assert_eq!(closing, dec!(4));

    // each sale is its own live head, none shadows a sibling
    let live = service.store().latest_visible()?;
    let sales = live
        .iter()
        .filter(|r| r.data.tag() == "stock_movement")
        .count();
    assert_eq!(sales, 3);

    Ok(())
}

/// Group members that are individually affordable but jointly oversell are
/// rejected together, whether the group is privileged or queued.
#[test]
fn jointly_overselling_group_is_rejected() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let service = open_service(&dir, "group_oversell.db")?;
    let mgr = manager();

    service.submit_record(&mgr, draft("Milk", MovementKind::OpeningStock, dec!(10), dec!(0), 1))?;

    // 6 + 6 against 10: each sale alone fits, the pair does not
    let err = service
        .submit_group(
            &mgr,
            vec![
                draft("Milk", MovementKind::Sold, dec!(0), dec!(6), 2),
                draft("Milk", MovementKind::Sold, dec!(0), dec!(6), 2),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientStock { .. }));
    let closing = service
        .reconciler()
        .closing_stock("Milk", Department::Store, date(2))?;
    assert_eq!(closing, dec!(10));

    // a queued group is re-checked cumulatively at approval time
    let clerk = staff(Role::Store, "store clerk");
    let supervisor = staff(Role::Supervisor, "floor supervisor");
    service.submit_record(&mgr, draft("Milk", MovementKind::Restock, dec!(10), dec!(0), 1))?;
    let queued = service.submit_group(
        &clerk,
        vec![
            draft("Milk", MovementKind::Sold, dec!(0), dec!(6), 2),
            draft("Milk", MovementKind::Sold, dec!(0), dec!(6), 2),
        ],
    )?;
    // a privileged sale shrinks the pool to 10 before review happens
    service.submit_record(&mgr, draft("Milk", MovementKind::Issued, dec!(0), dec!(10), 1))?;

    let err = service.approve_group(&supervisor, &queued[0].id).unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientStock { .. }));
    for rec in &queued {
        assert!(service.store().get(&rec.id)?.unwrap().status.is_pending());
    }

    Ok(())
}

#[test]
fn monthly_rollup_clamps_and_counts_only_sales_value() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let service = open_service(&dir, "rollup.db")?;
    let session = manager();

    service.submit_record(&session, draft("Rice", MovementKind::OpeningStock, dec!(8), dec!(0), 5))?;
    service.submit_record(&session, draft("Rice", MovementKind::Sold, dec!(0), dec!(3), 10))?;
    service.submit_record(&session, draft("Rice", MovementKind::Issued, dec!(0), dec!(5), 20))?;

    let rollup = service.monthly_rollup("Rice", Department::Store, 2024, 1)?;
    assert_eq!(rollup.open_start, Decimal::ZERO);
    assert_eq!(rollup.restocked, dec!(8));
    assert_eq!(rollup.sold, dec!(8));
    assert_eq!(rollup.close_end, Decimal::ZERO);
    // issues leave stock but only Sold movements count as turnover
    assert_eq!(rollup.sales_value, Money(dec!(6.00)));

    // february opens with what january left behind
    let rollup = service.monthly_rollup("Rice", Department::Store, 2024, 2)?;
    assert_eq!(rollup.open_start, Decimal::ZERO);
    assert_eq!(rollup.sales_value, Money::zero());

    Ok(())
}

#[test]
fn revenue_windows_are_half_open_and_approved_only() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let service = open_service(&dir, "revenue.db")?;
    let mgr = manager();
    let clerk = StaticSession::new(Actor::new(utils::new_actor_id(), "store clerk", Role::Store));

    service.submit_record(&mgr, draft("Eggs", MovementKind::OpeningStock, dec!(50), dec!(0), 1))?;
    service.submit_record(&mgr, draft("Eggs", MovementKind::Sold, dec!(0), dec!(10), 2))?; // 20.00
    service.submit_record(&mgr, draft("Eggs", MovementKind::Sold, dec!(0), dec!(5), 8))?; // outside window

    // still pending, must not count
    service.submit_record(&clerk, draft("Eggs", MovementKind::Sold, dec!(0), dec!(4), 2))?;

    let total = service
        .reconciler()
        .revenue(Some(Department::Store), date(1), date(8))?;
    assert_eq!(total, Money(dec!(20.00)));

    Ok(())
}

/// A soft-deleted movement drops out of every balance while remaining
/// stored for audit.
#[test]
fn deleted_movements_leave_the_replay() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let service = open_service(&dir, "deleted.db")?;
    let clerk = StaticSession::new(Actor::new(utils::new_actor_id(), "store clerk", Role::Store));

    let pending = service.submit_record(&clerk, draft("Salt", MovementKind::OpeningStock, dec!(9), dec!(0), 1))?;
    service.soft_delete_record(&clerk, &pending.id)?;

    let opening = service
        .reconciler()
        .opening_stock("Salt", Department::Store, date(2))?;
    assert_eq!(opening, Decimal::ZERO);
    assert!(service.store().get(&pending.id)?.is_some());

    Ok(())
}
