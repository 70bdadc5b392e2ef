//! Stock reconciliation by ledger replay
//!
//! Stock levels are never stored as running counters. Every figure here is
//! derived on demand by summing the signed deltas of approved, non-deleted,
//! latest-version stock movements, so a cached counter can never drift from
//! the ledger underneath it.

use crate::error::LedgerError;
use crate::record::{
    Department, EventDate, Money, MovementKind, RecordData, StockMovement,
};
use crate::store::RecordStore;
use rust_decimal::Decimal;

/// Incoming/outgoing split for one item on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DailyMovement {
    pub restocked: Decimal,
    pub issued: Decimal,
}

/// Month-level summary for display. `close_end` is clamped at zero, unlike
/// the raw daily figures which keep their true sign for audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthlyRollup {
    pub open_start: Decimal,
    pub restocked: Decimal,
    pub sold: Decimal,
    pub close_end: Decimal,
    pub sales_value: Money,
}

/// One line of the per-department stock sheet for a given date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockRow {
    pub item: String,
    pub unit: String,
    pub unit_price: Money,
    pub opening: Decimal,
    pub restocked: Decimal,
    pub issued: Decimal,
    pub closing: Decimal,
}

/// Opening balance as of `date`: the sum of signed deltas strictly before
/// it. No clamping; a negative result is a data-entry anomaly the audit
/// trail must show.
pub fn opening_from(movements: &[StockMovement], date: EventDate) -> Decimal {
    movements
        .iter()
        .filter(|mv| mv.event_date < date)
        .map(|mv| mv.signed_delta())
        .sum()
}

/// Incoming and outgoing totals for exactly `date`.
pub fn daily_from(movements: &[StockMovement], date: EventDate) -> DailyMovement {
    let mut day = DailyMovement::default();
    for mv in movements.iter().filter(|mv| mv.event_date == date) {
        if mv.is_incoming() {
            day.restocked += mv.quantity_in.0;
        } else {
            day.issued += mv.quantity_out.0;
        }
    }
    day
}

/// Pure reader over the approved projection of the ledger. Holds no state
/// of its own; identical inputs against an unchanged ledger yield identical
/// outputs.
pub struct StockReconciler<'a> {
    store: &'a RecordStore,
}

impl<'a> StockReconciler<'a> {
    pub fn new(store: &'a RecordStore) -> Self {
        Self { store }
    }

    /// Approved, visible movements for one item in one department.
    fn movements(&self, item: &str, dept: Department) -> Result<Vec<StockMovement>, LedgerError> {
        Ok(self.department_movements(dept)?
            .into_iter()
            .filter(|mv| mv.item == item)
            .collect())
    }

    /// Approved, visible movements for a whole department, for sheet-style
    /// listings that replay many items at once.
    fn department_movements(&self, dept: Department) -> Result<Vec<StockMovement>, LedgerError> {
        let mut movements = Vec::new();
        for record in self.store.latest_visible()? {
            if !record.status.is_approved() {
                continue;
            }
            if let RecordData::StockMovement(mv) = record.data {
                if mv.department == dept {
                    movements.push(mv);
                }
            }
        }
        Ok(movements)
    }

    pub fn opening_stock(
        &self,
        item: &str,
        dept: Department,
        date: EventDate,
    ) -> Result<Decimal, LedgerError> {
        Ok(opening_from(&self.movements(item, dept)?, date))
    }

    pub fn daily_movement(
        &self,
        item: &str,
        dept: Department,
        date: EventDate,
    ) -> Result<DailyMovement, LedgerError> {
        Ok(daily_from(&self.movements(item, dept)?, date))
    }

    /// `closing(date)` equals `opening(date + 1)` so long as the movement
    /// set is unchanged between the two calls; that equivalence is the
    /// engine's core correctness property.
    pub fn closing_stock(
        &self,
        item: &str,
        dept: Department,
        date: EventDate,
    ) -> Result<Decimal, LedgerError> {
        let movements = self.movements(item, dept)?;
        let day = daily_from(&movements, date);
        Ok(opening_from(&movements, date) + day.restocked - day.issued)
    }

    /// Month summary. `sales_value` counts only `Sold` movements so restocks
    /// and adjustments never inflate turnover.
    pub fn monthly_rollup(
        &self,
        item: &str,
        dept: Department,
        year: i32,
        month: u32,
    ) -> Result<MonthlyRollup, LedgerError> {
        let first = EventDate::new(year, month, 1).ok_or_else(|| {
            LedgerError::Validation(format!("{year}-{month:02} is not a calendar month"))
        })?;
        let next = first.first_of_next_month();

        let movements = self.movements(item, dept)?;
        let open_start = opening_from(&movements, first);

        let mut restocked = Decimal::ZERO;
        let mut sold = Decimal::ZERO;
        let mut sales_value = Money::zero();
        for mv in movements
            .iter()
            .filter(|mv| mv.event_date >= first && mv.event_date < next)
        {
            if mv.is_incoming() {
                restocked += mv.quantity_in.0;
            } else {
                sold += mv.quantity_out.0;
            }
            if mv.kind == MovementKind::Sold {
                sales_value += mv.total_value;
            }
        }

        Ok(MonthlyRollup {
            open_start,
            restocked,
            sold,
            close_end: (open_start + restocked - sold).max(Decimal::ZERO),
            sales_value,
        })
    }

    /// One row per live config item of the department (optionally filtered
    /// by category), replayed as of `date`.
    pub fn stock_state(
        &self,
        date: EventDate,
        dept: Department,
        category: Option<&str>,
    ) -> Result<Vec<StockRow>, LedgerError> {
        let movements = self.department_movements(dept)?;

        let mut rows = Vec::new();
        for record in self.store.latest_visible()? {
            if !record.status.is_approved() {
                continue;
            }
            let RecordData::ConfigItem {
                name,
                category: item_category,
                unit,
                unit_price,
                active,
                ..
            } = record.data
            else {
                continue;
            };
            if !active {
                continue;
            }
            if let Some(wanted) = category {
                if item_category != wanted {
                    continue;
                }
            }

            let own: Vec<StockMovement> = movements
                .iter()
                .filter(|mv| mv.item == name)
                .cloned()
                .collect();
            let opening = opening_from(&own, date);
            let day = daily_from(&own, date);
            rows.push(StockRow {
                item: name,
                unit,
                unit_price,
                opening,
                restocked: day.restocked,
                issued: day.issued,
                closing: opening + day.restocked - day.issued,
            });
        }
        rows.sort_by(|a, b| a.item.cmp(&b.item));
        Ok(rows)
    }

    /// Gate a movement before it reaches the ledger. Run again at approval
    /// time when approval is delayed, because other approved movements may
    /// have landed in the interim.
    pub fn validate_movement(&self, mv: &StockMovement) -> Result<(), LedgerError> {
        self.validate_against(mv, &[])
    }

    /// Gate a whole group at once. Each member is checked against the
    /// ledger plus the members before it in the group, so siblings that are
    /// individually affordable but jointly oversell are still caught.
    pub fn validate_group(&self, movements: &[StockMovement]) -> Result<(), LedgerError> {
        for (i, mv) in movements.iter().enumerate() {
            self.validate_against(mv, &movements[..i])?;
        }
        Ok(())
    }

    /// Availability math for one movement, with `approved_with` treated as
    /// if it were already part of the approved ledger.
    fn validate_against(
        &self,
        mv: &StockMovement,
        approved_with: &[StockMovement],
    ) -> Result<(), LedgerError> {
        if mv.item.trim().is_empty() {
            return Err(LedgerError::Validation(
                "stock movement is missing an item name".into(),
            ));
        }
        if mv.quantity_in.0 < Decimal::ZERO || mv.quantity_out.0 < Decimal::ZERO {
            return Err(LedgerError::Validation(format!(
                "negative quantity on movement for '{}'",
                mv.item
            )));
        }
        if mv.is_incoming() {
            return Ok(());
        }

        let mut movements = self.movements(&mv.item, mv.department)?;
        movements.extend(
            approved_with
                .iter()
                .filter(|s| s.item == mv.item && s.department == mv.department)
                .cloned(),
        );
        let opening = opening_from(&movements, mv.event_date);
        let day = daily_from(&movements, mv.event_date);

        // a single movement may not issue more than was ever available today
        let cap = opening + day.restocked;
        if mv.quantity_out.0 > cap {
            return Err(LedgerError::InsufficientStock {
                item: mv.item.clone(),
                requested: mv.quantity_out.0,
                available: cap,
            });
        }
        // and the day as a whole must not close negative
        if opening + day.restocked - day.issued - mv.quantity_out.0 < Decimal::ZERO {
            return Err(LedgerError::InsufficientStock {
                item: mv.item.clone(),
                requested: mv.quantity_out.0,
                available: cap - day.issued,
            });
        }
        Ok(())
    }

    /// Net approved revenue over the half-open window `[from, to)`,
    /// optionally restricted to one department.
    pub fn revenue(
        &self,
        dept: Option<Department>,
        from: EventDate,
        to: EventDate,
    ) -> Result<Money, LedgerError> {
        let mut total = Money::zero();
        for record in self.store.latest_visible()? {
            if !record.status.is_approved() {
                continue;
            }
            if let Some(wanted) = dept {
                if record.entity_type != wanted {
                    continue;
                }
            }
            let date = record.effective_date();
            if date >= from && date < to {
                total += record.financial_amount;
            }
        }
        Ok(total)
    }
}
