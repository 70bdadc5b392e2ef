//! Core ledger record types and their CBOR codecs
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;

/// Owning department of a ledger record.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Department {
    #[n(0)]
    FrontDesk,
    #[n(1)]
    Kitchen,
    #[n(2)]
    Bar,
    #[n(3)]
    Store,
}

impl Department {
    pub fn as_str(&self) -> &'static str {
        match self {
            Department::FrontDesk => "front-desk",
            Department::Kitchen => "kitchen",
            Department::Bar => "bar",
            Department::Store => "storekeeper",
        }
    }
}

/// Workflow state of a record. `Rejected` carries the mandatory reason,
/// `Converted` the id of the booking the reservation turned into.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum RecordStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected {
        #[n(0)]
        reason: String,
    },
    #[n(3)]
    Expired,
    #[n(4)]
    Converted {
        #[n(0)]
        booking_id: String,
    },
}

impl RecordStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, RecordStatus::Pending)
    }
    pub fn is_approved(&self) -> bool {
        matches!(self, RecordStatus::Approved)
    }
    /// Short label used in state-conflict error messages.
    pub fn label(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Approved => "approved",
            RecordStatus::Rejected { .. } => "rejected",
            RecordStatus::Expired => "expired",
            RecordStatus::Converted { .. } => "converted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

// deriving these would bound `T` itself by `Copy`/`Ord`, which timezone
// types don't implement; for `Utc` the wrapped datetime is copyable and
// chronologically ordered, so the impls are written out
impl Copy for TimeStamp<Utc> {}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    pub fn date(&self) -> EventDate {
        EventDate(self.0.date_naive())
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Calendar date on which a movement or stay takes effect. Stored as days
/// from the common era so the CBOR ordering matches the calendar ordering.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct EventDate(NaiveDate);

impl EventDate {
    pub fn new(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(EventDate)
    }
    pub fn today() -> Self {
        EventDate(Utc::now().date_naive())
    }
    pub fn date(&self) -> NaiveDate {
        self.0
    }
    pub fn next_day(&self) -> Self {
        EventDate(self.0.succ_opt().expect("date out of range"))
    }
    /// First day of the following month, the exclusive upper bound of a
    /// monthly window.
    pub fn first_of_next_month(&self) -> Self {
        let (y, m) = if self.0.month() == 12 {
            (self.0.year() + 1, 1)
        } else {
            (self.0.year(), self.0.month() + 1)
        };
        EventDate(NaiveDate::from_ymd_opt(y, m, 1).unwrap())
    }
}

impl From<NaiveDate> for EventDate {
    fn from(value: NaiveDate) -> Self {
        EventDate(value)
    }
}

impl std::fmt::Display for EventDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<C> minicbor::Encode<C> for EventDate {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.i32(self.0.num_days_from_ce())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for EventDate {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let days = d.i32()?;

        NaiveDate::from_num_days_from_ce_opt(days)
            .map(EventDate)
            .ok_or(minicbor::decode::Error::message(
                "failed to convert day count to date",
            ))
    }
}

/// Optional time-of-day attached to a check-in or check-out date.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct TimeOfDay(NaiveTime);

impl TimeOfDay {
    pub fn new(hour: u32, min: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, min, 0).map(TimeOfDay)
    }
    pub fn time(&self) -> NaiveTime {
        self.0
    }
}

impl<C> minicbor::Encode<C> for TimeOfDay {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.u32(self.0.num_seconds_from_midnight())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeOfDay {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let secs = d.u32()?;

        NaiveTime::from_num_seconds_from_midnight_opt(secs, 0)
            .map(TimeOfDay)
            .ok_or(minicbor::decode::Error::message(
                "failed to convert seconds to time of day",
            ))
    }
}

/// Signed monetary amount. Positive is revenue, negative is expense/refund.
/// Fixed-precision decimal, encoded as its canonical string form so no
/// floating-point rounding ever enters the ledger.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Money(pub Decimal);

impl Money {
    pub fn zero() -> Self {
        Money(Decimal::ZERO)
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl std::ops::Neg for Money {
    type Output = Money;
    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl<C> minicbor::Encode<C> for Money {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.0.to_string())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Money {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let s = d.str()?;

        Decimal::from_str(s)
            .map(Money)
            .map_err(|_| minicbor::decode::Error::message("failed to parse decimal amount"))
    }
}

/// Unsigned-by-convention quantity (validation rejects negatives before a
/// movement reaches the store). Same string codec as [`Money`].
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Qty(pub Decimal);

impl std::fmt::Display for Qty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<C> minicbor::Encode<C> for Qty {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.0.to_string())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Qty {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let s = d.str()?;

        Decimal::from_str(s)
            .map(Qty)
            .map_err(|_| minicbor::decode::Error::message("failed to parse decimal quantity"))
    }
}

/// Inventory movement kinds. `OpeningStock`, `Restock` and a positive
/// `Adjustment` add to stock; everything else removes from it.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementKind {
    #[n(0)]
    OpeningStock,
    #[n(1)]
    Restock,
    #[n(2)]
    Sold,
    #[n(3)]
    Issued,
    #[n(4)]
    Consumed,
    #[n(5)]
    Adjustment,
}

/// One inventory transaction as it sits in the ledger.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct StockMovement {
    #[n(0)]
    pub item: String,
    #[n(1)]
    pub department: Department,
    #[n(2)]
    pub kind: MovementKind,
    #[n(3)]
    pub quantity_in: Qty,
    #[n(4)]
    pub quantity_out: Qty,
    #[n(5)]
    pub unit_price: Money,
    #[n(6)]
    pub total_value: Money,
    #[n(7)]
    pub event_date: EventDate,
    #[n(8)]
    pub staff_name: String,
    #[n(9)]
    pub notes: Option<String>,
}

impl StockMovement {
    /// True when this movement adds to stock.
    pub fn is_incoming(&self) -> bool {
        match self.kind {
            MovementKind::OpeningStock | MovementKind::Restock => true,
            MovementKind::Adjustment => self.quantity_in.0 > Decimal::ZERO,
            _ => false,
        }
    }
    /// Net effect of the movement on the stock level of its item.
    pub fn signed_delta(&self) -> Decimal {
        if self.is_incoming() {
            self.quantity_in.0
        } else {
            -self.quantity_out.0
        }
    }
}

/// Guest stay details, shared by reservations and active bookings.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct StayDetails {
    #[n(0)]
    pub guest_name: String,
    #[n(1)]
    pub room: String,
    #[n(2)]
    pub check_in: EventDate,
    #[n(3)]
    pub check_out: EventDate,
    #[n(4)]
    pub check_in_time: Option<TimeOfDay>,
    #[n(5)]
    pub check_out_time: Option<TimeOfDay>,
    #[n(6)]
    pub deposit: Money,
    #[n(7)]
    pub payment_method: String,
}

/// The tagged payload of an [`OperationalRecord`]. A closed sum per payload
/// shape; `Unknown` carries payloads not yet modeled so old databases stay
/// readable.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    #[n(0)]
    RoomBooking(#[n(0)] StayDetails),
    #[n(1)]
    RoomReservation(#[n(0)] StayDetails),
    #[n(2)]
    ConfigCategory {
        #[n(0)]
        name: String,
        #[n(1)]
        description: String,
    },
    #[n(3)]
    ConfigCollection {
        #[n(0)]
        name: String,
        #[n(1)]
        category: String,
    },
    #[n(4)]
    ConfigItem {
        #[n(0)]
        name: String,
        #[n(1)]
        category: String,
        #[n(2)]
        collection: String,
        #[n(3)]
        unit: String,
        #[n(4)]
        unit_price: Money,
        #[n(5)]
        active: bool,
    },
    #[n(5)]
    StockMovement(#[n(0)] StockMovement),
    #[n(6)]
    InterruptedStay {
        #[n(0)]
        stay_id: String,
        #[n(1)]
        room: String,
        #[n(2)]
        reason: String,
        #[n(3)]
        interrupted_on: EventDate,
        #[n(4)]
        refund_due: Money,
    },
    #[n(7)]
    OperationalNote {
        #[n(0)]
        title: String,
        #[n(1)]
        body: String,
        #[n(2)]
        note_date: EventDate,
    },
    #[n(8)]
    RefundRecord {
        #[n(0)]
        reference: String,
        #[n(1)]
        guest_name: String,
        #[n(2)]
        amount: Money,
        #[n(3)]
        refund_date: EventDate,
        #[n(4)]
        reason: String,
    },
    #[n(9)]
    Unknown {
        #[n(0)]
        tag: String,
        #[n(1)]
        raw: Vec<u8>,
    },
}

impl RecordData {
    /// Discriminant tag. Edits may not change it, so every chain carries
    /// exactly one payload kind from root to head.
    pub fn tag(&self) -> &str {
        match self {
            RecordData::RoomBooking(_) => "room_booking",
            RecordData::RoomReservation(_) => "room_reservation",
            RecordData::ConfigCategory { .. } => "config_category",
            RecordData::ConfigCollection { .. } => "config_collection",
            RecordData::ConfigItem { .. } => "config_item",
            RecordData::StockMovement(_) => "stock_movement",
            RecordData::InterruptedStay { .. } => "interrupted_stay",
            RecordData::OperationalNote { .. } => "operational_note",
            RecordData::RefundRecord { .. } => "refund_record",
            RecordData::Unknown { tag, .. } => tag,
        }
    }
}

/// The universal ledger entry. Rows are append-only; an edit is a new row
/// with `original_id` pointing at the chain root and a bumped `version_no`.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct OperationalRecord {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub original_id: Option<String>,
    #[n(2)]
    pub version_no: u32,
    #[n(3)]
    pub entity_type: Department,
    #[n(4)]
    pub data: RecordData,
    #[n(5)]
    pub status: RecordStatus,
    #[n(6)]
    pub financial_amount: Money,
    #[n(7)]
    pub submitted_by: String,
    #[n(8)]
    pub reviewed_by: Option<String>,
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
    #[n(10)]
    pub reviewed_at: Option<TimeStamp<Utc>>,
    #[n(11)]
    pub deleted_at: Option<TimeStamp<Utc>>,
    /// Set on records submitted together as one batch; a group approval
    /// covers every pending member sharing this id.
    #[n(12)]
    pub group_id: Option<String>,
}

impl OperationalRecord {
    /// Root id of the edit chain this record belongs to.
    pub fn chain_root(&self) -> &str {
        self.original_id.as_deref().unwrap_or(&self.id)
    }
    /// Not soft-deleted.
    pub fn is_visible(&self) -> bool {
        self.deleted_at.is_none()
    }
    /// The business date the record takes effect on, used by revenue
    /// windows. Movements and stays carry their own date; everything else
    /// falls back to the submission date.
    pub fn effective_date(&self) -> EventDate {
        match &self.data {
            RecordData::StockMovement(mv) => mv.event_date,
            RecordData::RoomBooking(stay) | RecordData::RoomReservation(stay) => stay.check_in,
            RecordData::InterruptedStay { interrupted_on, .. } => *interrupted_on,
            RecordData::RefundRecord { refund_date, .. } => *refund_date,
            RecordData::OperationalNote { note_date, .. } => *note_date,
            _ => self.created_at.date(),
        }
    }
}
