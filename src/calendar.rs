//! Per-room, per-day occupancy for one month, rebuilt from date ranges.

use std::collections::BTreeMap;

use chrono::{Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::model::*;
use crate::store::{Store, StoreError};

/// Day of month → id, zero where nothing applies.
pub type DayMap = BTreeMap<u32, u64>;

/// Today in UTC, the month an unparameterised calendar shows.
pub fn today() -> Day {
    Utc::now().date_naive()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|_| Self { year, month })
    }

    pub fn containing(day: Day) -> Self {
        Self {
            year: day.year(),
            month: day.month(),
        }
    }

    pub fn first_day(self) -> Option<Day> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }

    pub fn last_day(self) -> Option<Day> {
        let first = self.first_day()?;
        first.checked_add_months(Months::new(1))?.pred_opt()
    }

    pub fn days_in_month(self) -> u32 {
        self.last_day().map(|d| d.day()).unwrap_or(0)
    }

    pub fn prev(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn next(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomCalendar {
    pub room: Room,
    pub reservation_map: DayMap,
    pub block_map: DayMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthCalendar {
    pub this: YearMonth,
    pub prev: YearMonth,
    pub next: YearMonth,
    pub days_in_month: u32,
    pub rooms: Vec<RoomCalendar>,
}

/// Fill the two day maps for one room.
///
/// Reservations mark every day of `[start, end]` inclusive, clipped to the
/// month. Blocks mark only their start day.
pub fn aggregate(month: YearMonth, restrictions: &[Restriction]) -> (DayMap, DayMap) {
    let days = month.days_in_month();
    let mut reservation_map: DayMap = (1..=days).map(|d| (d, 0)).collect();
    let mut block_map = reservation_map.clone();
    let (Some(first), Some(last)) = (month.first_day(), month.last_day()) else {
        return (reservation_map, block_map);
    };

    for r in restrictions {
        match r.kind {
            RestrictionKind::Reservation(id) => {
                let from = r.stay.start.max(first);
                let to = r.stay.end.min(last);
                for day in from.iter_days().take_while(|d| *d <= to) {
                    reservation_map.insert(day.day(), id);
                }
            }
            RestrictionKind::Block => {
                if (first..=last).contains(&r.stay.start) {
                    block_map.insert(r.stay.start.day(), r.id);
                }
            }
        }
    }
    (reservation_map, block_map)
}

/// Calendar for every room; `month` defaults to the current one.
pub async fn build(store: &Store, month: Option<YearMonth>) -> Result<MonthCalendar, StoreError> {
    let month = month.unwrap_or_else(|| YearMonth::containing(today()));
    let (Some(first), Some(last)) = (month.first_day(), month.last_day()) else {
        return Err(StoreError::InvalidRange("month out of range"));
    };

    let mut rooms = Vec::new();
    for room in store.all_rooms().await? {
        let restrictions = store.restrictions_for_room(room.id, first, last).await?;
        let (reservation_map, block_map) = aggregate(month, &restrictions);
        rooms.push(RoomCalendar {
            room,
            reservation_map,
            block_map,
        });
    }

    Ok(MonthCalendar {
        this: month,
        prev: month.prev(),
        next: month.next(),
        days_in_month: month.days_in_month(),
        rooms,
    })
}
