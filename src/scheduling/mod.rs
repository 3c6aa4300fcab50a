//! Scheduling service — computes bookable arrival windows.
//!
//! Slots are carved from the tenant's business hours in the tenant's local
//! timezone, then reduced by what is already booked: any window overlapping
//! a confirmed booking is dropped, and a day at its configured capacity
//! offers nothing at all.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Utc};

use crate::config::TenantSettings;
use crate::error::DatabaseError;
use crate::store::Database;

/// Length of a bookable arrival window.
const SLOT_HOURS: i64 = 2;

/// A bookable appointment window (UTC instants).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Compute open slots for `[range_start, range_end]` (inclusive dates,
/// tenant-local).
pub async fn available_slots(
    store: &dyn Database,
    settings: &TenantSettings,
    tenant_id: &str,
    range_start: NaiveDate,
    range_end: NaiveDate,
) -> Result<Vec<Slot>, DatabaseError> {
    let offset = tenant_offset(settings);
    let mut slots = Vec::new();

    let mut date = range_start;
    while date <= range_end {
        if let Some(hours) = settings.business_hours.for_weekday(date.weekday()) {
            let day_open = local_instant(date, hours.open, offset);
            let day_close = local_instant(date, hours.close, offset);

            let booked = store
                .confirmed_bookings_in_range(tenant_id, day_open, day_close)
                .await?;

            if (booked.len() as u32) < settings.daily_capacity {
                let mut cursor = day_open;
                while cursor + Duration::hours(SLOT_HOURS) <= day_close {
                    let candidate = Slot {
                        start: cursor,
                        end: cursor + Duration::hours(SLOT_HOURS),
                    };
                    let taken = booked
                        .iter()
                        .any(|b| b.window_start < candidate.end && b.window_end > candidate.start);
                    if !taken {
                        slots.push(candidate);
                    }
                    cursor += Duration::hours(SLOT_HOURS);
                }
            }
        }

        date = match date.succ_opt() {
            Some(d) => d,
            None => break,
        };
    }

    Ok(slots)
}

fn tenant_offset(settings: &TenantSettings) -> FixedOffset {
    FixedOffset::east_opt(settings.default_tz_offset_minutes * 60)
        .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"))
}

fn local_instant(date: NaiveDate, time: chrono::NaiveTime, offset: FixedOffset) -> DateTime<Utc> {
    match offset.from_local_datetime(&date.and_time(time)) {
        chrono::offset::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        // Fixed offsets never produce ambiguous local times.
        _ => Utc.from_utc_datetime(&date.and_time(time)),
    }
}
