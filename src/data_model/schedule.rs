use chrono::{DateTime, Datelike, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

/// One slot per 15 minutes across a 7 day week.
pub const SCHEDULE_SLOTS: usize = 7 * 24 * 4;

/// Weekly availability mask.
///
/// Slot `dayOfWeek * 96 + hour * 4 + quarterHour` (Sunday = day 0) is in
/// schedule when its character is `'1'`. Any mask that is not exactly
/// [`SCHEDULE_SLOTS`] characters long is never in schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schedule(String);

impl Default for Schedule {
    fn default() -> Self {
        Self::always()
    }
}

impl Schedule {
    pub fn new(mask: impl Into<String>) -> Self {
        Self(mask.into())
    }

    pub fn always() -> Self {
        Self("1".repeat(SCHEDULE_SLOTS))
    }

    pub fn never() -> Self {
        Self("0".repeat(SCHEDULE_SLOTS))
    }

    /// Builds a mask that is active for `[start_hour, end_hour)` on every day.
    pub fn daily_window(start_hour: u32, end_hour: u32) -> Self {
        let mask = (0..SCHEDULE_SLOTS)
            .map(|slot| {
                let hour = (slot % 96) as u32 / 4;
                if hour >= start_hour && hour < end_hour {
                    '1'
                } else {
                    '0'
                }
            })
            .collect::<String>();
        Self(mask)
    }

    pub fn get(&self) -> &str {
        &self.0
    }

    pub fn is_well_formed(&self) -> bool {
        self.0.chars().count() == SCHEDULE_SLOTS
    }

    pub fn slot_index(days_from_sunday: u32, hour: u32, minute: u32) -> usize {
        (days_from_sunday * 96 + hour * 4 + minute / 15) as usize
    }

    pub fn is_slot_active(&self, slot: usize) -> bool {
        if !self.is_well_formed() {
            return false;
        }
        self.0.chars().nth(slot) == Some('1')
    }

    pub fn is_in_schedule<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        let slot = Self::slot_index(
            at.weekday().num_days_from_sunday(),
            at.hour(),
            at.minute(),
        );
        self.is_slot_active(slot)
    }
}
