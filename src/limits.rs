//! Hard limits on request shapes. Anything past these is rejected before the
//! store is touched.

/// Longest recurring booking, in weeks.
pub const MAX_WEEKS: u32 = 52;

/// Racks are numbered `1..=MAX_RACK_NUMBER` on each side.
pub const MAX_RACK_NUMBER: u16 = 64;

/// Longest single session.
pub const MAX_SESSION_HOURS: i64 = 12;

/// Largest athlete count on one occurrence.
pub const MAX_CAPACITY: u32 = 500;

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_AREA_TAGS: usize = 16;
pub const MAX_AREA_TAG_LEN: usize = 64;
pub const MAX_OVERRIDE_REASON_LEN: usize = 1_000;

/// Max instances touched by one edit request.
pub const MAX_EDITS_PER_REQUEST: usize = 64;

/// Max period types and blocks in one capacity schedule.
pub const MAX_PERIOD_TYPES: usize = 32;
pub const MAX_SCHEDULE_BLOCKS: usize = 2_048;

/// Max bytes in one wire request line.
pub const MAX_LINE_LEN: usize = 256 * 1024;
