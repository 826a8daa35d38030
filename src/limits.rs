//! Hard limits on input sizes and store growth.

use std::time::Duration;

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_RESTRICTIONS_PER_ROOM: usize = 100_000;

/// Longest bookable stay.
pub const MAX_STAY_NIGHTS: i64 = 365;

/// Widest window a search or block may cover.
pub const MAX_QUERY_NIGHTS: i64 = 3 * 365;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_PHONE_LEN: usize = 64;
pub const MAX_PASSWORD_LEN: usize = 128;

/// Longest accepted request line on the wire.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Any WAL frame longer than this is treated as corruption.
pub const MAX_WAL_FRAME_LEN: usize = 1 << 20;

/// Default bound on a single store operation.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(3);
