// Input limits, enforced before any unit is opened.

pub const MAX_EVENTS: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
/// Long enough for any RFC 5321 address.
pub const MAX_HOLDER_LEN: usize = 320;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
pub const MAX_HOLD_DURATION_MS: i64 = 24 * 3_600_000;
