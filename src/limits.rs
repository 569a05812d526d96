//! Hard caps protecting a tenant's in-memory state and the WAL from
//! unbounded or nonsensical input. All checked before any write.

use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_CANDIDATES_PER_TENANT: usize = 100_000;
pub const MAX_LINKS_PER_TENANT: usize = 100_000;
pub const MAX_INTERVIEWS_PER_DAY: usize = 512;

pub const MAX_NAME_LEN: usize = 128;
pub const MAX_NOTES_LEN: usize = 2048;
pub const MAX_METADATA_LEN: usize = 256;

/// Booking-link uses per link. Links are single-use by default; a small
/// multi-use allowance covers shared trial links.
pub const MAX_LINK_USES: u32 = 32;

/// Base64url secret length: 32 random bytes, unpadded.
pub const TOKEN_LEN: usize = 43;

/// 2000-01-01T00:00:00Z — anything earlier is a caller bug.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
