/*!
 * System Limits and Constants
 *
 * Centralized location for descriptor-space limits and wire sizes.
 */

// =============================================================================
// DESCRIPTOR TABLE
// =============================================================================

/// Default handle table capacity
/// Matches the bridge provider's own descriptor ceiling
pub const MAX_OPEN_FDS: usize = 4096;

/// Hard upper bound for a configured table capacity
pub const MAX_OPEN_FDS_LIMIT: usize = 65536;

/// Compact table for constrained sandboxes
pub const COMPACT_OPEN_FDS: usize = 256;

/// Tiny table for tests that exercise exhaustion
pub const TESTING_OPEN_FDS: usize = 16;

// =============================================================================
// MULTIPLEXING
// =============================================================================

/// Bits in one descriptor set
/// [LINUX-COMPAT] glibc and musl both fix this at 1024
pub const FD_SETSIZE: usize = 1024;

// =============================================================================
// WIRE FORMATS
// =============================================================================

/// Address bytes carried by the bridge sockaddr after family and port
pub const SOCKADDR_PAYLOAD_LEN: usize = 124;

/// IPv4 address length
pub const IPV4_ADDR_LEN: usize = 4;

/// IPv6 address length
pub const IPV6_ADDR_LEN: usize = 16;

// =============================================================================
// OBSERVABILITY
// =============================================================================

/// Bridged calls slower than this are logged at warn level (milliseconds)
pub const DEFAULT_SLOW_CALL_MS: u64 = 10;
