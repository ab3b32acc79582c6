//! Protocol constants shared by the device service and the uploader.

// ============================================================================
// Versions and ports
// ============================================================================

/// Protocol version reported in every invitation reply.
pub const PROTOCOL_VERSION: &str = "0.0.2";

/// Default TCP port of the OTA service.
pub const DEFAULT_PORT: u16 = 8266;

/// UDP port the discovery responder listens on.
pub const DISCOVERY_PORT: u16 = 8267;

/// UDP port discovery replies are sent to.
pub const DISCOVERY_RESPONSE_PORT: u16 = 8268;

/// Magic carried by discovery datagrams.
pub const DISCOVERY_MAGIC: &str = "NOTA_DISCOVERY";

pub const DISCOVERY_REQUEST: &str = "disc_req";
pub const DISCOVERY_RESPONSE: &str = "disc_res";

// ============================================================================
// Command codes (Uploader -> Device)
// ============================================================================

/// Firmware image for the application region.
pub const CMD_FLASH: u64 = 0;

/// Filesystem image.
pub const CMD_FILESYSTEM: u64 = 100;

/// Challenge response that proceeds to the upload.
pub const CMD_AUTH: u64 = 200;

/// Challenge response that only checks credentials.
pub const CMD_TEST: u64 = 201;

// ============================================================================
// Replies (Device -> Uploader)
// ============================================================================

pub const REPLY_OK: &str = "OK";
pub const REPLY_AUTH: &str = "AUTH";
pub const REPLY_ERR_HASH: &str = "ERR:HASH";
pub const REPLY_ERR_CMD: &str = "ERR:CMD";
pub const REPLY_ERR_SIZE: &str = "ERR:SIZE";
pub const REPLY_ERR_KEY: &str = "ERR:KEY";
pub const REPLY_ERR_AUTH: &str = "ERR:AUTH";

/// Prefix of free-text failure replies.
pub const REPLY_ERR_PREFIX: &str = "ERR: ";

/// Separator between metadata fields of an invitation reply.
pub const META_SEPARATOR: &str = "|/";

// ============================================================================
// Timing and sizes
// ============================================================================

/// Time allowed in AwaitingAuth / Receiving before the session resets.
pub const STATE_TIMEOUT_MS: u64 = 5000;

/// Idle polls (of `IDLE_WAIT_STEP_MS` each) tolerated while receiving.
pub const IDLE_WAIT_BUDGET: u32 = 1000;
pub const IDLE_WAIT_STEP_MS: u64 = 1;

/// Maximum characters consumed by one integer field.
pub const MAX_INT_FIELD: usize = 16;

/// Receive buffer used while streaming the image.
pub const RECEIVE_CHUNK: usize = 1460;

/// Chunk size used by the uploader.
pub const UPLOAD_CHUNK: usize = 2048;

/// Discovery replies larger than this are dropped.
pub const MAX_DISCOVERY_PACKET: usize = 512;

/// Minimum spacing of discovery replies.
pub const DISCOVERY_MIN_INTERVAL_MS: u64 = 1000;
