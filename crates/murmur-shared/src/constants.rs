/// Application name
pub const APP_NAME: &str = "Murmur";

/// Wire protocol version advertised by `/info`
pub const PROTOCOL_VERSION: &str = "/murmur/chat/1";

/// Maximum accepted upload size in bytes (50 MiB)
pub const MAX_UPLOAD_SIZE: usize = 50 * 1024 * 1024;

/// Maximum accepted socket frame in bytes. Uploads travel inside frames as
/// encoded text, so this sits well above `MAX_UPLOAD_SIZE`.
pub const MAX_FRAME_SIZE: usize = 96 * 1024 * 1024;

/// Stored uploads are renamed to this stem; only the extension survives.
pub const UPLOAD_STEM: &str = "file";

/// Longest file extension accepted on an upload
pub const MAX_EXTENSION_LEN: usize = 16;

/// Path prefix under which stored uploads are referenced and served
pub const UPLOAD_URL_PREFIX: &str = "uploads";

/// Close code for an orderly close initiated by either side
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code recorded when the socket failed; never sent in a frame
pub const CLOSE_TRANSPORT: u16 = 1006;

/// Close code sent when a client frame cannot be decoded
pub const CLOSE_ABNORMAL: u16 = 1011;

/// Close code sent on orderly server shutdown
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Close code sent when the broker loses a room's membership
pub const CLOSE_ROOM_LOST: u16 = 4000;

/// Close code sent when a connection sat idle past the configured timeout
pub const CLOSE_IDLE_TIMEOUT: u16 = 4008;
