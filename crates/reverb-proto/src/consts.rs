//! Protocol constants shared by the server and the agent wire behavior.
//!
//! All multi-string payloads are joined with [`CONN_DATA_SEQ`]; all length
//! fields on the control path are little-endian `i32`.

/// Core protocol version. The handshake aborts unless the agent reports
/// exactly this string; the display version is free-form.
pub const CORE_VERSION: &str = "0.9.0";

/// Delimiter joining multiple strings inside one length-prefixed payload.
pub const CONN_DATA_SEQ: &str = "*#*";

/// 3-byte connection probe sent by agents before the handshake proper. The
/// port multiplexer also keys on these bytes to route a connection to the
/// bridge listener.
pub const CONN_TEST: &[u8; 3] = b"TST";

/// Upper bound for any single length-prefixed payload on the control path.
pub const MAX_CONTENT_LEN: usize = 32 << 10;

// 4-byte work-type tokens, sent by the agent right after verification.
pub const WORK_MAIN: [u8; 4] = *b"MAIN";
pub const WORK_CHAN: [u8; 4] = *b"CHAN";
pub const WORK_CONFIG: [u8; 4] = *b"CONF";
pub const WORK_REGISTER: [u8; 4] = *b"RGST";
pub const WORK_SECRET: [u8; 4] = *b"SECR";
pub const WORK_FILE: [u8; 4] = *b"FILE";
pub const WORK_P2P: [u8; 4] = *b"P2P ";

// Config-channel sub-flags.
pub const WORK_STATUS: [u8; 4] = *b"STAT";
pub const NEW_CONF: [u8; 4] = *b"NCON";
pub const NEW_HOST: [u8; 4] = *b"NHST";
pub const NEW_TASK: [u8; 4] = *b"NTSK";

// Replies.
pub const VERIFY_SUCCESS: [u8; 4] = *b"VERY";
pub const VERIFY_ERROR: [u8; 4] = *b"VERN";
pub const RES_CLOSE: [u8; 4] = *b"CLSE";
pub const NEW_UDP_CONN: [u8; 4] = *b"UDPC";

// Link connection types carried in the descriptor.
pub const CONN_TCP: &str = "tcp";
pub const CONN_UDP: &str = "udp";
pub const CONN_HTTP: &str = "http";
pub const CONN_UDP5: &str = "udp5";

// Roles in the P2P rendezvous packet: `password *#* role`.
pub const P2P_VISITOR: &str = "visitor";
pub const P2P_PROVIDER: &str = "provider";
