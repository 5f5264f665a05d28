//! Protocol constants for the swank wire format

/// Width of the ASCII hex length header
pub const HEADER_LEN: usize = 6;

/// Largest payload the 24-bit length header can describe
pub const MAX_PAYLOAD: usize = 0xFF_FFFF;

/// Deepest list or quote nesting the reader accepts
pub const MAX_DEPTH: usize = 256;

/// Protocol version reported by `connection-info`
pub const PROTOCOL_VERSION: &str = "20100404";

/// Implementation name reported by `connection-info`
pub const IMPLEMENTATION_NAME: &str = "swankd";

/// Namespace a fresh session starts in
pub const DEFAULT_NAMESPACE: &str = "user";

/// Package prefix used by editor RPC calls once the namespace shim has run
pub const RPC_NAMESPACE: &str = "swank";
