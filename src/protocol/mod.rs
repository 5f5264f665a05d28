pub mod constants;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod sexp;

pub use constants::*;
pub use error::{AuthenticationFailure, EncodingError, FramingError, SendError};
pub use frame::{read_frame, write_frame, FrameWriter};
pub use message::{ClientEvent, DebugKind, ReturnStatus, ServerEvent, ThreadSpec};
pub use sexp::Sexp;
