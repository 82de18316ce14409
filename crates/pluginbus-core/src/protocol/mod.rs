//! Wire protocol shared by the broker and plugins.
//!
//! Every message is a length-prefixed JSON frame:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! The first frame on a connection is a [`Registration`]; every frame after it
//! is an [`Envelope`].

pub mod envelope;
pub mod frame;

pub use envelope::{Envelope, MessageKind, Registration};
pub use frame::{encode_message, read_frame, read_message, write_frame};
