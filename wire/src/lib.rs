//! Tag-length-value message framing for the hbackup data protocol.
//!
//! A message (one *session*) is a tag-0 START frame, any number of data
//! frames with application-defined tags 1..=255, and a tag-0 END frame.
//! Tag 0 additionally carries CHECK liveness frames, which receivers may
//! use to abort a long-running transfer.

mod frame;
mod manager;

pub use frame::{Frame, Receiver, Sender, CHECK_CODE, END_CODE, MAX_VALUE_LEN, START_CODE};
pub use manager::{ReceptionManager, TransmissionManager};
