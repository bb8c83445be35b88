//! Shared types for Tether: turn records, drafts, activity entries and the
//! terminal wire protocol.

mod activity;
mod draft;
mod terminal;
mod turn;

pub use activity::*;
pub use draft::*;
pub use terminal::*;
pub use turn::*;
