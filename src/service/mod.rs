//! Service layer
//!
//! Contains business logic separated from HTTP handlers.
//! Services write local state first and hand federation work to the
//! outbound publisher.

mod account;
mod note;
mod social;

pub use account::AccountService;
pub use note::{NoteService, note_object};
pub use social::{SocialService, parse_handle};
