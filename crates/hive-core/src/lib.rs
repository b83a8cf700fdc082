#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared configuration types for `imagehive` (dispatch settings, worker and
//! federation entries, settings-file persistence).

pub mod settings;
