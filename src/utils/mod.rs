//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod bitmap;
mod error;
mod timer;

pub use bitmap::Bitmap;
pub use error::GuidStoreError;
pub use print::logger_init;
pub use timer::Timer;
