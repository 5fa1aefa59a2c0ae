pub mod bytes;
pub(crate) mod lock;
pub(crate) mod panic;
