pub mod dua;
pub mod mlr;

pub use dua::{DuaEntry, DuaRegisterOutcome, DuaRegistry};
pub use mlr::{MlrEntry, MlrExpiry, MlrRegistry};
