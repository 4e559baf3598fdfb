pub mod admin;
pub mod serve;
pub mod subscriber;
pub mod utils;

pub use utils::{CommandContext, init_logging};
