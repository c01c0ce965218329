mod event;
mod task;
mod template;

pub use event::*;
pub use task::*;
pub use template::*;
