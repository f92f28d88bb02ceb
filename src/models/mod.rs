pub mod candidate;
pub mod event;
pub mod settings;

pub use candidate::*;
pub use event::*;
pub use settings::*;
