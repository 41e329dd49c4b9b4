pub mod daemon;
pub mod history;
pub mod status;
pub mod sync;
