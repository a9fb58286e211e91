pub mod daemon;
pub mod identity;
pub mod logging;
pub mod storage;
pub mod sync;
