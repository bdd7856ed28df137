pub mod reading;
pub mod watch;

pub use reading::Reading;
pub use watch::WatchRecord;
