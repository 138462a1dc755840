pub mod daemon;
pub mod version;

pub use daemon::Daemon;
pub use version::Version;
