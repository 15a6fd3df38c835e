//! Browser session plumbing: launch, the page driver seam, and the
//! tear-up/process/tear-down state machine.

pub mod browser;
pub mod driver;
pub mod lifecycle;

pub use browser::{launch_session, remove_user_data_dir};
pub use driver::{CdpDriver, FrameNode, PageDriver};
pub use lifecycle::{PageSetupConfig, SessionController, SessionTuning};
