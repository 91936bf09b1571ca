pub mod controller;
pub mod error;
pub mod event;
pub mod fragment;
pub mod host;
pub mod manifest;
pub mod metric;
pub mod request;
pub mod session;
pub mod settings;
pub mod storage;
pub mod stream;
pub mod throttle;

#[cfg(test)]
mod test_util;

pub use controller::{SessionContext, StreamController};
pub use error::{DashlingError, DashlingResult};
pub use event::{ErrorType, SessionEvent, SessionState};
pub use manifest::{Manifest, StreamType};
pub use session::{Dashling, SessionSummary};
pub use settings::{PerStream, Settings};
