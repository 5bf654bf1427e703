//! Sensor read capability.

use std::future::Future;

use envlink_common::Reading;

use crate::error::SourceError;

/// Something that can take a reading from hardware.
///
/// The poller bounds every `read` with its own timeout, so an implementation
/// may block on the bus without guarding against hangs itself.
pub trait SampleSource: Send + 'static {
    /// Names of the sensors this source reports (goes into message metadata).
    fn sensors(&self) -> Vec<String>;

    /// Take one reading.
    fn read(&mut self) -> impl Future<Output = Result<Reading, SourceError>> + Send;
}
