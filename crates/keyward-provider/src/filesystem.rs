//! Provider contract for creating a filesystem on a cleartext mapping.

use std::error::Error;

pub trait FilesystemMaker {
    type Error: Error + Send + Sync + 'static;

    /// Create a `fstype` filesystem on `device`, discarding previous contents.
    fn make_filesystem(
        &self,
        device: &str,
        fstype: &str,
        label: Option<&str>,
    ) -> Result<(), Self::Error>;
}
