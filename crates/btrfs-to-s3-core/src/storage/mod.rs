pub mod memory;
pub mod s3;

use std::io::Read;
use std::path::Path;

use crate::error::Result;

/// Storage classes whose objects need a `RestoreObject` round trip before
/// they can be read.
const ARCHIVAL_STORAGE_CLASSES: [&str; 3] = ["GLACIER", "DEEP_ARCHIVE", "GLACIER_IR"];

/// Options applied to object writes.
#[derive(Debug, Clone)]
pub struct PutOptions {
    pub storage_class: String,
    pub sse: String,
    pub content_type: Option<&'static str>,
}

/// Metadata from a HEAD request.
#[derive(Debug, Clone, Default)]
pub struct HeadInfo {
    pub size: u64,
    pub etag: Option<String>,
    pub storage_class: Option<String>,
    /// Raw `x-amz-restore` header, when present.
    pub restore: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompletedPartInfo {
    pub part_number: i32,
    pub etag: String,
}

/// Object-store surface the engine depends on.
///
/// All methods are synchronous and retried internally on transient failures;
/// callers see either success or an exhausted/permanent error.
pub trait ObjectStore: Send + Sync {
    /// Read a whole object. `None` when the key does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Open a streamed read of an object. A missing key is an error here:
    /// callers ask for objects a manifest told them exist.
    fn get_reader(&self, key: &str) -> Result<Box<dyn Read + Send>>;

    /// Single-request PUT of a fully-buffered body. Returns the ETag.
    fn put(&self, key: &str, body: &[u8], opts: &PutOptions) -> Result<Option<String>>;

    fn head(&self, key: &str) -> Result<Option<HeadInfo>>;

    fn create_multipart(&self, key: &str, opts: &PutOptions) -> Result<String>;

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: &[u8],
    ) -> Result<String>;

    /// Upload a part from a spool file without materializing it in memory.
    fn upload_part_file(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        path: &Path,
    ) -> Result<String>;

    fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartInfo],
    ) -> Result<Option<String>>;

    fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()>;

    /// Issue `RestoreObject` for an archival-class object.
    fn restore_object(&self, key: &str, tier: &str, days: i32) -> Result<()>;
}

/// Whether objects of this storage class must be restored before reads.
pub fn needs_restore(storage_class: Option<&str>) -> bool {
    match storage_class {
        Some(class) => ARCHIVAL_STORAGE_CLASSES
            .iter()
            .any(|c| class.eq_ignore_ascii_case(c)),
        None => false,
    }
}

/// Whether an `x-amz-restore` header reports a completed restoration.
pub fn is_restore_ready(restore_header: Option<&str>) -> bool {
    match restore_header {
        Some(header) => header.to_ascii_lowercase().contains("ongoing-request=\"false\""),
        None => false,
    }
}
