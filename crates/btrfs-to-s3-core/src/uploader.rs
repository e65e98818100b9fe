use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempPath;

use crate::error::{B2sError, Result};
use crate::storage::{CompletedPartInfo, ObjectStore, PutOptions};

const GIB: u64 = 1024 * 1024 * 1024;

/// S3 hard limit on a single multipart part.
pub const MAX_PART_SIZE: u64 = 5 * GIB;

/// S3 hard limit on parts per multipart upload.
pub const MAX_PARTS: u64 = 10_000;

/// Copy-buffer size for filling part buffers and spool files.
const COPY_BUF_SIZE: usize = 4 * 1024 * 1024;

/// On-disk buffering configuration for part payloads.
#[derive(Debug, Clone)]
pub struct SpoolSettings {
    pub dir: PathBuf,
    pub size_bytes: u64,
}

/// Streams bodies into the object store.
///
/// Small objects go through a single PUT from a fully-materialized buffer
/// (the buffer doubles as the retry replay source). Large bodies always go
/// through multipart: the producer reads the non-seekable body sequentially
/// into per-part buffers and a fixed worker pool uploads them in parallel.
/// Retries replay from the part buffer, never by seeking the body.
pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    part_size: u64,
    concurrency: usize,
    spool: Option<SpoolSettings>,
}

#[derive(Debug)]
pub struct LargeUpload {
    pub size: u64,
    pub etag: Option<String>,
}

enum PartPayload {
    Mem(Vec<u8>),
    /// Spool file; deleted when the payload drops (success, failure, abort).
    Spooled(TempPath, u64),
}

impl PartPayload {
    fn len(&self) -> u64 {
        match self {
            PartPayload::Mem(data) => data.len() as u64,
            PartPayload::Spooled(_, len) => *len,
        }
    }
}

struct PartJob {
    part_number: i32,
    payload: PartPayload,
}

impl Uploader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        part_size: u64,
        concurrency: usize,
        spool: Option<SpoolSettings>,
    ) -> Self {
        Self {
            store,
            part_size,
            concurrency: concurrency.max(1),
            spool,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Single-PUT upload of a small, fully-buffered object.
    pub fn put_small(&self, key: &str, body: &[u8], opts: &PutOptions) -> Result<Option<String>> {
        self.store
            .put(key, body, opts)
            .map_err(|e| upload_error(key, e))
    }

    /// Multipart upload of a body that may exceed the single-PUT limit.
    ///
    /// `size_hint` is the upper bound on the body length (the logical chunk
    /// size); it raises the part size when needed to stay within the
    /// 10,000-part ceiling. On failure the multipart upload is aborted and
    /// no partial object is left addressable.
    pub fn put_large(
        &self,
        key: &str,
        body: &mut dyn Read,
        opts: &PutOptions,
        size_hint: u64,
    ) -> Result<LargeUpload> {
        let mut part_size = effective_part_size(self.part_size, size_hint);
        let mut workers = self.concurrency;
        if let Some(spool) = &self.spool {
            part_size = part_size.min(spool.size_bytes);
            workers = workers.min((spool.size_bytes / part_size.max(1)).max(1) as usize);
            std::fs::create_dir_all(&spool.dir)?;
        }

        let upload_id = self
            .store
            .create_multipart(key, opts)
            .map_err(|e| upload_error(key, e))?;

        match self.run_pipeline(key, &upload_id, body, part_size, workers) {
            Ok((size, parts)) => match self.store.complete_multipart(key, &upload_id, &parts) {
                Ok(etag) => Ok(LargeUpload { size, etag }),
                Err(e) => {
                    self.abort_quietly(key, &upload_id);
                    Err(upload_error(key, e))
                }
            },
            Err(e) => {
                self.abort_quietly(key, &upload_id);
                Err(upload_error(key, e))
            }
        }
    }

    /// Producer + worker pool for one multipart upload.
    ///
    /// The work channel is a rendezvous channel: outstanding part buffers
    /// are bounded to the workers' in-flight parts plus the one being read,
    /// which is what gives the `concurrency x part_size` memory bound and
    /// the backpressure that stalls `btrfs send` when uploads fall behind.
    fn run_pipeline(
        &self,
        key: &str,
        upload_id: &str,
        body: &mut dyn Read,
        part_size: u64,
        workers: usize,
    ) -> Result<(u64, Vec<CompletedPartInfo>)> {
        std::thread::scope(|s| {
            let (work_tx, work_rx) = crossbeam_channel::bounded::<PartJob>(0);
            // Results are (part_number, etag) tuples, bounded in practice by
            // the 10,000-part ceiling.
            let (result_tx, result_rx) =
                crossbeam_channel::unbounded::<(i32, Result<String>)>();

            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                s.spawn(move || {
                    for job in work_rx {
                        let result = match &job.payload {
                            PartPayload::Mem(data) => {
                                self.store.upload_part(key, upload_id, job.part_number, data)
                            }
                            PartPayload::Spooled(path, _) => self
                                .store
                                .upload_part_file(key, upload_id, job.part_number, path),
                        };
                        let part_number = job.part_number;
                        drop(job); // releases the part buffer / spool file
                        if result_tx.send((part_number, result)).is_err() {
                            return;
                        }
                    }
                });
            }
            drop(work_rx);
            drop(result_tx);

            let mut copy_buf = vec![0u8; COPY_BUF_SIZE];
            let mut parts: Vec<CompletedPartInfo> = Vec::new();
            let mut first_err: Option<B2sError> = None;
            let mut total: u64 = 0;
            let mut produced: i32 = 0;

            loop {
                // Fold in any finished results so a failed part stops the
                // producer instead of reading the body to the end.
                while let Ok((part_number, result)) = result_rx.try_recv() {
                    match result {
                        Ok(etag) => parts.push(CompletedPartInfo { part_number, etag }),
                        Err(e) => {
                            first_err.get_or_insert(e);
                        }
                    }
                }
                if first_err.is_some() {
                    break;
                }

                let payload = match self.read_part(body, part_size, &mut copy_buf) {
                    Ok(Some(payload)) => payload,
                    Ok(None) => {
                        if produced > 0 {
                            break;
                        }
                        // Empty body: a single empty part keeps the object
                        // addressable after complete.
                        PartPayload::Mem(Vec::new())
                    }
                    Err(e) => {
                        first_err.get_or_insert(e);
                        break;
                    }
                };

                produced += 1;
                total += payload.len();
                let job = PartJob {
                    part_number: produced,
                    payload,
                };
                if work_tx.send(job).is_err() {
                    // All workers exited early; their error is in the queue.
                    break;
                }
            }

            drop(work_tx);
            for (part_number, result) in result_rx {
                match result {
                    Ok(etag) => parts.push(CompletedPartInfo { part_number, etag }),
                    Err(e) => {
                        first_err.get_or_insert(e);
                    }
                }
            }

            if let Some(e) = first_err {
                return Err(e);
            }

            parts.sort_by_key(|p| p.part_number);
            for (idx, part) in parts.iter().enumerate() {
                if part.part_number != idx as i32 + 1 {
                    return Err(B2sError::Upload(format!(
                        "{key}: part {} missing from results",
                        idx + 1
                    )));
                }
            }
            Ok((total, parts))
        })
    }

    /// Read the next part from the body, or `None` at EOF.
    fn read_part(
        &self,
        body: &mut dyn Read,
        part_size: u64,
        copy_buf: &mut [u8],
    ) -> Result<Option<PartPayload>> {
        match &self.spool {
            None => {
                let mut data = Vec::with_capacity(part_size.min(64 * 1024 * 1024) as usize);
                let mut remaining = part_size;
                while remaining > 0 {
                    let want = copy_buf.len().min(remaining as usize);
                    let n = match body.read(&mut copy_buf[..want]) {
                        Ok(n) => n,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    };
                    if n == 0 {
                        break;
                    }
                    data.extend_from_slice(&copy_buf[..n]);
                    remaining -= n as u64;
                }
                if data.is_empty() {
                    return Ok(None);
                }
                Ok(Some(PartPayload::Mem(data)))
            }
            Some(spool) => {
                let mut file = tempfile::NamedTempFile::new_in(&spool.dir)?;
                let mut written: u64 = 0;
                let mut remaining = part_size;
                while remaining > 0 {
                    let want = copy_buf.len().min(remaining as usize);
                    let n = match body.read(&mut copy_buf[..want]) {
                        Ok(n) => n,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    };
                    if n == 0 {
                        break;
                    }
                    std::io::Write::write_all(&mut file, &copy_buf[..n])?;
                    written += n as u64;
                    remaining -= n as u64;
                }
                if written == 0 {
                    return Ok(None);
                }
                std::io::Write::flush(&mut file)?;
                Ok(Some(PartPayload::Spooled(file.into_temp_path(), written)))
            }
        }
    }

    /// Abort without masking the error that got us here.
    fn abort_quietly(&self, key: &str, upload_id: &str) {
        if let Err(abort_err) = self.store.abort_multipart(key, upload_id) {
            tracing::warn!(key, error = %abort_err, "failed to abort multipart upload");
        }
    }
}

/// Part size honoring the 5 GiB part limit and the 10,000-part ceiling for a
/// body of at most `size_hint` bytes.
pub fn effective_part_size(configured: u64, size_hint: u64) -> u64 {
    let part = configured.min(MAX_PART_SIZE).max(1);
    let floor = size_hint.div_ceil(MAX_PARTS);
    part.max(floor).min(MAX_PART_SIZE)
}

fn upload_error(key: &str, e: B2sError) -> B2sError {
    match e {
        B2sError::Storage(msg) => B2sError::Upload(format!("{key}: {msg}")),
        other => other,
    }
}
