use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use super::{CompletedPartInfo, HeadInfo, ObjectStore, PutOptions};
use crate::error::{B2sError, Result};

/// An object held by [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub storage_class: String,
    pub sse: String,
    pub restore: Option<String>,
    pub etag: String,
}

#[derive(Debug, Default)]
struct MultipartState {
    key: String,
    opts_storage_class: String,
    opts_sse: String,
    parts: BTreeMap<i32, Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    multiparts: HashMap<String, MultipartState>,
    next_upload_id: u64,
    ops: Vec<String>,
    /// part_number -> remaining injected failures
    fail_parts: HashMap<i32, u32>,
    /// keys whose single-PUT should fail
    fail_put_keys: Vec<String>,
}

/// In-memory object store for tests: thread-safe, with an operation log and
/// simple failure injection.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<String> {
        self.inner.lock().unwrap().ops.clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().unwrap().objects.keys().cloned().collect()
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.inner.lock().unwrap().objects.get(key).cloned()
    }

    pub fn insert_object(&self, key: &str, data: Vec<u8>, storage_class: &str) {
        let mut inner = self.inner.lock().unwrap();
        let etag = etag_of(&data);
        inner.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                storage_class: storage_class.to_string(),
                sse: "AES256".into(),
                restore: None,
                etag,
            },
        );
    }

    pub fn set_restore_header(&self, key: &str, value: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(obj) = inner.objects.get_mut(key) {
            obj.restore = value.map(str::to_string);
        }
    }

    /// Make the next `times` uploads of `part_number` fail.
    pub fn fail_part(&self, part_number: i32, times: u32) {
        self.inner
            .lock()
            .unwrap()
            .fail_parts
            .insert(part_number, times);
    }

    pub fn fail_put(&self, key: &str) {
        self.inner.lock().unwrap().fail_put_keys.push(key.to_string());
    }

    /// Number of multipart uploads started but neither completed nor aborted.
    pub fn open_multiparts(&self) -> usize {
        self.inner.lock().unwrap().multiparts.len()
    }

    fn log(inner: &mut Inner, op: String) {
        inner.ops.push(op);
    }
}

fn etag_of(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(&Sha256::digest(data)[..8]))
}

impl ObjectStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().unwrap();
        Self::log(&mut inner, format!("GET {key}"));
        Ok(inner.objects.get(key).map(|o| o.data.clone()))
    }

    fn get_reader(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let mut inner = self.inner.lock().unwrap();
        Self::log(&mut inner, format!("GET {key}"));
        match inner.objects.get(key) {
            Some(obj) => Ok(Box::new(Cursor::new(obj.data.clone()))),
            None => Err(B2sError::Storage(format!("missing object {key}"))),
        }
    }

    fn put(&self, key: &str, body: &[u8], opts: &PutOptions) -> Result<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        Self::log(&mut inner, format!("PUT {key}"));
        if inner.fail_put_keys.iter().any(|k| k == key) {
            return Err(B2sError::Storage(format!("PUT {key}: injected failure")));
        }
        let etag = etag_of(body);
        inner.objects.insert(
            key.to_string(),
            StoredObject {
                data: body.to_vec(),
                storage_class: opts.storage_class.clone(),
                sse: opts.sse.clone(),
                restore: None,
                etag: etag.clone(),
            },
        );
        Ok(Some(etag))
    }

    fn head(&self, key: &str) -> Result<Option<HeadInfo>> {
        let mut inner = self.inner.lock().unwrap();
        Self::log(&mut inner, format!("HEAD {key}"));
        Ok(inner.objects.get(key).map(|o| HeadInfo {
            size: o.data.len() as u64,
            etag: Some(o.etag.clone()),
            storage_class: Some(o.storage_class.clone()),
            restore: o.restore.clone(),
        }))
    }

    fn create_multipart(&self, key: &str, opts: &PutOptions) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_upload_id += 1;
        let upload_id = format!("upload-{}", inner.next_upload_id);
        Self::log(&mut inner, format!("CREATE_MULTIPART {key}"));
        inner.multiparts.insert(
            upload_id.clone(),
            MultipartState {
                key: key.to_string(),
                opts_storage_class: opts.storage_class.clone(),
                opts_sse: opts.sse.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: &[u8],
    ) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        Self::log(&mut inner, format!("UPLOAD_PART {key}#{part_number}"));
        if let Some(remaining) = inner.fail_parts.get_mut(&part_number) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(B2sError::Storage(format!(
                    "UPLOAD_PART {key}#{part_number}: injected failure"
                )));
            }
        }
        let state = inner
            .multiparts
            .get_mut(upload_id)
            .ok_or_else(|| B2sError::Storage(format!("unknown upload id {upload_id}")))?;
        if state.key != key {
            return Err(B2sError::Storage(format!(
                "upload id {upload_id} belongs to {}, not {key}",
                state.key
            )));
        }
        state.parts.insert(part_number, body.to_vec());
        Ok(format!("\"part-{part_number}\""))
    }

    fn upload_part_file(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        path: &Path,
    ) -> Result<String> {
        let body = std::fs::read(path)?;
        self.upload_part(key, upload_id, part_number, &body)
    }

    fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartInfo],
    ) -> Result<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        Self::log(&mut inner, format!("COMPLETE_MULTIPART {key}"));
        let state = inner
            .multiparts
            .remove(upload_id)
            .ok_or_else(|| B2sError::Storage(format!("unknown upload id {upload_id}")))?;
        let mut expected = 1;
        for part in parts {
            if part.part_number != expected {
                return Err(B2sError::Storage(format!(
                    "COMPLETE_MULTIPART {key}: part {} out of order (expected {expected})",
                    part.part_number
                )));
            }
            if !state.parts.contains_key(&part.part_number) {
                return Err(B2sError::Storage(format!(
                    "COMPLETE_MULTIPART {key}: part {} was never uploaded",
                    part.part_number
                )));
            }
            expected += 1;
        }
        let mut data = Vec::new();
        for body in state.parts.values() {
            data.extend_from_slice(body);
        }
        let etag = format!("\"mp-{}\"", hex::encode(&Sha256::digest(&data)[..8]));
        inner.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                storage_class: state.opts_storage_class,
                sse: state.opts_sse,
                restore: None,
                etag: etag.clone(),
            },
        );
        Ok(Some(etag))
    }

    fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::log(&mut inner, format!("ABORT_MULTIPART {key}"));
        inner.multiparts.remove(upload_id);
        Ok(())
    }

    fn restore_object(&self, key: &str, tier: &str, _days: i32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::log(&mut inner, format!("RESTORE {key} tier={tier}"));
        match inner.objects.get_mut(key) {
            Some(obj) => {
                if obj.restore.is_none() {
                    obj.restore = Some("ongoing-request=\"true\"".into());
                }
                Ok(())
            }
            None => Err(B2sError::Storage(format!("missing object {key}"))),
        }
    }
}
