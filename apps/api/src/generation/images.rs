//! Storage for rendered candidate images.
//!
//! Candidates carry only an opaque reference; the bytes live here. Upscale and
//! variation jobs read the selected candidate back to send it as a reference.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredImage {
    pub bytes: Bytes,
    pub mime_type: String,
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Stores an image and returns its reference.
    async fn put(&self, image: StoredImage) -> Result<String>;

    async fn get(&self, reference: &str) -> Result<StoredImage>;

    /// Removes an image. Deleting a missing reference is not an error.
    async fn delete(&self, reference: &str) -> Result<()>;
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    }
}

fn new_key(mime_type: &str) -> String {
    format!("generations/{}.{}", Uuid::new_v4(), extension_for(mime_type))
}

#[derive(Default)]
pub struct MemoryImageStore {
    images: RwLock<HashMap<String, StoredImage>>,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.images.read().len()
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn put(&self, image: StoredImage) -> Result<String> {
        let key = new_key(&image.mime_type);
        self.images.write().insert(key.clone(), image);
        Ok(key)
    }

    async fn get(&self, reference: &str) -> Result<StoredImage> {
        self.images
            .read()
            .get(reference)
            .cloned()
            .ok_or_else(|| anyhow!("image {reference} not found"))
    }

    async fn delete(&self, reference: &str) -> Result<()> {
        self.images.write().remove(reference);
        Ok(())
    }
}

/// S3 / MinIO-backed image store.
#[derive(Clone)]
pub struct S3ImageStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ImageStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl ImageStore for S3ImageStore {
    async fn put(&self, image: StoredImage) -> Result<String> {
        let key = new_key(&image.mime_type);
        let size = image.bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(&image.mime_type)
            .body(ByteStream::from(image.bytes))
            .send()
            .await
            .with_context(|| format!("S3 put_object failed for {key}"))?;

        debug!("Stored candidate image {key} ({size} bytes)");
        Ok(key)
    }

    async fn get(&self, reference: &str) -> Result<StoredImage> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(reference)
            .send()
            .await
            .with_context(|| format!("S3 get_object failed for {reference}"))?;

        let mime_type = object
            .content_type()
            .unwrap_or("image/png")
            .to_string();
        let bytes = object
            .body
            .collect()
            .await
            .with_context(|| format!("reading S3 object {reference}"))?
            .into_bytes();

        Ok(StoredImage { bytes, mime_type })
    }

    async fn delete(&self, reference: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(reference)
            .send()
            .await
            .with_context(|| format!("S3 delete_object failed for {reference}"))?;
        debug!("Deleted candidate image {reference}");
        Ok(())
    }
}
