//! [`Storage`] over an S3-compatible object store (minio in development).
//!
//! Paths are URLs of the form `s3://bucket/some/key`. Object stores have no
//! directories; a directory is a key prefix ending in `/`. Input paths may end
//! in a glob (`s3://bucket/input/*.log`).

use anyhow::{anyhow, Error, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use bytes::Bytes;
use globset::Glob;
use tracing::{debug, error, info};
use url::Url;

use crate::storage::{CreateOptions, Entry, Storage};

/// Objects larger than this are uploaded in parts.
const CHUNK_SIZE: usize = 1024 * 1024 * 5;

const GLOB_CHARS: &[char] = &['*', '?', '[', '{'];

#[derive(Debug, PartialEq, Eq)]
pub struct BucketKey {
    pub bucket: String,
    pub key: String,
}

/// Retrieves a bucket and key for a given path, the path should contain the s3 protocol.
pub fn path_to_bucket_key(path: &str) -> Result<BucketKey, Error> {
    let s3_url = Url::parse(path).map_err(|e| anyhow!("Could not parse path `{path}`: {}", e))?;

    if s3_url.scheme() != "s3" {
        return Err(anyhow!("protocol of path `{path}` is not S3"));
    }

    let bucket = s3_url
        .host_str()
        .ok_or(anyhow!("path `{path}` names no bucket"))?;

    // we slice out the first `/` character
    let key = s3_url.path().trim_start_matches('/');

    Ok(BucketKey {
        bucket: bucket.to_string(),
        key: key.to_string(),
    })
}

/// Splits a key into the literal prefix to list and an optional glob to filter with.
fn split_glob(key: &str) -> (&str, Option<&str>) {
    match key.find(GLOB_CHARS) {
        None => (key, None),
        Some(pos) => {
            let prefix_end = key[..pos].rfind('/').map(|i| i + 1).unwrap_or(0);
            (&key[..prefix_end], Some(key))
        }
    }
}

fn dir_key(key: &str) -> String {
    if key.is_empty() || key.ends_with('/') {
        key.to_string()
    } else {
        format!("{key}/")
    }
}

#[derive(Clone)]
pub struct ClientConfig {
    /// id
    pub access_key_id: String,

    /// password
    pub secret_access_key: String,

    /// object store region
    pub region: String,

    /// minio url
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct Client {
    pub client: s3::Client,
}

impl Client {
    pub fn from_conf(cfg: ClientConfig) -> Self {
        let cred = s3::config::Credentials::new(
            cfg.access_key_id,
            cfg.secret_access_key,
            None,
            None,
            "mrl",
        );
        let region = s3::config::Region::new(cfg.region);
        let conf = s3::config::Builder::new()
            .credentials_provider(cred)
            .region(region)
            .endpoint_url(cfg.url)
            .force_path_style(true)
            .behavior_version_latest()
            .build();

        Self {
            client: s3::Client::from_conf(conf),
        }
    }

    async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool, Error> {
        let object_request = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await;

        match object_request {
            Ok(_) => Ok(true),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_not_found() || err.code() == Some("NotFound") {
                    return Ok(false);
                }
                Err(anyhow!("head `{bucket}/{key}` failed: {err}"))
            }
        }
    }

    /// Every key under `prefix`, recursively.
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<(String, u64)>, Error> {
        let mut response = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut objects = vec![];
        while let Some(result) = response.next().await {
            let output = result.map_err(|err| {
                error!("listing `{bucket}/{prefix}` failed: {err:?}");
                anyhow!("listing `{bucket}/{prefix}` failed: {err}")
            })?;
            for object in output.contents() {
                if let Some(key) = object.key() {
                    objects.push((key.to_string(), object.size().unwrap_or(0).max(0) as u64));
                }
            }
        }

        Ok(objects)
    }

    async fn upload(&self, bucket: &str, key: &str, data: Bytes) -> Result<(), Error> {
        if data.len() <= CHUNK_SIZE {
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(data))
                .send()
                .await?;
            return Ok(());
        }

        let multipart_upload = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await?;
        let upload_id = multipart_upload
            .upload_id()
            .ok_or_else(|| anyhow!("no upload id for `{bucket}/{key}`"))?
            .to_string();

        let mut upload_parts = Vec::new();
        for (chunk_index, start) in (0..data.len()).step_by(CHUNK_SIZE).enumerate() {
            let end = (start + CHUNK_SIZE).min(data.len());

            // Chunk index needs to start at 0, but part numbers start at 1.
            let part_number = (chunk_index as i32) + 1;
            let upload_part_res = self
                .client
                .upload_part()
                .key(key)
                .bucket(bucket)
                .upload_id(&upload_id)
                .body(ByteStream::from(data.slice(start..end)))
                .part_number(part_number)
                .send()
                .await?;

            upload_parts.push(
                CompletedPart::builder()
                    .e_tag(upload_part_res.e_tag().unwrap_or_default())
                    .part_number(part_number)
                    .build(),
            );
        }

        let completed_multipart_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(upload_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .multipart_upload(completed_multipart_upload)
            .upload_id(upload_id)
            .send()
            .await?;

        debug!("uploaded `{bucket}/{key}` in parts");
        Ok(())
    }
}

#[async_trait]
impl Storage for Client {
    async fn exists(&self, path: &str) -> Result<bool> {
        let BucketKey { bucket, key } = path_to_bucket_key(path)?;
        if !key.is_empty() && !key.ends_with('/') && self.object_exists(&bucket, &key).await? {
            return Ok(true);
        }
        let listed = self
            .client
            .list_objects_v2()
            .bucket(&bucket)
            .prefix(dir_key(&key))
            .max_keys(1)
            .send()
            .await?;
        Ok(!listed.contents().is_empty())
    }

    async fn open(&self, path: &str) -> Result<Bytes> {
        let BucketKey { bucket, key } = path_to_bucket_key(path)?;
        let data = self
            .client
            .get_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await?
            .body
            .collect()
            .await?
            .into_bytes();
        Ok(data)
    }

    async fn create(&self, path: &str, options: CreateOptions, data: Bytes) -> Result<()> {
        let BucketKey { bucket, key } = path_to_bucket_key(path)?;
        if !options.overwrite && self.object_exists(&bucket, &key).await? {
            return Err(anyhow!("object `{path}` already exists"));
        }
        self.upload(&bucket, &key, data).await
    }

    async fn list(&self, path: &str) -> Result<Vec<Entry>> {
        let BucketKey { bucket, key } = path_to_bucket_key(path)?;
        let (literal, pattern) = split_glob(&key);

        if let Some(pattern) = pattern {
            let matcher = Glob::new(pattern)?.compile_matcher();
            let mut entries: Vec<Entry> = self
                .list_keys(&bucket, literal)
                .await?
                .into_iter()
                .filter(|(key, _)| matcher.is_match(key))
                .map(|(key, len)| Entry {
                    path: format!("s3://{bucket}/{key}"),
                    len,
                    is_dir: false,
                })
                .collect();
            entries.sort_by(|a, b| a.path.cmp(&b.path));
            return Ok(entries);
        }

        let prefix = dir_key(&key);
        let mut entries: Vec<Entry> = Vec::new();
        for (object_key, len) in self.list_keys(&bucket, &prefix).await? {
            let rest = &object_key[prefix.len()..];
            match rest.split_once('/') {
                None => entries.push(Entry {
                    path: format!("s3://{bucket}/{object_key}"),
                    len,
                    is_dir: false,
                }),
                Some((child, _)) => {
                    let child = format!("s3://{bucket}/{prefix}{child}");
                    if !entries.iter().any(|e| e.path == child) {
                        entries.push(Entry {
                            path: child,
                            len: 0,
                            is_dir: true,
                        });
                    }
                }
            }
        }

        if entries.is_empty() && !key.is_empty() && self.object_exists(&bucket, &key).await? {
            let len = self
                .client
                .head_object()
                .bucket(&bucket)
                .key(&key)
                .send()
                .await?
                .content_length()
                .unwrap_or(0)
                .max(0) as u64;
            entries.push(Entry {
                path: path.to_string(),
                len,
                is_dir: false,
            });
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<bool> {
        let BucketKey { bucket, key } = path_to_bucket_key(path)?;
        if !key.is_empty() && self.object_exists(&bucket, &key).await? {
            self.client
                .delete_object()
                .bucket(&bucket)
                .key(&key)
                .send()
                .await?;
            return Ok(true);
        }

        let objects = self.list_keys(&bucket, &dir_key(&key)).await?;
        if objects.is_empty() {
            return Ok(false);
        }
        if !recursive {
            return Err(anyhow!("directory `{path}` is not empty"));
        }
        for (object, _) in &objects {
            self.client
                .delete_object()
                .bucket(&bucket)
                .key(object)
                .send()
                .await?;
        }
        info!("deleted {} objects under `{path}`", objects.len());
        Ok(true)
    }
}
