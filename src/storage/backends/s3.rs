//! S3 object store

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::storage::{
    config::S3Config,
    error::{StorageError, StorageResult},
    traits::ObjectStore,
};

/// Object store over S3 buckets
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    prefix: Option<String>,
}

impl S3ObjectStore {
    /// Create the client from the environment plus any endpoint override
    pub async fn new(config: &S3Config) -> StorageResult<Self> {
        info!("Initializing S3 object store");

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(ref endpoint) = config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let Some(ref region) = config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            prefix: config.prefix.clone(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list(&self, container: &str) -> StorageResult<Vec<String>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(container)
            .set_prefix(self.prefix.clone())
            .into_paginator()
            .send();

        let mut names = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| StorageError::backend(format!("S3 list failed: {}", e)))?;
            names.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );
        }

        debug!(container, count = names.len(), "Listed objects");
        Ok(names)
    }

    async fn read(&self, container: &str, name: &str) -> StorageResult<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(container)
            .key(name)
            .send()
            .await
            .map_err(|e| {
                let missing = e
                    .as_service_error()
                    .is_some_and(|service| service.is_no_such_key());
                if missing {
                    StorageError::not_found(format!("{}/{}", container, name))
                } else {
                    StorageError::backend(format!("S3 get failed: {}", e))
                }
            })?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::backend(format!("S3 body read failed: {}", e)))?;

        Ok(bytes.into_bytes().to_vec())
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
