use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_rds::Client;
use aws_sdk_rds::types::DbInstance;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use crate::services::{DbService, InstanceRecord};

/// Discovery pages are capped by the provider at 100 records.
const PAGE_SIZE: i32 = 100;

/// Thin wrapper over the RDS SDK, reduced to the single discovery
/// operation the exporter needs.
pub struct RdsClient {
    client: Client,
}

impl RdsClient {
    /// Build a client for one region using the ambient credential chain.
    pub async fn new(region: &str) -> Result<Self> {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;

        Ok(Self {
            client: Client::new(&config),
        })
    }
}

#[async_trait]
impl DbService for RdsClient {
    #[instrument(skip(self), level = "debug")]
    async fn describe_db_instances(&self) -> Result<Vec<InstanceRecord>> {
        let mut pages = self
            .client
            .describe_db_instances()
            .max_records(PAGE_SIZE)
            .into_paginator()
            .send();

        let mut records = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.context("describing database instances")?;
            records.extend(page.db_instances().iter().map(convert_record));
        }

        debug!(count = records.len(), "retrieved instance records");
        Ok(records)
    }
}

fn convert_record(db: &DbInstance) -> InstanceRecord {
    InstanceRecord {
        engine: db.engine().map(str::to_string),
        status: db.db_instance_status().map(str::to_string),
        resource_id: db.dbi_resource_id().map(str::to_string),
        identifier: db.db_instance_identifier().map(str::to_string),
        creation_time: db.instance_create_time().and_then(to_chrono),
        performance_insights_enabled: db.performance_insights_enabled(),
        tags: db
            .tag_list()
            .iter()
            .filter_map(|tag| Some((tag.key()?.to_string(), tag.value()?.to_string())))
            .collect(),
    }
}

fn to_chrono(timestamp: &aws_sdk_rds::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp.secs(), timestamp.subsec_nanos())
}
