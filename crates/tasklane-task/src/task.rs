//! Task domain types submitted by the platform layer

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A one-shot unit of work identified by a GUID
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Task {
    pub guid: String,
    pub app_name: String,
    pub app_guid: String,
    pub space_name: String,
    pub space_guid: String,
    pub org_name: String,
    pub org_guid: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub memory_mb: u64,
    pub cpu_weight: u8,
    pub disk_mb: u64,
}

impl Task {
    /// Prefix handed to the API server's `generateName`
    ///
    /// `<app>-<space>-` when both names are known, otherwise `<guid>-`.
    pub fn name_prefix(&self) -> String {
        if self.app_name.is_empty() || self.space_name.is_empty() {
            format!("{}-", self.guid)
        } else {
            format!("{}-{}-", self.app_name, self.space_name)
        }
    }
}

/// A task executed as download → execute → upload
///
/// Unset stage images fall back to the task image.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StagingTask {
    #[serde(flatten)]
    pub task: Task,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloader_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader_image: Option<String>,
}

impl StagingTask {
    pub fn downloader_image(&self) -> &str {
        self.stage_image(&self.downloader_image)
    }

    pub fn executor_image(&self) -> &str {
        self.stage_image(&self.executor_image)
    }

    pub fn uploader_image(&self) -> &str {
        self.stage_image(&self.uploader_image)
    }

    fn stage_image<'a>(&'a self, image: &'a Option<String>) -> &'a str {
        match image.as_deref() {
            Some(image) if !image.is_empty() => image,
            _ => &self.task.image,
        }
    }
}
