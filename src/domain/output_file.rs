//! Output files: artifacts produced by executions, tracked through download
//! and deletion. `downloaded` and `deleted` are independent flags; a file
//! can expire out of the cache without ever having been downloaded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub method: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub id: Uuid,
    /// Owning execution.
    pub exec_id: Uuid,
    pub name: String,
    pub checksum: Checksum,
    pub url: String,
    pub size_bytes: u64,
    pub created: DateTime<Utc>,
    pub downloaded: bool,
    /// Once true the physical artifact no longer exists and discovery
    /// queries must not return the file.
    pub deleted: bool,
}

impl OutputFile {
    pub fn new(
        exec_id: Uuid,
        name: String,
        checksum: Checksum,
        url: String,
        size_bytes: u64,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            exec_id,
            name,
            checksum,
            url,
            size_bytes,
            created,
            downloaded: false,
            deleted: false,
        }
    }
}
