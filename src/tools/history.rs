use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct HistoryRequest {
    /// Maximum number of URLs to return, newest first. Omit for the whole history.
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub urls: Vec<String>,
    pub capacity: usize,
}
