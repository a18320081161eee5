//! Combined snapshot of every admission primitive.
//!
//! Serialises to one flat object: each worker pool under its own name, and
//! the inference gate under `"llm"`. Pool names are fixed by `BackendConfig`
//! and never collide with it.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::admission::GateStatus;
use crate::pool::PoolStatus;

pub const LLM_DESCRIPTION: &str = "LLM inference (priority queue)";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmStatus {
    pub description: String,
    #[serde(flatten)]
    pub gate: GateStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    #[serde(flatten)]
    pub pools: BTreeMap<String, PoolStatus>,
    pub llm: LlmStatus,
}

impl SystemStatus {
    pub fn new(pools: BTreeMap<String, PoolStatus>, gate: GateStatus) -> Self {
        Self {
            pools,
            llm: LlmStatus {
                description: LLM_DESCRIPTION.to_string(),
                gate,
            },
        }
    }

    pub fn pool(&self, name: &str) -> Option<&PoolStatus> {
        self.pools.get(name)
    }

    /// `true` if the gate or any pool has every slot taken.
    pub fn any_busy(&self) -> bool {
        self.llm.gate.is_busy || self.pools.values().any(|p| p.is_busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialises_pools_and_llm_side_by_side() {
        let mut pools = BTreeMap::new();
        pools.insert(
            "whisper".to_string(),
            PoolStatus {
                description: "Audio transcription".into(),
                concurrency: 1,
                running: 1,
                queued: 2,
                total_processed: 7,
                total_errors: 1,
                is_busy: true,
            },
        );
        let status = SystemStatus::new(
            pools,
            GateStatus {
                max_concurrency: 1,
                running: 0,
                waiting: 0,
                is_busy: false,
            },
        );
        let json = serde_json::to_value(&status).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "whisper": {
                    "description": "Audio transcription",
                    "concurrency": 1,
                    "running": 1,
                    "queued": 2,
                    "total_processed": 7,
                    "total_errors": 1,
                    "is_busy": true
                },
                "llm": {
                    "description": "LLM inference (priority queue)",
                    "max_concurrency": 1,
                    "running": 0,
                    "waiting": 0,
                    "is_busy": false
                }
            })
        );
        assert!(status.any_busy());
    }
}
