//! Wire shape of a queue-delivered batch descriptor (spec §6): `{bid,
//! rids[]}`, encoded as the queue's native text format (JSON here).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDescriptor {
    #[serde(rename = "bid")]
    pub batch_id: String,
    #[serde(rename = "rids")]
    pub request_ids: Vec<Uuid>,
}
