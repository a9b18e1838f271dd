//! Candidate Selector (C7): groups requests into per-stream candidates and
//! filters out already-anchored streams.

use tracing::instrument;

use crate::database::{AnchorStore, MetadataStore};
use crate::types::{Candidate, CandidateGroups, Request};

/// Builds candidate groups from `requests` (already READY/PROCESSING, one
/// batch's worth). `candidate_limit` of 0 means unbounded.
#[instrument(skip(requests, anchor_store, metadata_store), fields(n = requests.len()))]
pub async fn select_candidates(
    requests: Vec<Request>,
    candidate_limit: usize,
    anchor_store: &dyn AnchorStore,
    metadata_store: &dyn MetadataStore,
) -> anyhow::Result<CandidateGroups> {
    let mut groups = CandidateGroups::default();
    if requests.is_empty() {
        return Ok(groups);
    }

    // Step 1/2: one candidate per request, sorted by request timestamp
    // then streamId (the selector's own ordering, independent of the
    // stricter leaf comparator the tree builder applies later).
    let mut sorted = requests;
    sorted.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.stream_id.cmp(&b.stream_id))
    });

    // Step 3: batch-query already-anchored requests.
    let anchors = anchor_store.find_anchors_by_requests(&sorted).await?;
    let anchored_request_ids: std::collections::HashSet<_> =
        anchors.into_iter().map(|a| a.request_id).collect();

    let stream_ids: Vec<String> = sorted.iter().map(|r| r.stream_id.clone()).collect();
    let metadata_by_stream = metadata_store.load_metadata_many(&stream_ids).await?;

    let mut accepted = Vec::new();
    let mut already_anchored = Vec::new();

    for request in sorted {
        let cid = match request.cid() {
            Ok(cid) => cid,
            Err(_) => {
                groups.failed.push(request);
                continue;
            }
        };

        let metadata = metadata_by_stream.get(&request.stream_id).cloned();
        let is_anchored = anchored_request_ids.contains(&request.id);

        let candidate = Candidate {
            stream_id: request.stream_id.clone(),
            request,
            metadata,
            cid,
            already_anchored: is_anchored,
        };

        if is_anchored {
            already_anchored.push(candidate);
        } else {
            accepted.push(candidate);
        }
    }

    // Step 4: truncate to candidate_limit; remainder reported unprocessed.
    if candidate_limit > 0 && accepted.len() > candidate_limit {
        let unprocessed = accepted.split_off(candidate_limit);
        groups.unprocessed = unprocessed.into_iter().map(|c| c.request).collect();
    }

    groups.accepted = accepted;
    groups.already_anchored = already_anchored;

    Ok(groups)
}

/// The leaf comparator used by the Merkle Tree Builder (§4.4): model
/// ascending with nulls last, then first controller ascending, then
/// streamId ascending. Applied as a second, stable sort over the
/// Candidate Selector's output.
pub fn sort_for_tree(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        let model_a = a.metadata.as_ref().and_then(|m| m.model.as_deref());
        let model_b = b.metadata.as_ref().and_then(|m| m.model.as_deref());
        let model_cmp = match (model_a, model_b) {
            (Some(x), Some(y)) => x.cmp(y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        };

        let controller_a = a
            .metadata
            .as_ref()
            .and_then(|m| m.controllers.first().map(String::as_str))
            .unwrap_or("");
        let controller_b = b
            .metadata
            .as_ref()
            .and_then(|m| m.controllers.first().map(String::as_str))
            .unwrap_or("");

        model_cmp
            .then_with(|| controller_a.cmp(controller_b))
            .then_with(|| a.stream_id.cmp(&b.stream_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_for_tree_orders_by_model_then_controller_then_stream() {
        use chrono::Utc;
        use uuid::Uuid;

        use crate::types::{Request, RequestStatus, StreamMetadata};

        fn candidate(stream_id: &str, model: Option<&str>, controller: &str) -> Candidate {
            let now = Utc::now();
            Candidate {
                stream_id: stream_id.to_string(),
                request: Request {
                    id: Uuid::new_v4(),
                    cid: format!("cid-{stream_id}"),
                    stream_id: stream_id.to_string(),
                    status: RequestStatus::Processing,
                    message: None,
                    pinned: false,
                    origin: None,
                    timestamp: now,
                    created_at: now,
                    updated_at: now,
                },
                metadata: Some(StreamMetadata {
                    controllers: vec![controller.to_string()],
                    model: model.map(str::to_string),
                    family: None,
                    schema: None,
                    tags: None,
                }),
                cid: crate::merkle::node::cid_for(stream_id.as_bytes()),
                already_anchored: false,
            }
        }

        let mut candidates = vec![
            candidate("z", None, "c"),
            candidate("a", Some("m2"), "c"),
            candidate("b", Some("m1"), "c"),
        ];
        sort_for_tree(&mut candidates);

        let order: Vec<&str> = candidates.iter().map(|c| c.stream_id.as_str()).collect();
        // m1 < m2 < None(last)
        assert_eq!(order, vec!["b", "a", "z"]);
    }
}
