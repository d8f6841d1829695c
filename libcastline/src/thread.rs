//! Thread ordering and reply-target resolution
//!
//! A thread is a set of casts sharing `thread_id`, ordered by `thread_order`.
//! Every member after the first replies to the member just before it, whose
//! hash only exists once that member is published.

use std::collections::HashMap;

use crate::error::Result;
use crate::store::ScheduleStore;
use crate::types::{Cast, CastStatus};

/// What a cast should reply to when published
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentResolution {
    /// Not a thread member (or the first one): keep the stored `parent_hash`
    Stored(Option<String>),
    /// Reply to the published predecessor
    Predecessor(String),
    /// Predecessor not published yet; leave the cast for a later sweep
    Waiting {
        predecessor_id: String,
        predecessor_status: CastStatus,
    },
}

/// Group due casts into lanes that can be processed independently.
///
/// Each thread becomes one lane in `thread_order`; every other cast is a
/// lane of its own. Lanes keep the order in which their first cast appeared.
pub fn into_lanes(casts: Vec<Cast>) -> Vec<Vec<Cast>> {
    let mut lanes: Vec<Vec<Cast>> = Vec::new();
    let mut thread_lane: HashMap<String, usize> = HashMap::new();

    for cast in casts {
        match cast.thread_id.clone() {
            Some(thread_id) => match thread_lane.get(&thread_id) {
                Some(&index) => lanes[index].push(cast),
                None => {
                    thread_lane.insert(thread_id, lanes.len());
                    lanes.push(vec![cast]);
                }
            },
            None => lanes.push(vec![cast]),
        }
    }

    for lane in &mut lanes {
        lane.sort_by_key(|c| c.thread_order.unwrap_or(0));
    }
    lanes
}

/// Work out the reply target for `cast` from the current store state.
pub async fn resolve_parent<S>(store: &S, cast: &Cast) -> Result<ParentResolution>
where
    S: ScheduleStore + ?Sized,
{
    let (thread_id, order) = match (&cast.thread_id, cast.thread_order) {
        (Some(thread_id), Some(order)) => (thread_id, order),
        _ => return Ok(ParentResolution::Stored(cast.parent_hash.clone())),
    };

    let Some(predecessor) = store.find_thread_predecessor(thread_id, order).await? else {
        return Ok(ParentResolution::Stored(cast.parent_hash.clone()));
    };

    match (predecessor.status, predecessor.cast_hash) {
        (CastStatus::Published, Some(hash)) => Ok(ParentResolution::Predecessor(hash)),
        (status, _) => Ok(ParentResolution::Waiting {
            predecessor_id: predecessor.id,
            predecessor_status: status,
        }),
    }
}
