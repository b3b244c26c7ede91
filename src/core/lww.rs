//! Last-writer-wins tie breaking for concurrent updates.

/// Two distinct writes claimed the same `(timestamp, id)` position.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("LWW tie at timestamp {timestamp} for id {id}")]
pub struct LwwError {
    pub timestamp: u64,
    pub id: String,
}

/// Decide whether an update replaces the current value.
///
/// Orders by timestamp first and by id second. Ids are compared with their
/// `Ord` implementation, which for [`Hash`](crate::core::Hash) is the byte order.
///
/// # Errors
/// Returns [`LwwError`] when both timestamp and id are equal; this means two
/// logically distinct updates share an identifier and no winner may be picked.
pub fn should_update<Id>(
    current_timestamp: u64,
    current_id: &Id,
    update_timestamp: u64,
    update_id: &Id,
) -> Result<bool, LwwError>
where
    Id: Ord + std::fmt::Display,
{
    if update_timestamp != current_timestamp {
        return Ok(update_timestamp > current_timestamp);
    }
    match update_id.cmp(current_id) {
        std::cmp::Ordering::Greater => Ok(true),
        std::cmp::Ordering::Less => Ok(false),
        std::cmp::Ordering::Equal => Err(LwwError {
            timestamp: update_timestamp,
            id: update_id.to_string(),
        }),
    }
}
