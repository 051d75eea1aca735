//! Thread pagination.
//!
//! A fetched page carries two opaque cursors: `next` points past the
//! oldest returned message (paging further back) and `previous` at the
//! newest (paging forward). Cursors are encoded message ids; the query
//! engine decodes them on the way back in.

use banter_types::{MessageUnboxed, Pagination};

use crate::codec::{self, CodecError};

/// Builds the outgoing pagination for a descending result page.
///
/// `requested` is the page size the caller asked for; a shorter result
/// marks the page as the last one.
pub fn make_page(messages: &[MessageUnboxed], requested: usize) -> Result<Pagination, CodecError> {
    let (first, last) = match (messages.first(), messages.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => {
            return Ok(Pagination {
                last: true,
                ..Pagination::default()
            })
        }
    };

    Ok(Pagination {
        next: codec::encode(&last.message_id())?,
        previous: codec::encode(&first.message_id())?,
        num: messages.len(),
        last: messages.len() < requested,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
