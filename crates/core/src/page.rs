//! Offset pagination shared by list queries.

use serde::{Deserialize, Serialize};

/// Pagination parameters for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: usize,
    pub offset: usize,
}

impl PageRequest {
    pub const DEFAULT_LIMIT: usize = 20;
    pub const MAX_LIMIT: usize = 100;

    /// Build a page request, clamping the limit into `1..=MAX_LIMIT`.
    pub fn new(limit: Option<usize>, offset: Option<usize>) -> Self {
        let limit = limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT);
        Self {
            limit,
            offset: offset.unwrap_or(0),
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// One page of results plus the total number of matching rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, request: PageRequest) -> Self {
        let has_more = total > (request.offset + items.len()) as u64;
        Self {
            items,
            total,
            limit: request.limit,
            offset: request.offset,
            has_more,
        }
    }

    /// Slice an already-filtered, already-sorted collection into a page.
    pub fn from_vec(all: Vec<T>, request: PageRequest) -> Self {
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(request.offset)
            .take(request.limit)
            .collect();
        Self::new(items, total, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_clamped() {
        assert_eq!(PageRequest::new(Some(0), None).limit, 1);
        assert_eq!(PageRequest::new(Some(10_000), None).limit, PageRequest::MAX_LIMIT);
        assert_eq!(PageRequest::new(None, None).limit, PageRequest::DEFAULT_LIMIT);
    }

    #[test]
    fn from_vec_reports_has_more() {
        let page = Page::from_vec((0..5).collect::<Vec<_>>(), PageRequest::new(Some(2), Some(2)));
        assert_eq!(page.items, vec![2, 3]);
        assert_eq!(page.total, 5);
        assert!(page.has_more);

        let last = Page::from_vec((0..5).collect::<Vec<_>>(), PageRequest::new(Some(2), Some(4)));
        assert_eq!(last.items, vec![4]);
        assert!(!last.has_more);
    }
}
