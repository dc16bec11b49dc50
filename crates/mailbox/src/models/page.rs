use serde::Serialize;

/// One page of a larger result set
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
    pub has_more: bool,
    pub next_offset: Option<u32>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, limit: u32, offset: u32) -> Self {
        let end = offset as u64 + items.len() as u64;
        let has_more = end < total;
        Self {
            items,
            total,
            limit,
            offset,
            has_more,
            next_offset: has_more.then_some(end as u32),
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            limit: self.limit,
            offset: self.offset,
            has_more: self.has_more,
            next_offset: self.next_offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_more() {
        let page = Page::new(vec![1, 2], 5, 2, 0);
        assert!(page.has_more);
        assert_eq!(page.next_offset, Some(2));

        let last = Page::new(vec![5], 5, 2, 4);
        assert!(!last.has_more);
        assert_eq!(last.next_offset, None);
    }
}
