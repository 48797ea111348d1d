//! In-page binary search
//!
//! Positions are page ranks: `0` is the infimum, `n_recs + 1` the supremum.
//! On non-leaf pages a record carrying the minimum-record mark compares
//! below every tuple.

use std::cmp::Ordering;

use crate::record::{compare_tuple_rec, Tuple};
use crate::storage::Page;

/// Comparison mode of a search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Last record strictly less than the tuple
    Less,
    /// Last record less than or equal to the tuple
    LessOrEqual,
    /// First record strictly greater than the tuple
    Greater,
    /// First record greater than or equal to the tuple
    GreaterOrEqual,
}

impl SearchMode {
    /// Mode used on the levels above the target level, chosen so that
    /// records equal to a prefix tuple spanning several children are not
    /// skipped.
    pub fn for_upper_levels(self) -> SearchMode {
        match self {
            SearchMode::GreaterOrEqual => SearchMode::Less,
            SearchMode::Greater => SearchMode::LessOrEqual,
            mode => mode,
        }
    }
}

/// Result of a page search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageCursor {
    pub pos: usize,
    /// Fields matched with the record right above the boundary
    pub up_match: usize,
    /// Fields matched with the record right below the boundary
    pub low_match: usize,
}

/// Order of `tuple` relative to the record at `pos`, plus matched fields
fn cmp_at(page: &Page, tuple: &Tuple, pos: usize, start: usize) -> (Ordering, usize) {
    let rec = page.rec(pos);
    if pos == 1 && !page.is_leaf() && rec.is_min_rec() {
        return (Ordering::Greater, 0);
    }
    compare_tuple_rec(tuple, &rec, rec.n_key_fields(page.level()), start)
}

/// Binary search `page` for `tuple`
pub fn search(page: &Page, tuple: &Tuple, mode: SearchMode) -> PageCursor {
    let n = page.n_recs();
    // Records at positions <= low satisfy the "below" predicate, records
    // at positions >= up do not.
    let mut low = 0;
    let mut up = n + 1;
    let mut low_match = 0;
    let mut up_match = 0;
    let inclusive = matches!(mode, SearchMode::LessOrEqual | SearchMode::Greater);

    while up - low > 1 {
        let mid = (low + up) / 2;
        let (ord, matched) = cmp_at(page, tuple, mid, low_match.min(up_match));
        let below = match ord {
            Ordering::Greater => true,
            Ordering::Equal => inclusive,
            Ordering::Less => false,
        };
        if below {
            low = mid;
            low_match = matched;
        } else {
            up = mid;
            up_match = matched;
        }
    }

    let pos = match mode {
        SearchMode::Less | SearchMode::LessOrEqual => low,
        SearchMode::Greater | SearchMode::GreaterOrEqual => up,
    };
    PageCursor {
        pos,
        up_match: if up > n { 0 } else { up_match },
        low_match: if low == 0 { 0 } else { low_match },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RowFormat;
    use crate::storage::PageOp;

    fn page_with(keys: &[u64], level: u16) -> Page {
        let mut page = Page::new(1, 1024);
        page.apply(&PageOp::Create {
            index_id: 1,
            level,
            compact: true,
        })
        .unwrap();
        for (i, k) in keys.iter().enumerate() {
            let tuple = if level == 0 {
                Tuple::from_u64(*k)
            } else {
                Tuple::new(vec![k.to_be_bytes().to_vec(), 9u32.to_be_bytes().to_vec()])
            };
            let rec = tuple.encode(RowFormat::Compact).unwrap();
            page.apply(&PageOp::InsertRec { after: i as u16, rec }).unwrap();
        }
        page
    }

    #[test]
    fn test_modes_on_leaf() {
        let page = page_with(&[10, 20, 30], 0);
        let t = Tuple::from_u64(20);
        assert_eq!(search(&page, &t, SearchMode::Less).pos, 1);
        assert_eq!(search(&page, &t, SearchMode::LessOrEqual).pos, 2);
        assert_eq!(search(&page, &t, SearchMode::Greater).pos, 3);
        assert_eq!(search(&page, &t, SearchMode::GreaterOrEqual).pos, 2);

        let t = Tuple::from_u64(5);
        assert_eq!(search(&page, &t, SearchMode::LessOrEqual).pos, 0);
        let t = Tuple::from_u64(99);
        assert_eq!(search(&page, &t, SearchMode::GreaterOrEqual).pos, 4);
    }

    #[test]
    fn test_match_counts() {
        let page = page_with(&[10, 20, 30], 0);
        let cur = search(&page, &Tuple::from_u64(20), SearchMode::LessOrEqual);
        assert_eq!(cur.low_match, 1);
        assert_eq!(cur.up_match, 0);

        let cur = search(&page, &Tuple::from_u64(25), SearchMode::LessOrEqual);
        assert_eq!(cur.pos, 2);
        assert_eq!(cur.low_match, 0);

        let cur = search(&Page::new(2, 1024), &Tuple::from_u64(1), SearchMode::LessOrEqual);
        assert_eq!(cur, PageCursor::default());
    }

    #[test]
    fn test_min_rec_compares_below_everything() {
        let mut page = page_with(&[50, 60], 1);
        page.apply(&PageOp::SetMinRecMark { pos: 1, on: true }).unwrap();
        let t = Tuple::from_u64(1);
        assert_eq!(search(&page, &t, SearchMode::LessOrEqual).pos, 1);
        assert_eq!(search(&page, &t, SearchMode::Less).pos, 1);
        let t = Tuple::from_u64(60);
        assert_eq!(search(&page, &t, SearchMode::LessOrEqual).pos, 2);
    }

    #[test]
    fn test_upper_level_mode_mapping() {
        assert_eq!(SearchMode::GreaterOrEqual.for_upper_levels(), SearchMode::Less);
        assert_eq!(SearchMode::Greater.for_upper_levels(), SearchMode::LessOrEqual);
        assert_eq!(SearchMode::LessOrEqual.for_upper_levels(), SearchMode::LessOrEqual);
    }
}
