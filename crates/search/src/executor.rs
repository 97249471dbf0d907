use core_model::{DatasetError, MessagePreview};
use store_sqlite::SqliteStore;

use crate::filter::{Filter, compile_all};

/// One page of previews plus the total under the same filters.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub previews: Vec<MessagePreview>,
    pub page: usize,
    pub size: usize,
    pub total: i64,
}

impl SearchPage {
    pub fn page_count(&self) -> usize {
        (self.total.max(0) as usize).div_ceil(self.size)
    }

    pub fn has_next_page(&self) -> bool {
        self.page < self.page_count()
    }
}

/// Reads page `page` (1-based) of `size` previews, newest first.
pub fn find(
    store: &SqliteStore,
    page: usize,
    size: usize,
    filters: &[Filter],
) -> anyhow::Result<SearchPage> {
    if page == 0 || size == 0 {
        return Err(DatasetError::InvalidPage { page, size }.into());
    }
    let cond = compile_all(filters);
    let (sql, values) = match &cond {
        Some(c) => (Some(c.sql.as_str()), c.values.as_slice()),
        None => (None, &[][..]),
    };
    let offset = (page - 1).saturating_mul(size);
    let previews = store.fetch_previews(sql, values, size as i64, offset as i64)?;
    let total = store.count_where(sql, values)?;
    Ok(SearchPage {
        previews,
        page,
        size,
        total,
    })
}

pub fn count(store: &SqliteStore, filters: &[Filter]) -> anyhow::Result<i64> {
    let cond = compile_all(filters);
    match &cond {
        Some(c) => store.count_where(Some(&c.sql), &c.values),
        None => store.count_where(None, &[]),
    }
}
