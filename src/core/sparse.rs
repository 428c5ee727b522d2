//! Dynamic sparse page remapping for retrieval heads.
//!
//! An external scorer picks `num_pages` pages per (sequence, query head) out
//! of a long history. The kernel then iterates a short physical range
//! `0..valid_length` and translates each position back to the logical token
//! it stands for:
//!
//! ```text
//! physical i -> page i / tpb -> pages[page] * tpb + i % tpb
//! ```
//!
//! The last selected page is always the sequence's current page, so the
//! final page contributes only `(ctx - 1) % tpb + 1` positions. The token
//! appended this step is never remapped.

use crate::error::{Error, Result};

/// Marker returned for positions beyond the page budget.
///
/// Never dereferenced: iteration stops at [`SparseRemap::valid_length`].
pub const INVALID_TOKEN: usize = usize::MAX;

/// Selected page indices for a whole batch, `[batch, heads, num_pages]`.
#[derive(Debug, Clone, Copy)]
pub struct SparsePages<'a> {
    page_idxes: &'a [u32],
    batch_size: usize,
    num_heads: usize,
    num_pages: usize,
}

impl<'a> SparsePages<'a> {
    /// Wrap a page-index array.
    pub fn new(
        page_idxes: &'a [u32],
        batch_size: usize,
        num_heads: usize,
        num_pages: usize,
    ) -> Result<Self> {
        Error::check_len(
            "dynamic sparse page indices",
            batch_size * num_heads * num_pages,
            page_idxes.len(),
        )?;
        Ok(Self {
            page_idxes,
            batch_size,
            num_heads,
            num_pages,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Page list of one (sequence, query head).
    pub fn pages(&self, batch: usize, head: usize) -> &'a [u32] {
        let start = (batch * self.num_heads + head) * self.num_pages;
        &self.page_idxes[start..start + self.num_pages]
    }

    /// Remapper for one (sequence, query head) at context length `ctx`.
    pub fn remap(
        &self,
        batch: usize,
        head: usize,
        ctx: usize,
        tokens_per_block: usize,
    ) -> SparseRemap<'a> {
        SparseRemap::new(self.pages(batch, head), tokens_per_block, ctx)
    }

    /// Check that every page a step will read lies inside the sequence.
    ///
    /// Only query heads for which `reads_pages` holds are checked; the
    /// lists of the other heads are never dereferenced.
    pub fn validate<F>(
        &self,
        batch: usize,
        ctx: usize,
        tokens_per_block: usize,
        reads_pages: F,
    ) -> Result<()>
    where
        F: Fn(usize) -> bool,
    {
        let history_pages = ctx.div_ceil(tokens_per_block);
        for head in (0..self.num_heads).filter(|&h| reads_pages(h)) {
            let remap = self.remap(batch, head, ctx, tokens_per_block);
            if !remap.is_active() {
                continue;
            }
            if let Some(&bad) = remap.pages.iter().find(|&&p| p as usize >= history_pages) {
                return Err(Error::Config(format!(
                    "sparse page {bad} for sequence {batch} head {head} is past its {history_pages} pages"
                )));
            }
        }
        Ok(())
    }
}

/// Physical-to-logical translation for one (sequence, head).
#[derive(Debug, Clone, Copy)]
pub struct SparseRemap<'a> {
    pages: &'a [u32],
    tokens_per_block: usize,
    ctx: usize,
    valid_length: usize,
    active: bool,
}

impl<'a> SparseRemap<'a> {
    /// Build the remapper; it is a pass-through when the page budget already
    /// covers the whole history.
    pub fn new(pages: &'a [u32], tokens_per_block: usize, ctx: usize) -> Self {
        let budget = match pages.len() {
            0 => ctx,
            _ if ctx == 0 => 0,
            n => (n - 1) * tokens_per_block + (ctx - 1) % tokens_per_block + 1,
        };
        let active = budget < ctx;
        Self {
            pages,
            tokens_per_block,
            ctx,
            valid_length: if active { budget } else { ctx },
            active,
        }
    }

    /// Whether positions are actually translated.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Number of history positions to iterate.
    pub fn valid_length(&self) -> usize {
        self.valid_length
    }

    /// Logical token for history position `i`, or [`INVALID_TOKEN`].
    pub fn remap(&self, i: usize) -> usize {
        if !self.active {
            return if i < self.ctx { i } else { INVALID_TOKEN };
        }
        let page = i / self.tokens_per_block;
        match self.pages.get(page) {
            Some(&p) => p as usize * self.tokens_per_block + i % self.tokens_per_block,
            None => INVALID_TOKEN,
        }
    }

    /// Like [`remap`](Self::remap), but position `valid_length` is the
    /// current token and resolves to its true index.
    pub fn resolve(&self, i: usize) -> usize {
        if i == self.valid_length {
            self.ctx
        } else {
            self.remap(i)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remap_selected_pages() {
        // tpb 4, ctx 30 -> 8 logical pages, last page holds 2 tokens
        let pages = [1u32, 5, 7];
        let remap = SparseRemap::new(&pages, 4, 30);
        assert!(remap.is_active());
        assert_eq!(remap.valid_length(), 2 * 4 + 2);

        assert_eq!(remap.remap(0), 4);
        assert_eq!(remap.remap(3), 7);
        assert_eq!(remap.remap(4), 20);
        assert_eq!(remap.remap(8), 28);
        assert_eq!(remap.remap(9), 29);
        assert_eq!(remap.remap(12), INVALID_TOKEN);
    }

    #[test]
    fn test_current_token_is_not_remapped() {
        let pages = [0u32, 3];
        let remap = SparseRemap::new(&pages, 4, 16);
        let current = remap.valid_length();
        assert_eq!(current, 8);
        assert_eq!(remap.resolve(current), 16);
        assert_eq!(remap.resolve(current - 1), 15);
    }

    #[test]
    fn test_budget_covering_history_is_pass_through() {
        let pages = [0u32, 1, 2, 3];
        let remap = SparseRemap::new(&pages, 16, 40);
        assert!(!remap.is_active());
        assert_eq!(remap.valid_length(), 40);
        assert_eq!(remap.remap(17), 17);
        assert_eq!(remap.resolve(40), 40);
    }

    #[test]
    fn test_remap_is_deterministic() {
        let pages = [2u32, 9, 4, 11];
        let remap = SparseRemap::new(&pages, 8, 95);
        let first: Vec<usize> = (0..remap.valid_length()).map(|i| remap.remap(i)).collect();
        let second: Vec<usize> = (0..remap.valid_length()).map(|i| remap.remap(i)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_batch_pages_and_validation() {
        let idx = [0u32, 2, 1, 2, 0, 1, 5, 1];
        let sparse = SparsePages::new(&idx, 2, 2, 2).unwrap();
        assert_eq!(sparse.pages(1, 0), &[0, 1]);
        // ctx 12 with tpb 4 -> 3 pages, budget 8 < 12, page 2 is valid
        assert!(sparse.validate(0, 12, 4, |_| true).is_ok());
        // sequence 1 head 1 points at page 5
        assert!(sparse.validate(1, 12, 4, |_| true).is_err());
        // unless head 1 never reads its list
        assert!(sparse.validate(1, 12, 4, |h| h == 0).is_ok());
        assert!(SparsePages::new(&idx, 2, 2, 3).is_err());
    }
}
