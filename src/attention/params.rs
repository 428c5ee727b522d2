//! Per-step attention parameter block and head routing.

use crate::config::AttentionConfig;
use crate::core::kv_cache::HeadKind;
use crate::core::sparse::SparsePages;
use crate::error::{Error, Result};

/// Where one key/value head lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadRoute {
    pub kind: HeadKind,
    /// Head index inside its own cache.
    pub rank: usize,
}

/// Retrieval flag and head-rank table for every key/value head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadRouting {
    routes: Vec<HeadRoute>,
    num_retrieval: usize,
    num_streaming: usize,
}

impl HeadRouting {
    /// Every key/value head is a retrieval head.
    pub fn all_retrieval(num_kv_heads: usize) -> Self {
        Self::from_flags(&vec![true; num_kv_heads])
    }

    /// Route heads by flag (`true` = retrieval), ranking each kind in order.
    pub fn from_flags(retrieval_flags: &[bool]) -> Self {
        let mut num_retrieval = 0;
        let mut num_streaming = 0;
        let routes = retrieval_flags
            .iter()
            .map(|&is_retrieval| {
                let (kind, counter) = if is_retrieval {
                    (HeadKind::Retrieval, &mut num_retrieval)
                } else {
                    (HeadKind::Streaming, &mut num_streaming)
                };
                let rank = *counter;
                *counter += 1;
                HeadRoute { kind, rank }
            })
            .collect();
        Self {
            routes,
            num_retrieval,
            num_streaming,
        }
    }

    /// Route heads with an explicit head-rank table.
    ///
    /// Ranks of each kind must be a permutation of `0..count`.
    pub fn new(retrieval_flags: &[bool], head_ranks: &[usize]) -> Result<Self> {
        Error::check_len("head rank table", retrieval_flags.len(), head_ranks.len())?;
        let by_flags = Self::from_flags(retrieval_flags);
        let routes: Vec<HeadRoute> = by_flags
            .routes
            .iter()
            .zip(head_ranks)
            .map(|(route, &rank)| HeadRoute {
                kind: route.kind,
                rank,
            })
            .collect();

        for (kind, count) in [
            (HeadKind::Retrieval, by_flags.num_retrieval),
            (HeadKind::Streaming, by_flags.num_streaming),
        ] {
            let mut seen = vec![false; count];
            for route in routes.iter().filter(|r| r.kind == kind) {
                match seen.get_mut(route.rank) {
                    Some(slot) if !*slot => *slot = true,
                    _ => {
                        return Err(Error::Config(format!(
                            "head rank {} invalid or repeated for {kind:?} heads",
                            route.rank
                        )))
                    }
                }
            }
        }

        Ok(Self { routes, ..by_flags })
    }

    /// Route of key/value head `kv_head`.
    pub fn route(&self, kv_head: usize) -> HeadRoute {
        self.routes[kv_head]
    }

    pub fn num_kv_heads(&self) -> usize {
        self.routes.len()
    }

    pub fn num_retrieval_kv_heads(&self) -> usize {
        self.num_retrieval
    }

    pub fn num_streaming_kv_heads(&self) -> usize {
        self.num_streaming
    }
}

/// Immutable inputs of one decode step.
///
/// Q is `[batch, num_heads, head_dim]`; K and V are
/// `[batch, num_kv_heads, head_dim]` for the token being appended.
#[derive(Debug, Clone, Copy)]
pub struct AttentionParams<'a, T> {
    pub config: &'a AttentionConfig,
    pub batch_size: usize,
    pub q: &'a [T],
    pub k: &'a [T],
    pub v: &'a [T],
    /// Tokens already cached per sequence (also the new token's position).
    pub context_lengths: &'a [usize],
    /// Sequences to skip entirely.
    pub finished: Option<&'a [bool]>,
    pub routing: &'a HeadRouting,
    pub sparse: Option<SparsePages<'a>>,
}

impl<'a, T> AttentionParams<'a, T> {
    /// Create a parameter block; batch size is `context_lengths.len()`.
    pub fn new(
        config: &'a AttentionConfig,
        q: &'a [T],
        k: &'a [T],
        v: &'a [T],
        context_lengths: &'a [usize],
        routing: &'a HeadRouting,
    ) -> Self {
        Self {
            config,
            batch_size: context_lengths.len(),
            q,
            k,
            v,
            context_lengths,
            finished: None,
            routing,
            sparse: None,
        }
    }

    /// Attach per-sequence finished flags.
    pub fn with_finished(mut self, finished: &'a [bool]) -> Self {
        self.finished = Some(finished);
        self
    }

    /// Attach the dynamic sparse page selection.
    pub fn with_sparse_pages(mut self, sparse: SparsePages<'a>) -> Self {
        self.sparse = Some(sparse);
        self
    }

    /// Check buffer shapes against the configuration.
    pub fn validate(&self) -> Result<()> {
        let cfg = self.config;
        cfg.validate()?;
        let (b, dh) = (self.batch_size, cfg.head_dim);
        Error::check_len("query buffer", b * cfg.num_heads * dh, self.q.len())?;
        Error::check_len("key buffer", b * cfg.num_kv_heads * dh, self.k.len())?;
        Error::check_len("value buffer", b * cfg.num_kv_heads * dh, self.v.len())?;
        Error::check_len("head routing", cfg.num_kv_heads, self.routing.num_kv_heads())?;
        if let Some(finished) = self.finished {
            Error::check_len("finished flags", b, finished.len())?;
        }
        if let Some(sparse) = &self.sparse {
            Error::check_len("sparse page batch", b, sparse.batch_size())?;
            Error::check_len("sparse page heads", cfg.num_heads, sparse.num_heads())?;
        }
        Ok(())
    }

    pub fn is_finished(&self, batch: usize) -> bool {
        self.finished.is_some_and(|f| f[batch])
    }

    pub fn q_row(&self, batch: usize, head: usize) -> &'a [T] {
        let dh = self.config.head_dim;
        let start = (batch * self.config.num_heads + head) * dh;
        &self.q[start..start + dh]
    }

    pub fn k_row(&self, batch: usize, kv_head: usize) -> &'a [T] {
        let dh = self.config.head_dim;
        let start = (batch * self.config.num_kv_heads + kv_head) * dh;
        &self.k[start..start + dh]
    }

    pub fn v_row(&self, batch: usize, kv_head: usize) -> &'a [T] {
        let dh = self.config.head_dim;
        let start = (batch * self.config.num_kv_heads + kv_head) * dh;
        &self.v[start..start + dh]
    }
}
