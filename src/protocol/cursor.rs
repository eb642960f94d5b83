//! Cursor-style retrieval.
//!
//! A [`Cursor`] is a finite, forward-only sequence of row batches that can
//! be restarted from the beginning. Declaring one issues nothing; the
//! statement runs on the first fetch, and its result sets are buffered and
//! handed out `max_rows` at a time. Statements producing several result
//! sets are walked set by set.

use std::sync::Arc;

use crate::bridge::{BridgeResponse, BridgeValue, ResultSet};
use crate::error::{Error, Result};
use crate::query::{Param, Query, QueryResult};
use crate::types::{ColumnType, decode};
use crate::value::Value;

/// Continuation marker returned with every batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    /// More batches follow.
    More,
    /// This was the last batch.
    Done,
}

/// A declared cursor.
#[derive(Debug)]
pub struct Cursor {
    pub(crate) query: Query,
    pub(crate) params: Vec<Param>,
    max_rows: usize,
    state: CursorState,
}

#[derive(Debug)]
enum CursorState {
    /// Declared or deallocated; nothing buffered.
    Closed,
    Open(Buffered),
    Exhausted,
}

/// Result sets of one execution, with a read position.
#[derive(Debug)]
pub(crate) struct Buffered {
    sets: Vec<Segment>,
    set: usize,
    row: usize,
}

/// One result set (or update count) ready to be batched.
#[derive(Debug)]
pub(crate) enum Segment {
    Rows {
        set: ResultSet,
        types: Arc<[ColumnType]>,
    },
    Updated {
        rows: u64,
        warnings: u32,
    },
}

/// A segment whose column types are still to be resolved.
#[derive(Debug)]
pub(crate) enum PendingSegment {
    Rows(ResultSet),
    Updated { rows: u64, warnings: u32 },
}

impl PendingSegment {
    /// Flatten a bridge response into segments.
    pub(crate) fn flatten(response: BridgeResponse) -> Vec<PendingSegment> {
        match response {
            BridgeResponse::Updated { rows, warnings } => {
                vec![PendingSegment::Updated { rows, warnings }]
            }
            BridgeResponse::Selected(set) => vec![PendingSegment::Rows(set)],
            BridgeResponse::Multiple(all) => {
                all.into_iter().flat_map(PendingSegment::flatten).collect()
            }
        }
    }
}

impl Cursor {
    pub(crate) fn new(query: Query, params: Vec<Param>, max_rows: usize) -> Self {
        Self {
            query,
            params,
            max_rows: max_rows.max(1),
            state: CursorState::Closed,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    /// Whether results are currently buffered.
    pub fn is_open(&self) -> bool {
        matches!(self.state, CursorState::Open(_))
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.state, CursorState::Exhausted)
    }

    pub(crate) fn open(&mut self, sets: Vec<Segment>) {
        self.state = CursorState::Open(Buffered {
            sets,
            set: 0,
            row: 0,
        });
    }

    pub(crate) fn release(&mut self) {
        self.state = CursorState::Closed;
    }

    /// Hand out the next batch. Decoding happens here, batch by batch.
    pub(crate) fn next_batch(&mut self) -> Result<(QueryResult, Fetch)> {
        let max_rows = self.max_rows;
        let CursorState::Open(buffered) = &mut self.state else {
            return Ok((QueryResult::default(), Fetch::Done));
        };

        let (batch, segment_done) = match buffered.sets.get(buffered.set) {
            None => (QueryResult::default(), true),
            Some(Segment::Updated { rows, warnings }) => {
                (QueryResult::affected(*rows, *warnings), true)
            }
            Some(Segment::Rows { set, types }) => {
                let end = (buffered.row + max_rows).min(set.rows.len());
                let rows = set.rows[buffered.row..end]
                    .iter()
                    .map(|row| decode_row(row, types))
                    .collect::<Result<Vec<_>>>()?;
                buffered.row = end;
                let batch = QueryResult {
                    columns: set.columns.clone(),
                    num_rows: rows.len() as u64,
                    rows,
                    num_warnings: set.warnings,
                    query_id: set.query_id.clone(),
                };
                (batch, end >= set.rows.len())
            }
        };

        if segment_done {
            buffered.set += 1;
            buffered.row = 0;
        }
        if buffered.set >= buffered.sets.len() {
            self.state = CursorState::Exhausted;
            return Ok((batch, Fetch::Done));
        }
        Ok((batch, Fetch::More))
    }
}

pub(crate) fn decode_row(row: &[BridgeValue], types: &[ColumnType]) -> Result<Vec<Value>> {
    if row.len() != types.len() {
        return Err(Error::decode(format!(
            "row has {} cells for {} columns",
            row.len(),
            types.len()
        )));
    }
    row.iter()
        .zip(types)
        .map(|(value, column)| decode(value, &column.kind))
        .collect()
}
