//! planning for physical reorganization operations (e.g. COMPACT)

use std::sync::Arc;

use datafusion::logical_plan::{col, lit_timestamp_nano, LogicalPlan};
use observability_deps::tracing::debug;
use schema::{sort::SortKey, Schema, TIME_COLUMN_NAME};

use crate::{
    exec::{make_stream_split, IOxSessionContext},
    QueryChunk,
};
use snafu::{ResultExt, Snafu};

use super::common::ScanPlanBuilder;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Chunk schema not compatible for compact plan: {}", source))]
    ChunkSchemaNotCompatible { source: schema::merge::Error },

    #[snafu(display("Reorg planner got error building plan: {}", source))]
    BuildingPlan {
        source: datafusion::error::DataFusionError,
    },

    #[snafu(display("Reorg planner got error building scan: {}", source))]
    BuildingScan {
        source: crate::frontend::common::Error,
    },

    #[snafu(display(
        "Reorg planner got error adding creating scan for {}: {}",
        table_name,
        source
    ))]
    CreatingScan {
        table_name: String,
        source: super::common::Error,
    },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<datafusion::error::DataFusionError> for Error {
    fn from(source: datafusion::error::DataFusionError) -> Self {
        Self::BuildingPlan { source }
    }
}

/// Planner for physically rearranging chunk data. This planner
/// creates COMPACT and SPLIT plans for use in the database lifecycle manager
#[derive(Debug)]
pub struct ReorgPlanner {
    ctx: IOxSessionContext,
}

impl ReorgPlanner {
    pub fn new(ctx: IOxSessionContext) -> Self {
        Self { ctx }
    }

    /// Creates an execution plan for the COMPACT operations which does the following:
    ///
    /// 1. Merges chunks together into a single stream
    /// 2. Deduplicates via PK as necessary
    /// 3. Sorts the result according to the requested key
    ///
    /// The plan looks like:
    ///
    /// (Sort on output_sort)
    ///   (Scan chunks) <-- any needed deduplication happens here
    pub fn compact_plan<I>(
        &self,
        schema: Arc<Schema>,
        chunks: I,
        sort_key: SortKey,
    ) -> Result<LogicalPlan>
    where
        I: IntoIterator<Item = Arc<dyn QueryChunk>>,
    {
        let scan_plan = ScanPlanBuilder::new(schema, self.ctx.child_ctx("compact_plan"))
            .with_chunks(chunks)
            .with_sort_key(sort_key)
            .build()
            .context(BuildingScanSnafu)?;

        let plan = scan_plan.plan_builder.build()?;

        debug!(table_name=scan_plan.provider.table_name(), plan=%plan.display_indent_schema(),
               "created compact plan for table");

        Ok(plan)
    }

    /// Creates an execution plan for the SPLIT operations which does the following:
    ///
    /// 1. Merges chunks together into a single stream
    /// 2. Deduplicates via PK as necessary
    /// 3. Sorts the result according to the requested key
    /// 4. Splits the stream on value of the `time` column: Those
    ///    rows that are on or before the time and those that are after
    ///
    /// The plan looks like:
    ///
    /// (Split on Time)
    ///   (Sort on output_sort)
    ///     (Scan chunks) <-- any needed deduplication happens here
    ///
    /// The output execution plan has n "output streams" (DataFusion partition):
    /// Stream 0: Rows that have `time` *on or before* the `split_times[0]`
    /// Stream i (0 < i < split_times's length): Rows that have  `time` in range `(split_times[i-1], split_times[i]]`
    /// Stream n (n = split_times.len()): Rows that have `time` *after* all the split_times and NULL rows
    ///
    /// For example, if the input looks like:
    /// ```text
    ///  X | time
    /// ---+-----
    ///  b | 2000
    ///  a | 1000
    ///  c | 4000
    ///  d | 2000
    ///  e | 3000
    /// ```
    /// A split plan with `sort=time` and `split_times=[2000, 3000]` will produce the following three output streams
    ///
    /// ```text
    ///  X | time
    /// ---+-----
    ///  a | 1000
    ///  b | 2000
    ///  d | 2000
    /// ```
    ///
    /// ```text
    ///  X | time
    /// ---+-----
    ///  e | 3000
    /// ```
    ///
    /// ```text
    ///  X | time
    /// ---+-----
    ///  c | 4000
    /// ```
    pub fn split_plan<I>(
        &self,
        schema: Arc<Schema>,
        chunks: I,
        sort_key: SortKey,
        split_times: Vec<i64>,
    ) -> Result<LogicalPlan>
    where
        I: IntoIterator<Item = Arc<dyn QueryChunk>>,
    {
        // split_times must have values
        if split_times.is_empty() {
            panic!("Split plan does not accept empty split_times");
        }

        let scan_plan = ScanPlanBuilder::new(schema, self.ctx.child_ctx("split_plan"))
            .with_chunks(chunks)
            .with_sort_key(sort_key)
            .build()
            .context(BuildingScanSnafu)?;

        let mut split_exprs = Vec::with_capacity(split_times.len());
        // time <= split_times[0]
        split_exprs.push(col(TIME_COLUMN_NAME).lt_eq(lit_timestamp_nano(split_times[0])));
        // split_times[i-1] , time <= split_time[i]
        for i in 1..split_times.len() {
            if split_times[i - 1] >= split_times[i] {
                panic!(
                    "split_times[{}]: {} must be smaller than split_times[{}]: {}",
                    i - 1,
                    split_times[i - 1],
                    i,
                    split_times[i]
                );
            }
            split_exprs.push(
                col(TIME_COLUMN_NAME)
                    .gt(lit_timestamp_nano(split_times[i - 1]))
                    .and(col(TIME_COLUMN_NAME).lt_eq(lit_timestamp_nano(split_times[i]))),
            );
        }

        let plan = scan_plan.plan_builder.build().context(BuildingPlanSnafu)?;
        let plan = make_stream_split(plan, split_exprs);

        debug!(table_name=scan_plan.provider.table_name(), plan=%plan.display_indent_schema(),
               "created split plan for table");

        Ok(plan)
    }
}
