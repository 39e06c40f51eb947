//! Handle all requests from Querier

use crate::data::{
    IngesterData, IngesterQueryPartition, IngesterQueryResponse, QueryableBatch,
    UnpersistedPartitionData,
};
use arrow::error::ArrowError;
use datafusion::{
    error::DataFusionError, logical_plan::LogicalPlanBuilder,
    physical_plan::SendableRecordBatchStream,
};
use futures::StreamExt;
use generated_types::ingester::IngesterQueryRequest;
use iox_query::{
    exec::{Executor, ExecutorType},
    QueryChunk, QueryChunkMeta, ScanPlanBuilder,
};
use observability_deps::tracing::debug;
use predicate::Predicate;
use schema::selection::Selection;
use snafu::{ensure, ResultExt, Snafu};
use std::sync::Arc;

#[derive(Debug, Snafu)]
#[allow(missing_copy_implementations, missing_docs)]
pub enum Error {
    #[snafu(display("Error creating plan for querying Ingester data to send to Querier"))]
    FrontendError {
        source: iox_query::frontend::common::Error,
    },

    #[snafu(display("Error building logical plan for querying Ingester data to send to Querier"))]
    LogicalPlan { source: DataFusionError },

    #[snafu(display(
        "Error building physical plan for querying Ingester data to send to Querier: {}",
        source
    ))]
    PhysicalPlan { source: DataFusionError },

    #[snafu(display(
        "Error executing the query for getting Ingester data to send to Querier: {}",
        source
    ))]
    ExecutePlan { source: DataFusionError },

    #[snafu(display("Error collecting a stream of record batches: {}", source))]
    CollectStream { source: DataFusionError },

    #[snafu(display(
        "No Namespace Data found for the given namespace name {}",
        namespace_name,
    ))]
    NamespaceNotFound { namespace_name: String },

    #[snafu(display(
        "No Table Data found for the given namespace name {}, table name {}",
        namespace_name,
        table_name
    ))]
    TableNotFound {
        namespace_name: String,
        table_name: String,
    },

    #[snafu(display("Error concating same-schema record batches: {}", source))]
    ConcatBatches { source: arrow::error::ArrowError },

    #[snafu(display(
        "Cannot apply identical schema to record batches of all partitions: {}",
        source
    ))]
    InterPartitionSchemaApplication { source: arrow::error::ArrowError },

    #[snafu(display("Concurrent query request limit exceeded"))]
    RequestLimit,
}

/// A specialized `Error` for Ingester's Query errors
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Return data to send as a response back to the Querier per its request
pub async fn prepare_data_to_querier(
    ingest_data: &Arc<IngesterData>,
    request: &Arc<IngesterQueryRequest>,
) -> Result<IngesterQueryResponse> {
    debug!(?request, "prepare_data_to_querier");
    let mut unpersisted_partitions = vec![];
    let mut found_namespace = false;
    for (sequencer_id, sequencer_data) in ingest_data.sequencers() {
        debug!(sequencer_id=%sequencer_id.get());
        let namespace_data = match sequencer_data.namespace(&request.namespace) {
            Some(namespace_data) => {
                debug!(namespace=%request.namespace, "found namespace");
                found_namespace = true;
                namespace_data
            }
            None => {
                continue;
            }
        };

        let table_data = match namespace_data.table_data(&request.table) {
            Some(table_data) => {
                debug!(table_name=%request.table, "found table");
                table_data
            }
            None => {
                continue;
            }
        };

        let mut unpersisted_partition_data = {
            let table_data = table_data.read().await;
            table_data.unpersisted_partition_data()
        };
        debug!(?unpersisted_partition_data);

        unpersisted_partitions.append(&mut unpersisted_partition_data);
    }

    ensure!(
        found_namespace,
        NamespaceNotFoundSnafu {
            namespace_name: &request.namespace,
        },
    );
    ensure!(
        !unpersisted_partitions.is_empty(),
        TableNotFoundSnafu {
            namespace_name: &request.namespace,
            table_name: &request.table
        },
    );

    let ingest_data = Arc::clone(ingest_data);
    let request = Arc::clone(request);
    let partitions = futures::stream::iter(unpersisted_partitions).then(move |partition| {
        let ingest_data = Arc::clone(&ingest_data);
        let request = Arc::clone(&request);

        async move {
            // extract payload
            let partition_id = partition.partition_id;
            let status = partition.partition_status.clone();
            let snapshots: Vec<_> =
                prepare_data_to_querier_for_partition(ingest_data.exec(), partition, &request)
                    .await
                    .map_err(|e| ArrowError::ExternalError(Box::new(e)))?
                    .into_iter()
                    .map(Ok)
                    .collect();

            // Note: include partition in `unpersisted_partitions` even when there we might filter out all the data, because
            // the metadata (e.g. max persisted parquet file) is important for the querier.
            Ok(IngesterQueryPartition::new(
                Box::pin(futures::stream::iter(snapshots)),
                partition_id,
                status,
            ))
        }
    });

    Ok(IngesterQueryResponse::new(Box::pin(partitions)))
}

async fn prepare_data_to_querier_for_partition(
    executor: &Executor,
    unpersisted_partition_data: UnpersistedPartitionData,
    request: &IngesterQueryRequest,
) -> Result<Option<SendableRecordBatchStream>> {
    // ------------------------------------------------
    // Accumulate data

    // Make Filters
    let selection_columns: Vec<_> = request.columns.iter().map(String::as_str).collect();
    let selection = if selection_columns.is_empty() {
        Selection::All
    } else {
        Selection::Some(&selection_columns)
    };
    let predicate = request.predicate.clone().unwrap_or_default();

    // figure out what batches
    let queryable_batch = unpersisted_partition_data
        .persisting
        .unwrap_or_else(|| QueryableBatch::new(&request.table, vec![], vec![]))
        .with_data(unpersisted_partition_data.non_persisted);

    // No data!
    if queryable_batch.data.is_empty() {
        return Ok(None);
    }

    query(
        executor,
        Arc::new(queryable_batch),
        predicate.clone(),
        selection,
    )
    .await
    .map(Some)
}

/// Query a given Queryable Batch, applying selection and filters as appropriate
/// Return stream of record batches
pub(crate) async fn query(
    executor: &Executor,
    data: Arc<QueryableBatch>,
    predicate: Predicate,
    selection: Selection<'_>,
) -> Result<SendableRecordBatchStream> {
    // Build logical plan for filtering data
    // Note that this query will also apply the delete predicates that go with the QueryableBatch

    let mut expr = vec![];
    if let Some(filter_expr) = predicate.filter_expr() {
        expr.push(filter_expr);
    }

    // TODO: Since we have different type of servers (router,
    // ingester, compactor, and querier), we may want to add more
    // types into the ExecutorType to have better log and resource
    // managment
    let ctx = executor.new_context(ExecutorType::Query);

    // Creates an execution plan for a scan and filter data of a single chunk
    let schema = data.schema();
    let table_name = data.table_name().to_string();

    debug!(%table_name, ?predicate, "Creating single chunk scan plan");

    let logical_plan = ScanPlanBuilder::new(schema, ctx.child_ctx("scan_and_filter planning"))
        .with_predicate(&predicate)
        .with_chunks([data as _])
        .build()
        .context(FrontendSnafu)?
        .plan_builder
        .build()
        .context(LogicalPlanSnafu)?;

    debug!(%table_name, plan=%logical_plan.display_indent_schema(),
           "created single chunk scan plan");

    // Now, restrict to all columns that are relevant
    let logical_plan = match selection {
        Selection::All => logical_plan,
        Selection::Some(cols) => {
            // filter out columns that are not in the schema
            let schema = Arc::clone(logical_plan.schema());
            let cols = cols.iter().filter_map(|col_name| {
                schema
                    .index_of_column_by_name(None, col_name)
                    .ok()
                    .map(|_| datafusion::prelude::col(col_name))
            });

            LogicalPlanBuilder::from(logical_plan)
                .project(cols)
                .context(LogicalPlanSnafu)?
                .build()
                .context(LogicalPlanSnafu)?
        }
    };

    // Build physical plan
    let physical_plan = ctx
        .create_physical_plan(&logical_plan)
        .await
        .context(PhysicalPlanSnafu {})?;

    // Execute the plan and return the filtered stream
    let output_stream = ctx
        .execute_stream(physical_plan)
        .await
        .context(ExecutePlanSnafu {})?;

    Ok(output_stream)
}
