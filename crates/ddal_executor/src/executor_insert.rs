//! INSERT ... VALUES and INSERT ... SELECT.

use std::sync::Arc;

use ddal_cluster::repo::ShardCommand;
use ddal_cluster::routing::ObjectNode;
use ddal_common::datum::{Datum, OwnedRow};
use ddal_common::error::{DdalError, DdalResult};
use ddal_common::schema::{TableMetaProvider, TableSchema};
use ddal_common::types::DmlKind;

use crate::expression::Expression;
use crate::framework::{render_plan, DmlExecutor, WritePipeline};
use crate::prepared::{Insert, ResultTarget};
use crate::row_buffer::RowBuffer;
use crate::row_builder::RowBuilder;

/// Builds logical rows, buffers them and flushes every `flush_threshold`
/// rows through the write pipeline. Also the push target of an
/// INSERT ... SELECT source.
pub struct InsertExecutor {
    prepared: Insert,
    meta: Arc<dyn TableMetaProvider>,
    pipeline: WritePipeline,
    builder: Option<RowBuilder>,
    buffer: RowBuffer,
    pushed: u64,
}

impl InsertExecutor {
    pub fn new(prepared: Insert, meta: Arc<dyn TableMetaProvider>, pipeline: WritePipeline) -> Self {
        let buffer = RowBuffer::new(pipeline.context().flush_threshold());
        Self {
            prepared,
            meta,
            pipeline,
            builder: None,
            buffer,
            pushed: 0,
        }
    }

    pub fn pipeline(&self) -> &WritePipeline {
        &self.pipeline
    }

    fn builder(&self) -> DdalResult<&RowBuilder> {
        self.builder
            .as_ref()
            .ok_or_else(|| DdalError::Internal(format!("INSERT INTO {} used before prepare", self.prepared.table)))
    }

    fn ensure_prepared(&mut self) -> DdalResult<()> {
        if self.builder.is_none() {
            self.prepare()?;
        }
        Ok(())
    }

    fn insert_literal_rows(&mut self, rows: &[Vec<Option<Expression>>]) -> DdalResult<()> {
        for exprs in rows {
            let n = self.pipeline.context().next_row();
            self.prepared.current_row = n;
            let row = self.builder()?.build(exprs, &self.prepared.params, n)?;
            self.push_row(row)?;
        }
        Ok(())
    }

    fn push_row(&mut self, row: OwnedRow) -> DdalResult<()> {
        self.pushed += 1;
        if self.buffer.push(row) {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> DdalResult<u64> {
        let rows = self.buffer.take();
        if rows.is_empty() {
            return Ok(0);
        }
        let schema = match &self.builder {
            Some(b) => b.schema(),
            None => return Err(DdalError::Internal("insert flushed before prepare".into())),
        };
        self.pipeline
            .flush_rows(&self.prepared.table, rows, |node, row| Ok(insert_command(schema, node, row)))
    }
}

/// Every table column is sent so that defaults resolved by the row builder
/// reach the shard.
fn insert_command(schema: &TableSchema, node: &ObjectNode, row: &OwnedRow) -> (ShardCommand, Vec<Datum>) {
    let command = ShardCommand::Insert {
        table: node.object.clone(),
        columns: schema.columns.iter().map(|c| c.name.clone()).collect(),
    };
    (command, row.values.clone())
}

impl DmlExecutor for InsertExecutor {
    fn kind(&self) -> DmlKind {
        DmlKind::Insert
    }

    fn prepare(&mut self) -> DdalResult<()> {
        let schema = self.meta.table(&self.prepared.table)?.clone();
        self.pipeline.router().rule(&schema.name)?;
        self.builder = Some(RowBuilder::new(schema, self.prepared.columns.clone())?);
        Ok(())
    }

    fn update(&mut self) -> DdalResult<u64> {
        self.ensure_prepared()?;
        self.pipeline.context().begin_statement();
        self.pipeline.reset();
        self.buffer.clear();
        self.pushed = 0;

        if let Some(mut source) = self.prepared.query.take() {
            let result = source.query(self);
            self.prepared.query = Some(source);
            result?;
        } else {
            let rows = std::mem::take(&mut self.prepared.rows);
            let result = self.insert_literal_rows(&rows);
            self.prepared.rows = rows;
            result?;
        }
        // A failed row leaves its buffered predecessors unflushed.
        self.flush()?;
        let total = self.pipeline.total();
        tracing::debug!(table = %self.prepared.table, rows = self.pushed, affected = total, "insert done");
        Ok(total)
    }

    fn translate(&self, node: &ObjectNode, row: &OwnedRow) -> DdalResult<(ShardCommand, Vec<Datum>)> {
        Ok(insert_command(self.builder()?.schema(), node, row))
    }

    fn explain(&mut self) -> DdalResult<String> {
        self.ensure_prepared()?;
        let header = format!("INSERT INTO {}", self.prepared.table);
        if self.prepared.query.is_some() {
            let rule = self.pipeline.router().rule(&self.prepared.table)?;
            let mut out = format!("{} ... SELECT [routed per row] nodes={}", header, rule.nodes.len());
            for node in &rule.nodes {
                out.push_str(&format!("\n  {}", node));
            }
            return Ok(out);
        }
        let builder = self.builder()?;
        let mut rows = Vec::with_capacity(self.prepared.rows.len());
        for (i, exprs) in self.prepared.rows.iter().enumerate() {
            rows.push(builder.build(exprs, &self.prepared.params, i + 1)?);
        }
        let schema = builder.schema();
        let workers = self
            .pipeline
            .plan_rows(&self.prepared.table, &rows, |node, row| Ok(insert_command(schema, node, row)))?;
        let strategy = self.pipeline.strategy_for(&workers);
        let workers = self.pipeline.prepare_workers(workers, strategy);
        Ok(render_plan(&header, strategy, &workers))
    }
}

impl ResultTarget for InsertExecutor {
    fn add_row(&mut self, values: Vec<Datum>) -> DdalResult<()> {
        let n = self.pipeline.context().next_row();
        self.prepared.current_row = n;
        let row = self.builder()?.build_values(values, n)?;
        self.push_row(row)
    }

    fn row_count(&self) -> u64 {
        self.pushed
    }
}
