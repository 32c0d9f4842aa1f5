use std::sync::Arc;

use ddal_cluster::repo::ShardCommand;
use ddal_cluster::routing::ObjectNode;
use ddal_common::datum::{Datum, OwnedRow};
use ddal_common::error::{DdalError, DdalResult};
use ddal_common::schema::{TableMetaProvider, TableSchema};
use ddal_common::types::{ColumnId, DmlKind};

use crate::executor_update::{column, evaluate_condition, fold_constants};
use crate::expression::Expression;
use crate::framework::{render_plan, DmlExecutor, ExecutionStrategy, WritePipeline};
use crate::prepared::Delete;

pub struct DeleteExecutor {
    prepared: Delete,
    meta: Arc<dyn TableMetaProvider>,
    pipeline: WritePipeline,
    schema: Option<TableSchema>,
}

impl DeleteExecutor {
    pub fn new(prepared: Delete, meta: Arc<dyn TableMetaProvider>, pipeline: WritePipeline) -> Self {
        Self {
            prepared,
            meta,
            pipeline,
            schema: None,
        }
    }

    pub fn pipeline(&self) -> &WritePipeline {
        &self.pipeline
    }

    fn schema(&self) -> DdalResult<&TableSchema> {
        self.schema
            .as_ref()
            .ok_or_else(|| DdalError::Internal(format!("DELETE FROM {} used before prepare", self.prepared.table)))
    }

    fn evaluate(&self) -> DdalResult<Vec<(ColumnId, Datum)>> {
        evaluate_condition(self.schema()?, &self.prepared.condition, &self.prepared.params).map_err(|e| {
            let exprs: Vec<Option<Expression>> =
                self.prepared.condition.iter().map(|(_, e)| Some(e.clone())).collect();
            e.with_row(1, Expression::list_sql(&exprs))
        })
    }

    fn ensure_prepared(&mut self) -> DdalResult<()> {
        if self.schema.is_none() {
            self.prepare()?;
        }
        Ok(())
    }
}

fn delete_command(schema: &TableSchema, prepared: &Delete, node: &ObjectNode) -> DdalResult<ShardCommand> {
    let filter = prepared
        .condition
        .iter()
        .map(|(c, _)| Ok(column(schema, *c)?.name.clone()))
        .collect::<DdalResult<Vec<_>>>()?;
    Ok(ShardCommand::Delete {
        table: node.object.clone(),
        filter,
    })
}

fn condition_row(condition: &[(ColumnId, Datum)]) -> OwnedRow {
    OwnedRow::new(condition.iter().map(|(_, v)| v.clone()).collect())
}

impl DmlExecutor for DeleteExecutor {
    fn kind(&self) -> DmlKind {
        DmlKind::Delete
    }

    fn prepare(&mut self) -> DdalResult<()> {
        let schema = self.meta.table(&self.prepared.table)?.clone();
        for (col, _) in &self.prepared.condition {
            column(&schema, *col)?;
        }
        self.pipeline.router().rule(&schema.name)?;
        fold_constants(&mut self.prepared.condition);
        self.schema = Some(schema);
        Ok(())
    }

    fn update(&mut self) -> DdalResult<u64> {
        self.ensure_prepared()?;
        let ctx = self.pipeline.context();
        ctx.begin_statement();
        ctx.next_row();
        self.pipeline.reset();

        let condition = self.evaluate()?;
        let route = self.pipeline.router().route_condition(&self.prepared.table, &condition)?;
        if route.is_empty() {
            tracing::debug!(table = %self.prepared.table, "delete condition matches no shard");
            return Ok(0);
        }
        let row = condition_row(&condition);
        let (schema, prepared) = match &self.schema {
            Some(s) => (s, &self.prepared),
            None => return Err(DdalError::Internal("delete executed before prepare".into())),
        };
        let total = self.pipeline.flush_routed(&route, &row, |node, row| {
            Ok((delete_command(schema, prepared, node)?, row.values.clone()))
        })?;
        tracing::debug!(table = %self.prepared.table, nodes = route.len(), affected = total, "delete done");
        Ok(total)
    }

    fn translate(&self, node: &ObjectNode, row: &OwnedRow) -> DdalResult<(ShardCommand, Vec<Datum>)> {
        Ok((delete_command(self.schema()?, &self.prepared, node)?, row.values.clone()))
    }

    fn explain(&mut self) -> DdalResult<String> {
        self.ensure_prepared()?;
        let condition = self.evaluate()?;
        let route = self.pipeline.router().route_condition(&self.prepared.table, &condition)?;
        let row = condition_row(&condition);
        let workers = self.pipeline.plan_routed(&route, &row, |node, row| self.translate(node, row))?;
        let strategy = ExecutionStrategy::for_route(&route);
        Ok(render_plan(&format!("DELETE FROM {}", self.prepared.table), strategy, &workers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ExecutionContext, PoolHandle};
    use crate::pool::ExecutionPool;
    use crate::worker::ShardWorkerFactory;
    use ddal_cluster::repo::MemoryCluster;
    use ddal_cluster::routing::{RuleRouter, TableRule};
    use ddal_common::config::ExecutorConfig;
    use ddal_common::schema::{Catalog, ColumnDef};
    use ddal_common::types::DataType;

    fn executor(delete: Delete) -> (MemoryCluster, DeleteExecutor) {
        let mut catalog = Catalog::new();
        catalog.create_table(
            "tags",
            vec![
                ColumnDef::new(0, "id", DataType::Int32),
                ColumnDef::new(1, "name", DataType::Text),
            ],
        );
        let cluster = MemoryCluster::new();
        cluster.create_table("s0", "tags", &["id", "name"]);
        cluster.create_table("s1", "tags", &["id", "name"]);
        let router = RuleRouter::new().with_rule(TableRule::reference(
            "tags",
            vec![ObjectNode::new("s0", "tags"), ObjectNode::new("s1", "tags")],
        ));
        let ctx = ExecutionContext::with_pool(
            &ExecutorConfig::default(),
            Arc::new(PoolHandle::Owned(ExecutionPool::new(2))),
        );
        let pipeline = WritePipeline::new(
            Arc::new(router),
            Arc::new(ShardWorkerFactory::new(Arc::new(cluster.clone()))),
            Arc::new(ctx),
        );
        (cluster, DeleteExecutor::new(delete, Arc::new(catalog), pipeline))
    }

    fn seed(c: &MemoryCluster, shard: &str, ids: &[i32]) {
        let mut conn = ddal_cluster::repo::ShardConnector::connect(c, shard).unwrap();
        let rows: Vec<Vec<Datum>> = ids
            .iter()
            .map(|i| vec![Datum::Int32(*i), Datum::Text(format!("t{}", i))])
            .collect();
        conn.execute_batch(
            &ShardCommand::Insert {
                table: "tags".into(),
                columns: vec!["id".into(), "name".into()],
            },
            &rows,
            &ddal_common::cancel::CancelToken::new(),
        )
        .unwrap();
        conn.close();
    }

    #[test]
    fn test_reference_delete_reaches_every_copy() {
        let delete = Delete::new("tags")
            .filter(ColumnId(0), Expression::Parameter(1))
            .bind(vec![Datum::Text("2".into())]);
        let (c, mut ex) = executor(delete);
        seed(&c, "s0", &[1, 2, 3]);
        seed(&c, "s1", &[1, 2, 3]);
        assert_eq!(ex.update().unwrap(), 2);
        assert_eq!(c.row_count("s0", "tags"), 2);
        assert_eq!(c.row_count("s1", "tags"), 2);
    }

    #[test]
    fn test_unfiltered_delete() {
        let (c, mut ex) = executor(Delete::new("tags"));
        seed(&c, "s0", &[1, 2]);
        seed(&c, "s1", &[1, 2]);
        assert_eq!(ex.update().unwrap(), 4);
        assert_eq!(ex.translate(&ObjectNode::new("s0", "tags"), &OwnedRow::new(Vec::new())).unwrap().0.sql(), "DELETE FROM tags");
    }

    #[test]
    fn test_unbound_parameter_fails() {
        let delete = Delete::new("tags").filter(ColumnId(0), Expression::Parameter(1));
        let (c, mut ex) = executor(delete);
        let err = ex.update().unwrap_err();
        assert_eq!(err.row_number(), Some(1));
        assert_eq!(c.connections_opened(), 0);
    }

    #[test]
    fn test_explain() {
        let delete = Delete::new("tags").filter(ColumnId(1), Expression::literal("x"));
        let (_c, mut ex) = executor(delete);
        let plan = ex.explain().unwrap();
        assert!(plan.starts_with("DELETE FROM tags [MULTIPLE] workers=2 rows=2"));
        assert!(plan.contains("s0 -> DELETE FROM tags WHERE name = ? (1 row(s))"));
    }
}
