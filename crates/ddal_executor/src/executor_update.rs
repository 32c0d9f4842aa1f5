//! UPDATE with a conjunctive equality condition.

use std::sync::Arc;

use ddal_cluster::repo::ShardCommand;
use ddal_cluster::routing::ObjectNode;
use ddal_common::datum::{Datum, OwnedRow};
use ddal_common::error::{DdalError, DdalResult, MetadataError};
use ddal_common::schema::{ColumnDef, TableMetaProvider, TableSchema};
use ddal_common::types::{ColumnId, DmlKind};

use crate::expression::Expression;
use crate::framework::{render_plan, DmlExecutor, ExecutionStrategy, WritePipeline};
use crate::prepared::Update;

pub struct UpdateExecutor {
    prepared: Update,
    meta: Arc<dyn TableMetaProvider>,
    pipeline: WritePipeline,
    schema: Option<TableSchema>,
}

impl UpdateExecutor {
    pub fn new(prepared: Update, meta: Arc<dyn TableMetaProvider>, pipeline: WritePipeline) -> Self {
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
            .ok_or_else(|| DdalError::Internal(format!("UPDATE {} used before prepare", self.prepared.table)))
    }

    /// Evaluated SET values followed by condition values, converted to their
    /// column types. Conversion failures are attributed to row 1.
    fn evaluate(&self) -> DdalResult<(OwnedRow, Vec<(ColumnId, Datum)>)> {
        let schema = self.schema()?;
        let params = &self.prepared.params;
        let attribute = |e: DdalError| e.with_row(1, self.source_sql());
        let mut values = Vec::with_capacity(self.prepared.assignments.len() + self.prepared.condition.len());
        for (col, expr) in &self.prepared.assignments {
            let def = column(schema, *col)?;
            let v = expr.value(params).map_err(|e| attribute(e.into()))?;
            values.push(def.convert(v).map_err(|e| attribute(e.into()))?);
        }
        let condition = evaluate_condition(schema, &self.prepared.condition, params)
            .map_err(attribute)?;
        values.extend(condition.iter().map(|(_, v)| v.clone()));
        Ok((OwnedRow::new(values), condition))
    }

    fn source_sql(&self) -> String {
        let exprs: Vec<Option<Expression>> = self
            .prepared
            .assignments
            .iter()
            .chain(&self.prepared.condition)
            .map(|(_, e)| Some(e.clone()))
            .collect();
        Expression::list_sql(&exprs)
    }

    fn ensure_prepared(&mut self) -> DdalResult<()> {
        if self.schema.is_none() {
            self.prepare()?;
        }
        Ok(())
    }
}

pub(crate) fn column(schema: &TableSchema, col: ColumnId) -> DdalResult<&ColumnDef> {
    schema.column(col).ok_or_else(|| {
        MetadataError::UnknownColumn {
            table: schema.name.clone(),
            column: col.to_string(),
        }
        .into()
    })
}

/// Condition values converted to their column types. NULL is kept: it
/// matches nothing rather than violating NOT NULL.
pub(crate) fn evaluate_condition(
    schema: &TableSchema,
    condition: &[(ColumnId, Expression)],
    params: &[Datum],
) -> DdalResult<Vec<(ColumnId, Datum)>> {
    let mut out = Vec::with_capacity(condition.len());
    for (col, expr) in condition {
        let def = column(schema, *col)?;
        let v = expr.value(params)?.convert_to(&def.data_type, &def.name)?;
        out.push((*col, v));
    }
    Ok(out)
}

/// Fold parameter-free expressions to literals once per prepare. An
/// expression that fails to fold is kept and fails at execution, where the
/// error carries row attribution.
pub(crate) fn fold_constants(exprs: &mut [(ColumnId, Expression)]) {
    for (_, expr) in exprs.iter_mut() {
        if expr.is_constant() && !matches!(expr, Expression::Literal(_)) {
            if let Ok(folded) = expr.optimize(&[]) {
                *expr = folded;
            }
        }
    }
}

fn update_command(schema: &TableSchema, prepared: &Update, node: &ObjectNode) -> DdalResult<ShardCommand> {
    let names = |cols: &[(ColumnId, Expression)]| -> DdalResult<Vec<String>> {
        cols.iter().map(|(c, _)| Ok(column(schema, *c)?.name.clone())).collect()
    };
    Ok(ShardCommand::Update {
        table: node.object.clone(),
        set: names(&prepared.assignments)?,
        filter: names(&prepared.condition)?,
    })
}

impl DmlExecutor for UpdateExecutor {
    fn kind(&self) -> DmlKind {
        DmlKind::Update
    }

    fn prepare(&mut self) -> DdalResult<()> {
        let schema = self.meta.table(&self.prepared.table)?.clone();
        for (col, _) in self.prepared.assignments.iter().chain(&self.prepared.condition) {
            column(&schema, *col)?;
        }
        let assigned: Vec<ColumnId> = self.prepared.assignments.iter().map(|(c, _)| *c).collect();
        self.pipeline.router().check_update(&schema.name, &assigned)?;
        fold_constants(&mut self.prepared.assignments);
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
        if self.prepared.assignments.is_empty() {
            return Ok(0);
        }

        let (row, condition) = self.evaluate()?;
        let route = self.pipeline.router().route_condition(&self.prepared.table, &condition)?;
        if route.is_empty() {
            tracing::debug!(table = %self.prepared.table, "update condition matches no shard");
            return Ok(0);
        }
        let (schema, prepared) = match &self.schema {
            Some(s) => (s, &self.prepared),
            None => return Err(DdalError::Internal("update executed before prepare".into())),
        };
        let total = self.pipeline.flush_routed(&route, &row, |node, row| {
            Ok((update_command(schema, prepared, node)?, row.values.clone()))
        })?;
        tracing::debug!(table = %self.prepared.table, nodes = route.len(), affected = total, "update done");
        Ok(total)
    }

    fn translate(&self, node: &ObjectNode, row: &OwnedRow) -> DdalResult<(ShardCommand, Vec<Datum>)> {
        Ok((update_command(self.schema()?, &self.prepared, node)?, row.values.clone()))
    }

    fn explain(&mut self) -> DdalResult<String> {
        self.ensure_prepared()?;
        let header = format!("UPDATE {}", self.prepared.table);
        let (row, condition) = self.evaluate()?;
        let route = self.pipeline.router().route_condition(&self.prepared.table, &condition)?;
        let workers = self.pipeline.plan_routed(&route, &row, |node, row| self.translate(node, row))?;
        let strategy = ExecutionStrategy::for_route(&route);
        Ok(render_plan(&header, strategy, &workers))
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
    use ddal_common::error::RoutingError;
    use ddal_common::schema::Catalog;
    use ddal_common::types::DataType;

    fn executor(update: Update) -> (MemoryCluster, UpdateExecutor) {
        let mut catalog = Catalog::new();
        catalog.create_table(
            "accounts",
            vec![
                ColumnDef::new(0, "id", DataType::Int64).not_null(),
                ColumnDef::new(1, "balance", DataType::Int64).not_null(),
            ],
        );
        let cluster = MemoryCluster::new();
        let mut nodes = Vec::new();
        for i in 0..3 {
            cluster.create_table(&format!("s{}", i), &format!("accounts_{}", i), &["id", "balance"]);
            nodes.push(ObjectNode::new(format!("s{}", i), format!("accounts_{}", i)));
        }
        let router = RuleRouter::new().with_rule(TableRule::hash("accounts", vec![(ColumnId(0), "id".into())], nodes));
        let ctx = ExecutionContext::with_pool(
            &ExecutorConfig::default(),
            Arc::new(PoolHandle::Owned(ExecutionPool::new(2))),
        );
        let pipeline = WritePipeline::new(
            Arc::new(router),
            Arc::new(ShardWorkerFactory::new(Arc::new(cluster.clone()))),
            Arc::new(ctx),
        );
        (cluster, UpdateExecutor::new(update, Arc::new(catalog), pipeline))
    }

    #[test]
    fn test_shard_key_assignment_rejected() {
        let update = Update::new("accounts").set(ColumnId(0), Expression::literal(5i64));
        let (_c, mut ex) = executor(update);
        assert!(matches!(
            ex.prepare(),
            Err(DdalError::Routing(RoutingError::ShardKeyUpdate { .. }))
        ));
    }

    #[test]
    fn test_pinned_key_targets_one_shard() {
        let update = Update::new("accounts")
            .set(ColumnId(1), Expression::Parameter(1))
            .filter(ColumnId(0), Expression::literal(42i64))
            .bind(vec![Datum::Int64(100)]);
        let (c, mut ex) = executor(update);
        assert_eq!(ex.update().unwrap(), 0);
        let trips: u64 = (0..3).map(|i| c.round_trips_on(&format!("s{}", i))).sum();
        assert_eq!(trips, 1);
    }

    #[test]
    fn test_broadcast_update_sums_shards() {
        let (c, mut ex) = executor(Update::new("accounts").set(ColumnId(1), Expression::literal(0i64)));
        // Seed one row per shard directly.
        for i in 0..3 {
            let mut conn = ddal_cluster::repo::ShardConnector::connect(&c, &format!("s{}", i)).unwrap();
            conn.execute_batch(
                &ShardCommand::Insert {
                    table: format!("accounts_{}", i),
                    columns: vec!["id".into(), "balance".into()],
                },
                &[vec![Datum::Int64(i), Datum::Int64(10)]],
                &ddal_common::cancel::CancelToken::new(),
            )
            .unwrap();
            conn.close();
        }
        assert_eq!(ex.update().unwrap(), 3);
        assert_eq!(c.rows("s2", "accounts_2")[0][1], Datum::Int64(0));
    }

    #[test]
    fn test_conversion_error_names_row_one() {
        let update = Update::new("accounts")
            .set(ColumnId(1), Expression::literal("lots"))
            .filter(ColumnId(0), Expression::literal(1i64));
        let (c, mut ex) = executor(update);
        let err = ex.update().unwrap_err();
        assert_eq!(err.row_number(), Some(1));
        assert!(err.to_string().contains("('lots', 1)"));
        assert_eq!(c.connections_opened(), 0);
    }

    #[test]
    fn test_prepare_folds_constant_expressions() {
        let update = Update::new("accounts")
            .set(ColumnId(1), Expression::negate(Expression::literal(5i64)))
            .filter(ColumnId(0), Expression::cast(Expression::literal("7"), DataType::Int64));
        let (_c, mut ex) = executor(update);
        ex.prepare().unwrap();
        assert_eq!(ex.prepared.assignments[0].1, Expression::Literal(Datum::Int64(-5)));
        assert_eq!(ex.prepared.condition[0].1, Expression::Literal(Datum::Int64(7)));
    }

    #[test]
    fn test_unfoldable_constant_fails_at_execution() {
        let mut exprs = vec![
            (ColumnId(1), Expression::negate(Expression::literal("abc"))),
            (ColumnId(0), Expression::negate(Expression::Parameter(1))),
        ];
        fold_constants(&mut exprs);
        assert!(matches!(exprs[0].1, Expression::Negate(_)));
        assert!(matches!(exprs[1].1, Expression::Negate(_)));

        let update = Update::new("accounts")
            .set(ColumnId(1), Expression::negate(Expression::literal("abc")))
            .filter(ColumnId(0), Expression::literal(1i64));
        let (c, mut ex) = executor(update);
        let err = ex.update().unwrap_err();
        assert_eq!(err.row_number(), Some(1));
        assert!(err.to_string().contains("(-'abc', 1)"));
        assert_eq!(c.connections_opened(), 0);
    }

    #[test]
    fn test_null_key_matches_nothing() {
        let update = Update::new("accounts")
            .set(ColumnId(1), Expression::literal(1i64))
            .filter(ColumnId(0), Expression::Literal(Datum::Null));
        let (c, mut ex) = executor(update);
        assert_eq!(ex.update().unwrap(), 0);
        assert_eq!(c.connections_opened(), 0);
    }

    #[test]
    fn test_explain_lists_nodes() {
        let (_c, mut ex) = executor(Update::new("accounts").set(ColumnId(1), Expression::literal(0i64)));
        let plan = ex.explain().unwrap();
        assert!(plan.starts_with("UPDATE accounts [MULTIPLE] workers=3"));
        assert!(plan.contains("s1 -> UPDATE accounts_1 SET balance = ?"));
    }
}
