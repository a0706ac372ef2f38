//! Automation flow definitions.

use super::{now, rows, Store};
use uuid::Uuid;
use zaprelay_core::{
    error::RelayError,
    flow::{Flow, FlowEdge, FlowNode, TriggerType},
};

/// Fields for creating a flow.
#[derive(Debug, Clone)]
pub struct NewFlow {
    pub name: String,
    pub trigger_type: TriggerType,
    pub trigger_value: String,
    pub intent_triggers: Vec<String>,
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
}

impl Store {
    pub async fn create_flow(&self, tenant_id: &str, flow: &NewFlow) -> Result<Flow, RelayError> {
        let id = Uuid::new_v4().to_string();
        let ts = now();
        sqlx::query(
            "INSERT INTO flows \
             (id, tenant_id, name, trigger_type, trigger_value, intent_triggers, nodes, edges, \
              is_active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&id)
        .bind(tenant_id)
        .bind(&flow.name)
        .bind(flow.trigger_type.as_str())
        .bind(&flow.trigger_value)
        .bind(rows::to_json(&flow.intent_triggers)?)
        .bind(rows::to_json(&flow.nodes)?)
        .bind(rows::to_json(&flow.edges)?)
        .bind(&ts)
        .bind(&ts)
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Store(format!("create flow failed: {e}")))?;

        let sql = format!("SELECT {} FROM flows WHERE id = ?", rows::FLOW_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(&id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("query failed: {e}")))?;
        rows::flow(&row)
    }

    /// Active flows of a tenant in creation order.
    pub async fn active_flows(&self, tenant_id: &str) -> Result<Vec<Flow>, RelayError> {
        let sql = format!(
            "SELECT {} FROM flows WHERE tenant_id = ? AND is_active = 1 \
             ORDER BY created_at ASC, rowid ASC",
            rows::FLOW_COLUMNS
        );
        let found = sqlx::query(&sql)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("query failed: {e}")))?;
        found.iter().map(rows::flow).collect()
    }
}
