use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::amas::persistence::{AmasRepository, RepositoryError, UserStateProvider};
use crate::amas::types::{
    BanditModel, CognitiveProfile, DecisionTrace, PersistedBanditModel, UserState,
};
use crate::db::DatabaseProxy;
use crate::services::decision_recorder::{DecisionInsight, DecisionStore, StoreError};

const BANDIT_MODEL_TYPE: &str = "bandit";

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

pub struct PgAmasRepository {
    proxy: Arc<DatabaseProxy>,
}

impl PgAmasRepository {
    pub fn new(proxy: Arc<DatabaseProxy>) -> Self {
        Self { proxy }
    }
}

#[async_trait]
impl AmasRepository for PgAmasRepository {
    async fn load_state(&self, user_id: &str) -> Result<Option<UserState>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT "attention", "fatigue", "motivation", "cognitiveProfile", "confidence", "updatedAt"
            FROM "amas_user_states"
            WHERE "userId" = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(self.proxy.pool())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let cognitive: serde_json::Value = row.try_get("cognitiveProfile")?;
        let updated_at: DateTime<Utc> = row.try_get("updatedAt")?;
        Ok(Some(UserState {
            attention: row.try_get("attention")?,
            fatigue: row.try_get("fatigue")?,
            cognitive: serde_json::from_value::<CognitiveProfile>(cognitive).unwrap_or_default(),
            motivation: row.try_get("motivation")?,
            conf: row.try_get("confidence")?,
            ts: updated_at.timestamp_millis(),
        }))
    }

    async fn save_state(&self, user_id: &str, state: &UserState) -> Result<(), RepositoryError> {
        let cognitive = serde_json::to_value(&state.cognitive)?;
        sqlx::query(
            r#"
            INSERT INTO "amas_user_states" (
                "userId", "attention", "fatigue", "motivation",
                "cognitiveProfile", "confidence", "updatedAt"
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT ("userId") DO UPDATE SET
                "attention" = EXCLUDED."attention",
                "fatigue" = EXCLUDED."fatigue",
                "motivation" = EXCLUDED."motivation",
                "cognitiveProfile" = EXCLUDED."cognitiveProfile",
                "confidence" = EXCLUDED."confidence",
                "updatedAt" = EXCLUDED."updatedAt"
            "#,
        )
        .bind(user_id)
        .bind(state.attention)
        .bind(state.fatigue)
        .bind(state.motivation)
        .bind(cognitive)
        .bind(state.conf)
        .bind(millis_to_datetime(state.ts))
        .execute(self.proxy.pool())
        .await?;
        Ok(())
    }

    async fn load_model(&self, user_id: &str) -> Result<Option<BanditModel>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT "parameters" FROM "amas_user_models"
            WHERE "userId" = $1 AND "modelType" = $2
            "#,
        )
        .bind(user_id)
        .bind(BANDIT_MODEL_TYPE)
        .fetch_optional(self.proxy.pool())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let parameters: serde_json::Value = row.try_get("parameters")?;
        let persisted: PersistedBanditModel = serde_json::from_value(parameters)?;
        Ok(Some(persisted.into_current()))
    }

    async fn save_model(&self, user_id: &str, model: &BanditModel) -> Result<(), RepositoryError> {
        let parameters = serde_json::to_value(PersistedBanditModel::from(model.clone()))?;
        sqlx::query(
            r#"
            INSERT INTO "amas_user_models" ("userId", "modelType", "parameters", "updatedAt")
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT ("userId", "modelType") DO UPDATE SET
                "parameters" = EXCLUDED."parameters",
                "updatedAt" = EXCLUDED."updatedAt"
            "#,
        )
        .bind(user_id)
        .bind(BANDIT_MODEL_TYPE)
        .bind(parameters)
        .execute(self.proxy.pool())
        .await?;
        Ok(())
    }

    async fn delete_model(&self, user_id: &str) -> Result<(), RepositoryError> {
        sqlx::query(r#"DELETE FROM "amas_user_models" WHERE "userId" = $1 AND "modelType" = $2"#)
            .bind(user_id)
            .bind(BANDIT_MODEL_TYPE)
            .execute(self.proxy.pool())
            .await?;
        Ok(())
    }

    async fn load_snapshot(&self, name: &str) -> Result<Option<serde_json::Value>, RepositoryError> {
        let row = sqlx::query(r#"SELECT "payload" FROM "amas_snapshots" WHERE "name" = $1"#)
            .bind(name)
            .fetch_optional(self.proxy.pool())
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("payload")?)),
            None => Ok(None),
        }
    }

    async fn save_snapshot(&self, name: &str, payload: &serde_json::Value) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO "amas_snapshots" ("name", "payload", "updatedAt")
            VALUES ($1, $2, NOW())
            ON CONFLICT ("name") DO UPDATE SET
                "payload" = EXCLUDED."payload",
                "updatedAt" = EXCLUDED."updatedAt"
            "#,
        )
        .bind(name)
        .bind(payload)
        .execute(self.proxy.pool())
        .await?;
        Ok(())
    }
}

#[async_trait]
impl UserStateProvider for PgAmasRepository {
    async fn get_user_state(&self, user_id: &str) -> Option<UserState> {
        match self.load_state(user_id).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to load user state");
                None
            }
        }
    }
}

pub struct PgDecisionStore {
    proxy: Arc<DatabaseProxy>,
}

impl PgDecisionStore {
    pub fn new(proxy: Arc<DatabaseProxy>) -> Self {
        Self { proxy }
    }
}

async fn upsert_record(
    tx: &mut sqlx::PgConnection,
    trace: &DecisionTrace,
    status: &str,
    error: Option<&str>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO "decision_records" (
            "decisionId", "userId", "timestamp", "decisionSource", "stateSnapshot",
            "weightsSnapshot", "selectedAction", "confidence", "reward", "featureVector",
            "traceVersion", "isSimulation", "status", "error"
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT ("decisionId") DO UPDATE SET
            "userId" = EXCLUDED."userId",
            "timestamp" = EXCLUDED."timestamp",
            "decisionSource" = EXCLUDED."decisionSource",
            "stateSnapshot" = EXCLUDED."stateSnapshot",
            "weightsSnapshot" = EXCLUDED."weightsSnapshot",
            "selectedAction" = EXCLUDED."selectedAction",
            "confidence" = EXCLUDED."confidence",
            "reward" = EXCLUDED."reward",
            "featureVector" = EXCLUDED."featureVector",
            "traceVersion" = EXCLUDED."traceVersion",
            "isSimulation" = EXCLUDED."isSimulation",
            "status" = EXCLUDED."status",
            "error" = EXCLUDED."error"
        "#,
    )
    .bind(&trace.decision_id)
    .bind(&trace.user_id)
    .bind(millis_to_datetime(trace.timestamp))
    .bind(trace.decision_source.as_str())
    .bind(&trace.state_snapshot)
    .bind(&trace.weights_snapshot)
    .bind(serde_json::to_value(&trace.selected_action)?)
    .bind(trace.confidence)
    .bind(trace.reward)
    .bind(&trace.feature_vector)
    .bind(trace.trace_version as i32)
    .bind(trace.is_simulation)
    .bind(status)
    .bind(error)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

async fn replace_stages(tx: &mut sqlx::PgConnection, trace: &DecisionTrace) -> Result<(), StoreError> {
    sqlx::query(r#"DELETE FROM "pipeline_stages" WHERE "decisionId" = $1"#)
        .bind(&trace.decision_id)
        .execute(&mut *tx)
        .await?;

    for stage in &trace.pipeline_stages {
        sqlx::query(
            r#"
            INSERT INTO "pipeline_stages" (
                "id", "decisionId", "stage", "stageOrder", "stageName", "status",
                "startedAt", "endedAt", "durationMs", "inputSummary", "outputSummary", "errorMessage"
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(uuid::Uuid::new_v4())
        .bind(&trace.decision_id)
        .bind(stage.stage.as_str())
        .bind(stage.stage.order())
        .bind(&stage.stage_name)
        .bind(stage.status.as_str())
        .bind(millis_to_datetime(stage.started_at))
        .bind(stage.ended_at.map(millis_to_datetime))
        .bind(stage.duration_ms)
        .bind(&stage.input_summary)
        .bind(&stage.output_summary)
        .bind(&stage.error_message)
        .execute(&mut *tx)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl DecisionStore for PgDecisionStore {
    async fn persist_batch(&self, traces: &[DecisionTrace]) -> Result<(), StoreError> {
        let mut tx = self.proxy.pool().begin().await?;
        for trace in traces {
            upsert_record(&mut tx, trace, "SUCCESS", None).await?;
            replace_stages(&mut tx, trace).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn mark_failed(&self, trace: &DecisionTrace, error: &str) -> Result<(), StoreError> {
        let mut conn = self.proxy.pool().acquire().await?;
        upsert_record(&mut conn, trace, "FAILED", Some(error)).await
    }

    async fn write_insights(&self, insights: &[DecisionInsight]) -> Result<(), StoreError> {
        let mut tx = self.proxy.pool().begin().await?;
        for insight in insights {
            sqlx::query(
                r#"
                INSERT INTO "decision_insights" (
                    "decisionId", "userId", "featureHash", "stateSnapshot",
                    "selectedAction", "confidence", "reward", "createdAt"
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT ("decisionId") DO UPDATE SET
                    "featureHash" = EXCLUDED."featureHash",
                    "stateSnapshot" = EXCLUDED."stateSnapshot",
                    "selectedAction" = EXCLUDED."selectedAction",
                    "confidence" = EXCLUDED."confidence",
                    "reward" = EXCLUDED."reward"
                "#,
            )
            .bind(&insight.decision_id)
            .bind(&insight.user_id)
            .bind(&insight.feature_hash)
            .bind(&insight.state_snapshot)
            .bind(serde_json::to_value(&insight.selected_action)?)
            .bind(insight.confidence)
            .bind(insight.reward)
            .bind(millis_to_datetime(insight.created_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
