//! Call history in the hosted database, through its PostgREST interface.

use anyhow::{bail, Context};
use async_trait::async_trait;
use bonded::{
    call::{CallLogId, CallLogStore, CallLogUpdate, NewCallLog},
    error::Error,
};
use serde::Deserialize;

use crate::config::RestConfig;

#[derive(Clone)]
pub struct RestCallLog {
    client: reqwest::Client,
    config: RestConfig,
}

/// the id column may be a serial or a uuid
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RowId {
    Number(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct InsertedRow {
    id: RowId,
}

impl RestCallLog {
    pub fn new(config: RestConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.config.api_key)
            .header("Authorization", format!("Bearer {}", self.config.bearer()))
    }

    async fn insert_row(&self, entry: &NewCallLog) -> anyhow::Result<CallLogId> {
        let response = self
            .request(reqwest::Method::POST, &self.config.table_url())
            .header("Prefer", "return=representation")
            .json(entry)
            .send()
            .await
            .context("call log insert request")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("call log insert failed: {status} {body}");
        }
        let rows = response
            .json::<Vec<InsertedRow>>()
            .await
            .context("call log insert response")?;
        match rows.into_iter().next() {
            Some(row) => Ok(row_id(row.id)),
            None => bail!("call log insert returned no rows"),
        }
    }

    async fn update_row(&self, id: &CallLogId, update: &CallLogUpdate) -> anyhow::Result<()> {
        let url = update_url(&self.config, id);
        let response = self
            .request(reqwest::Method::PATCH, &url)
            .json(update)
            .send()
            .await
            .context("call log update request")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("call log update failed: {status} {body}");
        }
        Ok(())
    }
}

fn row_id(id: RowId) -> CallLogId {
    match id {
        RowId::Number(n) => CallLogId(n.to_string()),
        RowId::Text(s) => CallLogId(s),
    }
}

fn update_url(config: &RestConfig, id: &CallLogId) -> String {
    format!("{}?id=eq.{}", config.table_url(), id)
}

#[async_trait]
impl CallLogStore for RestCallLog {
    async fn insert(&self, entry: NewCallLog) -> Result<CallLogId, Error> {
        self.insert_row(&entry)
            .await
            .map_err(|e| Error::CallLog(format!("{e:#}")))
    }

    async fn update(&self, id: &CallLogId, update: CallLogUpdate) -> Result<(), Error> {
        self.update_row(id, &update)
            .await
            .map_err(|e| Error::CallLog(format!("{e:#}")))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bonded::call::CallLogStatus;

    fn config() -> RestConfig {
        RestConfig {
            base_url: "https://example.supabase.co".into(),
            api_key: "anon".into(),
            access_token: Some("jwt".into()),
            table: "call_logs".into(),
        }
    }

    #[test]
    fn update_targets_row_by_id() {
        let url = update_url(&config(), &CallLogId("42".into()));
        assert_eq!(url, "https://example.supabase.co/rest/v1/call_logs?id=eq.42");
    }

    #[test]
    fn accepts_numeric_and_text_ids() -> anyhow::Result<()> {
        let rows: Vec<InsertedRow> = serde_json::from_str(r#"[{"id": 7, "status": "missed"}]"#)?;
        let id = rows.into_iter().next().map(|r| row_id(r.id));
        assert_eq!(id, Some(CallLogId("7".into())));

        let rows: Vec<InsertedRow> =
            serde_json::from_str(r#"[{"id": "5b0c3d2e-9a7e-4c1e-8d52-0a3c1f3b6a11"}]"#)?;
        let id = rows.into_iter().next().map(|r| row_id(r.id));
        assert_eq!(
            id,
            Some(CallLogId("5b0c3d2e-9a7e-4c1e-8d52-0a3c1f3b6a11".into()))
        );
        Ok(())
    }

    #[test]
    fn insert_body_matches_table_columns() -> anyhow::Result<()> {
        let started_at = "2024-05-01T10:00:00Z".parse()?;
        let entry = NewCallLog {
            caller_id: "u1".parse()?,
            receiver_id: "u2".parse()?,
            status: CallLogStatus::Missed,
            started_at,
        };
        assert_eq!(
            serde_json::to_value(&entry)?,
            serde_json::json!({
                "caller_id": "u1",
                "receiver_id": "u2",
                "status": "missed",
                "started_at": "2024-05-01T10:00:00Z"
            })
        );
        Ok(())
    }
}
