//! Merge step: run the configured SQL script against the database.
//!
//! The script is plain SQL with `{{ name }}` placeholders. Bound names are
//! `staging_table`, `run_ts` (run start, RFC 3339), `run_date` (`%Y-%m-%d`)
//! and every key of `[merge.params]`. The built-ins win over params of the
//! same name.

use crate::store::{StoreConnector, StoreError};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("cannot read merge script {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("merge script {}: no value bound for placeholder '{name}'", path.display())]
    UnboundParameter { path: PathBuf, name: String },

    #[error("merge script {}: placeholder opened at byte {offset} is never closed", path.display())]
    UnterminatedPlaceholder { path: PathBuf, offset: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A SQL script loaded from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeScript {
    path: PathBuf,
    text: String,
}

impl MergeScript {
    pub fn from_file(path: &Path) -> Result<Self, MergeError> {
        let text = std::fs::read_to_string(path).map_err(|source| MergeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(path, text))
    }

    pub fn new(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Substitute every `{{ name }}`. Text outside placeholders is copied verbatim.
    pub fn render(&self, vars: &BTreeMap<String, String>) -> Result<String, MergeError> {
        let mut out = String::with_capacity(self.text.len());
        let mut rest = self.text.as_str();
        let mut consumed = 0;

        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or_else(|| MergeError::UnterminatedPlaceholder {
                    path: self.path.clone(),
                    offset: consumed + open,
                })?;

            let name = after[..close].trim();
            let value = vars
                .get(name)
                .ok_or_else(|| MergeError::UnboundParameter {
                    path: self.path.clone(),
                    name: name.to_string(),
                })?;
            out.push_str(value);

            let advance = open + 2 + close + 2;
            consumed += advance;
            rest = &rest[advance..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// Outcome of a merge step. `script` is `None` when nothing was configured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub script: Option<PathBuf>,
}

impl MergeReport {
    pub fn skipped(&self) -> bool {
        self.script.is_none()
    }
}

pub struct Merger<'a> {
    script: Option<&'a Path>,
    params: &'a BTreeMap<String, String>,
    staging_table: &'a str,
}

impl<'a> Merger<'a> {
    pub fn new(
        script: Option<&'a Path>,
        params: &'a BTreeMap<String, String>,
        staging_table: &'a str,
    ) -> Self {
        Self {
            script,
            params,
            staging_table,
        }
    }

    /// Placeholder values for a run that started at `run_start`.
    pub fn bindings(&self, run_start: DateTime<Utc>) -> BTreeMap<String, String> {
        let mut vars = self.params.clone();
        vars.insert("staging_table".into(), self.staging_table.to_string());
        vars.insert(
            "run_ts".into(),
            run_start.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        vars.insert("run_date".into(), run_start.format("%Y-%m-%d").to_string());
        vars
    }

    /// Render the script and execute it as one batch on a fresh connection.
    pub async fn run(
        &self,
        connector: &dyn StoreConnector,
        run_start: DateTime<Utc>,
    ) -> Result<MergeReport, MergeError> {
        let Some(path) = self.script else {
            info!("no merge script configured, skipping");
            return Ok(MergeReport::default());
        };

        let sql = MergeScript::from_file(path)?.render(&self.bindings(run_start))?;
        debug!(script = %path.display(), bytes = sql.len(), "rendered merge script");

        info!(store = %connector.describe(), script = %path.display(), "executing merge");
        let mut store = connector.connect().await?;
        if let Err(e) = store.execute_script(&sql).await {
            if let Err(ce) = store.close().await {
                warn!(error = %ce, "close after failed merge");
            }
            return Err(e.into());
        }
        store.close().await?;

        info!(script = %path.display(), "merge complete");
        Ok(MergeReport {
            script: Some(path.to_path_buf()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStagingStore;
    use chrono::TimeZone;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn placeholders_are_substituted_with_or_without_spaces() {
        let script = MergeScript::new(
            "m.sql",
            "INSERT INTO {{ final_table }} SELECT * FROM {{staging_table}};",
        );
        let sql = script
            .render(&vars(&[("final_table", "stock_price"), ("staging_table", "stock_price_stage")]))
            .unwrap();
        assert_eq!(sql, "INSERT INTO stock_price SELECT * FROM stock_price_stage;");
    }

    #[test]
    fn text_without_placeholders_is_unchanged() {
        let text = "DELETE FROM stock_price_stage WHERE dt < now() - interval '30 days';\n";
        assert_eq!(MergeScript::new("m.sql", text).render(&BTreeMap::new()).unwrap(), text);
    }

    #[test]
    fn unknown_placeholder_is_an_error() {
        let err = MergeScript::new("m.sql", "SELECT {{ nope }};")
            .render(&BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, MergeError::UnboundParameter { name, .. } if name == "nope"));
    }

    #[test]
    fn unterminated_placeholder_reports_its_offset() {
        let err = MergeScript::new("m.sql", "SELECT 1; SELECT {{ x")
            .render(&vars(&[("x", "1")]))
            .unwrap_err();
        assert!(matches!(err, MergeError::UnterminatedPlaceholder { offset: 17, .. }));
    }

    #[test]
    fn builtins_shadow_params() {
        let params = vars(&[("staging_table", "wrong"), ("final_table", "stock_price")]);
        let merger = Merger::new(None, &params, "stock_price_stage");
        let at = Utc.with_ymd_and_hms(2024, 1, 5, 6, 30, 0).unwrap();
        let b = merger.bindings(at);
        assert_eq!(b["staging_table"], "stock_price_stage");
        assert_eq!(b["final_table"], "stock_price");
        assert_eq!(b["run_ts"], "2024-01-05T06:30:00Z");
        assert_eq!(b["run_date"], "2024-01-05");
    }

    #[tokio::test]
    async fn without_a_script_the_step_is_skipped() {
        let store = MemoryStagingStore::new();
        let params = BTreeMap::new();
        let report = Merger::new(None, &params, "t")
            .run(&store, Utc::now())
            .await
            .unwrap();
        assert!(report.skipped());
        assert!(store.executed_scripts().is_empty());
    }

    #[tokio::test]
    async fn rendered_script_runs_as_one_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merge_sql.sql");
        std::fs::write(
            &path,
            "INSERT INTO {{ final_table }} SELECT * FROM {{ staging_table }} ON CONFLICT DO NOTHING;\n\
             TRUNCATE {{ staging_table }};\n",
        )
        .unwrap();

        let store = MemoryStagingStore::new();
        let params = vars(&[("final_table", "stock_price")]);
        let report = Merger::new(Some(&path), &params, "stock_price_stage")
            .run(&store, Utc::now())
            .await
            .unwrap();

        assert_eq!(report.script.as_deref(), Some(path.as_path()));
        let scripts = store.executed_scripts();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].starts_with("INSERT INTO stock_price SELECT * FROM stock_price_stage"));
        assert!(scripts[0].contains("TRUNCATE stock_price_stage;"));
    }

    #[tokio::test]
    async fn missing_script_file_fails_before_connecting() {
        let store = MemoryStagingStore::new();
        let params = BTreeMap::new();
        let missing = Path::new("/nonexistent/merge.sql");
        let err = Merger::new(Some(missing), &params, "t")
            .run(&store, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::Io { .. }));
    }
}
