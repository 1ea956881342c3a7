use std::path::PathBuf;

use anyhow::Result;
use pants_core::{
    Inquest, InquestId, NewInquest, NewRuling, PantsError, Ruling, SeenSet, VoteTally,
};
use pants_store_sqlite::{SchemaStatus, SqliteStore};
use rand::Rng;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateInquestRequest {
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordVoteRequest {
    pub vote: Option<String>,
}

/// An Inquest together with its navigation neighbors and vote counts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InquestView {
    pub inquest: Inquest,
    pub predecessor_id: Option<InquestId>,
    pub successor_id: Option<InquestId>,
    pub tally: VoteTally,
}

/// What the presentation layer shows next: one Inquest, or the "nothing left" state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Pick {
    Found { inquest: Box<InquestView> },
    #[serde(rename = "none")]
    Exhausted,
}

impl Pick {
    #[must_use]
    pub fn inquest_id(&self) -> Option<InquestId> {
        match self {
            Self::Found { inquest } => Some(inquest.inquest.id),
            Self::Exhausted => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleOutcome {
    pub ruling: Ruling,
    pub next: Pick,
}

#[derive(Debug, Clone)]
pub struct PantsApi {
    db_path: PathBuf,
}

impl PantsApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = SqliteStore::open(&self.db_path)?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Validate and persist a new Inquest stamped with the current time.
    ///
    /// # Errors
    /// Returns [`PantsError::Validation`] for a bad `image_url`, or a storage error.
    pub fn create_inquest(&self, input: CreateInquestRequest) -> Result<InquestView> {
        self.create_inquest_at(input.image_url, OffsetDateTime::now_utc())
    }

    /// Validate and persist a new Inquest with an operator-chosen `created_at`.
    ///
    /// Only for trusted callers such as the CLI importing existing pictures.
    ///
    /// # Errors
    /// Returns [`PantsError::Validation`] for a bad `image_url`, or a storage error.
    pub fn create_inquest_at(
        &self,
        image_url: Option<String>,
        created_at: OffsetDateTime,
    ) -> Result<InquestView> {
        let mut store = self.open_store()?;
        let inquest = store.create_inquest(&NewInquest { image_url }, created_at)?;
        info!(inquest_id = %inquest.id, "created inquest");
        build_view(&store, inquest)
    }

    /// Load one Inquest with its neighbors and tally.
    ///
    /// # Errors
    /// Returns [`PantsError::NotFound`] when no Inquest has this id.
    pub fn show_inquest(&self, id: InquestId) -> Result<InquestView> {
        let store = self.open_store()?;
        let inquest = store.find_inquest(id)?.ok_or_else(|| PantsError::inquest_not_found(id))?;
        build_view(&store, inquest)
    }

    /// List Inquests newest first.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_inquests(&self, limit: u32) -> Result<Vec<Inquest>> {
        self.open_store()?.list_inquests(limit)
    }

    /// The newest Inquest, or the exhausted state for an empty store.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn latest_inquest(&self) -> Result<Pick> {
        let store = self.open_store()?;
        match store.latest_inquest()? {
            Some(inquest) => found(&store, inquest),
            None => Ok(Pick::Exhausted),
        }
    }

    /// Pick a random Inquest the visitor has not ruled on yet.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn random_inquest(&self, seen: &SeenSet) -> Result<Pick> {
        self.random_inquest_with(seen, &mut rand::thread_rng())
    }

    /// Same as [`Self::random_inquest`] with a caller-supplied random source.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn random_inquest_with<R: Rng + ?Sized>(&self, seen: &SeenSet, rng: &mut R) -> Result<Pick> {
        let mut store = self.open_store()?;
        pick_unseen(&mut store, seen, rng)
    }

    /// Validate and persist one vote on `inquest_id`.
    ///
    /// # Errors
    /// Returns [`PantsError::Validation`] when the vote or Inquest reference is invalid.
    pub fn record_vote(&self, inquest_id: InquestId, input: RecordVoteRequest) -> Result<Ruling> {
        let mut store = self.open_store()?;
        store.record_vote(
            &NewRuling { inquest_id: Some(inquest_id), vote: input.vote },
            OffsetDateTime::now_utc(),
        )
    }

    /// Record a vote, mark the Inquest seen, then pick the next unseen Inquest.
    ///
    /// `seen` is only updated when the vote was persisted.
    ///
    /// # Errors
    /// Returns [`PantsError::Validation`] when the vote is rejected, or a storage error.
    pub fn rule(
        &self,
        inquest_id: InquestId,
        input: RecordVoteRequest,
        seen: &mut SeenSet,
    ) -> Result<RuleOutcome> {
        self.rule_with(inquest_id, input, seen, &mut rand::thread_rng())
    }

    /// Same as [`Self::rule`] with a caller-supplied random source.
    ///
    /// # Errors
    /// Returns [`PantsError::Validation`] when the vote is rejected, or a storage error.
    pub fn rule_with<R: Rng + ?Sized>(
        &self,
        inquest_id: InquestId,
        input: RecordVoteRequest,
        seen: &mut SeenSet,
        rng: &mut R,
    ) -> Result<RuleOutcome> {
        let mut store = self.open_store()?;
        let ruling = store.record_vote(
            &NewRuling { inquest_id: Some(inquest_id), vote: input.vote },
            OffsetDateTime::now_utc(),
        )?;
        mark_seen(seen, ruling.inquest_id);
        let next = pick_unseen(&mut store, seen, rng)?;
        Ok(RuleOutcome { ruling, next })
    }
}

/// Add `inquest_id` to the visitor's seen-set. Repeated calls are no-ops.
pub fn mark_seen(seen: &mut SeenSet, inquest_id: InquestId) {
    if seen.mark_seen(inquest_id) {
        debug!(%inquest_id, seen = seen.len(), "marked inquest as ruled on");
    }
}

fn pick_unseen<R: Rng + ?Sized>(
    store: &mut SqliteStore,
    seen: &SeenSet,
    rng: &mut R,
) -> Result<Pick> {
    match store.select_unseen(seen, rng)? {
        Some(inquest) => found(store, inquest),
        None => Ok(Pick::Exhausted),
    }
}

fn found(store: &SqliteStore, inquest: Inquest) -> Result<Pick> {
    Ok(Pick::Found { inquest: Box::new(build_view(store, inquest)?) })
}

fn build_view(store: &SqliteStore, inquest: Inquest) -> Result<InquestView> {
    let predecessor_id = store.predecessor_of(&inquest)?.map(|neighbor| neighbor.id);
    let successor_id = store.successor_of(&inquest)?.map(|neighbor| neighbor.id);
    let tally = store.tally(inquest.id)?;
    Ok(InquestView { inquest, predecessor_id, successor_id, tally })
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use time::Duration;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("pants-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn create(api: &PantsApi, url: &str, days_ago: i64) -> Result<InquestView> {
        api.create_inquest_at(
            Some(url.to_string()),
            OffsetDateTime::now_utc() - Duration::days(days_ago),
        )
    }

    #[test]
    fn api_create_and_show_expose_neighbors() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = PantsApi::new(db_path.clone());

        let old = create(&api, "http://foo.com/cabinet.jpg", 6)?;
        let new = create(&api, "http://baz.com/guitar.gif", 1)?;

        let old_view = api.show_inquest(old.inquest.id)?;
        assert_eq!(old_view.predecessor_id, None);
        assert_eq!(old_view.successor_id, Some(new.inquest.id));

        let new_view = api.show_inquest(new.inquest.id)?;
        assert_eq!(new_view.predecessor_id, Some(old.inquest.id));
        assert_eq!(new_view.successor_id, None);

        assert_eq!(api.latest_inquest()?.inquest_id(), Some(new.inquest.id));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn api_create_request_stamps_current_time() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = PantsApi::new(db_path.clone());

        let before = OffsetDateTime::now_utc() - Duration::seconds(1);
        let request: CreateInquestRequest = serde_json::from_value(serde_json::json!({
            "image_url": "http://host.com/x.png",
            "created_at": "1999-01-01T00:00:00Z"
        }))?;
        let view = api.create_inquest(request)?;
        assert!(view.inquest.created_at >= before);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn api_show_missing_inquest_is_not_found() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = PantsApi::new(db_path.clone());

        let Err(err) = api.show_inquest(InquestId(68_381)) else {
            panic!("missing inquest should not be found");
        };
        assert!(matches!(err.downcast_ref::<PantsError>(), Some(PantsError::NotFound { .. })));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn api_empty_store_picks_nothing() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = PantsApi::new(db_path.clone());

        assert_eq!(api.random_inquest(&SeenSet::new())?, Pick::Exhausted);
        assert_eq!(api.latest_inquest()?, Pick::Exhausted);
        assert_eq!(serde_json::to_value(Pick::Exhausted)?, serde_json::json!({ "state": "none" }));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn api_ruling_marks_seen_and_never_repeats() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = PantsApi::new(db_path.clone());
        let mut rng = StdRng::seed_from_u64(11);

        let first = create(&api, "http://myimageserver.com/images/1.png", 2)?;
        let second = create(&api, "http://myimageserver.com/images/2.png", 1)?;

        let mut seen = SeenSet::new();
        let Some(shown) = api.random_inquest_with(&seen, &mut rng)?.inquest_id() else {
            panic!("two inquests exist, one must be picked");
        };

        let outcome = api.rule_with(
            shown,
            RecordVoteRequest { vote: Some("yes".to_string()) },
            &mut seen,
            &mut rng,
        )?;
        assert!(seen.contains(shown));
        let other = if shown == first.inquest.id { second.inquest.id } else { first.inquest.id };
        assert_eq!(outcome.next.inquest_id(), Some(other));

        let outcome = api.rule_with(
            other,
            RecordVoteRequest { vote: Some("not_sure".to_string()) },
            &mut seen,
            &mut rng,
        )?;
        assert_eq!(outcome.next, Pick::Exhausted);
        assert_eq!(seen.len(), 2);

        assert_eq!(api.show_inquest(shown)?.tally.yes, 1);
        assert_eq!(api.show_inquest(other)?.tally.not_sure, 1);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn api_rejected_vote_leaves_seen_set_untouched() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = PantsApi::new(db_path.clone());
        let inquest = create(&api, "http://animals.org/tortoise.png", 1)?;

        let mut seen = SeenSet::new();
        let Err(err) = api.rule(
            inquest.inquest.id,
            RecordVoteRequest { vote: Some("fazbot".to_string()) },
            &mut seen,
        ) else {
            panic!("fazbot vote should be rejected");
        };
        assert!(matches!(err.downcast_ref::<PantsError>(), Some(PantsError::Validation(_))));
        assert!(seen.is_empty());
        assert_eq!(api.show_inquest(inquest.inquest.id)?.tally.total(), 0);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn api_migrate_dry_run_reports_plan() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = PantsApi::new(db_path.clone());

        let plan = api.migrate(true)?;
        assert_eq!(plan.would_apply_versions, vec![1, 2]);
        assert_eq!(plan.after_version, None);

        let applied = api.migrate(false)?;
        assert_eq!(applied.up_to_date, Some(true));
        assert!(api.schema_status()?.pending_versions.is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
