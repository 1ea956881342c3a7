use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::num::ParseIntError;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;
use url::Url;

/// Longest accepted `image_url`, matching the `inquests.image_url` column width.
pub const IMAGE_URL_MAX_LEN: usize = 255;

const MSG_BLANK: &str = "can't be blank";
const MSG_IMPROPER_URL: &str = "is not a fully-qualified URL";
const MSG_NOT_INCLUDED: &str = "is not included in the list";
const MSG_MUST_EXIST: &str = "must exist";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PantsError {
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

impl PantsError {
    #[must_use]
    pub fn inquest_not_found(id: impl Display) -> Self {
        Self::NotFound { entity: "inquest", id: id.to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl Display for FieldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.field, self.message)
    }
}

/// Field-level validation failures collected before any write happens.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: &str, message: &str) {
        self.0.push(FieldError { field: field.to_string(), message: message.to_string() });
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn on(&self, field: &str) -> Option<&FieldError> {
        self.0.iter().find(|error| error.field == field)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[FieldError] {
        &self.0
    }

    /// Turn the collected failures into an error when there is at least one.
    ///
    /// # Errors
    /// Returns [`PantsError::Validation`] when any field failed.
    pub fn into_result(self) -> Result<(), PantsError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(PantsError::Validation(self))
        }
    }
}

impl Display for ValidationErrors {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let joined = self.0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
        f.write_str(&joined)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct InquestId(pub i64);

impl Display for InquestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InquestId {
    type Err = ParseIntError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value.trim().parse::<i64>().map(Self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RulingId(pub Ulid);

impl RulingId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RulingId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RulingId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    Yes,
    No,
    NotSure,
}

impl Vote {
    pub const ALL: [Self; 3] = [Self::Yes, Self::No, Self::NotSure];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
            Self::NotSure => "not_sure",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "yes" => Some(Self::Yes),
            "no" => Some(Self::No),
            "not_sure" => Some(Self::NotSure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Inquest {
    pub id: InquestId,
    pub image_url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Submission for a new Inquest, before the store assigns an id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewInquest {
    pub image_url: Option<String>,
}

impl NewInquest {
    /// Validate the submission and return the `image_url` to persist.
    ///
    /// # Errors
    /// Returns [`PantsError::Validation`] with an `image_url` entry when the URL
    /// is missing, too long, or not an absolute `http`/`https` URL.
    pub fn validate(&self) -> Result<&str, PantsError> {
        validate_image_url(self.image_url.as_deref()).map_err(|message| {
            let mut errors = ValidationErrors::new();
            errors.add("image_url", message);
            PantsError::Validation(errors)
        })
    }
}

/// Check one candidate `image_url` and return it trimmed, or the failure message.
///
/// # Errors
/// Returns a static message describing why the value is not acceptable.
pub fn validate_image_url(raw: Option<&str>) -> Result<&str, &'static str> {
    let value = raw.map(str::trim).unwrap_or_default();
    if value.is_empty() {
        return Err(MSG_BLANK);
    }
    if value.chars().count() > IMAGE_URL_MAX_LEN {
        return Err("is too long (maximum is 255 characters)");
    }

    let parsed = Url::parse(value).map_err(|_| MSG_IMPROPER_URL)?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(MSG_IMPROPER_URL);
    }
    Ok(value)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Ruling {
    pub id: RulingId,
    pub inquest_id: InquestId,
    pub vote: Vote,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A vote submission; fields are optional so missing input surfaces as a field error.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewRuling {
    pub inquest_id: Option<InquestId>,
    pub vote: Option<String>,
}

impl NewRuling {
    /// Validate the submission given whether the referenced Inquest exists.
    ///
    /// # Errors
    /// Returns [`PantsError::Validation`] listing every failing field
    /// (`inquest` and/or `vote`).
    pub fn validate(&self, inquest_exists: bool) -> Result<(InquestId, Vote), PantsError> {
        let mut errors = ValidationErrors::new();

        match self.inquest_id {
            None => errors.add("inquest", MSG_BLANK),
            Some(_) if !inquest_exists => errors.add("inquest", MSG_MUST_EXIST),
            Some(_) => {}
        }

        let raw_vote = self.vote.as_deref().unwrap_or_default();
        let vote = if raw_vote.trim().is_empty() {
            errors.add("vote", MSG_BLANK);
            None
        } else {
            let parsed = Vote::parse(raw_vote);
            if parsed.is_none() {
                errors.add("vote", MSG_NOT_INCLUDED);
            }
            parsed
        };

        match (self.inquest_id, vote) {
            (Some(inquest_id), Some(vote)) if errors.is_empty() => Ok((inquest_id, vote)),
            _ => Err(PantsError::Validation(errors)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct VoteTally {
    pub yes: u64,
    pub no: u64,
    pub not_sure: u64,
}

impl VoteTally {
    pub fn add(&mut self, vote: Vote, count: u64) {
        match vote {
            Vote::Yes => self.yes += count,
            Vote::No => self.no += count,
            Vote::NotSure => self.not_sure += count,
        }
    }

    #[must_use]
    pub fn count(&self, vote: Vote) -> u64 {
        match vote {
            Vote::Yes => self.yes,
            Vote::No => self.no,
            Vote::NotSure => self.not_sure,
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.yes + self.no + self.not_sure
    }
}

/// Inquest ids one visitor has already ruled on during the current session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct SeenSet(BTreeSet<InquestId>);

impl SeenSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the visitor ruled on `id`. Returns `false` when it was already present.
    pub fn mark_seen(&mut self, id: InquestId) -> bool {
        self.0.insert(id)
    }

    #[must_use]
    pub fn contains(&self, id: InquestId) -> bool {
        self.0.contains(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = InquestId> + '_ {
        self.0.iter().copied()
    }

    /// Drop the lowest id other than `keep`, returning it. `None` when only `keep` remains.
    pub fn forget_lowest_except(&mut self, keep: InquestId) -> Option<InquestId> {
        let victim = self.0.iter().copied().find(|id| *id != keep)?;
        self.0.remove(&victim);
        Some(victim)
    }

    #[must_use]
    pub fn to_raw_ids(&self) -> Vec<i64> {
        self.0.iter().map(|id| id.0).collect()
    }
}

impl FromIterator<InquestId> for SeenSet {
    fn from_iter<T: IntoIterator<Item = InquestId>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Draw the row offset for a uniform pick among `remaining` eligible rows.
///
/// Returns `None` when nothing is eligible; otherwise an offset in `[0, remaining)`.
pub fn random_offset<R: Rng + ?Sized>(remaining: u64, rng: &mut R) -> Option<u64> {
    if remaining == 0 {
        None
    } else {
        Some(rng.gen_range(0..remaining))
    }
}
