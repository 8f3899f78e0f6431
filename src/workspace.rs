use crate::BuildWorldError;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

static VALID_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-.+]+$").expect("static regex"));

pub const MAX_NAME_LENGTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkspaceStatus {
    /// Initial state, nothing has been built yet.
    NotStarted,
    /// Entered automatically on the first content modification.
    InProgress,
    AlmostFinished,
    Finished,
    /// Content modifications are rejected.
    Archive,
    /// Hidden from listings; remembers the status it was hidden from.
    Hidden,
}

impl WorkspaceStatus {
    pub const ALL: [WorkspaceStatus; 6] = [
        WorkspaceStatus::NotStarted,
        WorkspaceStatus::InProgress,
        WorkspaceStatus::AlmostFinished,
        WorkspaceStatus::Finished,
        WorkspaceStatus::Archive,
        WorkspaceStatus::Hidden,
    ];

    /// Development stage; higher means further along.
    pub fn stage(&self) -> u8 {
        match self {
            WorkspaceStatus::NotStarted => 1,
            WorkspaceStatus::InProgress => 2,
            WorkspaceStatus::AlmostFinished => 3,
            WorkspaceStatus::Finished => 4,
            WorkspaceStatus::Archive => 5,
            WorkspaceStatus::Hidden => 6,
        }
    }

    /// Permission node required to move a workspace into this status.
    pub fn permission(&self) -> String {
        format!("buildsystem.setstatus.{}", self.as_str().replace('_', ""))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::NotStarted => "not_started",
            WorkspaceStatus::InProgress => "in_progress",
            WorkspaceStatus::AlmostFinished => "almost_finished",
            WorkspaceStatus::Finished => "finished",
            WorkspaceStatus::Archive => "archive",
            WorkspaceStatus::Hidden => "hidden",
        }
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkspaceStatus {
    type Err = BuildWorldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        WorkspaceStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized || status.as_str().replace('_', "") == normalized)
            .ok_or_else(|| BuildWorldError::Unknown(format!("unknown status '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityFilter {
    Public,
    Private,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorldType {
    #[default]
    Normal,
    Flat,
    Nether,
    End,
    Void,
    Template,
    Private,
    /// Not created by this system but brought under management.
    Imported,
    Custom,
    Unknown,
}

impl FromStr for WorldType {
    type Err = BuildWorldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "normal" => WorldType::Normal,
            "flat" => WorldType::Flat,
            "nether" => WorldType::Nether,
            "end" => WorldType::End,
            "void" => WorldType::Void,
            "template" => WorldType::Template,
            "private" => WorldType::Private,
            "imported" => WorldType::Imported,
            "custom" => WorldType::Custom,
            "unknown" => WorldType::Unknown,
            other => return Err(BuildWorldError::Unknown(format!("unknown world type '{other}'"))),
        })
    }
}

/// A player identity allowed to work on a workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Builder {
    pub id: Uuid,
    pub name: String,
}

impl Builder {
    pub fn new(id: Uuid, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
        }
    }
}

/// Display data owned by the menu layer; opaque to this crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DisplayMetadata {
    pub material: Option<String>,
    pub project: Option<String>,
    pub permission: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub status: WorkspaceStatus,
    #[serde(default)]
    pub status_before_hidden: Option<WorkspaceStatus>,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
    pub creator: Option<Builder>,
    /// Contributors other than the creator, in insertion order.
    pub builders: Vec<Builder>,
    #[serde(default)]
    pub display: DisplayMetadata,
    pub world_type: WorldType,
    pub physics: bool,
    #[serde(default)]
    pub last_edited: Option<DateTime<Utc>>,
}

impl Workspace {
    pub fn new(name: &str, creator: Option<Builder>, world_type: WorldType, visibility: Visibility) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: WorkspaceStatus::NotStarted,
            status_before_hidden: None,
            visibility,
            created_at: Utc::now(),
            creator,
            builders: Vec::new(),
            display: DisplayMetadata::default(),
            world_type,
            physics: true,
            last_edited: None,
        }
    }

    pub fn imported(name: &str, world_type: WorldType) -> Self {
        Self::new(name, None, world_type, Visibility::Public)
    }

    pub fn is_creator(&self, id: Uuid) -> bool {
        self.creator.as_ref().is_some_and(|c| c.id == id)
    }

    pub fn is_builder(&self, id: Uuid) -> bool {
        self.builders.iter().any(|b| b.id == id)
    }

    /// Creator or listed builder.
    pub fn can_modify(&self, id: Uuid) -> bool {
        self.is_creator(id) || self.is_builder(id)
    }

    /// Returns false when the builder is the creator or already listed.
    pub fn add_builder(&mut self, builder: Builder) -> bool {
        if self.is_creator(builder.id) || self.is_builder(builder.id) {
            return false;
        }
        self.builders.push(builder);
        true
    }

    pub fn remove_builder(&mut self, id: Uuid) -> bool {
        let before = self.builders.len();
        self.builders.retain(|b| b.id != id);
        before != self.builders.len()
    }

    pub fn matches_visibility(&self, filter: VisibilityFilter) -> bool {
        match filter {
            VisibilityFilter::Public => self.visibility == Visibility::Public,
            VisibilityFilter::Private => self.visibility == Visibility::Private,
            VisibilityFilter::Any => true,
        }
    }

    pub fn name_key(&self) -> String {
        self.name.to_lowercase()
    }
}

pub fn validate_name(name: &str) -> crate::Result<()> {
    let invalid = |reason: &str| BuildWorldError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(invalid("name is too long"));
    }
    if name == "." || name == ".." {
        return Err(invalid("name is reserved"));
    }
    if !VALID_NAME.is_match(name) {
        return Err(invalid("only letters, digits and _ - . + are allowed"));
    }
    Ok(())
}
