pub mod schedule;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

pub use self::schedule::Schedule;
use crate::utils::get_epoch_time_in_ms;

pub type EpochMs = u64;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl $name {
            pub fn new(id: String) -> Self {
                Self(id)
            }

            pub fn get(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value.to_string())
            }
        }
    };
}

string_id!(LibraryFileId);
string_id!(LibraryId);
string_id!(NodeId);
string_id!(FlowId);
string_id!(FlowPartId);
string_id!(RunnerId);

impl LibraryFileId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl RunnerId {
    pub fn generate() -> Self {
        Self(nanoid::nanoid!())
    }
}

/// Status stored for a library file.
///
/// A pending file is only ever stored as `Unprocessed` (or
/// `ReprocessByFlow`); the on-hold, out-of-schedule and disabled states are
/// derived through [`LibraryFile::effective_status`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, AsRefStr,
)]
pub enum FileStatus {
    #[default]
    Unprocessed,
    Processed,
    Processing,
    FlowNotFound,
    ProcessingFailed,
    Duplicate,
    MappingIssue,
    MissingLibrary,
    ReprocessByFlow,
}

impl FileStatus {
    /// Statuses the scheduler may hand out.
    pub fn is_queued(&self) -> bool {
        matches!(self, FileStatus::Unprocessed | FileStatus::ReprocessByFlow)
    }

    /// Statuses a runner may report when it finishes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileStatus::Processed
                | FileStatus::FlowNotFound
                | FileStatus::ProcessingFailed
                | FileStatus::Duplicate
                | FileStatus::MappingIssue
                | FileStatus::MissingLibrary
        )
    }
}

/// Status as shown to operators, including the virtual sub-statuses of a
/// pending file. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
pub enum EffectiveStatus {
    Unprocessed,
    OnHold,
    OutOfSchedule,
    Disabled,
    Processed,
    Processing,
    FlowNotFound,
    ProcessingFailed,
    Duplicate,
    MappingIssue,
    MissingLibrary,
    ReprocessByFlow,
}

impl EffectiveStatus {
    pub fn is_virtual(&self) -> bool {
        matches!(
            self,
            EffectiveStatus::OnHold | EffectiveStatus::OutOfSchedule | EffectiveStatus::Disabled
        )
    }
}

impl From<FileStatus> for EffectiveStatus {
    fn from(status: FileStatus) -> Self {
        match status {
            FileStatus::Unprocessed => EffectiveStatus::Unprocessed,
            FileStatus::Processed => EffectiveStatus::Processed,
            FileStatus::Processing => EffectiveStatus::Processing,
            FileStatus::FlowNotFound => EffectiveStatus::FlowNotFound,
            FileStatus::ProcessingFailed => EffectiveStatus::ProcessingFailed,
            FileStatus::Duplicate => EffectiveStatus::Duplicate,
            FileStatus::MappingIssue => EffectiveStatus::MappingIssue,
            FileStatus::MissingLibrary => EffectiveStatus::MissingLibrary,
            FileStatus::ReprocessByFlow => EffectiveStatus::ReprocessByFlow,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileFlags(u32);

impl FileFlags {
    pub const NONE: FileFlags = FileFlags(0);
    /// Bypasses schedule, disabled and max-runner exclusions.
    pub const FORCE_PROCESSING: FileFlags = FileFlags(1);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: FileFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: FileFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: FileFlags) {
        self.0 &= !other.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingOrder {
    Alphabetical,
    Random,
    OldestFirst,
    NewestFirst,
    #[default]
    AsFound,
    LargestFirst,
    SmallestFirst,
}

fn default_true() -> bool {
    true
}

fn default_flow_runners() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Library {
    pub uid: LibraryId,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub schedule: Schedule,
    /// 0 means unlimited concurrent files from this library.
    #[serde(default)]
    pub max_runners: u32,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub processing_order: ProcessingOrder,
    #[serde(default)]
    pub flow_uid: Option<FlowId>,
    /// Newly queued files are held for this many minutes.
    #[serde(default)]
    pub hold_minutes: u32,
}

impl Library {
    pub fn is_in_schedule<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        self.schedule.is_in_schedule(now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", content = "libraries", rename_all = "snake_case")]
pub enum LibraryRestriction {
    #[default]
    All,
    Only(Vec<LibraryId>),
    AllExcept(Vec<LibraryId>),
}

impl LibraryRestriction {
    pub fn allows(&self, library: &LibraryId) -> bool {
        match self {
            LibraryRestriction::All => true,
            LibraryRestriction::Only(list) => list.contains(library),
            LibraryRestriction::AllExcept(list) => !list.contains(library),
        }
    }
}

/// Rewrites a coordinator path prefix into the path seen by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    pub server: String,
    pub node: String,
}

pub fn map_path(mappings: &[PathMapping], path: &str) -> String {
    mappings
        .iter()
        .filter(|m| !m.server.is_empty() && path.starts_with(&m.server))
        .max_by_key(|m| m.server.len())
        .map(|m| format!("{}{}", m.node, &path[m.server.len()..]))
        .unwrap_or_else(|| path.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingNode {
    pub uid: NodeId,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_flow_runners")]
    pub flow_runners: u32,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub libraries: LibraryRestriction,
    /// 0 means no size cap.
    #[serde(default)]
    pub max_file_size_mb: u64,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub last_seen: EpochMs,
    #[serde(default)]
    pub temp_path: String,
    #[serde(default)]
    pub mappings: Vec<PathMapping>,
}

impl ProcessingNode {
    pub fn max_file_size_bytes(&self) -> Option<u64> {
        (self.max_file_size_mb > 0).then(|| self.max_file_size_mb.saturating_mul(1024 * 1024))
    }

    pub fn accepts_size(&self, size: u64) -> bool {
        self.max_file_size_bytes().map_or(true, |max| size <= max)
    }

    pub fn is_stale(&self, now_ms: EpochMs, stale_after_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen) > stale_after_ms
    }

    pub fn is_in_schedule<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        self.schedule.is_in_schedule(now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutedNode {
    pub name: String,
    pub part_uid: FlowPartId,
    pub element: String,
    pub output: i32,
    pub processing_time_ms: u64,
    pub depth: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Builder, PartialEq)]
pub struct LibraryFile {
    #[builder(default = "LibraryFileId::generate()")]
    pub uid: LibraryFileId,
    #[builder(setter(into))]
    pub name: String,
    pub library_uid: LibraryId,
    #[builder(default)]
    pub flow_uid: Option<FlowId>,
    #[builder(default)]
    pub status: FileStatus,
    #[builder(default)]
    pub flags: FileFlags,
    /// Epoch ms before which the file may not be processed, 0 when not held.
    #[builder(default)]
    pub hold_until: EpochMs,
    /// Manual rank, 1 based. 0 is unranked.
    #[builder(default)]
    pub order: u32,
    #[builder(default)]
    pub size: u64,
    #[builder(default)]
    pub creation_time: EpochMs,
    #[builder(default = "self.default_date_created()")]
    pub date_created: EpochMs,
    #[builder(default)]
    pub process_on_node_uid: Option<NodeId>,
    #[builder(default)]
    pub node_uid: Option<NodeId>,
    #[builder(default)]
    pub worker_uid: Option<RunnerId>,
    #[builder(default)]
    pub processing_started: Option<EpochMs>,
    #[builder(default)]
    pub processing_ended: Option<EpochMs>,
    #[builder(default)]
    pub final_size: Option<u64>,
    #[builder(default)]
    pub final_fingerprint: Option<String>,
    #[builder(default)]
    pub output_path: Option<String>,
    #[builder(default)]
    pub failure_reason: Option<String>,
    #[builder(default)]
    pub executed_nodes: Vec<ExecutedNode>,
}

impl LibraryFileBuilder {
    fn default_date_created(&self) -> EpochMs {
        get_epoch_time_in_ms()
    }
}

impl LibraryFile {
    pub fn is_forced(&self) -> bool {
        self.flags.contains(FileFlags::FORCE_PROCESSING)
    }

    pub fn is_on_hold(&self, now_ms: EpochMs) -> bool {
        self.hold_until > now_ms
    }

    /// Whether the file is pinned to a node other than `node`.
    pub fn is_pinned_elsewhere(&self, node: &NodeId) -> bool {
        self.process_on_node_uid
            .as_ref()
            .is_some_and(|pinned| pinned != node)
    }

    pub fn is_sticky_to(&self, node: &NodeId) -> bool {
        self.process_on_node_uid.as_ref() == Some(node)
    }

    pub fn effective_status<Tz: TimeZone>(
        &self,
        library: Option<&Library>,
        now: &DateTime<Tz>,
    ) -> EffectiveStatus {
        if self.status != FileStatus::Unprocessed || self.is_forced() {
            return self.status.into();
        }
        let Some(library) = library else {
            return EffectiveStatus::Unprocessed;
        };
        if !library.enabled {
            return EffectiveStatus::Disabled;
        }
        if self.is_on_hold(now.timestamp_millis().max(0) as u64) {
            return EffectiveStatus::OnHold;
        }
        if !library.is_in_schedule(now) {
            return EffectiveStatus::OutOfSchedule;
        }
        EffectiveStatus::Unprocessed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowElementKind {
    InputFile,
    SubFlowInput,
    SubFlow { flow_uid: FlowId },
    Log { message: String },
    CopyFile { destination: String },
    MoveFile { destination: String },
    DeleteOriginal,
    FileSizeGreaterThan { bytes: u64 },
    FileExtension { extensions: Vec<String> },
    SetAdditionalInfo { key: String, value: String, steps: u32 },
    Delay { millis: u64 },
    Fail { reason: String },
}

impl FlowElementKind {
    /// Startup markers and sub-flow entry are excluded from the step budget.
    pub fn is_counted(&self) -> bool {
        !matches!(
            self,
            FlowElementKind::InputFile | FlowElementKind::SubFlowInput | FlowElementKind::SubFlow { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            FlowElementKind::InputFile => "InputFile",
            FlowElementKind::SubFlowInput => "SubFlowInput",
            FlowElementKind::SubFlow { .. } => "SubFlow",
            FlowElementKind::Log { .. } => "Log",
            FlowElementKind::CopyFile { .. } => "CopyFile",
            FlowElementKind::MoveFile { .. } => "MoveFile",
            FlowElementKind::DeleteOriginal => "DeleteOriginal",
            FlowElementKind::FileSizeGreaterThan { .. } => "FileSizeGreaterThan",
            FlowElementKind::FileExtension { .. } => "FileExtension",
            FlowElementKind::SetAdditionalInfo { .. } => "SetAdditionalInfo",
            FlowElementKind::Delay { .. } => "Delay",
            FlowElementKind::Fail { .. } => "Fail",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlowConnection {
    pub output: i32,
    pub target: FlowPartId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlowPart {
    pub uid: FlowPartId,
    #[serde(default)]
    pub name: String,
    pub element: FlowElementKind,
    #[serde(default)]
    pub outputs: Vec<FlowConnection>,
}

impl FlowPart {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.element.name()
        } else {
            &self.name
        }
    }

    pub fn connection(&self, output: i32) -> Option<&FlowPartId> {
        self.outputs
            .iter()
            .find(|c| c.output == output)
            .map(|c| &c.target)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Flow {
    pub uid: FlowId,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub parts: Vec<FlowPart>,
}

impl Flow {
    pub fn startup_part(&self) -> Option<&FlowPart> {
        self.parts.first()
    }

    pub fn part(&self, uid: &FlowPartId) -> Option<&FlowPart> {
        self.parts.iter().find(|p| &p.uid == uid)
    }

    pub fn sub_flow_uids(&self) -> Vec<FlowId> {
        self.parts
            .iter()
            .filter_map(|p| match &p.element {
                FlowElementKind::SubFlow { flow_uid } => Some(flow_uid.clone()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdditionalInfo {
    pub value: String,
    /// Decremented once per executed step; removed at zero.
    pub steps_remaining: u32,
}

/// Live execution snapshot a runner reports with every hello.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FlowExecutorInfo {
    pub runner_uid: RunnerId,
    pub node_uid: NodeId,
    pub library_file_uid: LibraryFileId,
    pub library_uid: LibraryId,
    pub flow_uid: Option<FlowId>,
    pub working_file: String,
    pub initial_size: u64,
    pub current_part: u32,
    pub current_part_name: String,
    pub current_part_percent: f32,
    pub total_parts: u32,
    pub depth: u32,
    pub started_at: EpochMs,
    pub last_update: EpochMs,
    #[serde(default)]
    pub additional_info: BTreeMap<String, AdditionalInfo>,
}

impl FlowExecutorInfo {
    pub fn record_additional_info(&mut self, key: &str, value: &str, steps: u32) {
        if steps == 0 {
            self.additional_info.remove(key);
            return;
        }
        self.additional_info.insert(
            key.to_string(),
            AdditionalInfo {
                value: value.to_string(),
                steps_remaining: steps,
            },
        );
    }

    /// Ages every additional info entry by one step.
    pub fn step_additional_info(&mut self) {
        self.additional_info.retain(|_, info| {
            info.steps_remaining = info.steps_remaining.saturating_sub(1);
            info.steps_remaining > 0
        });
    }
}

/// Messages pushed from the coordinator to a connected runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerMessage {
    AbortFlow { library_file_uid: LibraryFileId },
}

/// Final report a runner delivers for the file it owns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionReport {
    pub library_file_uid: LibraryFileId,
    pub status: FileStatus,
    pub failure_reason: Option<String>,
    pub final_size: Option<u64>,
    pub final_fingerprint: Option<String>,
    pub output_path: Option<String>,
    pub executed_nodes: Vec<ExecutedNode>,
    pub processing_ended: EpochMs,
    /// Full flow log, re-sent wholesale so dropped log batches are recovered.
    pub log: String,
}

/// Everything a runner process needs to execute one claimed file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerParameters {
    pub runner_uid: RunnerId,
    pub node_uid: NodeId,
    pub server_addr: String,
    pub file: LibraryFile,
    pub library: Library,
    pub flow: Option<Flow>,
    #[serde(default)]
    pub sub_flows: Vec<Flow>,
    pub max_flow_parts: u32,
    pub temp_path: PathBuf,
    #[serde(default)]
    pub mappings: Vec<PathMapping>,
}

impl RunnerParameters {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading runner parameters {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing runner parameters {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)
            .with_context(|| format!("writing runner parameters {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::data_model::test_objects::tests::{mock_file, mock_library};

    #[test]
    fn test_file_flags() {
        let mut flags = FileFlags::NONE;
        assert!(!flags.contains(FileFlags::FORCE_PROCESSING));
        flags.insert(FileFlags::FORCE_PROCESSING);
        assert!(flags.contains(FileFlags::FORCE_PROCESSING));
        assert_eq!(flags.bits(), 1);
        flags.remove(FileFlags::FORCE_PROCESSING);
        assert_eq!(flags, FileFlags::NONE);
    }

    #[test]
    fn test_library_restriction() {
        let a = LibraryId::from("a");
        let b = LibraryId::from("b");
        assert!(LibraryRestriction::All.allows(&a));
        assert!(LibraryRestriction::Only(vec![a.clone()]).allows(&a));
        assert!(!LibraryRestriction::Only(vec![a.clone()]).allows(&b));
        assert!(!LibraryRestriction::AllExcept(vec![a.clone()]).allows(&a));
        assert!(LibraryRestriction::AllExcept(vec![a]).allows(&b));
    }

    #[test]
    fn test_library_restriction_serde() {
        let only: LibraryRestriction =
            serde_json::from_str(r#"{"mode":"only","libraries":["a"]}"#).unwrap();
        assert_eq!(only, LibraryRestriction::Only(vec!["a".into()]));
        let all: LibraryRestriction = serde_json::from_str(r#"{"mode":"all"}"#).unwrap();
        assert_eq!(all, LibraryRestriction::All);
    }

    #[test]
    fn test_effective_status_virtual_states() {
        let now = Utc.with_ymd_and_hms(2024, 1, 7, 12, 0, 0).unwrap();
        let now_ms = now.timestamp_millis() as u64;
        let mut library = mock_library("lib");
        let mut file = mock_file(&library, "/media/a.mkv");

        assert_eq!(
            file.effective_status(Some(&library), &now),
            EffectiveStatus::Unprocessed
        );

        file.hold_until = now_ms + 60_000;
        assert_eq!(
            file.effective_status(Some(&library), &now),
            EffectiveStatus::OnHold
        );
        file.hold_until = 0;

        library.schedule = Schedule::never();
        assert_eq!(
            file.effective_status(Some(&library), &now),
            EffectiveStatus::OutOfSchedule
        );

        library.enabled = false;
        let status = file.effective_status(Some(&library), &now);
        assert_eq!(status, EffectiveStatus::Disabled);
        assert!(status.is_virtual());

        // Forced files ignore every virtual state.
        file.flags.insert(FileFlags::FORCE_PROCESSING);
        assert_eq!(
            file.effective_status(Some(&library), &now),
            EffectiveStatus::Unprocessed
        );

        // Persisted statuses are reported as-is.
        file.status = FileStatus::Processing;
        assert_eq!(
            file.effective_status(Some(&library), &now),
            EffectiveStatus::Processing
        );
        // The stored value is still a persisted status.
        assert_eq!(file.status, FileStatus::Processing);
    }

    #[test]
    fn test_additional_info_expires_by_step() {
        let mut info = FlowExecutorInfo::default();
        info.record_additional_info("Codec", "hevc", 2);
        info.record_additional_info("Ratio", "0.5", 1);

        info.step_additional_info();
        assert!(info.additional_info.contains_key("Codec"));
        assert!(!info.additional_info.contains_key("Ratio"));

        info.step_additional_info();
        assert!(info.additional_info.is_empty());

        info.record_additional_info("Codec", "hevc", 3);
        info.record_additional_info("Codec", "", 0);
        assert!(info.additional_info.is_empty());
    }

    #[test]
    fn test_map_path_prefers_longest_prefix() {
        let mappings = vec![
            PathMapping {
                server: "/media".to_string(),
                node: "/mnt/media".to_string(),
            },
            PathMapping {
                server: "/media/tv".to_string(),
                node: "/mnt/tv".to_string(),
            },
        ];
        assert_eq!(map_path(&mappings, "/media/tv/a.mkv"), "/mnt/tv/a.mkv");
        assert_eq!(map_path(&mappings, "/media/movies/b.mkv"), "/mnt/media/movies/b.mkv");
        assert_eq!(map_path(&mappings, "/other/c.mkv"), "/other/c.mkv");
    }

    #[test]
    fn test_node_size_cap() {
        let mut node = crate::data_model::test_objects::tests::mock_node("n", 1);
        assert!(node.accepts_size(u64::MAX));
        node.max_file_size_mb = 1;
        assert!(node.accepts_size(1024 * 1024));
        assert!(!node.accepts_size(1024 * 1024 + 1));
    }

    #[test]
    fn test_flow_navigation() {
        let flow = crate::data_model::test_objects::tests::mock_branching_flow("flow");
        let start = flow.startup_part().unwrap();
        assert_eq!(start.element, FlowElementKind::InputFile);
        assert!(!start.element.is_counted());
        let next = flow.part(start.connection(1).unwrap()).unwrap();
        assert_eq!(next.element.name(), "FileSizeGreaterThan");
        assert!(start.connection(2).is_none());
    }
}
