// THEORY:
// A `Lineage` is the persistent identity of one dislocation across frames. A
// `Segment` is a snapshot; a `Lineage` is the story.
//
// Key architectural principles:
// 1.  **Append-Only History**: A lineage only ever grows. Its first event is a
//     creation (`Nucleated`, `MergeProductOf`, `SplitProductOf`), its last event may
//     be a termination (`Annihilated`, `Split`, `MergedInto`), and everything in
//     between is `Tracked`. Lineages are never deleted, only deactivated.
// 2.  **Closed Status Type**: Event statuses are an enum. The legacy string form
//     (`MERGED_INTO_D-0007`, `MERGE_PRODUCT_OF_D-0001+D-0002`, ...) exists only at
//     the serialisation boundary.
// 3.  **Store-Owned Lifecycle**: Only the `LineageStore` can create or mutate
//     lineages. It allocates identifiers monotonically and refuses any operation
//     that would revive or extend a terminated lineage.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core_modules::fingerprint::Vec3;
use crate::core_modules::segment::{Segment, SegmentIndex};
use crate::error::{Result, TrackingError};

/// Identifier of a lineage, rendered as `D-0000`, `D-0001`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LineageId(pub u64);

impl fmt::Display for LineageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D-{:04}", self.0)
    }
}

impl FromStr for LineageId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("D-")
            .ok_or_else(|| format!("lineage id `{s}` does not start with `D-`"))?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("lineage id `{s}` has no numeric suffix"));
        }
        digits
            .parse()
            .map(LineageId)
            .map_err(|e| format!("lineage id `{s}`: {e}"))
    }
}

impl Serialize for LineageId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LineageId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// What happened to a lineage in one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EventStatus {
    Nucleated,
    Tracked,
    Annihilated,
    Split,
    MergedInto(LineageId),
    MergeProductOf(Vec<LineageId>),
    SplitProductOf(LineageId),
}

impl EventStatus {
    /// Statuses that open a lineage's history.
    pub fn is_creation(&self) -> bool {
        matches!(
            self,
            Self::Nucleated | Self::MergeProductOf(_) | Self::SplitProductOf(_)
        )
    }

    /// Statuses that close a lineage's history.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Annihilated | Self::Split | Self::MergedInto(_))
    }
}

const MERGED_INTO: &str = "MERGED_INTO_";
const MERGE_PRODUCT_OF: &str = "MERGE_PRODUCT_OF_";
const SPLIT_PRODUCT_OF: &str = "SPLIT_PRODUCT_OF_";

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nucleated => f.write_str("NUCLEATED"),
            Self::Tracked => f.write_str("TRACKED"),
            Self::Annihilated => f.write_str("ANNIHILATED"),
            Self::Split => f.write_str("SPLIT"),
            Self::MergedInto(child) => write!(f, "{MERGED_INTO}{child}"),
            Self::MergeProductOf(parents) => {
                f.write_str(MERGE_PRODUCT_OF)?;
                for (i, parent) in parents.iter().enumerate() {
                    if i > 0 {
                        f.write_str("+")?;
                    }
                    write!(f, "{parent}")?;
                }
                Ok(())
            }
            Self::SplitProductOf(parent) => write!(f, "{SPLIT_PRODUCT_OF}{parent}"),
        }
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "NUCLEATED" => return Ok(Self::Nucleated),
            "TRACKED" => return Ok(Self::Tracked),
            "ANNIHILATED" => return Ok(Self::Annihilated),
            "SPLIT" => return Ok(Self::Split),
            _ => {}
        }
        if let Some(child) = s.strip_prefix(MERGED_INTO) {
            return Ok(Self::MergedInto(child.parse()?));
        }
        if let Some(parents) = s.strip_prefix(MERGE_PRODUCT_OF) {
            let parents = parents
                .split('+')
                .map(str::parse)
                .collect::<std::result::Result<Vec<LineageId>, _>>()?;
            return Ok(Self::MergeProductOf(parents));
        }
        if let Some(parent) = s.strip_prefix(SPLIT_PRODUCT_OF) {
            return Ok(Self::SplitProductOf(parent.parse()?));
        }
        Err(format!("unknown event status `{s}`"))
    }
}

impl From<EventStatus> for String {
    fn from(status: EventStatus) -> Self {
        status.to_string()
    }
}

impl TryFrom<String> for EventStatus {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

/// Segment-derived fields recorded with every history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentFields {
    pub index: SegmentIndex,
    pub position: Vec3,
    pub burgers_vector: Vec3,
    pub length: f64,
}

impl From<&Segment> for SegmentFields {
    fn from(segment: &Segment) -> Self {
        Self {
            index: segment.index,
            position: segment.position,
            burgers_vector: segment.burgers_vector,
            length: segment.length,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEvent {
    pub frame: u64,
    pub status: EventStatus,
    #[serde(flatten)]
    pub fields: SegmentFields,
}

/// The tracked identity of one dislocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Lineage {
    id: LineageId,
    creation_frame: u64,
    is_active: bool,
    history: Vec<LineageEvent>,
}

impl Lineage {
    pub fn id(&self) -> LineageId {
        self.id
    }

    pub fn creation_frame(&self) -> u64 {
        self.creation_frame
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn history(&self) -> &[LineageEvent] {
        &self.history
    }

    pub fn first_event(&self) -> &LineageEvent {
        &self.history[0]
    }

    pub fn last_event(&self) -> &LineageEvent {
        &self.history[self.history.len() - 1]
    }

    /// Frames between the first and the last recorded event.
    pub fn lifetime(&self) -> u64 {
        self.last_event().frame - self.first_event().frame
    }

    /// Mean segment length over the whole history.
    pub fn average_length(&self) -> f64 {
        self.history.iter().map(|e| e.fields.length).sum::<f64>() / self.history.len() as f64
    }

    fn append(&mut self, event: LineageEvent) -> Result<()> {
        if !self.is_active {
            return Err(TrackingError::invariant(format!(
                "lineage {} is inactive and cannot record {} at frame {}",
                self.id, event.status, event.frame
            )));
        }
        let last_frame = self.last_event().frame;
        if event.frame < last_frame {
            return Err(TrackingError::invariant(format!(
                "lineage {} cannot record frame {} after frame {}",
                self.id, event.frame, last_frame
            )));
        }
        if event.status.is_terminal() {
            self.is_active = false;
        }
        self.history.push(event);
        Ok(())
    }
}

/// Owner of every lineage of a run. Identifiers are allocated in creation order and
/// never reused; lineages are never removed.
#[derive(Debug, Clone, Default)]
pub struct LineageStore {
    lineages: Vec<Lineage>,
}

impl LineageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifier the next `create` call will return.
    pub fn next_id(&self) -> LineageId {
        LineageId(self.lineages.len() as u64)
    }

    /// Creates a lineage whose first event is `Nucleated`.
    pub fn create(&mut self, frame: u64, fields: SegmentFields) -> LineageId {
        let id = self.next_id();
        self.lineages.push(Lineage {
            id,
            creation_frame: frame,
            is_active: true,
            history: vec![LineageEvent {
                frame,
                status: EventStatus::Nucleated,
                fields,
            }],
        });
        id
    }

    /// Creates a lineage opened by any creation status, e.g. a merge or split product.
    pub fn create_with_status(
        &mut self,
        frame: u64,
        status: EventStatus,
        fields: SegmentFields,
    ) -> Result<LineageId> {
        if !status.is_creation() {
            return Err(TrackingError::invariant(format!(
                "{status} cannot open a lineage"
            )));
        }
        let id = self.create(frame, fields);
        self.lineages[id.0 as usize].history[0].status = status;
        Ok(id)
    }

    /// Appends a non-terminal event to an active lineage.
    pub fn update(
        &mut self,
        id: LineageId,
        frame: u64,
        status: EventStatus,
        fields: SegmentFields,
    ) -> Result<()> {
        if status.is_creation() || status.is_terminal() {
            return Err(TrackingError::invariant(format!(
                "{status} is not a valid update for lineage {id}"
            )));
        }
        self.get_mut(id)?.append(LineageEvent {
            frame,
            status,
            fields,
        })
    }

    /// Appends a terminal event and deactivates the lineage. Without `fields`, the
    /// last known segment fields are carried forward.
    pub fn terminate(
        &mut self,
        id: LineageId,
        frame: u64,
        status: EventStatus,
        fields: Option<SegmentFields>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(TrackingError::invariant(format!(
                "{status} does not terminate lineage {id}"
            )));
        }
        let lineage = self.get_mut(id)?;
        let fields = fields.unwrap_or_else(|| lineage.last_event().fields.clone());
        lineage.append(LineageEvent {
            frame,
            status,
            fields,
        })
    }

    pub fn get(&self, id: LineageId) -> Option<&Lineage> {
        self.lineages.get(id.0 as usize)
    }

    fn get_mut(&mut self, id: LineageId) -> Result<&mut Lineage> {
        self.lineages
            .get_mut(id.0 as usize)
            .ok_or_else(|| TrackingError::invariant(format!("unknown lineage {id}")))
    }

    pub fn is_active(&self, id: LineageId) -> bool {
        self.get(id).is_some_and(Lineage::is_active)
    }

    /// All lineages in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Lineage> {
        self.lineages.iter()
    }

    pub fn len(&self) -> usize {
        self.lineages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lineages.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.lineages.iter().filter(|l| l.is_active).count()
    }
}
