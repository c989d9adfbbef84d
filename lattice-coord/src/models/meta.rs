use prost::{Enumeration, Message};

/// The access mode of a physical channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Enumeration)]
#[repr(i32)]
pub enum AccessMode {
    /// The channel only accepts reads; appends are fenced.
    ReadOnly = 0,
    /// The channel accepts both reads and appends.
    ReadWrite = 1,
}

/// The assignment state of a physical channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Enumeration)]
#[repr(i32)]
pub enum ChannelState {
    /// The channel has been observed but never assigned.
    Uninitialized = 0,
    /// An assignment has been persisted and is awaiting acknowledgement from the target node.
    Assigning = 1,
    /// The target node has acknowledged ownership of the channel.
    Assigned = 2,
    /// The channel has been taken out of service.
    Unavailable = 3,
}

/// A prior assignment of a physical channel, retained for fencing and diagnostics.
#[derive(Clone, PartialEq, Message)]
pub struct AssignmentHistory {
    /// The term under which the assignment was made.
    #[prost(int64, tag = "1")]
    pub term: i64,
    /// The node which held the assignment.
    #[prost(int64, tag = "2")]
    pub node_id: i64,
    /// The access mode of the assignment.
    #[prost(enumeration = "AccessMode", tag = "3")]
    pub access_mode: i32,
}

/// The persisted metadata of a physical channel (a shard of the WAL stream).
#[derive(Clone, PartialEq, Message)]
pub struct PChannelMeta {
    /// The name of the channel.
    #[prost(string, tag = "1")]
    pub name: String,
    /// The channel's current term, strictly increasing on every assignment change.
    #[prost(int64, tag = "2")]
    pub term: i64,
    /// The channel's access mode.
    #[prost(enumeration = "AccessMode", tag = "3")]
    pub access_mode: i32,
    /// The node currently holding the assignment, `-1` when unassigned.
    #[prost(int64, tag = "4")]
    pub node_id: i64,
    /// The channel's assignment state.
    #[prost(enumeration = "ChannelState", tag = "5")]
    pub state: i32,
    /// A bounded history of prior assignments, cleared once an assignment is confirmed.
    #[prost(message, repeated, tag = "6")]
    pub histories: Vec<AssignmentHistory>,
    /// The wall-clock seconds timestamp of the last assignment change.
    #[prost(int64, tag = "7")]
    pub last_assign_timestamp: i64,
    /// The number of virtual channels currently multiplexed over this channel.
    #[prost(uint32, tag = "8")]
    pub vchannel_count: u32,
}

impl PChannelMeta {
    /// The typed assignment state of this channel.
    pub fn channel_state(&self) -> ChannelState {
        ChannelState::from_i32(self.state).unwrap_or(ChannelState::Uninitialized)
    }

    /// The typed access mode of this channel.
    pub fn channel_access_mode(&self) -> AccessMode {
        AccessMode::from_i32(self.access_mode).unwrap_or(AccessMode::ReadOnly)
    }
}

/// The kind of a worker task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Enumeration)]
#[repr(i32)]
pub enum TaskKind {
    /// A vector index build.
    IndexBuild = 0,
    /// A data distribution analyze job.
    Analyze = 1,
    /// A statistics computation job.
    Stats = 2,
}

impl TaskKind {
    /// The string form of this kind, used for storage keys and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IndexBuild => "index_build",
            Self::Analyze => "analyze",
            Self::Stats => "stats",
        }
    }
}

/// The lifecycle state of a worker task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Enumeration)]
#[repr(i32)]
pub enum TaskState {
    /// The task is no longer wanted and its metadata should be purged.
    None = 0,
    /// The task is awaiting dispatch.
    Init = 1,
    /// The task has been submitted to a worker.
    InProgress = 2,
    /// The task must be cleaned off its worker and re-attempted.
    Retry = 3,
    /// The task completed successfully.
    Finished = 4,
    /// The task terminally failed.
    Failed = 5,
}

/// The persisted record of a worker task.
#[derive(Clone, PartialEq, Message)]
pub struct TaskRecord {
    /// The unique ID of the task.
    #[prost(int64, tag = "1")]
    pub task_id: i64,
    /// The kind of the task.
    #[prost(enumeration = "TaskKind", tag = "2")]
    pub kind: i32,
    /// The lifecycle state of the task.
    #[prost(enumeration = "TaskState", tag = "3")]
    pub state: i32,
    /// The reason for the task's failure, empty when not failed.
    #[prost(string, tag = "4")]
    pub fail_reason: String,
    /// The worker node the task is assigned to, `-1` when unassigned.
    #[prost(int64, tag = "5")]
    pub node_id: i64,
    /// The collection the task belongs to, also its fair-share queue key.
    #[prost(int64, tag = "6")]
    pub collection_id: i64,
    /// The segment the task operates on, `0` for collection-level jobs.
    #[prost(int64, tag = "7")]
    pub segment_id: i64,
    /// The size in bytes of the task's input payload.
    #[prost(int64, tag = "8")]
    pub payload_size: i64,
    /// The attempt version, incremented on every dispatch.
    #[prost(int64, tag = "9")]
    pub version: i64,
    /// The index type to build, only used by index build tasks.
    #[prost(string, tag = "10")]
    pub index_type: String,
    /// The segment produced by the job, only used by stats tasks.
    #[prost(int64, tag = "11")]
    pub target_segment_id: i64,
    /// The files produced by the completed job.
    #[prost(string, repeated, tag = "12")]
    pub output_files: Vec<String>,
}

impl TaskRecord {
    /// The typed kind of this task.
    pub fn task_kind(&self) -> TaskKind {
        TaskKind::from_i32(self.kind).unwrap_or(TaskKind::IndexBuild)
    }

    /// The typed lifecycle state of this task.
    pub fn task_state(&self) -> TaskState {
        TaskState::from_i32(self.state).unwrap_or(TaskState::None)
    }
}

/// The lifecycle state of a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Enumeration)]
#[repr(i32)]
pub enum SegmentState {
    /// The segment is accepting appends.
    Growing = 0,
    /// The segment has been sealed and flushed to object storage.
    Flushed = 1,
    /// The segment has been dropped and awaits garbage collection.
    Dropped = 2,
}

/// The persisted metadata of a segment's presence in object storage.
#[derive(Clone, PartialEq, Message)]
pub struct SegmentRecord {
    /// The unique ID of the segment.
    #[prost(int64, tag = "1")]
    pub segment_id: i64,
    /// The collection the segment belongs to.
    #[prost(int64, tag = "2")]
    pub collection_id: i64,
    /// The physical channel the segment's writes rode on.
    #[prost(string, tag = "3")]
    pub channel: String,
    /// The lifecycle state of the segment.
    #[prost(enumeration = "SegmentState", tag = "4")]
    pub state: i32,
    /// The size in bytes of the segment's data.
    #[prost(int64, tag = "5")]
    pub size_bytes: i64,
    /// The wall-clock seconds timestamp at which the segment was dropped.
    #[prost(int64, tag = "6")]
    pub dropped_at: i64,
    /// The timestamp of the segment's latest DML position in the WAL.
    #[prost(int64, tag = "7")]
    pub dml_timestamp: i64,
    /// The segments this segment was compacted from, empty when not a compaction product.
    #[prost(int64, repeated, tag = "8")]
    pub compaction_from: Vec<i64>,
    /// The object storage paths of the segment's log files.
    #[prost(string, repeated, tag = "9")]
    pub log_paths: Vec<String>,
}

impl SegmentRecord {
    /// The typed lifecycle state of this segment.
    pub fn segment_state(&self) -> SegmentState {
        SegmentState::from_i32(self.state).unwrap_or(SegmentState::Growing)
    }
}

/// The persisted metadata of a built index.
#[derive(Clone, PartialEq, Message)]
pub struct IndexRecord {
    /// The build ID, identical to the ID of the task which built the index.
    #[prost(int64, tag = "1")]
    pub build_id: i64,
    /// The segment the index was built over.
    #[prost(int64, tag = "2")]
    pub segment_id: i64,
    /// The collection the index belongs to.
    #[prost(int64, tag = "3")]
    pub collection_id: i64,
    /// The build state, mirroring the building task's terminal state.
    #[prost(enumeration = "TaskState", tag = "4")]
    pub state: i32,
    /// The attempt version under which the index was built.
    #[prost(int64, tag = "5")]
    pub index_version: i64,
    /// The object storage file keys of the built index, relative to the build directory.
    #[prost(string, repeated, tag = "6")]
    pub file_keys: Vec<String>,
    /// A bool marking the index as dropped and eligible for recycling.
    #[prost(bool, tag = "7")]
    pub dropped: bool,
}

impl IndexRecord {
    /// The typed build state of this index.
    pub fn index_state(&self) -> TaskState {
        TaskState::from_i32(self.state).unwrap_or(TaskState::None)
    }
}

/// A per-channel replication checkpoint.
#[derive(Clone, PartialEq, Message)]
pub struct CheckpointRecord {
    /// The name of the channel.
    #[prost(string, tag = "1")]
    pub channel: String,
    /// The timestamp of the channel's durable replay position.
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

/// A request to create a job on a worker node.
#[derive(Clone, PartialEq, Message)]
pub struct JobRequest {
    /// The cluster issuing the job.
    #[prost(string, tag = "1")]
    pub cluster_id: String,
    /// The ID of the task driving the job.
    #[prost(int64, tag = "2")]
    pub task_id: i64,
    /// The kind of the job.
    #[prost(enumeration = "TaskKind", tag = "3")]
    pub kind: i32,
    /// The collection the job operates on.
    #[prost(int64, tag = "4")]
    pub collection_id: i64,
    /// The segment the job operates on, `0` for collection-level jobs.
    #[prost(int64, tag = "5")]
    pub segment_id: i64,
    /// The size in bytes of the job's input payload.
    #[prost(int64, tag = "6")]
    pub payload_size: i64,
    /// The number of worker slots the job consumes.
    #[prost(int64, tag = "7")]
    pub slot_cost: i64,
}

/// The state of a job as reported by its worker node.
#[derive(Clone, PartialEq, Message)]
pub struct JobStatus {
    /// The ID of the task driving the job.
    #[prost(int64, tag = "1")]
    pub task_id: i64,
    /// The lifecycle state reported by the worker.
    #[prost(enumeration = "TaskState", tag = "2")]
    pub state: i32,
    /// The reason for failure, empty when not failed.
    #[prost(string, tag = "3")]
    pub fail_reason: String,
    /// The files produced by the job so far.
    #[prost(string, repeated, tag = "4")]
    pub output_files: Vec<String>,
}

impl JobStatus {
    /// The typed lifecycle state reported by the worker.
    pub fn task_state(&self) -> TaskState {
        TaskState::from_i32(self.state).unwrap_or(TaskState::None)
    }
}
