//! Protobuf message definitions. The schema is small and owned by this
//! repository, so the messages are written out with `prost` derives rather
//! than generated from `.proto` sources.

use data_types::ChunkId;

/// Discriminator carried by every [`RequestHeader`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RequestType {
    /// Replication-control request; not serviced by this subsystem.
    Replicate = 0,
    /// Cancel the request registered under the body's id.
    Stop = 1,
    /// Report the lifecycle state of the request under the body's id.
    Status = 2,
    /// Per-chunk query task.
    Query = 3,
}

/// Advisory priority tier of a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
#[allow(missing_docs)]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl From<Priority> for data_types::Priority {
    fn from(p: Priority) -> Self {
        match p {
            Priority::Low => Self::Low,
            Priority::Medium => Self::Medium,
            Priority::High => Self::High,
            Priority::Critical => Self::Critical,
        }
    }
}

/// Outcome field of a [`StatusResponse`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
#[allow(missing_docs)]
pub enum ResponseStatus {
    Success = 0,
    Failed = 1,
}

/// First frame of every logical request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestHeader {
    /// Request type; decides the schema of the following body frame.
    #[prost(enumeration = "RequestType", tag = "1")]
    pub r#type: i32,
    /// Request id, a UUID string minted by the coordinator.
    #[prost(string, tag = "2")]
    pub id: String,
}

impl RequestHeader {
    /// The decoded request type, if the discriminator is known.
    pub fn request_type(&self) -> Option<RequestType> {
        RequestType::from_i32(self.r#type)
    }
}

/// One table of a query's scan manifest.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScanTable {
    /// Database the table lives in.
    #[prost(string, tag = "1")]
    pub db: String,
    /// Table name.
    #[prost(string, tag = "2")]
    pub table: String,
    /// Expected scan cost; higher is slower.
    #[prost(int32, tag = "3")]
    pub slowness: i32,
}

impl From<&ScanTable> for data_types::ScanTable {
    fn from(t: &ScanTable) -> Self {
        Self::new(t.db.clone(), t.table.clone(), t.slowness)
    }
}

/// Body of a QUERY request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryRequest {
    /// Target database.
    #[prost(string, tag = "1")]
    pub db: String,
    /// Target chunk.
    #[prost(uint32, tag = "2")]
    pub chunk: u32,
    /// SQL fragments, executed in order.
    #[prost(string, repeated, tag = "3")]
    pub fragments: Vec<String>,
    /// Tables the shared scan touches.
    #[prost(message, repeated, tag = "4")]
    pub scan_tables: Vec<ScanTable>,
    /// Advisory priority tier.
    #[prost(enumeration = "Priority", tag = "5")]
    pub priority: i32,
}

impl QueryRequest {
    /// Target chunk as a typed id.
    pub fn chunk_id(&self) -> ChunkId {
        ChunkId::new(self.chunk)
    }

    /// The scan manifest as scheduler types.
    pub fn scan_info(&self) -> data_types::ScanInfo {
        data_types::ScanInfo::new(self.scan_tables.iter().map(Into::into).collect())
    }

    /// Decoded priority; unknown values fall back to `Low`.
    pub fn decoded_priority(&self) -> data_types::Priority {
        Priority::from_i32(self.priority)
            .map(Into::into)
            .unwrap_or(data_types::Priority::Low)
    }
}

/// Body of a REPLICATE request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicateRequest {
    /// Database to replicate from.
    #[prost(string, tag = "1")]
    pub database: String,
    /// Chunk to replicate.
    #[prost(uint32, tag = "2")]
    pub chunk: u32,
    /// Replication request id.
    #[prost(string, tag = "3")]
    pub id: String,
}

/// Body of a STOP request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopRequest {
    /// Id of the request to cancel.
    #[prost(string, tag = "1")]
    pub id: String,
}

/// Body of a STATUS request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusRequest {
    /// Id of the request to report on.
    #[prost(string, tag = "1")]
    pub id: String,
}

/// One frame of a streamed query response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResultFrame {
    /// Opaque row bytes produced by the executor.
    #[prost(bytes = "vec", tag = "1")]
    pub rows: Vec<u8>,
    /// Set on the final frame of the response.
    #[prost(bool, tag = "2")]
    pub last: bool,
}

/// Terminal reply for control requests and failed queries.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusResponse {
    /// Outcome.
    #[prost(enumeration = "ResponseStatus", tag = "1")]
    pub status: i32,
    /// Human-readable detail.
    #[prost(string, tag = "2")]
    pub message: String,
    /// Error code; 0 on success.
    #[prost(int32, tag = "3")]
    pub code: i32,
}

impl StatusResponse {
    /// A successful reply with a detail message.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Success as i32,
            message: message.into(),
            code: 0,
        }
    }

    /// A failed reply with a detail message and code.
    pub fn failed(message: impl Into<String>, code: i32) -> Self {
        Self {
            status: ResponseStatus::Failed as i32,
            message: message.into(),
            code,
        }
    }
}
