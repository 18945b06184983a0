//! # Protocol Constants
//!
//! RPC method names understood by the server and the API version floor.

/// Lowest server API version. Servers that cannot report a version are
/// assumed to speak this one.
pub const MIN_API_VERSION: u32 = 1;

/// Server error name returned when a bucket does not exist.
pub const BUCKET_NOT_FOUND: &str = "BucketNotFoundError";

/// RPC method names.
pub mod method {
    pub const CREATE_BUCKET: &str = "createBucket";
    pub const GET_BUCKET: &str = "getBucket";
    pub const LIST_BUCKETS: &str = "listBuckets";
    pub const UPDATE_BUCKET: &str = "updateBucket";
    pub const DELETE_BUCKET: &str = "delBucket";

    pub const PUT_OBJECT: &str = "putObject";
    pub const GET_OBJECT: &str = "getObject";
    pub const DELETE_OBJECT: &str = "delObject";
    pub const FIND_OBJECTS: &str = "findObjects";
    pub const BATCH: &str = "batch";
    pub const UPDATE_OBJECTS: &str = "updateObjects";
    pub const DELETE_MANY: &str = "deleteMany";
    pub const REINDEX_OBJECTS: &str = "reindexObjects";

    pub const GET_TOKENS: &str = "getTokens";
    pub const SQL: &str = "sql";
    pub const PING: &str = "ping";
    pub const VERSION: &str = "version";
}
