// 传输层
//
// 服务端三个接口（分片上传 / 合并 / 存在性检查）的类型与 HTTP 实现

pub mod client;
pub mod types;

pub use client::{HttpTransport, UploadTransport};
pub use types::{
    ChunkUploadRequest, ChunkUploadResponse, ExistsRequest, ExistsResponse, MergeRequest,
    MergeResponse, StoredFile, UploadError,
};
