//! HTTP 接口层：统一响应包裹、错误映射与载荷转换。

pub(crate) mod error;
pub(crate) mod response;
pub(crate) mod types;
