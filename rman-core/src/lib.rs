pub mod config;
pub mod decode;
pub mod encode;
pub mod error;
pub mod fetch;
pub mod hash;
pub mod manifest;
pub mod paths;
pub mod plan;
pub mod progress;
pub mod table;
pub mod transfer;

pub use config::{CdnTable, PatcherConfig, Selection};
pub use decode::{decode, decode_with_limits, DecodeLimits};
pub use error::{Result, RmanError};
pub use fetch::{CancelToken, HttpFetcher, LocalFetcher, RangeFetcher};
pub use hash::HashAlgorithm;
pub use manifest::Manifest;
pub use transfer::{FileOutcome, PatchOptions, PatchReport, Patcher};
